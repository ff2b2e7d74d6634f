//! Control transfer, flag manipulation and system instructions.

use super::ops_alu::{dec_flags, inc_flags};
use super::{both, both_0f, deliver_interrupt, CpuGeneration, Exec, Flow, OpFn};
use crate::exception::{Exception, Trap};
use crate::modrm::MODRM_REG;
use crate::segments::read_descriptor;
use crate::state::{
    CpuState, CR0_PE, CR0_PG, CR0_TS, F_CF, F_DF, F_IF, F_OF, F_ZF, GpReg, Reg8, SegReg,
};

pub(super) fn register(t: &mut [OpFn]) {
    for op in 0x70..0x80 {
        both(t, op, jcc_rel8);
    }
    both(t, 0x62, bound);
    both(t, 0x63, arpl);
    both(t, 0x9A, call_far);
    both(t, 0x9B, fwait);
    both(t, 0xC2, retn_iw);
    both(t, 0xC3, retn);
    both(t, 0xCA, retf_iw);
    both(t, 0xCB, retf);
    both(t, 0xCC, int3);
    both(t, 0xCD, int_ib);
    both(t, 0xCE, into);
    both(t, 0xCF, iret);
    both(t, 0xE0, loopne);
    both(t, 0xE1, loope);
    both(t, 0xE2, loop_cx);
    both(t, 0xE3, jcxz);
    both(t, 0xE4, in_al_ib);
    both(t, 0xE5, in_eax_ib);
    both(t, 0xE6, out_ib_al);
    both(t, 0xE7, out_ib_eax);
    both(t, 0xE8, call_rel);
    both(t, 0xE9, jmp_rel);
    both(t, 0xEA, jmp_far);
    both(t, 0xEB, jmp_rel8);
    both(t, 0xEC, in_al_dx);
    both(t, 0xED, in_eax_dx);
    both(t, 0xEE, out_dx_al);
    both(t, 0xEF, out_dx_eax);
    both(t, 0xF4, hlt);
    both(t, 0xF5, cmc);
    both(t, 0xF8, clc);
    both(t, 0xF9, stc);
    both(t, 0xFA, cli);
    both(t, 0xFB, sti);
    both(t, 0xFC, cld);
    both(t, 0xFD, std);
    both(t, 0xFF, grp5);

    both_0f(t, 0x00, grp6);
    both_0f(t, 0x01, grp7);
    both_0f(t, 0x02, lar);
    both_0f(t, 0x03, lsl);
    both_0f(t, 0x06, clts);
    both_0f(t, 0x08, invd);
    both_0f(t, 0x09, invd);
    both_0f(t, 0x20, mov_rd_cr);
    both_0f(t, 0x21, mov_rd_dr);
    both_0f(t, 0x22, mov_cr_rd);
    both_0f(t, 0x23, mov_dr_rd);
    both_0f(t, 0x24, mov_rd_tr);
    both_0f(t, 0x26, mov_tr_rd);
    both_0f(t, 0x31, rdtsc);
    both_0f(t, 0xA2, cpuid);
    for op in 0x80..0x90 {
        both_0f(t, op, jcc_rel);
    }
    for op in 0x90..0xA0 {
        both_0f(t, op, setcc);
    }
}

pub(crate) fn op_illegal(x: &mut Exec) -> Result<Flow, Trap> {
    tracing::debug!(
        opcode = format_args!("{:#05x}", x.opcode),
        "undefined opcode encoding"
    );
    Err(Exception::InvalidOpcode.into())
}

/// Jcc/SETcc condition from the low opcode nibble.
fn condition(state: &CpuState, index: u8) -> bool {
    use crate::state::{F_PF, F_SF};
    let f = state.eflags;
    let result = match index >> 1 {
        0 => f & F_OF != 0,
        1 => f & F_CF != 0,
        2 => f & F_ZF != 0,
        3 => f & (F_CF | F_ZF) != 0,
        4 => f & F_SF != 0,
        5 => f & F_PF != 0,
        6 => (f & F_SF != 0) != (f & F_OF != 0),
        _ => (f & F_ZF != 0) || ((f & F_SF != 0) != (f & F_OF != 0)),
    };
    result != (index & 1 != 0)
}

fn jcc_rel8(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = x.fetch_u8()? as i8 as i32;
    if condition(x.state, x.opcode_byte() & 0xF) {
        x.jump_rel(rel);
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

fn jcc_rel(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = if x.op32 {
        x.fetch_u32()? as i32
    } else {
        x.fetch_u16()? as i16 as i32
    };
    if condition(x.state, x.opcode_byte() & 0xF) {
        x.jump_rel(rel);
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

fn setcc(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let dst = x.modrm_operand(modrm, 8)?;
    let val = condition(x.state, x.opcode_byte() & 0xF) as u32;
    x.store(dst, 8, val)?;
    Ok(Flow::Next)
}

fn call_rel(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = if x.op32 {
        x.fetch_u32()? as i32
    } else {
        x.fetch_u16()? as i16 as i32
    };
    let ret = x.state.eip;
    x.push_v(ret)?;
    x.jump_rel(rel);
    Ok(Flow::Jumped)
}

fn jmp_rel(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = if x.op32 {
        x.fetch_u32()? as i32
    } else {
        x.fetch_u16()? as i16 as i32
    };
    x.jump_rel(rel);
    Ok(Flow::Jumped)
}

fn jmp_rel8(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = x.fetch_u8()? as i8 as i32;
    x.jump_rel(rel);
    Ok(Flow::Jumped)
}

fn jmp_far(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = x.fetch_iv()?;
    let selector = x.fetch_u16()?;
    x.load_seg(SegReg::Cs, selector)?;
    x.jump_abs(offset);
    Ok(Flow::Jumped)
}

fn call_far(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = x.fetch_iv()?;
    let selector = x.fetch_u16()?;
    let old_cs = x.state.seg(SegReg::Cs).selector;
    let ret = x.state.eip;
    x.push_v(old_cs as u32)?;
    x.push_v(ret)?;
    x.load_seg(SegReg::Cs, selector)?;
    x.jump_abs(offset);
    Ok(Flow::Jumped)
}

fn retn(x: &mut Exec) -> Result<Flow, Trap> {
    let target = x.pop_v()?;
    x.jump_abs(target);
    Ok(Flow::Jumped)
}

fn retn_iw(x: &mut Exec) -> Result<Flow, Trap> {
    let imm = x.fetch_u16()? as u32;
    let target = x.pop_v()?;
    x.jump_abs(target);
    adjust_sp(x.state, imm);
    Ok(Flow::Jumped)
}

fn retf(x: &mut Exec) -> Result<Flow, Trap> {
    let target = x.pop_v()?;
    let selector = x.pop_v()? as u16;
    x.load_seg(SegReg::Cs, selector)?;
    x.jump_abs(target);
    Ok(Flow::Jumped)
}

fn retf_iw(x: &mut Exec) -> Result<Flow, Trap> {
    let imm = x.fetch_u16()? as u32;
    let target = x.pop_v()?;
    let selector = x.pop_v()? as u16;
    x.load_seg(SegReg::Cs, selector)?;
    x.jump_abs(target);
    adjust_sp(x.state, imm);
    Ok(Flow::Jumped)
}

fn adjust_sp(state: &mut CpuState, delta: u32) {
    if state.stack_big() {
        let esp = state.reg32(GpReg::Esp).wrapping_add(delta);
        state.set_reg32(GpReg::Esp, esp);
    } else {
        let sp = state.reg16(GpReg::Esp).wrapping_add(delta as u16);
        state.set_reg16(GpReg::Esp, sp);
    }
}

fn bound(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    if modrm >= 0xC0 {
        return Err(Exception::InvalidOpcode.into());
    }
    let index = super::ops_alu::sign_extend(x.state.reg(MODRM_REG[modrm as usize], bits), bits);
    let ea = x.resolve_ea(modrm)?;
    let lin = ea.linear();
    let (lower, upper) = if bits == 32 {
        (x.mem.read_u32(lin)? as i32, x.mem.read_u32(lin.wrapping_add(4))? as i32)
    } else {
        (
            x.mem.read_u16(lin)? as i16 as i32,
            x.mem.read_u16(lin.wrapping_add(2))? as i16 as i32,
        )
    };
    if index < lower || index > upper {
        return Err(Exception::BoundRange.into());
    }
    Ok(Flow::Next)
}

/// ARPL adjusts a selector's RPL; outside protected mode the encoding is
/// undefined.
fn arpl(x: &mut Exec) -> Result<Flow, Trap> {
    if !x.state.protected_mode() || x.state.v86_mode() {
        return Err(Exception::InvalidOpcode.into());
    }
    let modrm = x.fetch_u8()?;
    let src = x.state.reg16(MODRM_REG[modrm as usize]);
    let dst = x.modrm_operand(modrm, 16)?;
    let val = x.load(dst, 16)? as u16;
    if val & 3 < src & 3 {
        x.store(dst, 16, ((val & !3) | (src & 3)) as u32)?;
        x.state.set_flag(F_ZF, true);
    } else {
        x.state.set_flag(F_ZF, false);
    }
    Ok(Flow::Next)
}

fn int3(x: &mut Exec) -> Result<Flow, Trap> {
    deliver_interrupt(x.state, x.mem, 3, None, true)?;
    Ok(Flow::Jumped)
}

fn int_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let vector = x.fetch_u8()?;
    deliver_interrupt(x.state, x.mem, vector, None, true)?;
    Ok(Flow::Jumped)
}

fn into(x: &mut Exec) -> Result<Flow, Trap> {
    if x.state.flag(F_OF) {
        deliver_interrupt(x.state, x.mem, 4, None, true)?;
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

fn iret(x: &mut Exec) -> Result<Flow, Trap> {
    let target = x.pop_v()?;
    let selector = x.pop_v()? as u16;
    let flags = x.pop_v()?;
    x.load_seg(SegReg::Cs, selector)?;
    x.jump_abs(target);

    let mut mask: u32 = 0x0000_7FD5 | 0x0020_0000;
    if x.state.protected_mode() && x.state.cpl > 0 {
        mask &= !crate::state::F_IOPL;
        if x.state.cpl > x.state.iopl() {
            mask &= !F_IF;
        }
    }
    if !x.op32 {
        mask &= 0xFFFF;
    }
    x.state.set_eflags(flags, mask);
    Ok(Flow::Jumped)
}

fn loop_count(x: &mut Exec) -> u32 {
    if x.addr32 {
        let v = x.state.reg32(GpReg::Ecx).wrapping_sub(1);
        x.state.set_reg32(GpReg::Ecx, v);
        v
    } else {
        let v = x.state.reg16(GpReg::Ecx).wrapping_sub(1);
        x.state.set_reg16(GpReg::Ecx, v);
        v as u32
    }
}

fn loopne(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = x.fetch_u8()? as i8 as i32;
    if loop_count(x) != 0 && !x.state.flag(F_ZF) {
        x.jump_rel(rel);
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

fn loope(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = x.fetch_u8()? as i8 as i32;
    if loop_count(x) != 0 && x.state.flag(F_ZF) {
        x.jump_rel(rel);
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

fn loop_cx(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = x.fetch_u8()? as i8 as i32;
    if loop_count(x) != 0 {
        x.jump_rel(rel);
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

fn jcxz(x: &mut Exec) -> Result<Flow, Trap> {
    let rel = x.fetch_u8()? as i8 as i32;
    let count = if x.addr32 {
        x.state.reg32(GpReg::Ecx)
    } else {
        x.state.reg16(GpReg::Ecx) as u32
    };
    if count == 0 {
        x.jump_rel(rel);
        return Ok(Flow::Jumped);
    }
    Ok(Flow::Next)
}

// ---------------------------------------------------------------------
// Port I/O against the stub bus: reads float high, writes vanish. The
// real port backends live outside this core.
// ---------------------------------------------------------------------

fn in_al_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.fetch_u8()? as u16;
    tracing::trace!(port, "port read (stub)");
    x.state.set_reg8(Reg8::Al, 0xFF);
    Ok(Flow::Next)
}

fn in_eax_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.fetch_u8()? as u16;
    tracing::trace!(port, "port read (stub)");
    let bits = x.op_bits();
    x.state.set_reg(GpReg::Eax, bits, 0xFFFF_FFFF);
    Ok(Flow::Next)
}

fn in_al_dx(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.state.reg16(GpReg::Edx);
    tracing::trace!(port, "port read (stub)");
    x.state.set_reg8(Reg8::Al, 0xFF);
    Ok(Flow::Next)
}

fn in_eax_dx(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.state.reg16(GpReg::Edx);
    tracing::trace!(port, "port read (stub)");
    let bits = x.op_bits();
    x.state.set_reg(GpReg::Eax, bits, 0xFFFF_FFFF);
    Ok(Flow::Next)
}

fn out_ib_al(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.fetch_u8()? as u16;
    tracing::trace!(port, val = x.state.reg8(Reg8::Al), "port write (stub)");
    Ok(Flow::Next)
}

fn out_ib_eax(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.fetch_u8()? as u16;
    tracing::trace!(port, "port write (stub)");
    Ok(Flow::Next)
}

fn out_dx_al(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.state.reg16(GpReg::Edx);
    tracing::trace!(port, val = x.state.reg8(Reg8::Al), "port write (stub)");
    Ok(Flow::Next)
}

fn out_dx_eax(x: &mut Exec) -> Result<Flow, Trap> {
    let port = x.state.reg16(GpReg::Edx);
    tracing::trace!(port, "port write (stub)");
    Ok(Flow::Next)
}

// ---------------------------------------------------------------------
// Flag manipulation
// ---------------------------------------------------------------------

fn hlt(x: &mut Exec) -> Result<Flow, Trap> {
    if x.state.protected_mode() && x.state.cpl != 0 {
        return Err(Exception::gp0().into());
    }
    Ok(Flow::Halt)
}

fn fwait(_x: &mut Exec) -> Result<Flow, Trap> {
    Ok(Flow::Next)
}

fn cmc(x: &mut Exec) -> Result<Flow, Trap> {
    let cf = x.state.flag(F_CF);
    x.state.set_flag(F_CF, !cf);
    Ok(Flow::Next)
}

fn clc(x: &mut Exec) -> Result<Flow, Trap> {
    x.state.set_flag(F_CF, false);
    Ok(Flow::Next)
}

fn stc(x: &mut Exec) -> Result<Flow, Trap> {
    x.state.set_flag(F_CF, true);
    Ok(Flow::Next)
}

fn cli(x: &mut Exec) -> Result<Flow, Trap> {
    if x.state.protected_mode() && x.state.iopl() < x.state.cpl {
        return Err(Exception::gp0().into());
    }
    x.state.set_flag(F_IF, false);
    Ok(Flow::Next)
}

fn sti(x: &mut Exec) -> Result<Flow, Trap> {
    if x.state.protected_mode() && x.state.iopl() < x.state.cpl {
        return Err(Exception::gp0().into());
    }
    x.state.set_flag(F_IF, true);
    Ok(Flow::Next)
}

fn cld(x: &mut Exec) -> Result<Flow, Trap> {
    x.state.set_flag(F_DF, false);
    Ok(Flow::Next)
}

fn std(x: &mut Exec) -> Result<Flow, Trap> {
    x.state.set_flag(F_DF, true);
    Ok(Flow::Next)
}

// ---------------------------------------------------------------------
// Group 5 and the system set
// ---------------------------------------------------------------------

fn grp5(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    match (modrm >> 3) & 7 {
        0 => {
            let dst = x.modrm_operand(modrm, bits)?;
            let a = x.load(dst, bits)?;
            let res = inc_flags(x.state, a, bits);
            x.store(dst, bits, res)?;
            Ok(Flow::Next)
        }
        1 => {
            let dst = x.modrm_operand(modrm, bits)?;
            let a = x.load(dst, bits)?;
            let res = dec_flags(x.state, a, bits);
            x.store(dst, bits, res)?;
            Ok(Flow::Next)
        }
        2 => {
            let src = x.modrm_operand(modrm, bits)?;
            let target = x.load(src, bits)?;
            let ret = x.state.eip;
            x.push_v(ret)?;
            x.jump_abs(target);
            Ok(Flow::Jumped)
        }
        3 => {
            if modrm >= 0xC0 {
                return Err(Exception::InvalidOpcode.into());
            }
            let ea = x.resolve_ea(modrm)?;
            let lin = ea.linear();
            let offset = if bits == 32 {
                x.mem.read_u32(lin)?
            } else {
                x.mem.read_u16(lin)? as u32
            };
            let selector = x.mem.read_u16(lin.wrapping_add(bits / 8))?;
            let old_cs = x.state.seg(SegReg::Cs).selector;
            let ret = x.state.eip;
            x.push_v(old_cs as u32)?;
            x.push_v(ret)?;
            x.load_seg(SegReg::Cs, selector)?;
            x.jump_abs(offset);
            Ok(Flow::Jumped)
        }
        4 => {
            let src = x.modrm_operand(modrm, bits)?;
            let target = x.load(src, bits)?;
            x.jump_abs(target);
            Ok(Flow::Jumped)
        }
        5 => {
            if modrm >= 0xC0 {
                return Err(Exception::InvalidOpcode.into());
            }
            let ea = x.resolve_ea(modrm)?;
            let lin = ea.linear();
            let offset = if bits == 32 {
                x.mem.read_u32(lin)?
            } else {
                x.mem.read_u16(lin)? as u32
            };
            let selector = x.mem.read_u16(lin.wrapping_add(bits / 8))?;
            x.load_seg(SegReg::Cs, selector)?;
            x.jump_abs(offset);
            Ok(Flow::Jumped)
        }
        6 => {
            let src = x.modrm_operand(modrm, bits)?;
            let val = x.load(src, bits)?;
            x.push_v(val)?;
            Ok(Flow::Next)
        }
        _ => Err(Exception::InvalidOpcode.into()),
    }
}

fn grp6(x: &mut Exec) -> Result<Flow, Trap> {
    if !x.state.protected_mode() || x.state.v86_mode() {
        return Err(Exception::InvalidOpcode.into());
    }
    let modrm = x.fetch_u8()?;
    match (modrm >> 3) & 7 {
        0 => {
            // SLDT
            let sel = x.state.ldt_selector;
            let dst = x.modrm_operand(modrm, 16)?;
            x.store(dst, 16, sel as u32)?;
            Ok(Flow::Next)
        }
        1 => {
            // STR
            let sel = x.state.task_selector;
            let dst = x.modrm_operand(modrm, 16)?;
            x.store(dst, 16, sel as u32)?;
            Ok(Flow::Next)
        }
        2 => {
            // LLDT
            if x.state.cpl != 0 {
                return Err(Exception::gp0().into());
            }
            let src = x.modrm_operand(modrm, 16)?;
            let selector = x.load(src, 16)? as u16;
            if selector & 0xFFFC == 0 {
                x.state.ldt_selector = selector;
                x.state.ldt.base = 0;
                x.state.ldt.limit = 0;
                return Ok(Flow::Next);
            }
            let desc = read_descriptor(x.state, x.mem, selector)?;
            if !desc.present() {
                return Err(Exception::NotPresent(selector & 0xFFFC).into());
            }
            x.state.ldt_selector = selector;
            x.state.ldt.base = desc.base;
            x.state.ldt.limit = desc.limit_bytes() as u16;
            Ok(Flow::Next)
        }
        3 => {
            // LTR
            if x.state.cpl != 0 {
                return Err(Exception::gp0().into());
            }
            let src = x.modrm_operand(modrm, 16)?;
            let selector = x.load(src, 16)? as u16;
            x.state.task_selector = selector;
            Ok(Flow::Next)
        }
        4 | 5 => {
            // VERR/VERW
            let verw = (modrm >> 3) & 7 == 5;
            let src = x.modrm_operand(modrm, 16)?;
            let selector = x.load(src, 16)? as u16;
            let ok = verify_selector(x.state, x.mem, selector, verw);
            x.state.set_flag(F_ZF, ok);
            Ok(Flow::Next)
        }
        _ => Err(Exception::InvalidOpcode.into()),
    }
}

fn verify_selector(
    state: &mut CpuState,
    mem: &mut retrobox_memory::Memory,
    selector: u16,
    for_write: bool,
) -> bool {
    if selector & 0xFFFC == 0 {
        return false;
    }
    let Ok(desc) = read_descriptor(state, mem, selector) else {
        return false;
    };
    if !desc.present() || !desc.is_code_or_data() {
        return false;
    }
    let is_code = desc.access & 0x08 != 0;
    let conforming = is_code && desc.access & 0x04 != 0;
    if !conforming {
        let rpl = (selector & 3) as u8;
        if desc.dpl() < state.cpl || desc.dpl() < rpl {
            return false;
        }
    }
    if for_write {
        // Only writable data segments verify for write.
        !is_code && desc.access & 0x02 != 0
    } else {
        // Data always reads; code only when the readable bit is set.
        !is_code || desc.access & 0x02 != 0
    }
}

fn grp7(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let which = (modrm >> 3) & 7;

    if modrm < 0xC0 {
        let ea = x.resolve_ea(modrm)?;
        let lin = ea.linear();
        match which {
            0 => {
                // SGDT
                x.mem.write_u16(lin, x.state.gdt.limit)?;
                x.mem.write_u32(lin.wrapping_add(2), x.state.gdt.base)?;
            }
            1 => {
                // SIDT
                x.mem.write_u16(lin, x.state.idt.limit)?;
                x.mem.write_u32(lin.wrapping_add(2), x.state.idt.base)?;
            }
            2 => {
                // LGDT
                privileged(x.state)?;
                let limit = x.mem.read_u16(lin)?;
                let base = x.mem.read_u32(lin.wrapping_add(2))?;
                x.state.gdt.limit = limit;
                x.state.gdt.base = if x.op32 { base } else { base & 0x00FF_FFFF };
            }
            3 => {
                // LIDT
                privileged(x.state)?;
                let limit = x.mem.read_u16(lin)?;
                let base = x.mem.read_u32(lin.wrapping_add(2))?;
                x.state.idt.limit = limit;
                x.state.idt.base = if x.op32 { base } else { base & 0x00FF_FFFF };
            }
            4 => {
                // SMSW
                x.mem.write_u16(lin, x.state.cr0 as u16)?;
            }
            6 => {
                // LMSW
                privileged(x.state)?;
                let val = x.mem.read_u16(lin)?;
                lmsw(x.state, val);
            }
            7 => {
                // INVLPG invalidates the whole TLB on this core.
                privileged(x.state)?;
                x.mem.clear_tlb();
            }
            _ => return Err(Exception::InvalidOpcode.into()),
        }
    } else {
        let dst = x.modrm_operand(modrm, 16)?;
        match which {
            4 => x.store(dst, 16, x.state.cr0 as u16 as u32)?,
            6 => {
                privileged(x.state)?;
                let val = x.load(dst, 16)? as u16;
                lmsw(x.state, val);
            }
            _ => return Err(Exception::InvalidOpcode.into()),
        }
    }
    Ok(Flow::Next)
}

fn privileged(state: &CpuState) -> Result<(), Trap> {
    if state.protected_mode() && state.cpl != 0 {
        Err(Exception::gp0().into())
    } else {
        Ok(())
    }
}

/// LMSW updates the low machine-status bits; it can set PE but never clear
/// it.
fn lmsw(state: &mut CpuState, val: u16) {
    let mut new = (state.cr0 & !0xE) | (val as u32 & 0xF);
    if state.cr0 & CR0_PE != 0 {
        new |= CR0_PE;
    }
    state.cr0 = new;
}

fn lar(x: &mut Exec) -> Result<Flow, Trap> {
    if !x.state.protected_mode() || x.state.v86_mode() {
        return Err(Exception::InvalidOpcode.into());
    }
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, 16)?;
    let selector = x.load(src, 16)? as u16;
    match accessible_descriptor(x.state, x.mem, selector) {
        Some(desc) => {
            let ar = ((desc.access as u32) << 8) | ((desc.flags as u32) << 20);
            x.state.set_reg(reg, bits, ar & 0x00FF_FF00);
            x.state.set_flag(F_ZF, true);
        }
        None => x.state.set_flag(F_ZF, false),
    }
    Ok(Flow::Next)
}

fn lsl(x: &mut Exec) -> Result<Flow, Trap> {
    if !x.state.protected_mode() || x.state.v86_mode() {
        return Err(Exception::InvalidOpcode.into());
    }
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, 16)?;
    let selector = x.load(src, 16)? as u16;
    match accessible_descriptor(x.state, x.mem, selector) {
        Some(desc) => {
            x.state.set_reg(reg, bits, desc.limit_bytes());
            x.state.set_flag(F_ZF, true);
        }
        None => x.state.set_flag(F_ZF, false),
    }
    Ok(Flow::Next)
}

fn accessible_descriptor(
    state: &mut CpuState,
    mem: &mut retrobox_memory::Memory,
    selector: u16,
) -> Option<crate::segments::Descriptor> {
    if selector & 0xFFFC == 0 {
        return None;
    }
    let desc = read_descriptor(state, mem, selector).ok()?;
    if !desc.present() || !desc.is_code_or_data() {
        return None;
    }
    let is_code = desc.access & 0x08 != 0;
    let conforming = is_code && desc.access & 0x04 != 0;
    if !conforming {
        let rpl = (selector & 3) as u8;
        if desc.dpl() < state.cpl || desc.dpl() < rpl {
            return None;
        }
    }
    Some(desc)
}

fn clts(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    x.state.cr0 &= !CR0_TS;
    Ok(Flow::Next)
}

fn invd(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    privileged(x.state)?;
    Ok(Flow::Next)
}

/// MOV CRx/DRx/TRx tolerate a memory-form ModRM by treating it as the
/// register form, which real hardware also does.
fn control_modrm(x: &mut Exec) -> Result<(u8, GpReg), Trap> {
    let modrm = x.fetch_u8()?;
    if modrm < 0xC0 {
        tracing::warn!(
            modrm,
            "control-register move with memory-form modrm, using register form"
        );
    }
    let which = (modrm >> 3) & 7;
    Ok((which, GpReg::from_index(modrm & 7)))
}

fn mov_rd_cr(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    let (which, reg) = control_modrm(x)?;
    let val = match which {
        0 => x.state.cr0,
        2 => x.mem.fault_addr(),
        3 => x.mem.dir_base(),
        4 => x.state.cr4,
        _ => return Err(Exception::InvalidOpcode.into()),
    };
    x.state.set_reg32(reg, val);
    Ok(Flow::Next)
}

fn mov_cr_rd(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    let (which, reg) = control_modrm(x)?;
    let val = x.state.reg32(reg);
    match which {
        0 => {
            x.state.cr0 = val;
            x.mem.enable_paging(val & CR0_PG != 0);
        }
        2 => x.mem.set_fault_addr(val),
        3 => x.mem.set_dir_base(val),
        4 => {
            x.require_generation(CpuGeneration::Pentium)?;
            x.state.cr4 = val;
        }
        _ => return Err(Exception::InvalidOpcode.into()),
    }
    Ok(Flow::Next)
}

fn mov_rd_dr(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    let (which, reg) = control_modrm(x)?;
    x.state.set_reg32(reg, x.state.dr[which as usize]);
    Ok(Flow::Next)
}

fn mov_dr_rd(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    let (which, reg) = control_modrm(x)?;
    x.state.dr[which as usize] = x.state.reg32(reg);
    Ok(Flow::Next)
}

fn mov_rd_tr(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    let (which, reg) = control_modrm(x)?;
    if which < 3 {
        return Err(Exception::InvalidOpcode.into());
    }
    x.state.set_reg32(reg, x.state.tr[which as usize]);
    Ok(Flow::Next)
}

fn mov_tr_rd(x: &mut Exec) -> Result<Flow, Trap> {
    privileged(x.state)?;
    let (which, reg) = control_modrm(x)?;
    if which < 3 {
        return Err(Exception::InvalidOpcode.into());
    }
    x.state.tr[which as usize] = x.state.reg32(reg);
    Ok(Flow::Next)
}

fn rdtsc(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::Pentium)?;
    let tsc = x.state.tsc;
    x.state.set_reg32(GpReg::Eax, tsc as u32);
    x.state.set_reg32(GpReg::Edx, (tsc >> 32) as u32);
    Ok(Flow::Next)
}

fn cpuid(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    match x.state.reg32(GpReg::Eax) {
        0 => {
            x.state.set_reg32(GpReg::Eax, 1);
            x.state.set_reg32(GpReg::Ebx, u32::from_le_bytes(*b"Genu"));
            x.state.set_reg32(GpReg::Edx, u32::from_le_bytes(*b"ineI"));
            x.state.set_reg32(GpReg::Ecx, u32::from_le_bytes(*b"ntel"));
        }
        1 => {
            let (signature, features) = match x.config.generation {
                CpuGeneration::Pentium => (0x513, 0x11),
                _ => (0x402, 0x1),
            };
            x.state.set_reg32(GpReg::Eax, signature);
            x.state.set_reg32(GpReg::Ebx, 0);
            x.state.set_reg32(GpReg::Ecx, 0);
            x.state.set_reg32(GpReg::Edx, features);
        }
        _ => {
            x.state.set_reg32(GpReg::Eax, 0);
            x.state.set_reg32(GpReg::Ebx, 0);
            x.state.set_reg32(GpReg::Ecx, 0);
            x.state.set_reg32(GpReg::Edx, 0);
        }
    }
    Ok(Flow::Next)
}
