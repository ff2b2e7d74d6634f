//! Data movement: MOV forms, stack traffic, segment loads, exchanges and
//! the 486 read-modify-write additions.

use super::ops_alu::add_flags;
use super::{both, both_0f, CpuGeneration, Exec, Flow, OpFn, Operand};
use crate::exception::{Exception, Trap};
use crate::modrm::{MODRM_REG, MODRM_REG8};
use crate::state::{F_AF, F_CF, F_PF, F_SF, F_ZF, GpReg, Reg8, SegReg};

pub(super) fn register(t: &mut [OpFn]) {
    both(t, 0x06, push_sreg);
    both(t, 0x07, pop_sreg);
    both(t, 0x0E, push_sreg);
    both(t, 0x16, push_sreg);
    both(t, 0x17, pop_sreg);
    both(t, 0x1E, push_sreg);
    both(t, 0x1F, pop_sreg);
    for op in 0x50..0x58 {
        both(t, op, push_reg);
    }
    for op in 0x58..0x60 {
        both(t, op, pop_reg);
    }
    both(t, 0x60, pusha);
    both(t, 0x61, popa);
    both(t, 0x68, push_iv);
    both(t, 0x6A, push_ib);
    both(t, 0x86, xchg_eb_gb);
    both(t, 0x87, xchg_ev_gv);
    both(t, 0x88, mov_eb_gb);
    both(t, 0x89, mov_ev_gv);
    both(t, 0x8A, mov_gb_eb);
    both(t, 0x8B, mov_gv_ev);
    both(t, 0x8C, mov_ew_sw);
    both(t, 0x8D, lea);
    both(t, 0x8E, mov_sw_ew);
    both(t, 0x8F, pop_ev);
    for op in 0x90..0x98 {
        both(t, op, xchg_eax_reg);
    }
    both(t, 0x9C, pushf);
    both(t, 0x9D, popf);
    both(t, 0x9E, sahf);
    both(t, 0x9F, lahf);
    both(t, 0xA0, mov_al_moffs);
    both(t, 0xA1, mov_eax_moffs);
    both(t, 0xA2, mov_moffs_al);
    both(t, 0xA3, mov_moffs_eax);
    for op in 0xB0..0xB8 {
        both(t, op, mov_reg8_ib);
    }
    for op in 0xB8..0xC0 {
        both(t, op, mov_reg_iv);
    }
    both(t, 0xC4, les);
    both(t, 0xC5, lds);
    both(t, 0xC6, mov_eb_ib);
    both(t, 0xC7, mov_ev_iv);
    both(t, 0xC8, enter);
    both(t, 0xC9, leave);
    both(t, 0xD6, salc);
    both(t, 0xD7, xlat);

    both_0f(t, 0xA0, push_fs);
    both_0f(t, 0xA1, pop_fs);
    both_0f(t, 0xA8, push_gs);
    both_0f(t, 0xA9, pop_gs);
    both_0f(t, 0xB0, cmpxchg_eb_gb);
    both_0f(t, 0xB1, cmpxchg_ev_gv);
    both_0f(t, 0xB2, lss);
    both_0f(t, 0xB4, lfs);
    both_0f(t, 0xB5, lgs);
    both_0f(t, 0xB6, movzx_gv_eb);
    both_0f(t, 0xB7, movzx_gv_ew);
    both_0f(t, 0xBE, movsx_gv_eb);
    both_0f(t, 0xBF, movsx_gv_ew);
    both_0f(t, 0xC0, xadd_eb_gb);
    both_0f(t, 0xC1, xadd_ev_gv);
    for op in 0xC8..0xD0 {
        both_0f(t, op, bswap_reg);
    }
}

fn mov_eb_gb(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let src = x.state.reg8(MODRM_REG8[modrm as usize]);
    let dst = x.modrm_operand(modrm, 8)?;
    x.store(dst, 8, src as u32)?;
    Ok(Flow::Next)
}

fn mov_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let src = x.state.reg(MODRM_REG[modrm as usize], bits);
    let dst = x.modrm_operand(modrm, bits)?;
    x.store(dst, bits, src)?;
    Ok(Flow::Next)
}

fn mov_gb_eb(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG8[modrm as usize];
    let src = x.modrm_operand(modrm, 8)?;
    let val = x.load(src, 8)?;
    x.state.set_reg8(reg, val as u8);
    Ok(Flow::Next)
}

fn mov_gv_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, bits)?;
    let val = x.load(src, bits)?;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

fn mov_ew_sw(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let Some(seg) = SegReg::from_index((modrm >> 3) & 7) else {
        return Err(Exception::InvalidOpcode.into());
    };
    let selector = x.state.seg(seg).selector;
    // Register destinations zero-extend to the operand size; memory stores
    // are always 16-bit.
    let dst = x.modrm_operand(modrm, 16)?;
    match dst {
        Operand::Reg(r) => x.state.set_reg(r, x.op_bits(), selector as u32),
        _ => x.store(dst, 16, selector as u32)?,
    }
    Ok(Flow::Next)
}

fn mov_sw_ew(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let Some(seg) = SegReg::from_index((modrm >> 3) & 7) else {
        return Err(Exception::InvalidOpcode.into());
    };
    if seg == SegReg::Cs {
        return Err(Exception::InvalidOpcode.into());
    }
    let src = x.modrm_operand(modrm, 16)?;
    let selector = x.load(src, 16)? as u16;
    x.load_seg(seg, selector)?;
    Ok(Flow::Next)
}

fn lea(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    if modrm >= 0xC0 {
        return Err(Exception::InvalidOpcode.into());
    }
    let reg = MODRM_REG[modrm as usize];
    let ea = x.resolve_ea(modrm)?;
    let offset = if ea.addr32 {
        ea.offset
    } else {
        ea.offset & 0xFFFF
    };
    x.state.set_reg(reg, x.op_bits(), offset);
    Ok(Flow::Next)
}

fn mov_eb_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let dst = x.modrm_operand(modrm, 8)?;
    let val = x.fetch_u8()?;
    x.store(dst, 8, val as u32)?;
    Ok(Flow::Next)
}

fn mov_ev_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let dst = x.modrm_operand(modrm, bits)?;
    let val = x.fetch_iv()?;
    x.store(dst, bits, val)?;
    Ok(Flow::Next)
}

fn mov_reg8_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let reg = Reg8::from_index(x.opcode_byte() & 7);
    let val = x.fetch_u8()?;
    x.state.set_reg8(reg, val);
    Ok(Flow::Next)
}

fn mov_reg_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    let val = x.fetch_iv()?;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

/// Fetch the address-sized offset of the A0–A3 moffs forms.
fn fetch_moffs(x: &mut Exec) -> Result<u32, Trap> {
    if x.addr32 {
        x.fetch_u32()
    } else {
        Ok(x.fetch_u16()? as u32)
    }
}

fn mov_al_moffs(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = fetch_moffs(x)?;
    let val = x.mem.read_u8(x.base_ds.wrapping_add(offset))?;
    x.state.set_reg8(Reg8::Al, val);
    Ok(Flow::Next)
}

fn mov_eax_moffs(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = fetch_moffs(x)?;
    let lin = x.base_ds.wrapping_add(offset);
    let val = if x.op32 {
        x.mem.read_u32(lin)?
    } else {
        x.mem.read_u16(lin)? as u32
    };
    x.state.set_reg(GpReg::Eax, x.op_bits(), val);
    Ok(Flow::Next)
}

fn mov_moffs_al(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = fetch_moffs(x)?;
    x.mem
        .write_u8(x.base_ds.wrapping_add(offset), x.state.reg8(Reg8::Al))?;
    Ok(Flow::Next)
}

fn mov_moffs_eax(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = fetch_moffs(x)?;
    let lin = x.base_ds.wrapping_add(offset);
    if x.op32 {
        x.mem.write_u32(lin, x.state.reg32(GpReg::Eax))?;
    } else {
        x.mem.write_u16(lin, x.state.reg16(GpReg::Eax))?;
    }
    Ok(Flow::Next)
}

fn xchg_eb_gb(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG8[modrm as usize];
    let other = x.modrm_operand(modrm, 8)?;
    let a = x.load(other, 8)?;
    let b = x.state.reg8(reg);
    x.store(other, 8, b as u32)?;
    x.state.set_reg8(reg, a as u8);
    Ok(Flow::Next)
}

fn xchg_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let other = x.modrm_operand(modrm, bits)?;
    let a = x.load(other, bits)?;
    let b = x.state.reg(reg, bits);
    x.store(other, bits, b)?;
    x.state.set_reg(reg, bits, a);
    Ok(Flow::Next)
}

/// 0x90 is both NOP and XCHG (E)AX,(E)AX.
fn xchg_eax_reg(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    let a = x.state.reg(GpReg::Eax, bits);
    let b = x.state.reg(reg, bits);
    x.state.set_reg(GpReg::Eax, bits, b);
    x.state.set_reg(reg, bits, a);
    Ok(Flow::Next)
}

fn push_reg(x: &mut Exec) -> Result<Flow, Trap> {
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    let val = x.state.reg(reg, x.op_bits());
    x.push_v(val)
        .map(|_| Flow::Next)
}

fn pop_reg(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    let val = x.pop_v()?;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

fn push_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let val = x.fetch_iv()?;
    x.push_v(val).map(|_| Flow::Next)
}

fn push_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let val = x.fetch_u8()? as i8 as i32 as u32;
    x.push_v(val).map(|_| Flow::Next)
}

fn pop_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let val = x.pop_v()?;
    let modrm = x.fetch_u8()?;
    let dst = x.modrm_operand(modrm, bits)?;
    x.store(dst, bits, val)?;
    Ok(Flow::Next)
}

fn pusha(x: &mut Exec) -> Result<Flow, Trap> {
    let sp_before = x.state.reg(GpReg::Esp, x.op_bits());
    for reg in [
        GpReg::Eax,
        GpReg::Ecx,
        GpReg::Edx,
        GpReg::Ebx,
    ] {
        let val = x.state.reg(reg, x.op_bits());
        x.push_v(val)?;
    }
    x.push_v(sp_before)?;
    for reg in [GpReg::Ebp, GpReg::Esi, GpReg::Edi] {
        let val = x.state.reg(reg, x.op_bits());
        x.push_v(val)?;
    }
    Ok(Flow::Next)
}

fn popa(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    for reg in [GpReg::Edi, GpReg::Esi, GpReg::Ebp] {
        let val = x.pop_v()?;
        x.state.set_reg(reg, bits, val);
    }
    // The stored SP is discarded.
    let _ = x.pop_v()?;
    for reg in [GpReg::Ebx, GpReg::Edx, GpReg::Ecx, GpReg::Eax] {
        let val = x.pop_v()?;
        x.state.set_reg(reg, bits, val);
    }
    Ok(Flow::Next)
}

fn push_sreg(x: &mut Exec) -> Result<Flow, Trap> {
    let seg = match x.opcode_byte() {
        0x06 => SegReg::Es,
        0x0E => SegReg::Cs,
        0x16 => SegReg::Ss,
        _ => SegReg::Ds,
    };
    let sel = x.state.seg(seg).selector;
    // A 32-bit push still stores only the 16-bit selector value.
    x.push_v(sel as u32).map(|_| Flow::Next)
}

fn pop_sreg(x: &mut Exec) -> Result<Flow, Trap> {
    let seg = match x.opcode_byte() {
        0x07 => SegReg::Es,
        0x17 => SegReg::Ss,
        _ => SegReg::Ds,
    };
    let sel = x.pop_v()? as u16;
    x.load_seg(seg, sel)?;
    Ok(Flow::Next)
}

fn push_fs(x: &mut Exec) -> Result<Flow, Trap> {
    let sel = x.state.seg(SegReg::Fs).selector;
    x.push_v(sel as u32).map(|_| Flow::Next)
}

fn pop_fs(x: &mut Exec) -> Result<Flow, Trap> {
    let sel = x.pop_v()? as u16;
    x.load_seg(SegReg::Fs, sel)?;
    Ok(Flow::Next)
}

fn push_gs(x: &mut Exec) -> Result<Flow, Trap> {
    let sel = x.state.seg(SegReg::Gs).selector;
    x.push_v(sel as u32).map(|_| Flow::Next)
}

fn pop_gs(x: &mut Exec) -> Result<Flow, Trap> {
    let sel = x.pop_v()? as u16;
    x.load_seg(SegReg::Gs, sel)?;
    Ok(Flow::Next)
}

fn pushf(x: &mut Exec) -> Result<Flow, Trap> {
    // VM/RF never reach the stack image.
    let flags = x.state.eflags & !(0x0003_0000);
    x.push_v(flags).map(|_| Flow::Next)
}

fn popf(x: &mut Exec) -> Result<Flow, Trap> {
    use crate::state::{F_IF, F_IOPL};
    let val = x.pop_v()?;
    // CF/PF/AF/ZF/SF/TF/IF/DF/OF plus IOPL, NT and ID.
    let mut mask: u32 = 0x0000_7FD5 | 0x0020_0000;
    if x.state.protected_mode() && x.state.cpl > 0 {
        mask &= !F_IOPL;
        if x.state.cpl > x.state.iopl() {
            mask &= !F_IF;
        }
    }
    if !x.op32 {
        mask &= 0xFFFF;
    }
    x.state.set_eflags(val, mask);
    Ok(Flow::Next)
}

fn sahf(x: &mut Exec) -> Result<Flow, Trap> {
    let ah = x.state.reg8(Reg8::Ah) as u32;
    let mask = F_SF | F_ZF | F_AF | F_PF | F_CF;
    x.state.set_eflags(ah, mask);
    Ok(Flow::Next)
}

fn lahf(x: &mut Exec) -> Result<Flow, Trap> {
    let flags = (x.state.eflags & 0xFF) as u8 | 0x02;
    x.state.set_reg8(Reg8::Ah, flags);
    Ok(Flow::Next)
}

fn xlat(x: &mut Exec) -> Result<Flow, Trap> {
    let offset = if x.addr32 {
        x.state
            .reg32(GpReg::Ebx)
            .wrapping_add(x.state.reg8(Reg8::Al) as u32)
    } else {
        x.state
            .reg16(GpReg::Ebx)
            .wrapping_add(x.state.reg8(Reg8::Al) as u16) as u32
    };
    let val = x.mem.read_u8(x.base_ds.wrapping_add(offset))?;
    x.state.set_reg8(Reg8::Al, val);
    Ok(Flow::Next)
}

#[inline]
fn stack_ptr(x: &Exec) -> u32 {
    if x.state.stack_big() {
        x.state.reg32(GpReg::Esp)
    } else {
        x.state.reg16(GpReg::Esp) as u32
    }
}

fn enter(x: &mut Exec) -> Result<Flow, Trap> {
    let size = x.fetch_u16()? as u32;
    let level = (x.fetch_u8()? & 0x1F) as u32;
    let bits = x.op_bits();

    let old_bp = x.state.reg(GpReg::Ebp, bits);
    x.push_v(old_bp)?;
    let frame = stack_ptr(x);

    if level > 0 {
        let w = bits / 8;
        let ss_base = x.state.seg(SegReg::Ss).base;
        let mut bp = old_bp;
        for _ in 1..level {
            bp = bp.wrapping_sub(w);
            let offset = if x.state.stack_big() { bp } else { bp & 0xFFFF };
            let lin = ss_base.wrapping_add(offset);
            let val = if bits == 32 {
                x.mem.read_u32(lin)?
            } else {
                x.mem.read_u16(lin)? as u32
            };
            x.push_v(val)?;
        }
        x.push_v(frame)?;
    }

    x.state.set_reg(GpReg::Ebp, bits, frame);
    if x.state.stack_big() {
        let esp = x.state.reg32(GpReg::Esp).wrapping_sub(size);
        x.state.set_reg32(GpReg::Esp, esp);
    } else {
        let sp = x.state.reg16(GpReg::Esp).wrapping_sub(size as u16);
        x.state.set_reg16(GpReg::Esp, sp);
    }
    Ok(Flow::Next)
}

fn leave(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    if x.state.stack_big() {
        let ebp = x.state.reg32(GpReg::Ebp);
        x.state.set_reg32(GpReg::Esp, ebp);
    } else {
        let bp = x.state.reg16(GpReg::Ebp);
        x.state.set_reg16(GpReg::Esp, bp);
    }
    let val = x.pop_v()?;
    x.state.set_reg(GpReg::Ebp, bits, val);
    Ok(Flow::Next)
}

/// Undocumented SALC: AL follows the carry flag.
fn salc(x: &mut Exec) -> Result<Flow, Trap> {
    let val = if x.state.flag(F_CF) { 0xFF } else { 0x00 };
    x.state.set_reg8(Reg8::Al, val);
    Ok(Flow::Next)
}

/// Shared body of LES/LDS/LSS/LFS/LGS: load offset then the new selector
/// from a far pointer in memory.
fn load_far_pointer(x: &mut Exec, seg: SegReg) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    if modrm >= 0xC0 {
        return Err(Exception::InvalidOpcode.into());
    }
    let reg = MODRM_REG[modrm as usize];
    let ea = x.resolve_ea(modrm)?;
    let lin = ea.linear();
    let offset = if bits == 32 {
        x.mem.read_u32(lin)?
    } else {
        x.mem.read_u16(lin)? as u32
    };
    let sel_lin = lin.wrapping_add(bits / 8);
    let selector = x.mem.read_u16(sel_lin)?;
    x.load_seg(seg, selector)?;
    x.state.set_reg(reg, bits, offset);
    Ok(Flow::Next)
}

fn les(x: &mut Exec) -> Result<Flow, Trap> {
    load_far_pointer(x, SegReg::Es)
}

fn lds(x: &mut Exec) -> Result<Flow, Trap> {
    load_far_pointer(x, SegReg::Ds)
}

fn lss(x: &mut Exec) -> Result<Flow, Trap> {
    load_far_pointer(x, SegReg::Ss)
}

fn lfs(x: &mut Exec) -> Result<Flow, Trap> {
    load_far_pointer(x, SegReg::Fs)
}

fn lgs(x: &mut Exec) -> Result<Flow, Trap> {
    load_far_pointer(x, SegReg::Gs)
}

fn movzx_gv_eb(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, 8)?;
    let val = x.load(src, 8)?;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

fn movzx_gv_ew(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, 16)?;
    let val = x.load(src, 16)?;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

fn movsx_gv_eb(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, 8)?;
    let val = x.load(src, 8)? as u8 as i8 as i32 as u32;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

fn movsx_gv_ew(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src = x.modrm_operand(modrm, 16)?;
    let val = x.load(src, 16)? as u16 as i16 as i32 as u32;
    x.state.set_reg(reg, bits, val);
    Ok(Flow::Next)
}

fn xadd_eb_gb(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG8[modrm as usize];
    let dst = x.modrm_operand(modrm, 8)?;
    let a = x.load(dst, 8)?;
    let b = x.state.reg8(reg) as u32;
    let sum = add_flags(x.state, a, b, 8);
    x.state.set_reg8(reg, a as u8);
    x.store(dst, 8, sum)?;
    Ok(Flow::Next)
}

fn xadd_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let dst = x.modrm_operand(modrm, bits)?;
    let a = x.load(dst, bits)?;
    let b = x.state.reg(reg, bits);
    let sum = add_flags(x.state, a, b, bits);
    x.state.set_reg(reg, bits, a);
    x.store(dst, bits, sum)?;
    Ok(Flow::Next)
}

fn cmpxchg_eb_gb(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG8[modrm as usize];
    let dst = x.modrm_operand(modrm, 8)?;
    let val = x.load(dst, 8)?;
    let al = x.state.reg8(Reg8::Al) as u32;
    if al == val {
        let src = x.state.reg8(reg) as u32;
        x.store(dst, 8, src)?;
        x.state.set_flag(F_ZF, true);
    } else {
        // The miss branch still writes: real hardware always issues the
        // store, and software can observe that.
        x.store(dst, 8, val)?;
        x.state.set_reg8(Reg8::Al, val as u8);
        x.state.set_flag(F_ZF, false);
    }
    Ok(Flow::Next)
}

fn cmpxchg_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let dst = x.modrm_operand(modrm, bits)?;
    let val = x.load(dst, bits)?;
    let acc = x.state.reg(GpReg::Eax, bits);
    if acc == val {
        let src = x.state.reg(reg, bits);
        x.store(dst, bits, src)?;
        x.state.set_flag(F_ZF, true);
    } else {
        x.store(dst, bits, val)?;
        x.state.set_reg(GpReg::Eax, bits, val);
        x.state.set_flag(F_ZF, false);
    }
    Ok(Flow::Next)
}

fn bswap_reg(x: &mut Exec) -> Result<Flow, Trap> {
    x.require_generation(CpuGeneration::I486)?;
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    // 16-bit BSWAP swaps the low word; the documented forms are 32-bit.
    if x.op32 {
        let val = x.state.reg32(reg);
        x.state.set_reg32(reg, val.swap_bytes());
    } else {
        let val = x.state.reg16(reg);
        x.state.set_reg16(reg, val.swap_bytes());
    }
    Ok(Flow::Next)
}
