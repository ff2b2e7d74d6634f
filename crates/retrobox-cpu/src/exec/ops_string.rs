//! String operations with REP/REPE/REPNE.
//!
//! Registers commit after every element, so a page fault mid-repetition
//! leaves (E)SI/(E)DI/(E)CX describing the progress made; the rewound
//! instruction pointer then resumes the iteration exactly where the
//! hardware would.

use super::ops_alu::{set_szp, sign_bit};
use super::{both, Exec, Flow, OpFn, Rep};
use crate::exception::Trap;
use crate::state::{CpuState, F_AF, F_CF, F_DF, F_OF, F_ZF, GpReg, Reg8};

pub(super) fn register(t: &mut [OpFn]) {
    both(t, 0xA4, movs);
    both(t, 0xA5, movs);
    both(t, 0xA6, cmps);
    both(t, 0xA7, cmps);
    both(t, 0xAA, stos);
    both(t, 0xAB, stos);
    both(t, 0xAC, lods);
    both(t, 0xAD, lods);
    both(t, 0xAE, scas);
    both(t, 0xAF, scas);
}

/// Element width in bytes: opcode bit 0 selects byte vs operand-sized.
fn width(x: &Exec) -> u32 {
    if x.opcode_byte() & 1 == 0 {
        1
    } else if x.op32 {
        4
    } else {
        2
    }
}

#[inline]
fn index_reg(x: &Exec, reg: GpReg) -> u32 {
    if x.addr32 {
        x.state.reg32(reg)
    } else {
        x.state.reg16(reg) as u32
    }
}

#[inline]
fn advance_index(x: &mut Exec, reg: GpReg, step: i32) {
    if x.addr32 {
        let v = x.state.reg32(reg).wrapping_add(step as u32);
        x.state.set_reg32(reg, v);
    } else {
        let v = x.state.reg16(reg).wrapping_add(step as u16);
        x.state.set_reg16(reg, v);
    }
}

#[inline]
fn count(x: &Exec) -> u32 {
    if x.rep.is_none() {
        1
    } else {
        index_reg(x, GpReg::Ecx)
    }
}

#[inline]
fn consume_count(x: &mut Exec) {
    if x.rep.is_some() {
        advance_index(x, GpReg::Ecx, -1);
    }
}

fn read_element(x: &mut Exec, lin: u32, w: u32) -> Result<u32, Trap> {
    Ok(match w {
        1 => x.mem.read_u8(lin)? as u32,
        2 => x.mem.read_u16(lin)? as u32,
        _ => x.mem.read_u32(lin)?,
    })
}

fn write_element(x: &mut Exec, lin: u32, w: u32, val: u32) -> Result<(), Trap> {
    match w {
        1 => x.mem.write_u8(lin, val as u8)?,
        2 => x.mem.write_u16(lin, val as u16)?,
        _ => x.mem.write_u32(lin, val)?,
    }
    Ok(())
}

/// CMPS/SCAS compare flags (a - b).
fn compare_flags(state: &mut CpuState, a: u32, b: u32, bits: u32) {
    let res = a.wrapping_sub(b) & super::ops_alu::mask_bits(bits);
    state.set_flag(F_CF, b > a);
    state.set_flag(F_OF, (a ^ b) & (a ^ res) & sign_bit(bits) != 0);
    state.set_flag(F_AF, (a ^ b ^ res) & 0x10 != 0);
    set_szp(state, res, bits);
}

fn movs(x: &mut Exec) -> Result<Flow, Trap> {
    let w = width(x);
    let step = if x.state.flag(F_DF) {
        -(w as i32)
    } else {
        w as i32
    };
    let es_base = x.state.seg(crate::state::SegReg::Es).base;
    let mut remaining = count(x);
    while remaining != 0 {
        let src = x.base_ds.wrapping_add(index_reg(x, GpReg::Esi));
        let dst = es_base.wrapping_add(index_reg(x, GpReg::Edi));
        let val = read_element(x, src, w)?;
        write_element(x, dst, w, val)?;
        advance_index(x, GpReg::Esi, step);
        advance_index(x, GpReg::Edi, step);
        consume_count(x);
        remaining -= 1;
    }
    Ok(Flow::Next)
}

fn stos(x: &mut Exec) -> Result<Flow, Trap> {
    let w = width(x);
    let step = if x.state.flag(F_DF) {
        -(w as i32)
    } else {
        w as i32
    };
    let es_base = x.state.seg(crate::state::SegReg::Es).base;
    let val = x.state.reg(GpReg::Eax, 32);
    let mut remaining = count(x);
    while remaining != 0 {
        let dst = es_base.wrapping_add(index_reg(x, GpReg::Edi));
        write_element(x, dst, w, val)?;
        advance_index(x, GpReg::Edi, step);
        consume_count(x);
        remaining -= 1;
    }
    Ok(Flow::Next)
}

fn lods(x: &mut Exec) -> Result<Flow, Trap> {
    let w = width(x);
    let step = if x.state.flag(F_DF) {
        -(w as i32)
    } else {
        w as i32
    };
    let mut remaining = count(x);
    while remaining != 0 {
        let src = x.base_ds.wrapping_add(index_reg(x, GpReg::Esi));
        let val = read_element(x, src, w)?;
        match w {
            1 => x.state.set_reg8(Reg8::Al, val as u8),
            2 => x.state.set_reg16(GpReg::Eax, val as u16),
            _ => x.state.set_reg32(GpReg::Eax, val),
        }
        advance_index(x, GpReg::Esi, step);
        consume_count(x);
        remaining -= 1;
    }
    Ok(Flow::Next)
}

fn cmps(x: &mut Exec) -> Result<Flow, Trap> {
    let w = width(x);
    let bits = w * 8;
    let step = if x.state.flag(F_DF) {
        -(w as i32)
    } else {
        w as i32
    };
    let es_base = x.state.seg(crate::state::SegReg::Es).base;
    let rep = x.rep;
    let mut remaining = count(x);
    while remaining != 0 {
        let src = x.base_ds.wrapping_add(index_reg(x, GpReg::Esi));
        let dst = es_base.wrapping_add(index_reg(x, GpReg::Edi));
        let a = read_element(x, src, w)?;
        let b = read_element(x, dst, w)?;
        compare_flags(x.state, a, b, bits);
        advance_index(x, GpReg::Esi, step);
        advance_index(x, GpReg::Edi, step);
        consume_count(x);
        remaining -= 1;
        match rep {
            Some(Rep::E) if !x.state.flag(F_ZF) => break,
            Some(Rep::Ne) if x.state.flag(F_ZF) => break,
            _ => {}
        }
    }
    Ok(Flow::Next)
}

fn scas(x: &mut Exec) -> Result<Flow, Trap> {
    let w = width(x);
    let bits = w * 8;
    let step = if x.state.flag(F_DF) {
        -(w as i32)
    } else {
        w as i32
    };
    let es_base = x.state.seg(crate::state::SegReg::Es).base;
    let acc = x.state.reg(GpReg::Eax, bits.max(16)) & super::ops_alu::mask_bits(bits);
    let rep = x.rep;
    let mut remaining = count(x);
    while remaining != 0 {
        let dst = es_base.wrapping_add(index_reg(x, GpReg::Edi));
        let b = read_element(x, dst, w)?;
        compare_flags(x.state, acc, b, bits);
        advance_index(x, GpReg::Edi, step);
        consume_count(x);
        remaining -= 1;
        match rep {
            Some(Rep::E) if !x.state.flag(F_ZF) => break,
            Some(Rep::Ne) if x.state.flag(F_ZF) => break,
            _ => {}
        }
    }
    Ok(Flow::Next)
}
