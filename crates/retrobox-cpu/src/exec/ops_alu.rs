//! Arithmetic, logic, shift and multiply/divide bodies, with eager flag
//! computation.

use super::{both, both_0f, Exec, Flow, OpFn};
use crate::exception::{Exception, Trap};
use crate::modrm::{MODRM_REG, MODRM_REG8};
use crate::state::{CpuState, GpReg, Reg8, F_AF, F_CF, F_OF, F_PF, F_SF, F_ZF};

pub(super) fn register(t: &mut [OpFn]) {
    for group in 0..8usize {
        let base = group * 8;
        both(t, base, alu_eb_gb);
        both(t, base + 1, alu_ev_gv);
        both(t, base + 2, alu_gb_eb);
        both(t, base + 3, alu_gv_ev);
        both(t, base + 4, alu_al_ib);
        both(t, base + 5, alu_eax_iv);
    }
    for op in 0x40..0x48 {
        both(t, op, inc_reg);
    }
    for op in 0x48..0x50 {
        both(t, op, dec_reg);
    }
    both(t, 0x27, daa);
    both(t, 0x2F, das);
    both(t, 0x37, aaa);
    both(t, 0x3F, aas);
    both(t, 0x69, imul_gv_ev_iv);
    both(t, 0x6B, imul_gv_ev_ib);
    both(t, 0x80, grp1_eb);
    both(t, 0x81, grp1_ev_iv);
    both(t, 0x82, grp1_eb);
    both(t, 0x83, grp1_ev_ib);
    both(t, 0x84, test_eb_gb);
    both(t, 0x85, test_ev_gv);
    both(t, 0x98, cbw_cwde);
    both(t, 0x99, cwd_cdq);
    both(t, 0xA8, test_al_ib);
    both(t, 0xA9, test_eax_iv);
    both(t, 0xC0, grp2_eb_ib);
    both(t, 0xC1, grp2_ev_ib);
    both(t, 0xD4, aam);
    both(t, 0xD5, aad);
    both(t, 0xD0, grp2_eb_1);
    both(t, 0xD1, grp2_ev_1);
    both(t, 0xD2, grp2_eb_cl);
    both(t, 0xD3, grp2_ev_cl);
    both(t, 0xF6, grp3_eb);
    both(t, 0xF7, grp3_ev);
    both(t, 0xFE, grp4_eb);
    both_0f(t, 0xAF, imul_gv_ev);
}

#[inline]
pub(crate) fn mask_bits(bits: u32) -> u32 {
    if bits == 32 {
        !0
    } else {
        (1 << bits) - 1
    }
}

#[inline]
pub(crate) fn sign_bit(bits: u32) -> u32 {
    1 << (bits - 1)
}

/// Sign, zero and parity from a result.
pub(crate) fn set_szp(state: &mut CpuState, res: u32, bits: u32) {
    let res = res & mask_bits(bits);
    state.set_flag(F_ZF, res == 0);
    state.set_flag(F_SF, res & sign_bit(bits) != 0);
    state.set_flag(F_PF, (res as u8).count_ones() % 2 == 0);
}

/// Flags for AND/OR/XOR/TEST: CF and OF cleared.
pub(crate) fn set_logic_flags(state: &mut CpuState, res: u32, bits: u32) {
    state.set_flag(F_CF | F_OF | F_AF, false);
    set_szp(state, res, bits);
}

fn add_with_carry(state: &mut CpuState, a: u32, b: u32, carry: u32, bits: u32) -> u32 {
    let mask = mask_bits(bits);
    let wide = a as u64 + b as u64 + carry as u64;
    let res = (wide as u32) & mask;
    state.set_flag(F_CF, wide > mask as u64);
    state.set_flag(F_OF, (a ^ res) & (b ^ res) & sign_bit(bits) != 0);
    state.set_flag(F_AF, (a ^ b ^ res) & 0x10 != 0);
    set_szp(state, res, bits);
    res
}

fn sub_with_borrow(state: &mut CpuState, a: u32, b: u32, borrow: u32, bits: u32) -> u32 {
    let mask = mask_bits(bits);
    let rhs = b as u64 + borrow as u64;
    let res = (a as u64).wrapping_sub(rhs) as u32 & mask;
    state.set_flag(F_CF, rhs > a as u64);
    state.set_flag(F_OF, (a ^ b) & (a ^ res) & sign_bit(bits) != 0);
    state.set_flag(F_AF, (a ^ b ^ res) & 0x10 != 0);
    set_szp(state, res, bits);
    res
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_index(index: u8) -> Self {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    fn from_opcode(opcode: u8) -> Self {
        Self::from_index(opcode >> 3)
    }
}

/// Compute one ALU operation, updating flags. `None` means no write-back
/// (CMP).
fn alu_calc(state: &mut CpuState, op: AluOp, a: u32, b: u32, bits: u32) -> Option<u32> {
    let cf = state.flag(F_CF) as u32;
    let mask = mask_bits(bits);
    match op {
        AluOp::Add => Some(add_with_carry(state, a, b, 0, bits)),
        AluOp::Adc => Some(add_with_carry(state, a, b, cf, bits)),
        AluOp::Sub => Some(sub_with_borrow(state, a, b, 0, bits)),
        AluOp::Sbb => Some(sub_with_borrow(state, a, b, cf, bits)),
        AluOp::Cmp => {
            sub_with_borrow(state, a, b, 0, bits);
            None
        }
        AluOp::And => {
            let res = a & b & mask;
            set_logic_flags(state, res, bits);
            Some(res)
        }
        AluOp::Or => {
            let res = (a | b) & mask;
            set_logic_flags(state, res, bits);
            Some(res)
        }
        AluOp::Xor => {
            let res = (a ^ b) & mask;
            set_logic_flags(state, res, bits);
            Some(res)
        }
    }
}

fn alu_eb_gb(x: &mut Exec) -> Result<Flow, Trap> {
    let op = AluOp::from_opcode(x.opcode_byte());
    let modrm = x.fetch_u8()?;
    let src = x.state.reg8(MODRM_REG8[modrm as usize]) as u32;
    let dst = x.modrm_operand(modrm, 8)?;
    let a = x.load(dst, 8)?;
    if let Some(res) = alu_calc(x.state, op, a, src, 8) {
        x.store(dst, 8, res)?;
    }
    Ok(Flow::Next)
}

fn alu_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    let op = AluOp::from_opcode(x.opcode_byte());
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let src = x.state.reg(MODRM_REG[modrm as usize], bits);
    let dst = x.modrm_operand(modrm, bits)?;
    let a = x.load(dst, bits)?;
    if let Some(res) = alu_calc(x.state, op, a, src, bits) {
        x.store(dst, bits, res)?;
    }
    Ok(Flow::Next)
}

fn alu_gb_eb(x: &mut Exec) -> Result<Flow, Trap> {
    let op = AluOp::from_opcode(x.opcode_byte());
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG8[modrm as usize];
    let src_op = x.modrm_operand(modrm, 8)?;
    let b = x.load(src_op, 8)?;
    let a = x.state.reg8(reg) as u32;
    if let Some(res) = alu_calc(x.state, op, a, b, 8) {
        x.state.set_reg8(reg, res as u8);
    }
    Ok(Flow::Next)
}

fn alu_gv_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let op = AluOp::from_opcode(x.opcode_byte());
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src_op = x.modrm_operand(modrm, bits)?;
    let b = x.load(src_op, bits)?;
    let a = x.state.reg(reg, bits);
    if let Some(res) = alu_calc(x.state, op, a, b, bits) {
        x.state.set_reg(reg, bits, res);
    }
    Ok(Flow::Next)
}

fn alu_al_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let op = AluOp::from_opcode(x.opcode_byte());
    let b = x.fetch_u8()? as u32;
    let a = x.state.reg8(Reg8::Al) as u32;
    if let Some(res) = alu_calc(x.state, op, a, b, 8) {
        x.state.set_reg8(Reg8::Al, res as u8);
    }
    Ok(Flow::Next)
}

fn alu_eax_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let op = AluOp::from_opcode(x.opcode_byte());
    let bits = x.op_bits();
    let b = x.fetch_iv()?;
    let a = x.state.reg(GpReg::Eax, bits);
    if let Some(res) = alu_calc(x.state, op, a, b, bits) {
        x.state.set_reg(GpReg::Eax, bits, res);
    }
    Ok(Flow::Next)
}

fn grp1_eb(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let op = AluOp::from_index(modrm >> 3);
    let dst = x.modrm_operand(modrm, 8)?;
    let a = x.load(dst, 8)?;
    let b = x.fetch_u8()? as u32;
    if let Some(res) = alu_calc(x.state, op, a, b, 8) {
        x.store(dst, 8, res)?;
    }
    Ok(Flow::Next)
}

fn grp1_ev_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let op = AluOp::from_index(modrm >> 3);
    let dst = x.modrm_operand(modrm, bits)?;
    let a = x.load(dst, bits)?;
    let b = x.fetch_iv()?;
    if let Some(res) = alu_calc(x.state, op, a, b, bits) {
        x.store(dst, bits, res)?;
    }
    Ok(Flow::Next)
}

fn grp1_ev_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let op = AluOp::from_index(modrm >> 3);
    let dst = x.modrm_operand(modrm, bits)?;
    let a = x.load(dst, bits)?;
    let b = (x.fetch_u8()? as i8 as i32 as u32) & mask_bits(bits);
    if let Some(res) = alu_calc(x.state, op, a, b, bits) {
        x.store(dst, bits, res)?;
    }
    Ok(Flow::Next)
}

fn test_eb_gb(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let src = x.state.reg8(MODRM_REG8[modrm as usize]) as u32;
    let dst = x.modrm_operand(modrm, 8)?;
    let a = x.load(dst, 8)?;
    set_logic_flags(x.state, a & src, 8);
    Ok(Flow::Next)
}

fn test_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let src = x.state.reg(MODRM_REG[modrm as usize], bits);
    let dst = x.modrm_operand(modrm, bits)?;
    let a = x.load(dst, bits)?;
    set_logic_flags(x.state, a & src, bits);
    Ok(Flow::Next)
}

fn test_al_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let b = x.fetch_u8()? as u32;
    let a = x.state.reg8(Reg8::Al) as u32;
    set_logic_flags(x.state, a & b, 8);
    Ok(Flow::Next)
}

fn test_eax_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let b = x.fetch_iv()?;
    let a = x.state.reg(GpReg::Eax, bits);
    set_logic_flags(x.state, a & b, bits);
    Ok(Flow::Next)
}

/// Full ADD flag semantics for callers outside the ALU table (XADD).
pub(super) fn add_flags(state: &mut CpuState, a: u32, b: u32, bits: u32) -> u32 {
    add_with_carry(state, a, b, 0, bits)
}

/// INC/DEC leave CF untouched.
pub(crate) fn inc_flags(state: &mut CpuState, a: u32, bits: u32) -> u32 {
    let cf = state.flag(F_CF);
    let res = add_with_carry(state, a, 1, 0, bits);
    state.set_flag(F_CF, cf);
    res
}

pub(crate) fn dec_flags(state: &mut CpuState, a: u32, bits: u32) -> u32 {
    let cf = state.flag(F_CF);
    let res = sub_with_borrow(state, a, 1, 0, bits);
    state.set_flag(F_CF, cf);
    res
}

fn inc_reg(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    let res = inc_flags(x.state, x.state.reg(reg, bits), bits);
    x.state.set_reg(reg, bits, res);
    Ok(Flow::Next)
}

fn dec_reg(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let reg = GpReg::from_index(x.opcode_byte() & 7);
    let res = dec_flags(x.state, x.state.reg(reg, bits), bits);
    x.state.set_reg(reg, bits, res);
    Ok(Flow::Next)
}

// ---------------------------------------------------------------------
// Decimal adjust
// ---------------------------------------------------------------------

fn daa(x: &mut Exec) -> Result<Flow, Trap> {
    let old_al = x.state.reg8(Reg8::Al);
    let old_cf = x.state.flag(F_CF);
    let mut al = old_al;
    if al & 0x0F > 9 || x.state.flag(F_AF) {
        al = al.wrapping_add(6);
        x.state.set_flag(F_AF, true);
    } else {
        x.state.set_flag(F_AF, false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        x.state.set_flag(F_CF, true);
    } else {
        x.state.set_flag(F_CF, false);
    }
    x.state.set_reg8(Reg8::Al, al);
    set_szp(x.state, al as u32, 8);
    Ok(Flow::Next)
}

fn das(x: &mut Exec) -> Result<Flow, Trap> {
    let old_al = x.state.reg8(Reg8::Al);
    let old_cf = x.state.flag(F_CF);
    let mut al = old_al;
    if al & 0x0F > 9 || x.state.flag(F_AF) {
        al = al.wrapping_sub(6);
        x.state.set_flag(F_AF, true);
    } else {
        x.state.set_flag(F_AF, false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        x.state.set_flag(F_CF, true);
    } else {
        x.state.set_flag(F_CF, false);
    }
    x.state.set_reg8(Reg8::Al, al);
    set_szp(x.state, al as u32, 8);
    Ok(Flow::Next)
}

fn aaa(x: &mut Exec) -> Result<Flow, Trap> {
    if x.state.reg8(Reg8::Al) & 0x0F > 9 || x.state.flag(F_AF) {
        let ax = x.state.reg16(GpReg::Eax).wrapping_add(0x106);
        x.state.set_reg16(GpReg::Eax, ax);
        x.state.set_flag(F_AF | F_CF, true);
    } else {
        x.state.set_flag(F_AF | F_CF, false);
    }
    let al = x.state.reg8(Reg8::Al) & 0x0F;
    x.state.set_reg8(Reg8::Al, al);
    Ok(Flow::Next)
}

fn aas(x: &mut Exec) -> Result<Flow, Trap> {
    if x.state.reg8(Reg8::Al) & 0x0F > 9 || x.state.flag(F_AF) {
        let ax = x.state.reg16(GpReg::Eax).wrapping_sub(6);
        x.state.set_reg16(GpReg::Eax, ax);
        let ah = x.state.reg8(Reg8::Ah).wrapping_sub(1);
        x.state.set_reg8(Reg8::Ah, ah);
        x.state.set_flag(F_AF | F_CF, true);
    } else {
        x.state.set_flag(F_AF | F_CF, false);
    }
    let al = x.state.reg8(Reg8::Al) & 0x0F;
    x.state.set_reg8(Reg8::Al, al);
    Ok(Flow::Next)
}

/// AAM divides AL by the immediate base and faults on zero, one of the two
/// ways a guest reaches #DE.
fn aam(x: &mut Exec) -> Result<Flow, Trap> {
    let base = x.fetch_u8()?;
    if base == 0 {
        return Err(Exception::DivideError.into());
    }
    let al = x.state.reg8(Reg8::Al);
    x.state.set_reg8(Reg8::Ah, al / base);
    x.state.set_reg8(Reg8::Al, al % base);
    let al = x.state.reg8(Reg8::Al);
    set_szp(x.state, al as u32, 8);
    Ok(Flow::Next)
}

fn aad(x: &mut Exec) -> Result<Flow, Trap> {
    let base = x.fetch_u8()?;
    let al = x.state.reg8(Reg8::Al) as u16;
    let ah = x.state.reg8(Reg8::Ah) as u16;
    let res = al.wrapping_add(ah.wrapping_mul(base as u16)) as u8;
    x.state.set_reg8(Reg8::Al, res);
    x.state.set_reg8(Reg8::Ah, 0);
    set_szp(x.state, res as u32, 8);
    Ok(Flow::Next)
}

fn cbw_cwde(x: &mut Exec) -> Result<Flow, Trap> {
    if x.op32 {
        let v = x.state.reg16(GpReg::Eax) as i16 as i32 as u32;
        x.state.set_reg32(GpReg::Eax, v);
    } else {
        let v = x.state.reg8(Reg8::Al) as i8 as i16 as u16;
        x.state.set_reg16(GpReg::Eax, v);
    }
    Ok(Flow::Next)
}

fn cwd_cdq(x: &mut Exec) -> Result<Flow, Trap> {
    if x.op32 {
        let sign = (x.state.reg32(GpReg::Eax) as i32) >> 31;
        x.state.set_reg32(GpReg::Edx, sign as u32);
    } else {
        let sign = (x.state.reg16(GpReg::Eax) as i16) >> 15;
        x.state.set_reg16(GpReg::Edx, sign as u16);
    }
    Ok(Flow::Next)
}

/// Signed multiply with CF/OF = "upper half is not a sign extension".
pub(crate) fn imul_flags(state: &mut CpuState, a: u32, b: u32, bits: u32) -> u32 {
    let sa = sign_extend(a, bits) as i64;
    let sb = sign_extend(b, bits) as i64;
    let wide = sa * sb;
    let res = (wide as u32) & mask_bits(bits);
    let fits = wide == sign_extend(res, bits) as i64;
    state.set_flag(F_CF | F_OF, !fits);
    res
}

#[inline]
pub(crate) fn sign_extend(val: u32, bits: u32) -> i32 {
    match bits {
        8 => val as u8 as i8 as i32,
        16 => val as u16 as i16 as i32,
        _ => val as i32,
    }
}

fn imul_gv_ev_iv(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src_op = x.modrm_operand(modrm, bits)?;
    let a = x.load(src_op, bits)?;
    let b = x.fetch_iv()?;
    let res = imul_flags(x.state, a, b, bits);
    x.state.set_reg(reg, bits, res);
    Ok(Flow::Next)
}

fn imul_gv_ev_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src_op = x.modrm_operand(modrm, bits)?;
    let a = x.load(src_op, bits)?;
    let b = x.fetch_u8()? as i8 as i32 as u32;
    let res = imul_flags(x.state, a, b, bits);
    x.state.set_reg(reg, bits, res);
    Ok(Flow::Next)
}

fn imul_gv_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src_op = x.modrm_operand(modrm, bits)?;
    let b = x.load(src_op, bits)?;
    let a = x.state.reg(reg, bits);
    let res = imul_flags(x.state, a, b, bits);
    x.state.set_reg(reg, bits, res);
    Ok(Flow::Next)
}

// ---------------------------------------------------------------------
// Group 2: rotates and shifts
// ---------------------------------------------------------------------

fn shift_calc(state: &mut CpuState, which: u8, a: u32, count: u32, bits: u32) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return a;
    }
    let mask = mask_bits(bits);
    let a = a & mask;
    match which & 7 {
        0 => {
            // ROL
            let c = count % bits;
            let res = if c == 0 {
                a
            } else {
                ((a << c) | (a >> (bits - c))) & mask
            };
            state.set_flag(F_CF, res & 1 != 0);
            state.set_flag(
                F_OF,
                ((res & 1) != 0) ^ ((res & sign_bit(bits)) != 0),
            );
            res
        }
        1 => {
            // ROR
            let c = count % bits;
            let res = if c == 0 {
                a
            } else {
                ((a >> c) | (a << (bits - c))) & mask
            };
            state.set_flag(F_CF, res & sign_bit(bits) != 0);
            state.set_flag(
                F_OF,
                ((res & sign_bit(bits)) != 0) ^ ((res & sign_bit(bits) >> 1) != 0),
            );
            res
        }
        2 => {
            // RCL: rotate through carry.
            let mut res = a;
            let mut cf = state.flag(F_CF);
            for _ in 0..count % (bits + 1) {
                let new_cf = res & sign_bit(bits) != 0;
                res = ((res << 1) | cf as u32) & mask;
                cf = new_cf;
            }
            state.set_flag(F_CF, cf);
            state.set_flag(F_OF, ((res & sign_bit(bits)) != 0) ^ cf);
            res
        }
        3 => {
            // RCR
            let mut res = a;
            let mut cf = state.flag(F_CF);
            for _ in 0..count % (bits + 1) {
                let new_cf = res & 1 != 0;
                res = (res >> 1) | ((cf as u32) << (bits - 1));
                cf = new_cf;
            }
            state.set_flag(F_CF, cf);
            state.set_flag(
                F_OF,
                ((res & sign_bit(bits)) != 0) ^ ((res & sign_bit(bits) >> 1) != 0),
            );
            res
        }
        4 | 6 => {
            // SHL (and its undocumented /6 alias)
            let wide = (a as u64) << count;
            let res = wide as u32 & mask;
            state.set_flag(F_CF, wide & (1u64 << bits) != 0);
            state.set_flag(
                F_OF,
                ((res & sign_bit(bits)) != 0) ^ state.flag(F_CF),
            );
            set_szp(state, res, bits);
            res
        }
        5 => {
            // SHR
            let res = if count >= bits { 0 } else { a >> count };
            let cf = if count > bits {
                false
            } else {
                (a >> (count - 1)) & 1 != 0
            };
            state.set_flag(F_CF, cf);
            state.set_flag(F_OF, a & sign_bit(bits) != 0);
            set_szp(state, res, bits);
            res
        }
        _ => {
            // SAR
            let sa = sign_extend(a, bits);
            let c = count.min(31);
            let res = (sa >> c) as u32 & mask;
            let cf = if count > 31 {
                sa < 0
            } else {
                (sa >> (count - 1)) & 1 != 0
            };
            state.set_flag(F_CF, cf);
            state.set_flag(F_OF, false);
            set_szp(state, res, bits);
            res
        }
    }
}

fn grp2(x: &mut Exec, bits: u32, count: ShiftCount) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let which = (modrm >> 3) & 7;
    let dst = x.modrm_operand(modrm, bits)?;
    let a = x.load(dst, bits)?;
    let count = match count {
        ShiftCount::Imm => x.fetch_u8()? as u32,
        ShiftCount::One => 1,
        ShiftCount::Cl => x.state.reg8(Reg8::Cl) as u32,
    };
    let res = shift_calc(x.state, which, a, count, bits);
    x.store(dst, bits, res)?;
    Ok(Flow::Next)
}

#[derive(Clone, Copy)]
enum ShiftCount {
    Imm,
    One,
    Cl,
}

fn grp2_eb_ib(x: &mut Exec) -> Result<Flow, Trap> {
    grp2(x, 8, ShiftCount::Imm)
}

fn grp2_ev_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    grp2(x, bits, ShiftCount::Imm)
}

fn grp2_eb_1(x: &mut Exec) -> Result<Flow, Trap> {
    grp2(x, 8, ShiftCount::One)
}

fn grp2_ev_1(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    grp2(x, bits, ShiftCount::One)
}

fn grp2_eb_cl(x: &mut Exec) -> Result<Flow, Trap> {
    grp2(x, 8, ShiftCount::Cl)
}

fn grp2_ev_cl(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    grp2(x, bits, ShiftCount::Cl)
}

// ---------------------------------------------------------------------
// Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV
// ---------------------------------------------------------------------

fn grp3(x: &mut Exec, bits: u32) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let which = (modrm >> 3) & 7;
    let dst = x.modrm_operand(modrm, bits)?;
    match which {
        // TEST Ev,Iv (and its undocumented /1 alias).
        0 | 1 => {
            let a = x.load(dst, bits)?;
            let b = if bits == 8 {
                x.fetch_u8()? as u32
            } else {
                x.fetch_iv()?
            };
            set_logic_flags(x.state, a & b, bits);
        }
        2 => {
            let a = x.load(dst, bits)?;
            x.store(dst, bits, !a)?;
        }
        3 => {
            let a = x.load(dst, bits)?;
            let res = sub_with_borrow(x.state, 0, a, 0, bits);
            x.store(dst, bits, res)?;
        }
        4 => {
            let a = x.load(dst, bits)?;
            mul_unsigned(x.state, a, bits);
        }
        5 => {
            let a = x.load(dst, bits)?;
            mul_signed(x.state, a, bits);
        }
        6 => {
            let a = x.load(dst, bits)?;
            div_unsigned(x.state, a, bits)?;
        }
        _ => {
            let a = x.load(dst, bits)?;
            div_signed(x.state, a, bits)?;
        }
    }
    Ok(Flow::Next)
}

fn grp3_eb(x: &mut Exec) -> Result<Flow, Trap> {
    grp3(x, 8)
}

fn grp3_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    grp3(x, bits)
}

fn mul_unsigned(state: &mut CpuState, b: u32, bits: u32) {
    match bits {
        8 => {
            let res = state.reg8(Reg8::Al) as u32 * b;
            state.set_reg16(GpReg::Eax, res as u16);
            state.set_flag(F_CF | F_OF, res > 0xFF);
        }
        16 => {
            let res = state.reg16(GpReg::Eax) as u32 * b;
            state.set_reg16(GpReg::Eax, res as u16);
            state.set_reg16(GpReg::Edx, (res >> 16) as u16);
            state.set_flag(F_CF | F_OF, res > 0xFFFF);
        }
        _ => {
            let res = state.reg32(GpReg::Eax) as u64 * b as u64;
            state.set_reg32(GpReg::Eax, res as u32);
            state.set_reg32(GpReg::Edx, (res >> 32) as u32);
            state.set_flag(F_CF | F_OF, res > 0xFFFF_FFFF);
        }
    }
}

fn mul_signed(state: &mut CpuState, b: u32, bits: u32) {
    let sb = sign_extend(b, bits) as i64;
    match bits {
        8 => {
            let res = state.reg8(Reg8::Al) as i8 as i64 * sb;
            state.set_reg16(GpReg::Eax, res as u16);
            state.set_flag(F_CF | F_OF, res != res as i8 as i64);
        }
        16 => {
            let res = state.reg16(GpReg::Eax) as i16 as i64 * sb;
            state.set_reg16(GpReg::Eax, res as u16);
            state.set_reg16(GpReg::Edx, (res >> 16) as u16);
            state.set_flag(F_CF | F_OF, res != res as i16 as i64);
        }
        _ => {
            let res = state.reg32(GpReg::Eax) as i32 as i64 * sb;
            state.set_reg32(GpReg::Eax, res as u32);
            state.set_reg32(GpReg::Edx, (res >> 32) as u32);
            state.set_flag(F_CF | F_OF, res != res as i32 as i64);
        }
    }
}

fn div_unsigned(state: &mut CpuState, b: u32, bits: u32) -> Result<(), Trap> {
    if b == 0 {
        return Err(Exception::DivideError.into());
    }
    match bits {
        8 => {
            let num = state.reg16(GpReg::Eax) as u32;
            let quot = num / b;
            if quot > 0xFF {
                return Err(Exception::DivideError.into());
            }
            state.set_reg8(Reg8::Al, quot as u8);
            state.set_reg8(Reg8::Ah, (num % b) as u8);
        }
        16 => {
            let num = ((state.reg16(GpReg::Edx) as u32) << 16) | state.reg16(GpReg::Eax) as u32;
            let quot = num / b;
            if quot > 0xFFFF {
                return Err(Exception::DivideError.into());
            }
            state.set_reg16(GpReg::Eax, quot as u16);
            state.set_reg16(GpReg::Edx, (num % b) as u16);
        }
        _ => {
            let num = ((state.reg32(GpReg::Edx) as u64) << 32) | state.reg32(GpReg::Eax) as u64;
            let quot = num / b as u64;
            if quot > 0xFFFF_FFFF {
                return Err(Exception::DivideError.into());
            }
            state.set_reg32(GpReg::Eax, quot as u32);
            state.set_reg32(GpReg::Edx, (num % b as u64) as u32);
        }
    }
    Ok(())
}

fn div_signed(state: &mut CpuState, b: u32, bits: u32) -> Result<(), Trap> {
    let sb = sign_extend(b, bits) as i64;
    if sb == 0 {
        return Err(Exception::DivideError.into());
    }
    match bits {
        8 => {
            let num = state.reg16(GpReg::Eax) as i16 as i64;
            let quot = num / sb;
            if quot != quot as i8 as i64 {
                return Err(Exception::DivideError.into());
            }
            state.set_reg8(Reg8::Al, quot as u8);
            state.set_reg8(Reg8::Ah, (num % sb) as u8);
        }
        16 => {
            let num = (((state.reg16(GpReg::Edx) as u32 as i64) << 16)
                | state.reg16(GpReg::Eax) as i64) as i32 as i64;
            let quot = num / sb;
            if quot != quot as i16 as i64 {
                return Err(Exception::DivideError.into());
            }
            state.set_reg16(GpReg::Eax, quot as u16);
            state.set_reg16(GpReg::Edx, (num % sb) as u16);
        }
        _ => {
            let num = (((state.reg32(GpReg::Edx) as u64) << 32) | state.reg32(GpReg::Eax) as u64)
                as i64;
            let quot = num.checked_div(sb).ok_or(Exception::DivideError)?;
            if quot != quot as i32 as i64 {
                return Err(Exception::DivideError.into());
            }
            state.set_reg32(GpReg::Eax, quot as u32);
            state.set_reg32(GpReg::Edx, (num % sb) as u32);
        }
    }
    Ok(())
}

fn grp4_eb(x: &mut Exec) -> Result<Flow, Trap> {
    let modrm = x.fetch_u8()?;
    let dst = x.modrm_operand(modrm, 8)?;
    match (modrm >> 3) & 7 {
        0 => {
            let a = x.load(dst, 8)?;
            let res = inc_flags(x.state, a, 8);
            x.store(dst, 8, res)?;
        }
        1 => {
            let a = x.load(dst, 8)?;
            let res = dec_flags(x.state, a, 8);
            x.store(dst, 8, res)?;
        }
        _ => return Err(Exception::InvalidOpcode.into()),
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CpuState;

    #[test]
    fn add_carry_overflow_and_zero() {
        let mut state = CpuState::new();

        let res = add_with_carry(&mut state, 0xFF, 1, 0, 8);
        assert_eq!(res, 0);
        assert!(state.flag(F_CF));
        assert!(state.flag(F_ZF));
        assert!(!state.flag(F_OF));

        let res = add_with_carry(&mut state, 0x7F, 1, 0, 8);
        assert_eq!(res, 0x80);
        assert!(!state.flag(F_CF));
        assert!(state.flag(F_OF));
        assert!(state.flag(F_SF));
    }

    #[test]
    fn sub_borrow_and_signed_overflow() {
        let mut state = CpuState::new();

        let res = sub_with_borrow(&mut state, 0, 1, 0, 16);
        assert_eq!(res, 0xFFFF);
        assert!(state.flag(F_CF));
        assert!(state.flag(F_SF));

        let res = sub_with_borrow(&mut state, 0x8000, 1, 0, 16);
        assert_eq!(res, 0x7FFF);
        assert!(state.flag(F_OF));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut state = CpuState::new();
        state.set_flag(F_CF, true);
        let res = inc_flags(&mut state, 0xFFFF_FFFF, 32);
        assert_eq!(res, 0);
        assert!(state.flag(F_ZF));
        assert!(state.flag(F_CF));
    }

    #[test]
    fn shifts_report_the_last_bit_out() {
        let mut state = CpuState::new();

        let res = shift_calc(&mut state, 4, 0x8001, 1, 16);
        assert_eq!(res, 0x0002);
        assert!(state.flag(F_CF));

        let res = shift_calc(&mut state, 5, 0x0003, 1, 16);
        assert_eq!(res, 0x0001);
        assert!(state.flag(F_CF));

        // SAR keeps the sign.
        let res = shift_calc(&mut state, 7, 0x8000, 4, 16);
        assert_eq!(res, 0xF800);
    }

    #[test]
    fn rotate_through_carry_round_trips() {
        let mut state = CpuState::new();
        state.set_flag(F_CF, false);
        // 9 RCLs of an 8-bit value bring it back (8 bits + CF).
        let mut val = 0xA5u32;
        for _ in 0..9 {
            val = shift_calc(&mut state, 2, val, 1, 8);
        }
        assert_eq!(val, 0xA5);
        assert!(!state.flag(F_CF));
    }

    #[test]
    fn imul_overflow_flags() {
        let mut state = CpuState::new();
        let res = imul_flags(&mut state, 0x40, 4, 8);
        assert_eq!(res, 0);
        assert!(state.flag(F_CF) && state.flag(F_OF));

        let res = imul_flags(&mut state, 0xF0, 2, 8); // -16 * 2 fits
        assert_eq!(res, 0xE0);
        assert!(!state.flag(F_CF));
    }

    #[test]
    fn division_edge_cases() {
        let mut state = CpuState::new();
        state.set_reg16(GpReg::Eax, 100);
        assert!(div_unsigned(&mut state, 0, 8).is_err());

        // 0x1234 / 2 fits in AL? 0x91A does not: quotient overflow faults.
        state.set_reg16(GpReg::Eax, 0x1234);
        assert!(div_unsigned(&mut state, 2, 8).is_err());

        state.set_reg16(GpReg::Eax, 100);
        div_unsigned(&mut state, 7, 8).unwrap();
        assert_eq!(state.reg8(Reg8::Al), 14);
        assert_eq!(state.reg8(Reg8::Ah), 2);
    }
}
