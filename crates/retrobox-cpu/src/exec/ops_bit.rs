//! Bit tests, bit scans and double shifts.
//!
//! The memory forms of BT/BTS/BTR/BTC address the bit string relative to the
//! effective address: the register bit offset is an arithmetic displacement
//! in operand-sized units, and 16-bit addressing re-wraps the displaced
//! offset inside the selected segment.

use super::ops_alu::{mask_bits, set_szp, sign_bit};
use super::{both_0f, Exec, Flow, OpFn};
use crate::exception::Trap;
use crate::modrm::{MODRM_REG, MODRM_RM};
use crate::state::{F_CF, F_OF, F_ZF, Reg8};

pub(super) fn register(t: &mut [OpFn]) {
    both_0f(t, 0xA3, bt_ev_gv);
    both_0f(t, 0xA4, shld_ib);
    both_0f(t, 0xA5, shld_cl);
    both_0f(t, 0xAB, bts_ev_gv);
    both_0f(t, 0xAC, shrd_ib);
    both_0f(t, 0xAD, shrd_cl);
    both_0f(t, 0xB3, btr_ev_gv);
    both_0f(t, 0xBA, grp8_ev_ib);
    both_0f(t, 0xBB, btc_ev_gv);
    both_0f(t, 0xBC, bsf_gv_ev);
    both_0f(t, 0xBD, bsr_gv_ev);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

impl BitOp {
    #[inline]
    fn apply(self, val: u32, mask: u32) -> u32 {
        match self {
            BitOp::Test => val,
            BitOp::Set => val | mask,
            BitOp::Reset => val & !mask,
            BitOp::Complement => val ^ mask,
        }
    }
}

/// BT/BTS/BTR/BTC with a register bit offset.
fn bit_op(x: &mut Exec, op: BitOp) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let offset = x.state.reg(MODRM_REG[modrm as usize], bits);
    let mask = 1u32 << (offset & (bits - 1));

    if modrm >= 0xC0 {
        let reg = MODRM_RM[modrm as usize];
        let val = x.state.reg(reg, bits);
        x.state.set_flag(F_CF, val & mask != 0);
        if op != BitOp::Test {
            x.state.set_reg(reg, bits, op.apply(val, mask));
        }
        return Ok(Flow::Next);
    }

    let mut ea = x.resolve_ea(modrm)?;
    // The bit offset displaces the effective address in operand-sized
    // units; the shift is arithmetic so negative offsets walk backwards.
    let delta = if bits == 32 {
        ((offset as i32) >> 5).wrapping_mul(4)
    } else {
        (((offset as u16 as i16) >> 4) as i32).wrapping_mul(2)
    };
    ea.displace(delta);

    let lin = ea.linear();
    let old = if bits == 32 {
        x.mem.read_u32(lin)?
    } else {
        x.mem.read_u16(lin)? as u32
    };
    x.state.set_flag(F_CF, old & mask != 0);
    if op != BitOp::Test {
        let new = op.apply(old, mask);
        if bits == 32 {
            x.mem.write_u32(lin, new)?;
        } else {
            x.mem.write_u16(lin, new as u16)?;
        }
    }
    Ok(Flow::Next)
}

fn bt_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    bit_op(x, BitOp::Test)
}

fn bts_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    bit_op(x, BitOp::Set)
}

fn btr_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    bit_op(x, BitOp::Reset)
}

fn btc_ev_gv(x: &mut Exec) -> Result<Flow, Trap> {
    bit_op(x, BitOp::Complement)
}

/// Group 8: BT/BTS/BTR/BTC with an immediate bit offset. The immediate is
/// taken modulo the operand width; the effective address is not displaced.
/// Sub-opcodes 0–3 have no defined operation: reaching one means the
/// dispatch tables and decoder disagree, which is an emulator bug, not
/// guest behavior.
fn grp8_ev_ib(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let op = match (modrm >> 3) & 7 {
        4 => BitOp::Test,
        5 => BitOp::Set,
        6 => BitOp::Reset,
        7 => BitOp::Complement,
        _ => return Err(x.illegal_dispatch()),
    };

    let dst = x.modrm_operand(modrm, bits)?;
    let old = x.load(dst, bits)?;
    let imm = x.fetch_u8()? as u32;
    let mask = 1u32 << (imm & (bits - 1));
    x.state.set_flag(F_CF, old & mask != 0);
    if op != BitOp::Test {
        x.store(dst, bits, op.apply(old, mask))?;
    }
    Ok(Flow::Next)
}

fn bsf_gv_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src_op = x.modrm_operand(modrm, bits)?;
    let val = x.load(src_op, bits)?;
    if val == 0 {
        x.state.set_flag(F_ZF, true);
    } else {
        x.state.set_flag(F_ZF, false);
        x.state.set_reg(reg, bits, val.trailing_zeros());
    }
    Ok(Flow::Next)
}

fn bsr_gv_ev(x: &mut Exec) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let reg = MODRM_REG[modrm as usize];
    let src_op = x.modrm_operand(modrm, bits)?;
    let val = x.load(src_op, bits)?;
    if val == 0 {
        x.state.set_flag(F_ZF, true);
    } else {
        x.state.set_flag(F_ZF, false);
        x.state.set_reg(reg, bits, 31 - val.leading_zeros());
    }
    Ok(Flow::Next)
}

#[derive(Debug, Clone, Copy)]
enum ShiftCount {
    /// Immediate count byte, fetched after the ModRM/displacement bytes.
    Imm,
    Cl,
}

fn double_shift(x: &mut Exec, left: bool, count: ShiftCount) -> Result<Flow, Trap> {
    let bits = x.op_bits();
    let modrm = x.fetch_u8()?;
    let filler = x.state.reg(MODRM_REG[modrm as usize], bits);
    let dst = x.modrm_operand(modrm, bits)?;
    let count = match count {
        ShiftCount::Imm => x.fetch_u8()? as u32,
        ShiftCount::Cl => x.state.reg8(Reg8::Cl) as u32,
    } & 0x1F;
    if count == 0 {
        return Ok(Flow::Next);
    }

    let a = x.load(dst, bits)? & mask_bits(bits);
    let b = filler & mask_bits(bits);
    // The composite is 2×bits wide, so widen far enough that a 32-bit
    // double shift cannot push the carry out of range.
    let (res, cf) = if left {
        let wide = ((a as u128) << bits) | b as u128;
        let shifted = wide << count;
        (
            ((shifted >> bits) as u32) & mask_bits(bits),
            (shifted >> (2 * bits)) & 1 != 0,
        )
    } else {
        let wide = ((b as u128) << bits) | a as u128;
        (
            ((wide >> count) as u32) & mask_bits(bits),
            (wide >> (count - 1)) & 1 != 0,
        )
    };

    x.state.set_flag(F_CF, cf);
    x.state
        .set_flag(F_OF, (res ^ a) & sign_bit(bits) != 0 && count == 1);
    set_szp(x.state, res, bits);
    x.store(dst, bits, res)?;
    Ok(Flow::Next)
}

fn shld_ib(x: &mut Exec) -> Result<Flow, Trap> {
    double_shift(x, true, ShiftCount::Imm)
}

fn shrd_ib(x: &mut Exec) -> Result<Flow, Trap> {
    double_shift(x, false, ShiftCount::Imm)
}

fn shld_cl(x: &mut Exec) -> Result<Flow, Trap> {
    double_shift(x, true, ShiftCount::Cl)
}

fn shrd_cl(x: &mut Exec) -> Result<Flow, Trap> {
    double_shift(x, false, ShiftCount::Cl)
}
