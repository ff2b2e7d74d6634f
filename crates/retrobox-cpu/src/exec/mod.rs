//! The instruction dispatcher.
//!
//! Decoding folds the legacy prefixes into a table index instead of
//! branching at execute time: the 1024-entry dispatch table is indexed by
//! `(operand-size state) × (0F escape) × opcode byte` and built once when
//! the [`Cpu`] is constructed. Group opcodes select their sub-operation from
//! ModRM bits 3–5 inside the handler body.
//!
//! Handler bodies return `Result<Flow, Trap>`: guest faults unwind as
//! values, get the instruction pointer rewound to the faulting instruction,
//! and are synthesized into the guest's own exception delivery path.
//! Host-fatal conditions (an opcode group with no matching sub-case) abort
//! the session with a diagnostic instead.

mod ops_alu;
mod ops_bit;
mod ops_ctrl;
mod ops_data;
mod ops_string;

use crate::exception::{Exception, Fatal, Trap};
use crate::modrm::{Disp, Ea, EA16, EA32, MODRM_RM, MODRM_RM8};
use crate::segments::load_segment;
use crate::state::{CpuState, F_IF, F_NT, F_TF, GpReg, Reg8, SegReg, CR0_WP};
use retrobox_memory::Memory;

/// Table-index bit for "operand-size override active".
const OP_SIZE: usize = 0x100;
/// Table-index bit for "0F escape".
const OP_0F: usize = 0x200;
const TABLE_LEN: usize = 0x400;

pub(crate) type OpFn = fn(&mut Exec<'_>) -> Result<Flow, Trap>;

/// Outcome of one executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Fall through; the instruction pointer already advanced past the
    /// instruction during fetching.
    Next,
    /// A control transfer wrote the instruction pointer itself.
    Jumped,
    /// HLT.
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rep {
    E,
    Ne,
}

/// Minimum emulated CPU generation; instructions introduced later fault as
/// undefined opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuGeneration {
    I386,
    I486,
    Pentium,
}

#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub generation: CpuGeneration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            generation: CpuGeneration::Pentium,
        }
    }
}

/// Why [`Cpu::step`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Continue,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Completed,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub executed: u64,
    pub exit: RunExit,
}

/// One x86 core: architectural state plus the prebuilt dispatch tables.
pub struct Cpu {
    pub state: CpuState,
    pub config: CoreConfig,
    ops: Box<[OpFn]>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl Cpu {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            state: CpuState::new(),
            config,
            ops: build_ops(),
        }
    }

    /// Execute a single instruction. Guest faults are delivered to the
    /// guest's handler and report [`StepExit::Continue`]; only host-fatal
    /// conditions surface as `Err`.
    pub fn step(&mut self, mem: &mut Memory) -> Result<StepExit, Fatal> {
        if self.state.halted {
            return Ok(StepExit::Halted);
        }

        mem.set_privilege(self.state.cpl, self.state.cr0 & CR0_WP != 0);
        self.state.tsc = self.state.tsc.wrapping_add(1);

        let start_eip = self.state.eip;
        let code_big = self.state.code_big();
        let mut x = Exec {
            base_ds: self.state.seg(SegReg::Ds).base,
            base_ss: self.state.seg(SegReg::Ss).base,
            state: &mut self.state,
            mem: &mut *mem,
            config: &self.config,
            opcode: 0,
            op32: code_big,
            addr32: code_big,
            rep: None,
            start_eip,
        };

        let flow = x.decode_opcode().and_then(|idx| {
            x.opcode = idx;
            (self.ops[idx])(&mut x)
        });

        match flow {
            Ok(Flow::Next) | Ok(Flow::Jumped) => Ok(StepExit::Continue),
            Ok(Flow::Halt) => {
                self.state.halted = true;
                Ok(StepExit::Halted)
            }
            Err(Trap::Fault(e)) => {
                // Faults point at the faulting instruction; effects already
                // committed to memory stay committed.
                self.state.eip = start_eip;
                self.deliver_exception(mem, e)?;
                Ok(StepExit::Continue)
            }
            Err(Trap::Fatal(f)) => {
                tracing::error!(error = %f, "host-fatal dispatch state");
                Err(f)
            }
        }
    }

    /// Execute up to `max_insts` instructions.
    pub fn run(&mut self, mem: &mut Memory, max_insts: u64) -> Result<RunResult, Fatal> {
        let mut executed = 0;
        while executed < max_insts {
            match self.step(mem)? {
                StepExit::Continue => executed += 1,
                StepExit::Halted => {
                    return Ok(RunResult {
                        executed,
                        exit: RunExit::Halted,
                    })
                }
            }
        }
        Ok(RunResult {
            executed,
            exit: RunExit::Completed,
        })
    }

    /// Synthesize a guest fault into the guest's exception path.
    fn deliver_exception(&mut self, mem: &mut Memory, e: Exception) -> Result<(), Fatal> {
        tracing::debug!(exception = %e, vector = e.vector(), "delivering guest exception");
        let vector = e.vector();
        deliver_interrupt(&mut self.state, mem, vector, e.error_code(), false).map_err(|fault| {
            Fatal::DeliveryFailed { vector, fault }
        })
    }

    /// Deliver an external (hardware) interrupt at an instruction boundary.
    pub fn hardware_interrupt(&mut self, mem: &mut Memory, vector: u8) -> Result<(), Fatal> {
        self.state.halted = false;
        deliver_interrupt(&mut self.state, mem, vector, None, false)
            .map_err(|fault| Fatal::DeliveryFailed { vector, fault })
    }
}

/// Per-instruction execution context: the decoded prefix state plus
/// borrowed CPU and memory.
pub(crate) struct Exec<'a> {
    pub state: &'a mut CpuState,
    pub mem: &'a mut Memory,
    pub config: &'a CoreConfig,
    /// Dispatch-table index of the executing opcode.
    pub opcode: usize,
    /// Effective data-segment base (override-aware).
    pub base_ds: u32,
    /// Effective stack-segment base (override-aware).
    pub base_ss: u32,
    pub op32: bool,
    pub addr32: bool,
    pub rep: Option<Rep>,
    pub start_eip: u32,
}

impl Exec<'_> {
    /// Consume prefixes and the opcode byte(s), producing the table index.
    fn decode_opcode(&mut self) -> Result<usize, Trap> {
        loop {
            let b = self.fetch_u8()?;
            match b {
                0x66 => self.op32 = !self.state.code_big(),
                0x67 => self.addr32 = !self.state.code_big(),
                0x26 => self.set_seg_override(SegReg::Es),
                0x2E => self.set_seg_override(SegReg::Cs),
                0x36 => self.set_seg_override(SegReg::Ss),
                0x3E => self.set_seg_override(SegReg::Ds),
                0x64 => self.set_seg_override(SegReg::Fs),
                0x65 => self.set_seg_override(SegReg::Gs),
                // LOCK: a uniprocessor core is always atomic between
                // instruction boundaries.
                0xF0 => {}
                0xF2 => self.rep = Some(Rep::Ne),
                0xF3 => self.rep = Some(Rep::E),
                0x0F => {
                    let b2 = self.fetch_u8()?;
                    return Ok(self.size_base() | OP_0F | b2 as usize);
                }
                _ => return Ok(self.size_base() | b as usize),
            }
        }
    }

    #[inline]
    fn size_base(&self) -> usize {
        if self.op32 {
            OP_SIZE
        } else {
            0
        }
    }

    fn set_seg_override(&mut self, seg: SegReg) {
        let base = self.state.seg(seg).base;
        self.base_ds = base;
        self.base_ss = base;
    }

    /// Opcode byte of the executing instruction (low 8 table-index bits).
    #[inline]
    pub(crate) fn opcode_byte(&self) -> u8 {
        self.opcode as u8
    }

    #[inline]
    pub(crate) fn op_bits(&self) -> u32 {
        if self.op32 {
            32
        } else {
            16
        }
    }

    // -----------------------------------------------------------------
    // Code fetch
    // -----------------------------------------------------------------

    #[inline]
    pub(crate) fn fetch_u8(&mut self) -> Result<u8, Trap> {
        let lin = self.state.seg(SegReg::Cs).base.wrapping_add(self.state.eip);
        let b = self.mem.read_u8(lin)?;
        self.state.eip = self.state.eip.wrapping_add(1);
        Ok(b)
    }

    #[inline]
    pub(crate) fn fetch_u16(&mut self) -> Result<u16, Trap> {
        let lin = self.state.seg(SegReg::Cs).base.wrapping_add(self.state.eip);
        let v = self.mem.read_u16(lin)?;
        self.state.eip = self.state.eip.wrapping_add(2);
        Ok(v)
    }

    #[inline]
    pub(crate) fn fetch_u32(&mut self) -> Result<u32, Trap> {
        let lin = self.state.seg(SegReg::Cs).base.wrapping_add(self.state.eip);
        let v = self.mem.read_u32(lin)?;
        self.state.eip = self.state.eip.wrapping_add(4);
        Ok(v)
    }

    /// Fetch an operand-sized immediate.
    #[inline]
    pub(crate) fn fetch_iv(&mut self) -> Result<u32, Trap> {
        if self.op32 {
            self.fetch_u32()
        } else {
            Ok(self.fetch_u16()? as u32)
        }
    }

    /// Bytes of the executing instruction, for host-fatal diagnostics.
    pub(crate) fn instruction_bytes(&mut self) -> Vec<u8> {
        let base = self.state.seg(SegReg::Cs).base;
        let len = self.state.eip.wrapping_sub(self.start_eip).min(15);
        (0..len)
            .map(|i| {
                self.mem
                    .try_read_u8(base.wrapping_add(self.start_eip).wrapping_add(i))
                    .unwrap_or(0)
            })
            .collect()
    }

    pub(crate) fn illegal_dispatch(&mut self) -> Trap {
        Trap::Fatal(Fatal::IllegalDispatch {
            bytes: self.instruction_bytes(),
            cs: self.state.seg(SegReg::Cs).selector,
            eip: self.start_eip,
        })
    }

    /// Gate an instruction on the configured CPU generation.
    #[inline]
    pub(crate) fn require_generation(&self, gen: CpuGeneration) -> Result<(), Trap> {
        if self.config.generation < gen {
            Err(Exception::InvalidOpcode.into())
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------
    // Effective addresses and operands
    // -----------------------------------------------------------------

    pub(crate) fn resolve_ea(&mut self, modrm: u8) -> Result<Ea, Trap> {
        debug_assert!(modrm < 0xC0);
        if self.addr32 {
            self.resolve_ea32(modrm)
        } else {
            self.resolve_ea16(modrm)
        }
    }

    fn resolve_ea16(&mut self, modrm: u8) -> Result<Ea, Trap> {
        let desc = EA16[modrm as usize];
        let mut offset: u16 = 0;
        if let Some(base) = desc.base {
            offset = offset.wrapping_add(self.state.reg16(base));
        }
        if let Some(index) = desc.index {
            offset = offset.wrapping_add(self.state.reg16(index));
        }
        match desc.disp {
            Disp::None => {}
            Disp::Byte => offset = offset.wrapping_add(self.fetch_u8()? as i8 as u16),
            _ => offset = offset.wrapping_add(self.fetch_u16()?),
        }
        Ok(Ea {
            base: if desc.stack_seg {
                self.base_ss
            } else {
                self.base_ds
            },
            offset: offset as u32,
            addr32: false,
        })
    }

    fn resolve_ea32(&mut self, modrm: u8) -> Result<Ea, Trap> {
        let desc = EA32[modrm as usize];
        let mut offset: u32 = 0;
        let mut stack_seg = desc.stack_seg;

        if desc.sib {
            let sib = self.fetch_u8()?;
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let base = sib & 7;
            // ESP never indexes.
            if index != 4 {
                offset = offset
                    .wrapping_add(self.state.reg32(GpReg::from_index(index)) << scale);
            }
            if base == 5 && modrm >> 6 == 0 {
                offset = offset.wrapping_add(self.fetch_u32()?);
            } else {
                offset = offset.wrapping_add(self.state.reg32(GpReg::from_index(base)));
                if base == 4 || base == 5 {
                    stack_seg = true;
                }
            }
        } else if let Some(base) = desc.base {
            offset = self.state.reg32(base);
        }

        match desc.disp {
            Disp::None => {}
            Disp::Byte => offset = offset.wrapping_add(self.fetch_u8()? as i8 as u32),
            _ => offset = offset.wrapping_add(self.fetch_u32()?),
        }

        Ok(Ea {
            base: if stack_seg {
                self.base_ss
            } else {
                self.base_ds
            },
            offset,
            addr32: true,
        })
    }

    pub(crate) fn modrm_operand(&mut self, modrm: u8, bits: u32) -> Result<Operand, Trap> {
        if modrm >= 0xC0 {
            Ok(if bits == 8 {
                Operand::Reg8(MODRM_RM8[modrm as usize])
            } else {
                Operand::Reg(MODRM_RM[modrm as usize])
            })
        } else {
            Ok(Operand::Mem(self.resolve_ea(modrm)?))
        }
    }

    pub(crate) fn load(&mut self, op: Operand, bits: u32) -> Result<u32, Trap> {
        match op {
            Operand::Reg8(r) => Ok(self.state.reg8(r) as u32),
            Operand::Reg(r) => Ok(self.state.reg(r, bits)),
            Operand::Mem(ea) => {
                let lin = ea.linear();
                Ok(match bits {
                    8 => self.mem.read_u8(lin)? as u32,
                    16 => self.mem.read_u16(lin)? as u32,
                    _ => self.mem.read_u32(lin)?,
                })
            }
        }
    }

    pub(crate) fn store(&mut self, op: Operand, bits: u32, val: u32) -> Result<(), Trap> {
        match op {
            Operand::Reg8(r) => {
                self.state.set_reg8(r, val as u8);
                Ok(())
            }
            Operand::Reg(r) => {
                self.state.set_reg(r, bits, val);
                Ok(())
            }
            Operand::Mem(ea) => {
                let lin = ea.linear();
                match bits {
                    8 => self.mem.write_u8(lin, val as u8)?,
                    16 => self.mem.write_u16(lin, val as u16)?,
                    _ => self.mem.write_u32(lin, val)?,
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------
    // Stack
    // -----------------------------------------------------------------

    pub(crate) fn push16(&mut self, val: u16) -> Result<(), Trap> {
        stack_push16(self.state, self.mem, val).map_err(Trap::from)
    }

    pub(crate) fn push32(&mut self, val: u32) -> Result<(), Trap> {
        stack_push32(self.state, self.mem, val).map_err(Trap::from)
    }

    pub(crate) fn pop16(&mut self) -> Result<u16, Trap> {
        stack_pop16(self.state, self.mem).map_err(Trap::from)
    }

    pub(crate) fn pop32(&mut self) -> Result<u32, Trap> {
        stack_pop32(self.state, self.mem).map_err(Trap::from)
    }

    /// Operand-sized push.
    pub(crate) fn push_v(&mut self, val: u32) -> Result<(), Trap> {
        if self.op32 {
            self.push32(val)
        } else {
            self.push16(val as u16)
        }
    }

    /// Operand-sized pop.
    pub(crate) fn pop_v(&mut self) -> Result<u32, Trap> {
        if self.op32 {
            self.pop32()
        } else {
            Ok(self.pop16()? as u32)
        }
    }

    // -----------------------------------------------------------------
    // Control transfer
    // -----------------------------------------------------------------

    /// Relative jump; 16-bit operand size truncates the new IP.
    pub(crate) fn jump_rel(&mut self, rel: i32) {
        let target = self.state.eip.wrapping_add(rel as u32);
        self.state.eip = if self.op32 { target } else { target & 0xFFFF };
    }

    pub(crate) fn jump_abs(&mut self, target: u32) {
        self.state.eip = if self.op32 { target } else { target & 0xFFFF };
    }

    pub(crate) fn load_seg(&mut self, seg: SegReg, selector: u16) -> Result<(), Trap> {
        load_segment(self.state, self.mem, seg, selector).map_err(Trap::from)
    }
}

/// The reachable-from-anywhere stack primitives, shared by instruction
/// bodies and exception delivery. The stack pointer only commits once the
/// memory access has succeeded.
pub(crate) fn stack_push16(
    state: &mut CpuState,
    mem: &mut Memory,
    val: u16,
) -> Result<(), Exception> {
    let base = state.seg(SegReg::Ss).base;
    if state.stack_big() {
        let esp = state.reg32(GpReg::Esp).wrapping_sub(2);
        mem.write_u16(base.wrapping_add(esp), val)?;
        state.set_reg32(GpReg::Esp, esp);
    } else {
        let sp = state.reg16(GpReg::Esp).wrapping_sub(2);
        mem.write_u16(base.wrapping_add(sp as u32), val)?;
        state.set_reg16(GpReg::Esp, sp);
    }
    Ok(())
}

pub(crate) fn stack_push32(
    state: &mut CpuState,
    mem: &mut Memory,
    val: u32,
) -> Result<(), Exception> {
    let base = state.seg(SegReg::Ss).base;
    if state.stack_big() {
        let esp = state.reg32(GpReg::Esp).wrapping_sub(4);
        mem.write_u32(base.wrapping_add(esp), val)?;
        state.set_reg32(GpReg::Esp, esp);
    } else {
        let sp = state.reg16(GpReg::Esp).wrapping_sub(4);
        mem.write_u32(base.wrapping_add(sp as u32), val)?;
        state.set_reg16(GpReg::Esp, sp);
    }
    Ok(())
}

pub(crate) fn stack_pop16(state: &mut CpuState, mem: &mut Memory) -> Result<u16, Exception> {
    let base = state.seg(SegReg::Ss).base;
    if state.stack_big() {
        let esp = state.reg32(GpReg::Esp);
        let val = mem.read_u16(base.wrapping_add(esp))?;
        state.set_reg32(GpReg::Esp, esp.wrapping_add(2));
        Ok(val)
    } else {
        let sp = state.reg16(GpReg::Esp);
        let val = mem.read_u16(base.wrapping_add(sp as u32))?;
        state.set_reg16(GpReg::Esp, sp.wrapping_add(2));
        Ok(val)
    }
}

pub(crate) fn stack_pop32(state: &mut CpuState, mem: &mut Memory) -> Result<u32, Exception> {
    let base = state.seg(SegReg::Ss).base;
    if state.stack_big() {
        let esp = state.reg32(GpReg::Esp);
        let val = mem.read_u32(base.wrapping_add(esp))?;
        state.set_reg32(GpReg::Esp, esp.wrapping_add(4));
        Ok(val)
    } else {
        let sp = state.reg16(GpReg::Esp);
        let val = mem.read_u32(base.wrapping_add(sp as u32))?;
        state.set_reg16(GpReg::Esp, sp.wrapping_add(4));
        Ok(val)
    }
}

/// Enter an interrupt/exception handler: through the IVT in real mode,
/// through an IDT gate at the current privilege level in protected mode.
/// `software` applies the gate-DPL check for `INT n`.
pub(crate) fn deliver_interrupt(
    state: &mut CpuState,
    mem: &mut Memory,
    vector: u8,
    error_code: Option<u32>,
    software: bool,
) -> Result<(), Exception> {
    if !state.protected_mode() {
        let target = mem.read_ivt_vector(vector)?;
        let flags = state.eflags as u16;
        let old_cs = state.seg(SegReg::Cs).selector;
        let old_ip = state.eip as u16;
        stack_push16(state, mem, flags)?;
        stack_push16(state, mem, old_cs)?;
        stack_push16(state, mem, old_ip)?;
        state.set_flag(F_IF | F_TF, false);
        state.set_real_segment(SegReg::Cs, target.segment);
        state.eip = target.offset as u32;
        return Ok(());
    }

    let ext = ((vector as u16) << 3) | 2;
    let index = vector as u32 * 8;
    if index + 7 > state.idt.limit as u32 {
        return Err(Exception::GeneralProtection(ext));
    }
    let lo = mem.read_u32(state.idt.base.wrapping_add(index))?;
    let hi = mem.read_u32(state.idt.base.wrapping_add(index + 4))?;

    let gate_dpl = ((hi >> 13) & 3) as u8;
    if software && gate_dpl < state.cpl {
        return Err(Exception::GeneralProtection(ext));
    }
    if hi & 0x8000 == 0 {
        return Err(Exception::NotPresent(ext));
    }

    let (gate32, trap_gate) = match (hi >> 8) & 0x1F {
        0x6 => (false, false),
        0x7 => (false, true),
        0xE => (true, false),
        0xF => (true, true),
        _ => return Err(Exception::GeneralProtection(ext)),
    };

    let selector = (lo >> 16) as u16;
    let offset = (lo & 0xFFFF) | (hi & 0xFFFF_0000);

    let old_flags = state.eflags;
    let old_cs = state.seg(SegReg::Cs).selector;
    let old_eip = state.eip;
    if gate32 {
        stack_push32(state, mem, old_flags)?;
        stack_push32(state, mem, old_cs as u32)?;
        stack_push32(state, mem, old_eip)?;
    } else {
        stack_push16(state, mem, old_flags as u16)?;
        stack_push16(state, mem, old_cs)?;
        stack_push16(state, mem, old_eip as u16)?;
    }

    load_segment(state, mem, SegReg::Cs, selector)?;
    state.eip = if gate32 { offset } else { offset & 0xFFFF };
    if !trap_gate {
        state.set_flag(F_IF, false);
    }
    state.set_flag(F_TF | F_NT, false);

    if let Some(code) = error_code {
        if gate32 {
            stack_push32(state, mem, code)?;
        } else {
            stack_push16(state, mem, code as u16)?;
        }
    }
    Ok(())
}

fn build_ops() -> Box<[OpFn]> {
    let mut table: Vec<OpFn> = vec![ops_ctrl::op_illegal; TABLE_LEN];
    ops_alu::register(&mut table);
    ops_data::register(&mut table);
    ops_bit::register(&mut table);
    ops_ctrl::register(&mut table);
    ops_string::register(&mut table);
    table.into_boxed_slice()
}

/// Register `f` for `opcode` under both operand sizes.
fn both(table: &mut [OpFn], opcode: usize, f: OpFn) {
    table[opcode] = f;
    table[OP_SIZE | opcode] = f;
}

/// Register `f` for `0F opcode` under both operand sizes.
fn both_0f(table: &mut [OpFn], opcode: usize, f: OpFn) {
    table[OP_0F | opcode] = f;
    table[OP_SIZE | OP_0F | opcode] = f;
}

/// A register/memory operand at a fixed width.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand {
    Reg(GpReg),
    Reg8(Reg8),
    Mem(Ea),
}
