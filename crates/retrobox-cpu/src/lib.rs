//! x86 instruction-execution core.
//!
//! The [`Cpu`] fetches, decodes and executes guest machine code against a
//! [`retrobox_memory::Memory`] context. Decoding is table-driven: legacy
//! prefixes fold into the dispatch-table index, ModRM operands resolve
//! through precomputed lookup tables, and every instruction body reports an
//! explicit outcome: fall-through, control transfer, halt, a guest fault
//! to deliver, or a host-fatal diagnostic.
//!
//! Guest faults never escape [`Cpu::step`]: they re-enter the guest through
//! its own interrupt/exception path (IVT in real mode, IDT gates in
//! protected mode). Only emulator bugs surface as errors.

mod exception;
mod exec;
mod modrm;
mod segments;

pub mod state;

pub use exception::{Exception, Fatal};
pub use exec::{CoreConfig, Cpu, CpuGeneration, RunExit, RunResult, StepExit};
pub use state::CpuState;
