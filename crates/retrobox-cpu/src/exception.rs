//! Guest faults and host-fatal conditions.
//!
//! Guest faults are ordinary values: the dispatcher turns them into guest
//! exception delivery and keeps running. Host-fatal conditions mean the
//! emulator itself is wrong (or delivery is impossible); they terminate the
//! session with a diagnostic.

use retrobox_memory::PageFault;
use thiserror::Error;

/// A guest-visible CPU exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("divide error")]
    DivideError,
    #[error("bound range exceeded")]
    BoundRange,
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("segment not present (selector {0:#06x})")]
    NotPresent(u16),
    #[error("stack-segment fault (selector {0:#06x})")]
    StackFault(u16),
    #[error("general protection fault (error code {0:#06x})")]
    GeneralProtection(u16),
    #[error("{0}")]
    PageFault(PageFault),
}

impl Exception {
    /// #GP(0), the most common protection fault.
    #[inline]
    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    /// Interrupt vector the exception is delivered through.
    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::NotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault(_) => 14,
        }
    }

    /// Error code pushed by protected-mode delivery, if the vector defines
    /// one.
    pub fn error_code(&self) -> Option<u32> {
        match self {
            Exception::DivideError | Exception::BoundRange | Exception::InvalidOpcode => None,
            Exception::NotPresent(sel)
            | Exception::StackFault(sel)
            | Exception::GeneralProtection(sel) => Some(*sel as u32),
            Exception::PageFault(pf) => Some(pf.error_code),
        }
    }
}

impl From<PageFault> for Exception {
    fn from(pf: PageFault) -> Self {
        Exception::PageFault(pf)
    }
}

/// An unrecoverable emulator condition. Continuing would produce silently
/// wrong guest-visible behavior, so the session stops here.
#[derive(Debug, Clone, Error)]
pub enum Fatal {
    #[error("unhandled dispatch state for bytes {bytes:02x?} at {cs:#06x}:{eip:#010x}")]
    IllegalDispatch { bytes: Vec<u8>, cs: u16, eip: u32 },
    #[error("exception delivery for vector {vector} failed: {fault}")]
    DeliveryFailed { vector: u8, fault: Exception },
}

/// Execute-stage outcome channel: a guest fault to deliver, or a host-fatal
/// stop.
#[derive(Debug)]
pub(crate) enum Trap {
    Fault(Exception),
    Fatal(Fatal),
}

impl From<Exception> for Trap {
    fn from(e: Exception) -> Self {
        Trap::Fault(e)
    }
}

impl From<PageFault> for Trap {
    fn from(pf: PageFault) -> Self {
        Trap::Fault(Exception::PageFault(pf))
    }
}

impl From<Fatal> for Trap {
    fn from(f: Fatal) -> Self {
        Trap::Fatal(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(Exception::DivideError.vector(), 0);
        assert_eq!(Exception::DivideError.error_code(), None);
        assert_eq!(Exception::InvalidOpcode.vector(), 6);
        assert_eq!(Exception::GeneralProtection(0x28).error_code(), Some(0x28));

        let pf = Exception::from(PageFault {
            addr: 0x1000,
            error_code: 0x7,
        });
        assert_eq!(pf.vector(), 14);
        assert_eq!(pf.error_code(), Some(7));
    }
}
