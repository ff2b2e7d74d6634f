//! Per-page access mediation: capability flags and page handlers.
//!
//! Every 4 KiB physical page is mediated by a [`PageHandler`]. Plain RAM and
//! ROM delegate to the flat store (and advertise a direct fast path so the
//! TLB can bypass dispatch entirely); MMIO windows are claimed by device
//! models that implement the trait themselves; everything else is an open
//! bus.
//!
//! Handlers receive *physical* addresses. Translation and TLB routing happen
//! above this layer, in [`crate::Memory`].

use crate::phys::FlatMemory;
use bitflags::bitflags;

bitflags! {
    /// Capabilities of one physical page.
    ///
    /// `HAS_CODE16`/`HAS_CODE32` mark pages that a translation cache has
    /// consumed instructions from; a write to such a page must raise an
    /// invalidation event before it commits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const READABLE   = 0x01;
        const WRITEABLE  = 0x02;
        const HAS_ROM    = 0x04;
        const HAS_CODE32 = 0x08;
        const NO_CODE    = 0x10;
        const INIT       = 0x20;
        const HAS_CODE16 = 0x40;
        const HAS_CODE   = Self::HAS_CODE32.bits() | Self::HAS_CODE16.bits();
    }
}

/// Mediates access to one 4 KiB physical page.
///
/// The unchecked accessors never fail; pages that cannot satisfy an access
/// supply fill values (reads) or drop the data (writes). The `try_*`
/// variants report success instead: `Some` means the access happened (or
/// was legitimately discarded), `None` means it would fault, for
/// callers that must consult the paging unit before unwinding.
pub trait PageHandler {
    fn read_u8(&mut self, ram: &mut FlatMemory, paddr: u32) -> u8;
    fn write_u8(&mut self, ram: &mut FlatMemory, paddr: u32, val: u8);

    fn read_u16(&mut self, ram: &mut FlatMemory, paddr: u32) -> u16 {
        let lo = self.read_u8(ram, paddr) as u16;
        let hi = self.read_u8(ram, paddr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn read_u32(&mut self, ram: &mut FlatMemory, paddr: u32) -> u32 {
        let lo = self.read_u16(ram, paddr) as u32;
        let hi = self.read_u16(ram, paddr.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn write_u16(&mut self, ram: &mut FlatMemory, paddr: u32, val: u16) {
        self.write_u8(ram, paddr, val as u8);
        self.write_u8(ram, paddr.wrapping_add(1), (val >> 8) as u8);
    }

    fn write_u32(&mut self, ram: &mut FlatMemory, paddr: u32, val: u32) {
        self.write_u16(ram, paddr, val as u16);
        self.write_u16(ram, paddr.wrapping_add(2), (val >> 16) as u16);
    }

    fn try_read_u8(&mut self, ram: &mut FlatMemory, paddr: u32) -> Option<u8> {
        Some(self.read_u8(ram, paddr))
    }

    fn try_read_u16(&mut self, ram: &mut FlatMemory, paddr: u32) -> Option<u16> {
        Some(self.read_u16(ram, paddr))
    }

    fn try_read_u32(&mut self, ram: &mut FlatMemory, paddr: u32) -> Option<u32> {
        Some(self.read_u32(ram, paddr))
    }

    fn try_write_u8(&mut self, ram: &mut FlatMemory, paddr: u32, val: u8) -> Option<()> {
        self.write_u8(ram, paddr, val);
        Some(())
    }

    fn try_write_u16(&mut self, ram: &mut FlatMemory, paddr: u32, val: u16) -> Option<()> {
        self.write_u16(ram, paddr, val);
        Some(())
    }

    fn try_write_u32(&mut self, ram: &mut FlatMemory, paddr: u32, val: u32) -> Option<()> {
        self.write_u32(ram, paddr, val);
        Some(())
    }

    /// Flat-store page backing reads of `phys_page`, when reads need no
    /// handler dispatch. `None` forces all reads through the handler.
    fn host_read_page(&self, _phys_page: u32) -> Option<u32> {
        None
    }

    /// Flat-store page backing writes of `phys_page`. `None` forces all
    /// writes through the handler (MMIO, ROM write protection).
    fn host_write_page(&self, _phys_page: u32) -> Option<u32> {
        None
    }
}

/// Plain RAM: direct flat-store access in both directions.
#[derive(Debug, Default)]
pub struct RamPageHandler;

impl PageHandler for RamPageHandler {
    #[inline]
    fn read_u8(&mut self, ram: &mut FlatMemory, paddr: u32) -> u8 {
        ram.read_u8(paddr)
    }

    #[inline]
    fn write_u8(&mut self, ram: &mut FlatMemory, paddr: u32, val: u8) {
        ram.write_u8(paddr, val);
    }

    #[inline]
    fn read_u16(&mut self, ram: &mut FlatMemory, paddr: u32) -> u16 {
        ram.read_u16(paddr)
    }

    #[inline]
    fn read_u32(&mut self, ram: &mut FlatMemory, paddr: u32) -> u32 {
        ram.read_u32(paddr)
    }

    #[inline]
    fn write_u16(&mut self, ram: &mut FlatMemory, paddr: u32, val: u16) {
        ram.write_u16(paddr, val);
    }

    #[inline]
    fn write_u32(&mut self, ram: &mut FlatMemory, paddr: u32, val: u32) {
        ram.write_u32(paddr, val);
    }

    fn host_read_page(&self, phys_page: u32) -> Option<u32> {
        Some(phys_page)
    }

    fn host_write_page(&self, phys_page: u32) -> Option<u32> {
        Some(phys_page)
    }
}

/// ROM: reads come straight from the flat store, writes are discarded.
#[derive(Debug, Default)]
pub struct RomPageHandler;

impl PageHandler for RomPageHandler {
    #[inline]
    fn read_u8(&mut self, ram: &mut FlatMemory, paddr: u32) -> u8 {
        ram.read_u8(paddr)
    }

    fn write_u8(&mut self, _ram: &mut FlatMemory, paddr: u32, val: u8) {
        tracing::debug!(paddr = format_args!("{paddr:#010x}"), val, "discarding write to rom");
    }

    #[inline]
    fn read_u16(&mut self, ram: &mut FlatMemory, paddr: u32) -> u16 {
        ram.read_u16(paddr)
    }

    #[inline]
    fn read_u32(&mut self, ram: &mut FlatMemory, paddr: u32) -> u32 {
        ram.read_u32(paddr)
    }

    fn write_u16(&mut self, _ram: &mut FlatMemory, paddr: u32, val: u16) {
        tracing::debug!(paddr = format_args!("{paddr:#010x}"), val, "discarding write to rom");
    }

    fn write_u32(&mut self, _ram: &mut FlatMemory, paddr: u32, val: u32) {
        tracing::debug!(paddr = format_args!("{paddr:#010x}"), val, "discarding write to rom");
    }

    fn host_read_page(&self, phys_page: u32) -> Option<u32> {
        Some(phys_page)
    }
}

/// Open bus: reads return a fixed fill value, writes vanish, checked
/// accesses fail.
#[derive(Debug, Default)]
pub struct UnmappedPageHandler;

impl PageHandler for UnmappedPageHandler {
    fn read_u8(&mut self, _ram: &mut FlatMemory, paddr: u32) -> u8 {
        tracing::trace!(paddr = format_args!("{paddr:#010x}"), "read from unmapped memory");
        0xFF
    }

    fn write_u8(&mut self, _ram: &mut FlatMemory, paddr: u32, _val: u8) {
        tracing::trace!(paddr = format_args!("{paddr:#010x}"), "write to unmapped memory");
    }

    fn try_read_u8(&mut self, _ram: &mut FlatMemory, _paddr: u32) -> Option<u8> {
        None
    }

    fn try_read_u16(&mut self, _ram: &mut FlatMemory, _paddr: u32) -> Option<u16> {
        None
    }

    fn try_read_u32(&mut self, _ram: &mut FlatMemory, _paddr: u32) -> Option<u32> {
        None
    }

    fn try_write_u8(&mut self, _ram: &mut FlatMemory, _paddr: u32, _val: u8) -> Option<()> {
        None
    }

    fn try_write_u16(&mut self, _ram: &mut FlatMemory, _paddr: u32, _val: u16) -> Option<()> {
        None
    }

    fn try_write_u32(&mut self, _ram: &mut FlatMemory, _paddr: u32, _val: u32) -> Option<()> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_word_access_composes_from_bytes() {
        struct Incrementing;
        impl PageHandler for Incrementing {
            fn read_u8(&mut self, _ram: &mut FlatMemory, paddr: u32) -> u8 {
                paddr as u8
            }
            fn write_u8(&mut self, _ram: &mut FlatMemory, _paddr: u32, _val: u8) {}
        }

        let mut ram = FlatMemory::new(1);
        let mut h = Incrementing;
        assert_eq!(h.read_u16(&mut ram, 0x10), 0x1110);
        assert_eq!(h.read_u32(&mut ram, 0x10), 0x1312_1110);
    }

    #[test]
    fn rom_discards_writes() {
        let mut ram = FlatMemory::new(1);
        ram.write_u32(0x40, 0xDEAD_BEEF);

        let mut rom = RomPageHandler;
        rom.write_u32(&mut ram, 0x40, 0x1122_3344);
        assert_eq!(rom.read_u32(&mut ram, 0x40), 0xDEAD_BEEF);
        // Checked writes report success: the discard is the architected outcome.
        assert!(rom.try_write_u8(&mut ram, 0x40, 0).is_some());
        assert_eq!(ram.read_u32(0x40), 0xDEAD_BEEF);
    }

    #[test]
    fn unmapped_reads_fill_and_checked_accesses_fail() {
        let mut ram = FlatMemory::new(1);
        let mut h = UnmappedPageHandler;
        assert_eq!(h.read_u8(&mut ram, 0), 0xFF);
        assert_eq!(h.read_u32(&mut ram, 0), 0xFFFF_FFFF);
        assert!(h.try_read_u8(&mut ram, 0).is_none());
        assert!(h.try_write_u8(&mut ram, 0, 1).is_none());
    }
}
