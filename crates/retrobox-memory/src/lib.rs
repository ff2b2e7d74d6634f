//! Guest memory for an x86 PC emulator: flat RAM, per-page handlers, and a
//! software TLB with an x86-compatible page-table walker.
//!
//! [`Memory`] is the context object every other subsystem talks to. The CPU
//! core issues *linear* reads and writes; devices claim physical windows with
//! page handlers; DMA-style collaborators move bytes with the physical-level
//! bulk API. Translation state (CR2/CR3, the TLB, the paging enable) lives in
//! [`Paging`] and is owned by the `Memory` instance, not by globals.
//!
//! The access fast path is one TLB lookup plus a flat-store index; handler
//! dispatch and table walks only happen on misses and special pages.

pub mod handler;
pub mod paging;
pub mod phys;
pub mod realmode;

mod alloc;

pub use alloc::MemHandle;
pub use handler::{PageFlags, PageHandler, RamPageHandler, RomPageHandler, UnmappedPageHandler};
pub use paging::{PageFault, Paging, TLB_ENTRIES};
pub use phys::FlatMemory;
pub use realmode::{phys_of, RealAddr};

use paging::TlbWay;

/// Bytes per page.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// First page handed to the allocation pool; everything below belongs to
/// conventional memory and the HMA.
pub const XMS_START_PAGE: u32 = 0x110;

/// Pages of MMIO control window paired with a linear frame buffer.
const LFB_MMIO_PAGES: u32 = 16;

type HandlerId = u16;

const H_RAM: HandlerId = 0;
const H_ROM: HandlerId = 1;
const H_UNMAPPED: HandlerId = 2;

/// Callback invoked with a physical page number before a write to a page
/// flagged as holding translated code commits.
pub type CodeObserver = Box<dyn FnMut(u32)>;

struct LfbWindow {
    start_page: u32,
    pages: u32,
    handler: HandlerId,
    mmio_handler: HandlerId,
}

/// The guest memory context: flat RAM, handler registry, paging unit, page
/// allocator and the A20 gate.
pub struct Memory {
    ram: FlatMemory,
    /// Per-installed-page capability flags.
    flags: Box<[PageFlags]>,
    /// Per-installed-page handler assignment.
    phandlers: Box<[HandlerId]>,
    handlers: Vec<Box<dyn PageHandler>>,
    lfb: Option<LfbWindow>,
    paging: Paging,
    alloc: alloc::PageAllocator,
    code_observer: Option<CodeObserver>,
    a20_enabled: bool,
}

#[inline]
fn phys_byte(phys_page: u32, laddr: u32) -> u32 {
    (phys_page << PAGE_SHIFT) | (laddr & (PAGE_SIZE as u32 - 1))
}

impl Memory {
    /// Build a context with `total_pages` pages of installed RAM.
    pub fn new(total_pages: u32) -> Self {
        let default_flags = PageFlags::READABLE | PageFlags::WRITEABLE;
        Self {
            ram: FlatMemory::new(total_pages),
            flags: vec![default_flags; total_pages as usize].into_boxed_slice(),
            phandlers: vec![H_RAM; total_pages as usize].into_boxed_slice(),
            handlers: vec![
                Box::new(RamPageHandler),
                Box::new(RomPageHandler),
                Box::new(UnmappedPageHandler),
            ],
            lfb: None,
            paging: Paging::new(),
            alloc: alloc::PageAllocator::new(total_pages),
            code_observer: None,
            a20_enabled: false,
        }
    }

    #[inline]
    pub fn paging(&self) -> &Paging {
        &self.paging
    }

    #[inline]
    pub fn paging_mut(&mut self) -> &mut Paging {
        &mut self.paging
    }

    #[inline]
    pub fn ram(&self) -> &FlatMemory {
        &self.ram
    }

    #[inline]
    pub fn ram_mut(&mut self) -> &mut FlatMemory {
        &mut self.ram
    }

    // ---------------------------------------------------------------------
    // Linear (TLB-mediated) access
    // ---------------------------------------------------------------------

    pub fn read_u8(&mut self, laddr: u32) -> Result<u8, PageFault> {
        match self.read_way(laddr)? {
            TlbWay::Direct { phys_page } => Ok(self.ram.read_u8(phys_byte(phys_page, laddr))),
            TlbWay::Handler { handler, phys_page } => {
                let paddr = phys_byte(phys_page, laddr);
                Ok(self.handlers[handler as usize].read_u8(&mut self.ram, paddr))
            }
            TlbWay::Miss | TlbWay::Code { .. } => unreachable!("read way resolved above"),
        }
    }

    pub fn read_u16(&mut self, laddr: u32) -> Result<u16, PageFault> {
        if laddr & 0xFFF < 0xFFF {
            match self.read_way(laddr)? {
                TlbWay::Direct { phys_page } => Ok(self.ram.read_u16(phys_byte(phys_page, laddr))),
                TlbWay::Handler { handler, phys_page } => {
                    let paddr = phys_byte(phys_page, laddr);
                    Ok(self.handlers[handler as usize].read_u16(&mut self.ram, paddr))
                }
                TlbWay::Miss | TlbWay::Code { .. } => unreachable!("read way resolved above"),
            }
        } else {
            let lo = self.read_u8(laddr)? as u16;
            let hi = self.read_u8(laddr.wrapping_add(1))? as u16;
            Ok(lo | (hi << 8))
        }
    }

    pub fn read_u32(&mut self, laddr: u32) -> Result<u32, PageFault> {
        if laddr & 0xFFF < 0xFFD {
            match self.read_way(laddr)? {
                TlbWay::Direct { phys_page } => Ok(self.ram.read_u32(phys_byte(phys_page, laddr))),
                TlbWay::Handler { handler, phys_page } => {
                    let paddr = phys_byte(phys_page, laddr);
                    Ok(self.handlers[handler as usize].read_u32(&mut self.ram, paddr))
                }
                TlbWay::Miss | TlbWay::Code { .. } => unreachable!("read way resolved above"),
            }
        } else {
            let lo = self.read_u16(laddr)? as u32;
            let hi = self.read_u16(laddr.wrapping_add(2))? as u32;
            Ok(lo | (hi << 16))
        }
    }

    pub fn write_u8(&mut self, laddr: u32, val: u8) -> Result<(), PageFault> {
        match self.write_way(laddr)? {
            TlbWay::Direct { phys_page } => {
                self.ram.write_u8(phys_byte(phys_page, laddr), val);
                Ok(())
            }
            TlbWay::Handler { handler, phys_page } => {
                let paddr = phys_byte(phys_page, laddr);
                self.handlers[handler as usize].write_u8(&mut self.ram, paddr, val);
                Ok(())
            }
            TlbWay::Miss | TlbWay::Code { .. } => unreachable!("write way resolved above"),
        }
    }

    pub fn write_u16(&mut self, laddr: u32, val: u16) -> Result<(), PageFault> {
        if laddr & 0xFFF < 0xFFF {
            match self.write_way(laddr)? {
                TlbWay::Direct { phys_page } => {
                    self.ram.write_u16(phys_byte(phys_page, laddr), val);
                    Ok(())
                }
                TlbWay::Handler { handler, phys_page } => {
                    let paddr = phys_byte(phys_page, laddr);
                    self.handlers[handler as usize].write_u16(&mut self.ram, paddr, val);
                    Ok(())
                }
                TlbWay::Miss | TlbWay::Code { .. } => unreachable!("write way resolved above"),
            }
        } else {
            self.write_u8(laddr, val as u8)?;
            self.write_u8(laddr.wrapping_add(1), (val >> 8) as u8)
        }
    }

    pub fn write_u32(&mut self, laddr: u32, val: u32) -> Result<(), PageFault> {
        if laddr & 0xFFF < 0xFFD {
            match self.write_way(laddr)? {
                TlbWay::Direct { phys_page } => {
                    self.ram.write_u32(phys_byte(phys_page, laddr), val);
                    Ok(())
                }
                TlbWay::Handler { handler, phys_page } => {
                    let paddr = phys_byte(phys_page, laddr);
                    self.handlers[handler as usize].write_u32(&mut self.ram, paddr, val);
                    Ok(())
                }
                TlbWay::Miss | TlbWay::Code { .. } => unreachable!("write way resolved above"),
            }
        } else {
            self.write_u16(laddr, val as u16)?;
            self.write_u16(laddr.wrapping_add(2), (val >> 16) as u16)
        }
    }

    /// Resolve the read way for `laddr`, filling the TLB on a miss.
    #[inline]
    fn read_way(&mut self, laddr: u32) -> Result<TlbWay, PageFault> {
        let lin_page = laddr >> PAGE_SHIFT;
        loop {
            match self.paging.read_way(lin_page) {
                TlbWay::Miss => self.fill(laddr, false)?,
                way => return Ok(way),
            }
        }
    }

    /// Resolve the write way for `laddr`, filling on a miss and flushing
    /// code-page intercepts. The returned way is `Direct` or `Handler`.
    #[inline]
    fn write_way(&mut self, laddr: u32) -> Result<TlbWay, PageFault> {
        let lin_page = laddr >> PAGE_SHIFT;
        loop {
            match self.paging.write_way(lin_page) {
                TlbWay::Miss => self.fill(laddr, true)?,
                TlbWay::Code { phys_page } => {
                    self.invalidate_code_flags(phys_page);
                    let (_, write) = self.ways_for(phys_page);
                    self.paging.set_write_way(lin_page, write);
                }
                way => return Ok(way),
            }
        }
    }

    /// Fill the TLB entry covering `laddr`: table walk when paging is
    /// enabled, identity mapping (through the A20 gate) otherwise.
    fn fill(&mut self, laddr: u32, write: bool) -> Result<(), PageFault> {
        let lin_page = laddr >> PAGE_SHIFT;
        let phys_page = if self.paging.enabled() {
            self.paging.walk(&mut self.ram, laddr, write)?.phys_page
        } else {
            self.identity_page(lin_page)
        };

        let (read, write_way) = self.ways_for(phys_page);
        // On a read fill under paging, leave the write direction unfilled so
        // the first write re-walks and commits the dirty bit.
        let write_way = if write || !self.paging.enabled() {
            write_way
        } else {
            self.paging.write_way(lin_page)
        };
        self.paging.link(lin_page, read, write_way);
        Ok(())
    }

    fn identity_page(&self, lin_page: u32) -> u32 {
        if !self.a20_enabled && (0x100..0x110).contains(&lin_page) {
            lin_page & !0x100
        } else {
            lin_page
        }
    }

    /// Build the (read, write) ways for a physical page from its handler
    /// assignment and capability flags.
    fn ways_for(&self, phys_page: u32) -> (TlbWay, TlbWay) {
        let handler = self.handler_id_for(phys_page);
        let flags = self.flags_for(phys_page);
        let h = &self.handlers[handler as usize];

        let read = match h.host_read_page(phys_page) {
            Some(page) if flags.contains(PageFlags::READABLE) => TlbWay::Direct { phys_page: page },
            _ => TlbWay::Handler { handler, phys_page },
        };
        let write = match h.host_write_page(phys_page) {
            Some(page) if flags.contains(PageFlags::WRITEABLE) => {
                if flags.intersects(PageFlags::HAS_CODE) {
                    TlbWay::Code { phys_page: page }
                } else {
                    TlbWay::Direct { phys_page: page }
                }
            }
            _ => TlbWay::Handler { handler, phys_page },
        };
        (read, write)
    }

    fn handler_id_for(&self, phys_page: u32) -> HandlerId {
        if let Some(lfb) = &self.lfb {
            let lfb_end = lfb.start_page + lfb.pages;
            if (lfb.start_page..lfb_end).contains(&phys_page) {
                return lfb.handler;
            }
            if (lfb_end..lfb_end + LFB_MMIO_PAGES).contains(&phys_page) {
                return lfb.mmio_handler;
            }
        }
        self.phandlers
            .get(phys_page as usize)
            .copied()
            .unwrap_or(H_UNMAPPED)
    }

    fn flags_for(&self, phys_page: u32) -> PageFlags {
        self.flags
            .get(phys_page as usize)
            .copied()
            .unwrap_or(PageFlags::READABLE | PageFlags::WRITEABLE)
    }

    // ---------------------------------------------------------------------
    // Checked (probe) access: report failure instead of faulting, and leave
    // no guest-visible paging side effects behind on the probe itself.
    // ---------------------------------------------------------------------

    pub fn try_read_u8(&mut self, laddr: u32) -> Option<u8> {
        let lin_page = laddr >> PAGE_SHIFT;
        let way = match self.paging.read_way(lin_page) {
            TlbWay::Miss => self.ways_for(self.probe_page(laddr, false)?).0,
            way => way,
        };
        match way {
            TlbWay::Direct { phys_page } => Some(self.ram.read_u8(phys_byte(phys_page, laddr))),
            TlbWay::Handler { handler, phys_page } => {
                let paddr = phys_byte(phys_page, laddr);
                self.handlers[handler as usize].try_read_u8(&mut self.ram, paddr)
            }
            TlbWay::Miss | TlbWay::Code { .. } => None,
        }
    }

    pub fn try_read_u16(&mut self, laddr: u32) -> Option<u16> {
        if laddr & 0xFFF < 0xFFF {
            let lin_page = laddr >> PAGE_SHIFT;
            let way = match self.paging.read_way(lin_page) {
                TlbWay::Miss => self.ways_for(self.probe_page(laddr, false)?).0,
                way => way,
            };
            match way {
                TlbWay::Direct { phys_page } => {
                    Some(self.ram.read_u16(phys_byte(phys_page, laddr)))
                }
                TlbWay::Handler { handler, phys_page } => {
                    let paddr = phys_byte(phys_page, laddr);
                    self.handlers[handler as usize].try_read_u16(&mut self.ram, paddr)
                }
                TlbWay::Miss | TlbWay::Code { .. } => None,
            }
        } else {
            let lo = self.try_read_u8(laddr)? as u16;
            let hi = self.try_read_u8(laddr.wrapping_add(1))? as u16;
            Some(lo | (hi << 8))
        }
    }

    pub fn try_read_u32(&mut self, laddr: u32) -> Option<u32> {
        if laddr & 0xFFF < 0xFFD {
            let lin_page = laddr >> PAGE_SHIFT;
            let way = match self.paging.read_way(lin_page) {
                TlbWay::Miss => self.ways_for(self.probe_page(laddr, false)?).0,
                way => way,
            };
            match way {
                TlbWay::Direct { phys_page } => {
                    Some(self.ram.read_u32(phys_byte(phys_page, laddr)))
                }
                TlbWay::Handler { handler, phys_page } => {
                    let paddr = phys_byte(phys_page, laddr);
                    self.handlers[handler as usize].try_read_u32(&mut self.ram, paddr)
                }
                TlbWay::Miss | TlbWay::Code { .. } => None,
            }
        } else {
            let lo = self.try_read_u16(laddr)? as u32;
            let hi = self.try_read_u16(laddr.wrapping_add(2))? as u32;
            Some(lo | (hi << 16))
        }
    }

    /// Checked write: commits when a write would succeed, reports `None`
    /// when it would fault.
    pub fn try_write_u8(&mut self, laddr: u32, val: u8) -> Option<()> {
        let lin_page = laddr >> PAGE_SHIFT;
        let way = match self.paging.write_way(lin_page) {
            TlbWay::Miss => self.ways_for(self.probe_page(laddr, true)?).1,
            way => way,
        };
        match way {
            TlbWay::Direct { phys_page } => {
                self.ram.write_u8(phys_byte(phys_page, laddr), val);
                Some(())
            }
            TlbWay::Code { phys_page } => {
                self.invalidate_code_flags(phys_page);
                self.ram.write_u8(phys_byte(phys_page, laddr), val);
                Some(())
            }
            TlbWay::Handler { handler, phys_page } => {
                let paddr = phys_byte(phys_page, laddr);
                self.handlers[handler as usize].try_write_u8(&mut self.ram, paddr, val)
            }
            TlbWay::Miss => None,
        }
    }

    pub fn try_write_u16(&mut self, laddr: u32, val: u16) -> Option<()> {
        self.try_write_u8(laddr, val as u8)?;
        self.try_write_u8(laddr.wrapping_add(1), (val >> 8) as u8)
    }

    pub fn try_write_u32(&mut self, laddr: u32, val: u32) -> Option<()> {
        self.try_write_u16(laddr, val as u16)?;
        self.try_write_u16(laddr.wrapping_add(2), (val >> 16) as u16)
    }

    fn probe_page(&self, laddr: u32, write: bool) -> Option<u32> {
        if self.paging.enabled() {
            self.paging.walk_probe(&self.ram, laddr, write)
        } else {
            Some(self.identity_page(laddr >> PAGE_SHIFT))
        }
    }

    // ---------------------------------------------------------------------
    // Paging operations
    // ---------------------------------------------------------------------

    /// Force a direct linear→physical mapping, bypassing the table walk:
    /// for identity-mapping with paging disabled and for EMS-style window
    /// remapping. With `read_only`, writes are discarded (ROM semantics).
    pub fn map_page(&mut self, lin_page: u32, phys_page: u32, read_only: bool) {
        let (read, mut write) = self.ways_for(phys_page);
        if read_only {
            write = TlbWay::Handler {
                handler: H_ROM,
                phys_page,
            };
        }
        self.paging.link(lin_page, read, write);
    }

    /// Evict `count` consecutive linear pages from the TLB.
    pub fn unmap_pages(&mut self, lin_page: u32, count: u32) {
        self.paging.unlink(lin_page, count);
    }

    pub fn clear_tlb(&mut self) {
        self.paging.clear_tlb();
    }

    pub fn enable_paging(&mut self, enabled: bool) {
        self.paging.enable(enabled);
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.paging.enabled()
    }

    pub fn set_dir_base(&mut self, cr3: u32) {
        self.paging.set_dir_base(cr3);
    }

    #[inline]
    pub fn dir_base(&self) -> u32 {
        self.paging.dir_base()
    }

    /// Last faulting linear address (CR2).
    #[inline]
    pub fn fault_addr(&self) -> u32 {
        self.paging.fault_addr()
    }

    pub fn set_fault_addr(&mut self, cr2: u32) {
        self.paging.set_fault_addr(cr2);
    }

    /// Synchronize privilege inputs (CPL, CR0.WP) used by walk-time checks.
    pub fn set_privilege(&mut self, cpl: u8, wp: bool) {
        self.paging.set_privilege(cpl, wp);
    }

    // ---------------------------------------------------------------------
    // A20 gate
    // ---------------------------------------------------------------------

    /// Gate address line 20: while disabled, the first 64 KiB above 1 MiB
    /// alias the bottom of conventional memory.
    pub fn set_a20(&mut self, enabled: bool) {
        if self.a20_enabled != enabled {
            self.a20_enabled = enabled;
            self.paging.unlink(0x100, 16);
        }
    }

    #[inline]
    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    // ---------------------------------------------------------------------
    // Handler windows
    // ---------------------------------------------------------------------

    /// Claim `count` physical pages starting at `phys_page` for `handler`.
    /// Cached translations referencing the window are evicted so stale
    /// direct ways cannot bypass the new handler.
    pub fn install_page_handler(
        &mut self,
        phys_page: u32,
        count: u32,
        handler: Box<dyn PageHandler>,
    ) {
        let id = self.handlers.len() as HandlerId;
        self.handlers.push(handler);
        for page in phys_page..phys_page + count {
            if let Some(slot) = self.phandlers.get_mut(page as usize) {
                *slot = id;
                self.flags[page as usize] =
                    PageFlags::READABLE | PageFlags::WRITEABLE | PageFlags::NO_CODE;
            } else {
                tracing::warn!(page, "page handler window extends past installed memory");
            }
        }
        self.invalidate_phys_range(phys_page, count);
    }

    /// Release a physical window back to plain RAM.
    pub fn remove_page_handler(&mut self, phys_page: u32, count: u32) {
        for page in phys_page..phys_page + count {
            if let Some(slot) = self.phandlers.get_mut(page as usize) {
                *slot = H_RAM;
                self.flags[page as usize] = PageFlags::READABLE | PageFlags::WRITEABLE;
            }
        }
        self.invalidate_phys_range(phys_page, count);
    }

    /// Mark `count` pages starting at `phys_page` as ROM: reads stay on the
    /// direct fast path, writes are discarded.
    pub fn install_rom(&mut self, phys_page: u32, count: u32) {
        for page in phys_page..phys_page + count {
            if let Some(slot) = self.phandlers.get_mut(page as usize) {
                *slot = H_ROM;
                self.flags[page as usize] = PageFlags::READABLE | PageFlags::HAS_ROM;
            }
        }
        self.invalidate_phys_range(phys_page, count);
    }

    /// Install a linear-frame-buffer window (direct-mapped where the handler
    /// allows) with its MMIO control window on the following
    /// [`LFB_MMIO_PAGES`] pages.
    pub fn install_frame_buffer(
        &mut self,
        phys_page: u32,
        count: u32,
        handler: Box<dyn PageHandler>,
        mmio_handler: Box<dyn PageHandler>,
    ) {
        let handler_id = self.handlers.len() as HandlerId;
        self.handlers.push(handler);
        let mmio_id = self.handlers.len() as HandlerId;
        self.handlers.push(mmio_handler);
        self.lfb = Some(LfbWindow {
            start_page: phys_page,
            pages: count,
            handler: handler_id,
            mmio_handler: mmio_id,
        });
        self.invalidate_phys_range(phys_page, count + LFB_MMIO_PAGES);
    }

    /// Evict any TLB entry whose cached physical page falls in the range.
    fn invalidate_phys_range(&mut self, phys_page: u32, count: u32) {
        let range = phys_page..phys_page + count;
        let stale: Vec<u32> = self
            .paging
            .linked_pages()
            .iter()
            .copied()
            .filter(|&lp| {
                self.paging
                    .read_way(lp)
                    .phys_page()
                    .is_some_and(|p| range.contains(&p))
                    || self
                        .paging
                        .write_way(lp)
                        .phys_page()
                        .is_some_and(|p| range.contains(&p))
            })
            .collect();
        for lp in stale {
            self.paging.unlink(lp, 1);
        }
    }

    // ---------------------------------------------------------------------
    // Self-modifying-code tracking
    // ---------------------------------------------------------------------

    /// Register the callback fired before a write to a code-flagged page
    /// commits. The translation-cache collaborator uses this to drop stale
    /// translations.
    pub fn set_code_observer(&mut self, observer: impl FnMut(u32) + 'static) {
        self.code_observer = Some(Box::new(observer));
    }

    /// Flag `phys_page` as containing translated code (`HAS_CODE16` and/or
    /// `HAS_CODE32`). Cached write ways for the page are rerouted through
    /// the invalidation intercept.
    pub fn mark_code_page(&mut self, phys_page: u32, kind: PageFlags) {
        let Some(flags) = self.flags.get_mut(phys_page as usize) else {
            return;
        };
        *flags |= kind & PageFlags::HAS_CODE;

        let stale: Vec<u32> = self
            .paging
            .linked_pages()
            .iter()
            .copied()
            .filter(|&lp| {
                self.paging
                    .write_way(lp)
                    .phys_page()
                    .is_some_and(|p| p == phys_page)
            })
            .collect();
        for lp in stale {
            let (_, write) = self.ways_for(phys_page);
            self.paging.set_write_way(lp, write);
        }
    }

    #[inline]
    pub fn page_flags(&self, phys_page: u32) -> PageFlags {
        self.flags_for(phys_page)
    }

    fn invalidate_code_flags(&mut self, phys_page: u32) {
        let Some(flags) = self.flags.get_mut(phys_page as usize) else {
            return;
        };
        if flags.intersects(PageFlags::HAS_CODE) {
            *flags -= PageFlags::HAS_CODE;
            if let Some(observer) = self.code_observer.as_mut() {
                observer(phys_page);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Physical-level bulk transfer (DMA/disk collaborators; flat RAM only)
    // ---------------------------------------------------------------------

    pub fn block_read(&self, paddr: u32, dst: &mut [u8]) {
        self.ram.read_into(paddr, dst);
    }

    pub fn block_write(&mut self, paddr: u32, src: &[u8]) {
        self.ram.write_from(paddr, src);
    }

    pub fn block_copy(&mut self, dst: u32, src: u32, len: usize) {
        self.ram.copy_within(dst, src, len);
    }

    pub fn str_copy(&mut self, dst: u32, src: u32) {
        self.ram.str_copy(dst, src);
    }

    // ---------------------------------------------------------------------
    // Interrupt vector table
    // ---------------------------------------------------------------------

    pub fn read_ivt_vector(&mut self, vector: u8) -> Result<RealAddr, PageFault> {
        Ok(RealAddr::from_raw(self.read_u32(vector as u32 * 4)?))
    }

    pub fn write_ivt_vector(&mut self, vector: u8, target: RealAddr) -> Result<(), PageFault> {
        self.write_u32(vector as u32 * 4, target.to_raw())
    }

    // ---------------------------------------------------------------------
    // Capacity queries and allocation handles
    // ---------------------------------------------------------------------

    #[inline]
    pub fn total_pages(&self) -> u32 {
        self.alloc.total_pages()
    }

    pub fn free_pages(&self) -> u32 {
        self.alloc.free_pages()
    }

    pub fn free_largest(&self) -> u32 {
        self.alloc.free_largest()
    }

    pub fn allocate_pages(&mut self, pages: u32, sequence: bool) -> Option<MemHandle> {
        self.alloc.allocate(pages, sequence)
    }

    pub fn allocated_pages(&self, handle: MemHandle) -> u32 {
        self.alloc.allocated_pages(handle)
    }

    pub fn release_pages(&mut self, handle: MemHandle) {
        self.alloc.release(handle);
    }

    pub fn realloc_pages(
        &mut self,
        handle: MemHandle,
        pages: u32,
        sequence: bool,
    ) -> Option<MemHandle> {
        self.alloc.realloc(handle, pages, sequence)
    }

    pub fn next_handle(&self, handle: MemHandle) -> Option<MemHandle> {
        self.alloc.next_handle(handle)
    }

    pub fn next_handle_at(&self, handle: MemHandle, where_at: u32) -> Option<MemHandle> {
        self.alloc.next_handle_at(handle, where_at)
    }
}

impl core::fmt::Debug for Memory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.total_pages())
            .field("handlers", &self.handlers.len())
            .field("paging", &self.paging)
            .field("a20_enabled", &self.a20_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests;
