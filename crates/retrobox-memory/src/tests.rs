use crate::{FlatMemory, Memory, PageFault, PageFlags, PageHandler};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;

/// Point CR3 at 0x1000 and map `laddr`'s page to `pte` through a table at
/// 0x2000.
fn install_mapping(mem: &mut Memory, laddr: u32, pte: u32) {
    let pde_addr = 0x1000 + ((laddr >> 22) & 0x3FF) * 4;
    let pte_addr = 0x2000 + ((laddr >> 12) & 0x3FF) * 4;
    mem.ram_mut().write_u32(pde_addr, 0x2000 | PTE_P | PTE_RW | PTE_US);
    mem.ram_mut().write_u32(pte_addr, pte);
}

#[test]
fn map_page_bridges_linear_to_physical() {
    let mut mem = Memory::new(16);
    mem.map_page(0, 5, false);

    mem.write_u32(0x5, 0xDEAD_BEEF).unwrap();
    assert_eq!(mem.ram().read_u32(0x5005), 0xDEAD_BEEF);

    let mut buf = [0u8; 4];
    mem.block_read(0x5005, &mut buf);
    assert_eq!(u32::from_le_bytes(buf), 0xDEAD_BEEF);
}

#[test]
fn identity_mapping_when_paging_disabled() {
    let mut mem = Memory::new(16);
    mem.write_u32(0x1234, 0xCAFE_F00D).unwrap();
    assert_eq!(mem.read_u32(0x1234).unwrap(), 0xCAFE_F00D);
    assert_eq!(mem.ram().read_u32(0x1234), 0xCAFE_F00D);
}

struct TestMmio {
    reads: Rc<RefCell<Vec<u32>>>,
    writes: Rc<RefCell<Vec<(u32, u8)>>>,
}

impl PageHandler for TestMmio {
    fn read_u8(&mut self, _ram: &mut FlatMemory, paddr: u32) -> u8 {
        self.reads.borrow_mut().push(paddr);
        0x5A
    }

    fn write_u8(&mut self, _ram: &mut FlatMemory, paddr: u32, val: u8) {
        self.writes.borrow_mut().push((paddr, val));
    }
}

#[test]
fn mmio_handler_intercepts_the_claimed_window() {
    let mut mem = Memory::new(0x100);
    let reads = Rc::new(RefCell::new(Vec::new()));
    let writes = Rc::new(RefCell::new(Vec::new()));
    mem.install_page_handler(
        0xA0,
        1,
        Box::new(TestMmio {
            reads: reads.clone(),
            writes: writes.clone(),
        }),
    );

    mem.write_u8(0xA0005, 0x42).unwrap();
    assert_eq!(writes.borrow().as_slice(), &[(0xA0005, 0x42)]);
    // The store itself must not see the write.
    assert_eq!(mem.ram().read_u8(0xA0005), 0);

    assert_eq!(mem.read_u8(0xA0005).unwrap(), 0x5A);
    assert_eq!(reads.borrow().as_slice(), &[0xA0005]);

    // Adjacent pages stay plain RAM.
    mem.write_u8(0x9F000, 0x77).unwrap();
    assert_eq!(mem.ram().read_u8(0x9F000), 0x77);
}

#[test]
fn handler_install_evicts_stale_translations() {
    let mut mem = Memory::new(0x100);

    // Warm the TLB with a direct way first.
    mem.write_u8(0xA0000, 0x11).unwrap();
    assert_eq!(mem.ram().read_u8(0xA0000), 0x11);

    let writes = Rc::new(RefCell::new(Vec::new()));
    mem.install_page_handler(
        0xA0,
        1,
        Box::new(TestMmio {
            reads: Rc::new(RefCell::new(Vec::new())),
            writes: writes.clone(),
        }),
    );

    // The stale direct way must not swallow this.
    mem.write_u8(0xA0000, 0x22).unwrap();
    assert_eq!(writes.borrow().as_slice(), &[(0xA0000, 0x22)]);
    assert_eq!(mem.ram().read_u8(0xA0000), 0x11);
}

#[test]
fn rom_window_reads_direct_and_discards_writes() {
    let mut mem = Memory::new(0x100);
    mem.ram_mut().write_u32(0xF0000, 0x0BAD_B105);
    mem.install_rom(0xF0, 0x10);

    assert_eq!(mem.read_u32(0xF0000).unwrap(), 0x0BAD_B105);
    mem.write_u32(0xF0000, 0x1111_1111).unwrap();
    assert_eq!(mem.read_u32(0xF0000).unwrap(), 0x0BAD_B105);
}

#[test]
fn code_page_write_fires_invalidation_before_commit() {
    let mut mem = Memory::new(16);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    mem.set_code_observer(move |page| sink.borrow_mut().push(page));

    mem.write_u8(0x3000, 0x90).unwrap();
    mem.mark_code_page(3, PageFlags::HAS_CODE32);
    assert!(mem.page_flags(3).contains(PageFlags::HAS_CODE32));

    mem.write_u8(0x3000, 0xCC).unwrap();
    assert_eq!(events.borrow().as_slice(), &[3]);
    assert_eq!(mem.read_u8(0x3000).unwrap(), 0xCC);
    assert!(!mem.page_flags(3).intersects(PageFlags::HAS_CODE));

    // The flags are consumed; further writes are plain stores.
    mem.write_u8(0x3001, 0xCC).unwrap();
    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn code_page_marking_reroutes_warm_write_ways() {
    let mut mem = Memory::new(16);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    mem.set_code_observer(move |page| sink.borrow_mut().push(page));

    // Warm the write way, then flag the page.
    mem.write_u8(0x4000, 0x01).unwrap();
    mem.mark_code_page(4, PageFlags::HAS_CODE16);

    mem.write_u8(0x4001, 0x02).unwrap();
    assert_eq!(events.borrow().as_slice(), &[4]);
}

#[test]
fn cold_and_warm_translations_agree() {
    let mut mem = Memory::new(16);
    install_mapping(&mut mem, 0x0040_0000, 0x5000 | PTE_P | PTE_RW | PTE_US);
    mem.ram_mut().write_u32(0x5010, 0x1357_9BDF);
    mem.set_dir_base(0x1000);
    mem.enable_paging(true);

    let cold = mem.read_u32(0x0040_0010).unwrap();
    let warm = mem.read_u32(0x0040_0010).unwrap();
    assert_eq!(cold, 0x1357_9BDF);
    assert_eq!(cold, warm);

    mem.write_u32(0x0040_0020, 0xA5A5_A5A5).unwrap();
    let back_cold = mem.ram().read_u32(0x5020);
    let back_warm = mem.read_u32(0x0040_0020).unwrap();
    assert_eq!(back_cold, 0xA5A5_A5A5);
    assert_eq!(back_warm, 0xA5A5_A5A5);
}

#[test]
fn write_through_walk_sets_dirty_once() {
    let mut mem = Memory::new(16);
    install_mapping(&mut mem, 0x0040_0000, 0x5000 | PTE_P | PTE_RW | PTE_US);
    mem.set_dir_base(0x1000);
    mem.enable_paging(true);

    let pte_addr = 0x2000 + ((0x0040_0000u32 >> 12) & 0x3FF) * 4;

    // A read fill must not set the dirty bit.
    mem.read_u8(0x0040_0000).unwrap();
    assert_eq!(mem.ram().read_u32(pte_addr) & PTE_D, 0);
    assert_ne!(mem.ram().read_u32(pte_addr) & PTE_A, 0);

    // The first write re-walks and commits it.
    mem.write_u8(0x0040_0000, 1).unwrap();
    assert_ne!(mem.ram().read_u32(pte_addr) & PTE_D, 0);
}

#[test]
fn user_access_faults_surface_with_cr2() {
    let mut mem = Memory::new(16);
    install_mapping(&mut mem, 0x0040_0000, 0x5000 | PTE_P | PTE_RW);
    mem.set_dir_base(0x1000);
    mem.enable_paging(true);
    mem.set_privilege(3, false);

    let err = mem.read_u8(0x0040_0123).unwrap_err();
    assert_eq!(err.addr, 0x0040_0123);
    assert_eq!(err.error_code, PageFault::EC_P | PageFault::EC_US);
    assert_eq!(mem.fault_addr(), 0x0040_0123);
}

#[test]
fn probes_report_without_faulting() {
    let mut mem = Memory::new(16);
    mem.set_dir_base(0x1000);
    mem.enable_paging(true);

    assert_eq!(mem.try_read_u8(0x0040_0000), None);
    assert_eq!(mem.try_write_u8(0x0040_0000, 1), None);
    // No CR2 latch, no accessed bits.
    assert_eq!(mem.fault_addr(), 0);

    install_mapping(&mut mem, 0x0040_0000, 0x5000 | PTE_P | PTE_RW | PTE_US);
    mem.ram_mut().write_u8(0x5000, 0x99);
    assert_eq!(mem.try_read_u8(0x0040_0000), Some(0x99));
}

#[test]
fn unaligned_access_splits_across_mappings() {
    let mut mem = Memory::new(16);
    mem.map_page(0, 0, false);
    mem.map_page(1, 2, false);

    mem.write_u32(0xFFE, 0x4433_2211).unwrap();
    assert_eq!(mem.ram().read_u16(0xFFE), 0x2211);
    assert_eq!(mem.ram().read_u16(0x2000), 0x4433);
    assert_eq!(mem.read_u32(0xFFE).unwrap(), 0x4433_2211);
}

#[test]
fn a20_gate_aliases_the_first_hma_pages() {
    let mut mem = Memory::new(0x120);
    mem.write_u8(0x0000_0010, 0xAB).unwrap();

    // Gate closed: 1 MiB wraps.
    assert_eq!(mem.read_u8(0x0010_0010).unwrap(), 0xAB);

    mem.set_a20(true);
    assert!(mem.a20_enabled());
    assert_eq!(mem.read_u8(0x0010_0010).unwrap(), 0x00);

    mem.write_u8(0x0010_0010, 0xCD).unwrap();
    mem.set_a20(false);
    assert_eq!(mem.read_u8(0x0010_0010).unwrap(), 0xAB);
    assert_eq!(mem.ram().read_u8(0x0010_0010), 0xCD);
}

#[test]
fn ivt_vectors_round_trip() {
    let mut mem = Memory::new(16);
    let target = crate::RealAddr::new(0xF000, 0x1234);
    mem.write_ivt_vector(0x21, target).unwrap();
    assert_eq!(mem.read_ivt_vector(0x21).unwrap(), target);
    assert_eq!(mem.ram().read_u32(0x21 * 4), 0xF000_1234);
}

#[test]
fn tlb_clear_forces_rewalk_through_new_tables() {
    let mut mem = Memory::new(16);
    install_mapping(&mut mem, 0, 0x5000 | PTE_P | PTE_RW | PTE_US);
    mem.set_dir_base(0x1000);
    mem.enable_paging(true);

    mem.ram_mut().write_u8(0x5000, 1);
    assert_eq!(mem.read_u8(0).unwrap(), 1);

    // Retarget linear page 0 at physical page 6 behind the TLB's back.
    let pte_addr = 0x2000;
    mem.ram_mut().write_u32(pte_addr, 0x6000 | PTE_P | PTE_RW | PTE_US);
    mem.ram_mut().write_u8(0x6000, 2);

    // Warm entry still serves the old page until the TLB is cleared.
    assert_eq!(mem.read_u8(0).unwrap(), 1);
    mem.clear_tlb();
    assert_eq!(mem.read_u8(0).unwrap(), 2);
}

proptest! {
    #[test]
    fn typed_round_trip(addr in 0u32..0xFFF0, val in any::<u32>()) {
        let mut mem = Memory::new(16);
        mem.write_u8(addr, val as u8).unwrap();
        prop_assert_eq!(mem.read_u8(addr).unwrap(), val as u8);
        mem.write_u16(addr, val as u16).unwrap();
        prop_assert_eq!(mem.read_u16(addr).unwrap(), val as u16);
        mem.write_u32(addr, val).unwrap();
        prop_assert_eq!(mem.read_u32(addr).unwrap(), val);
    }

    #[test]
    fn paged_and_flat_views_agree(offset in 0u32..0xFF0, val in any::<u32>()) {
        let mut mem = Memory::new(16);
        install_mapping(&mut mem, 0x0040_0000, 0x5000 | PTE_P | PTE_RW | PTE_US);
        mem.set_dir_base(0x1000);
        mem.enable_paging(true);

        mem.write_u32(0x0040_0000 + offset, val).unwrap();
        prop_assert_eq!(mem.ram().read_u32(0x5000 + offset), val);
        prop_assert_eq!(mem.read_u32(0x0040_0000 + offset).unwrap(), val);
    }
}
