//! End-to-end execution tests: real guest byte sequences run against the
//! paged memory context.

use retrobox_cpu::state::{GpReg, Reg8, SegReg, Segment, F_CF, F_ZF, CR0_PE};
use retrobox_cpu::{CoreConfig, Cpu, CpuGeneration, Fatal, StepExit};
use retrobox_memory::{FlatMemory, Memory, PageHandler, RealAddr};
use std::cell::RefCell;
use std::rc::Rc;

const CODE_SEG: u16 = 0x0100;
const DATA_SEG: u16 = 0x0200;
const STACK_SEG: u16 = 0x0300;

/// Real-mode harness: code at CODE_SEG:0, data at DATA_SEG, stack at
/// STACK_SEG:0xFFFE.
fn setup(code: &[u8]) -> (Cpu, Memory) {
    let mut mem = Memory::new(0x120);
    let mut cpu = Cpu::default();
    cpu.state.set_real_segment(SegReg::Cs, CODE_SEG);
    cpu.state.set_real_segment(SegReg::Ds, DATA_SEG);
    cpu.state.set_real_segment(SegReg::Es, DATA_SEG);
    cpu.state.set_real_segment(SegReg::Ss, STACK_SEG);
    cpu.state.set_reg16(GpReg::Esp, 0xFFFE);
    cpu.state.eip = 0;
    mem.block_write((CODE_SEG as u32) << 4, code);
    (cpu, mem)
}

fn data_lin(offset: u32) -> u32 {
    ((DATA_SEG as u32) << 4) + offset
}

#[test]
fn mov_add_and_store() {
    // mov ax, 0x1234 / add ax, 0x0BCC / mov [0x20], ax
    let (mut cpu, mut mem) = setup(&[
        0xB8, 0x34, 0x12, 0x05, 0xCC, 0x0B, 0xA3, 0x20, 0x00,
    ]);
    for _ in 0..3 {
        assert_eq!(cpu.step(&mut mem).unwrap(), StepExit::Continue);
    }
    assert_eq!(cpu.state.reg16(GpReg::Eax), 0x1E00);
    assert_eq!(mem.read_u16(data_lin(0x20)).unwrap(), 0x1E00);
}

#[test]
fn bt_reads_without_writing_bts_sets_in_memory() {
    // bt [0x20], bx / bts [0x20], bx
    let (mut cpu, mut mem) = setup(&[
        0x0F, 0xA3, 0x1E, 0x20, 0x00, //
        0x0F, 0xAB, 0x1E, 0x20, 0x00,
    ]);
    mem.write_u16(data_lin(0x20), 0x0002).unwrap();

    cpu.state.set_reg16(GpReg::Ebx, 1);
    cpu.step(&mut mem).unwrap();
    assert!(cpu.state.flag(F_CF));
    assert_eq!(mem.read_u16(data_lin(0x20)).unwrap(), 0x0002);

    cpu.state.set_reg16(GpReg::Ebx, 2);
    cpu.step(&mut mem).unwrap();
    assert!(!cpu.state.flag(F_CF));
    assert_eq!(mem.read_u16(data_lin(0x20)).unwrap(), 0x0006);
}

#[test]
fn bt_bit_offset_walks_words() {
    // bt [0x20], bx with bx = 16 + 3: tests bit 3 of the following word.
    let (mut cpu, mut mem) = setup(&[0x0F, 0xA3, 0x1E, 0x20, 0x00]);
    mem.write_u16(data_lin(0x20), 0).unwrap();
    mem.write_u16(data_lin(0x22), 0x0008).unwrap();

    cpu.state.set_reg16(GpReg::Ebx, 0x13);
    cpu.step(&mut mem).unwrap();
    assert!(cpu.state.flag(F_CF));
}

#[test]
fn group8_immediate_bit_ops() {
    // btr word [0x20], 5
    let (mut cpu, mut mem) = setup(&[0x0F, 0xBA, 0x36, 0x20, 0x00, 0x05]);
    mem.write_u16(data_lin(0x20), 0xFFFF).unwrap();
    cpu.step(&mut mem).unwrap();
    assert!(cpu.state.flag(F_CF));
    assert_eq!(mem.read_u16(data_lin(0x20)).unwrap(), 0xFFDF);
}

#[test]
fn group8_undefined_subcase_is_host_fatal() {
    // 0F BA /0 has no architected operation.
    let (mut cpu, mut mem) = setup(&[0x0F, 0xBA, 0x06, 0x20, 0x00, 0x05]);
    match cpu.step(&mut mem) {
        Err(Fatal::IllegalDispatch { bytes, .. }) => {
            assert_eq!(&bytes[..2], &[0x0F, 0xBA]);
        }
        other => panic!("expected host-fatal dispatch, got {other:?}"),
    }
}

struct RecordingMmio {
    writes: Rc<RefCell<Vec<(u32, u16)>>>,
    value: u16,
}

impl PageHandler for RecordingMmio {
    fn read_u8(&mut self, _ram: &mut FlatMemory, paddr: u32) -> u8 {
        if paddr & 1 == 0 {
            self.value as u8
        } else {
            (self.value >> 8) as u8
        }
    }

    fn write_u8(&mut self, _ram: &mut FlatMemory, paddr: u32, val: u8) {
        self.writes.borrow_mut().push((paddr, val as u16));
    }

    fn write_u16(&mut self, _ram: &mut FlatMemory, paddr: u32, val: u16) {
        self.writes.borrow_mut().push((paddr, val));
    }
}

#[test]
fn cmpxchg_always_writes_even_on_miss() {
    // cmpxchg [0x00], bx against an MMIO window: the miss branch must still
    // issue the store.
    let (mut cpu, mut mem) = setup(&[0x0F, 0xB1, 0x1E, 0x00, 0x00]);
    let writes = Rc::new(RefCell::new(Vec::new()));
    // DATA_SEG:0 sits at linear 0x2000, physical page 2.
    mem.install_page_handler(
        2,
        1,
        Box::new(RecordingMmio {
            writes: writes.clone(),
            value: 0x5555,
        }),
    );

    cpu.state.set_reg16(GpReg::Eax, 0x1111); // != 0x5555: miss branch
    cpu.state.set_reg16(GpReg::Ebx, 0x2222);
    cpu.step(&mut mem).unwrap();

    assert!(!cpu.state.flag(F_ZF));
    assert_eq!(cpu.state.reg16(GpReg::Eax), 0x5555);
    assert_eq!(writes.borrow().as_slice(), &[(0x2000, 0x5555)]);
}

#[test]
fn divide_error_enters_guest_handler() {
    // div cl with cl = 0.
    let (mut cpu, mut mem) = setup(&[0xF6, 0xF1]);
    mem.write_ivt_vector(0, RealAddr::new(0x2000, 0x0010)).unwrap();
    cpu.state.set_reg8(Reg8::Cl, 0);

    assert_eq!(cpu.step(&mut mem).unwrap(), StepExit::Continue);
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, 0x2000);
    assert_eq!(cpu.state.eip, 0x0010);

    // The pushed IP points back at the faulting instruction.
    let sp = cpu.state.reg16(GpReg::Esp) as u32;
    let stack_lin = ((STACK_SEG as u32) << 4) + sp;
    assert_eq!(mem.read_u16(stack_lin).unwrap(), 0x0000);
    assert_eq!(mem.read_u16(stack_lin + 2).unwrap(), CODE_SEG);
}

#[test]
fn int_and_iret_round_trip() {
    // int 0x21, then hlt; the handler at 0x2000:0 is a bare iret.
    let (mut cpu, mut mem) = setup(&[0xCD, 0x21, 0xF4]);
    mem.write_ivt_vector(0x21, RealAddr::new(0x2000, 0)).unwrap();
    mem.block_write(0x20000, &[0xCF]);

    cpu.step(&mut mem).unwrap();
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, 0x2000);
    cpu.step(&mut mem).unwrap();
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, CODE_SEG);
    assert_eq!(cpu.state.eip, 2);
    assert_eq!(cpu.step(&mut mem).unwrap(), StepExit::Halted);
}

#[test]
fn undefined_opcode_is_a_guest_fault() {
    // ARPL is not valid in real mode.
    let (mut cpu, mut mem) = setup(&[0x63, 0xC0]);
    mem.write_ivt_vector(6, RealAddr::new(0x2000, 0x0040)).unwrap();
    cpu.step(&mut mem).unwrap();
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, 0x2000);
    assert_eq!(cpu.state.eip, 0x0040);
}

#[test]
fn generation_gating_faults_as_undefined() {
    let mut mem = Memory::new(0x120);
    let mut cpu = Cpu::new(CoreConfig {
        generation: CpuGeneration::I386,
    });
    cpu.state.set_real_segment(SegReg::Cs, CODE_SEG);
    cpu.state.set_real_segment(SegReg::Ss, STACK_SEG);
    cpu.state.set_reg16(GpReg::Esp, 0xFFFE);
    cpu.state.eip = 0;
    // bswap eax needs a 486.
    mem.block_write((CODE_SEG as u32) << 4, &[0x66, 0x0F, 0xC8]);
    mem.write_ivt_vector(6, RealAddr::new(0x2000, 0)).unwrap();

    cpu.step(&mut mem).unwrap();
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, 0x2000);
}

#[test]
fn rep_movsb_copies_and_consumes_count() {
    let (mut cpu, mut mem) = setup(&[0xF3, 0xA4]);
    mem.block_write(data_lin(0x10), b"HELLO");
    cpu.state.set_reg16(GpReg::Esi, 0x10);
    cpu.state.set_reg16(GpReg::Edi, 0x40);
    cpu.state.set_reg16(GpReg::Ecx, 5);

    cpu.step(&mut mem).unwrap();
    let mut buf = [0u8; 5];
    mem.block_read(data_lin(0x40), &mut buf);
    assert_eq!(&buf, b"HELLO");
    assert_eq!(cpu.state.reg16(GpReg::Ecx), 0);
    assert_eq!(cpu.state.reg16(GpReg::Esi), 0x15);
    assert_eq!(cpu.state.reg16(GpReg::Edi), 0x45);
}

#[test]
fn shift_with_immediate_sets_carry() {
    // shl ax, 4
    let (mut cpu, mut mem) = setup(&[0xC1, 0xE0, 0x04]);
    cpu.state.set_reg16(GpReg::Eax, 0x1234);
    cpu.step(&mut mem).unwrap();
    assert_eq!(cpu.state.reg16(GpReg::Eax), 0x2340);
    assert!(cpu.state.flag(F_CF));
}

#[test]
fn stack_segment_default_for_bp_addressing() {
    // mov [bp+0x10], ax must hit SS, not DS.
    let (mut cpu, mut mem) = setup(&[0x89, 0x46, 0x10]);
    cpu.state.set_reg16(GpReg::Ebp, 0x0100);
    cpu.state.set_reg16(GpReg::Eax, 0xBEEF);
    cpu.step(&mut mem).unwrap();

    let ss_lin = ((STACK_SEG as u32) << 4) + 0x0110;
    assert_eq!(mem.read_u16(ss_lin).unwrap(), 0xBEEF);
    assert_eq!(mem.read_u16(data_lin(0x0110)).unwrap(), 0);
}

#[test]
fn segment_override_rebases_bp_form() {
    // es: mov [bp+0x10], ax
    let (mut cpu, mut mem) = setup(&[0x26, 0x89, 0x46, 0x10]);
    cpu.state.set_real_segment(SegReg::Es, 0x0400);
    cpu.state.set_reg16(GpReg::Ebp, 0x0100);
    cpu.state.set_reg16(GpReg::Eax, 0xBEEF);
    cpu.step(&mut mem).unwrap();
    assert_eq!(mem.read_u16(0x4110).unwrap(), 0xBEEF);
}

#[test]
fn self_modifying_store_fires_invalidation() {
    // mov byte [0x00], 0xCC aimed at a page flagged as holding code.
    let (mut cpu, mut mem) = setup(&[0xC6, 0x06, 0x00, 0x00, 0xCC]);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    mem.set_code_observer(move |page| sink.borrow_mut().push(page));
    mem.mark_code_page(2, retrobox_memory::PageFlags::HAS_CODE16);

    cpu.step(&mut mem).unwrap();
    assert_eq!(events.borrow().as_slice(), &[2]);
    assert_eq!(mem.read_u8(data_lin(0)).unwrap(), 0xCC);
}

#[test]
fn protected_mode_fault_delivers_through_idt_gate() {
    let mut mem = Memory::new(0x120);
    let mut cpu = Cpu::default();

    // GDT at 0x3000: null, then a flat 32-bit code segment at 0x08 and a
    // flat data segment at 0x10.
    mem.block_write(0x3000, &0u64.to_le_bytes());
    mem.block_write(0x3008, &0x00CF_9A00_0000_FFFFu64.to_le_bytes());
    mem.block_write(0x3010, &0x00CF_9200_0000_FFFFu64.to_le_bytes());
    // IDT at 0x4000: vector 6 → 32-bit interrupt gate, selector 0x08,
    // offset 0x5000.
    let gate: u64 = 0x0000_8E00_0008_5000 | (0u64 << 48);
    mem.block_write(0x4000 + 6 * 8, &gate.to_le_bytes());

    cpu.state.cr0 |= CR0_PE;
    cpu.state.gdt.base = 0x3000;
    cpu.state.gdt.limit = 0x7F;
    cpu.state.idt.base = 0x4000;
    cpu.state.idt.limit = 0x7FF;
    *cpu.state.seg_mut(SegReg::Cs) = Segment {
        selector: 0x08,
        base: 0,
        limit: 0xFFFF_FFFF,
        big: true,
    };
    *cpu.state.seg_mut(SegReg::Ss) = Segment {
        selector: 0x10,
        base: 0,
        limit: 0xFFFF_FFFF,
        big: true,
    };
    cpu.state.set_reg32(GpReg::Esp, 0x9000);
    cpu.state.eip = 0x6000;

    // An undefined encoding at 0x6000.
    mem.block_write(0x6000, &[0x0F, 0xFF]);

    assert_eq!(cpu.step(&mut mem).unwrap(), StepExit::Continue);
    assert_eq!(cpu.state.eip, 0x5000);
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, 0x08);
    // EFLAGS, CS, EIP pushed as dwords; EIP points at the faulting
    // instruction.
    assert_eq!(mem.read_u32(0x9000 - 4).unwrap() & 0x2, 0x2);
    assert_eq!(mem.read_u32(0x9000 - 8).unwrap(), 0x08);
    assert_eq!(mem.read_u32(0x9000 - 12).unwrap(), 0x6000);
}

#[test]
fn fetch_through_paging_and_code_in_high_linear_space() {
    let mut mem = Memory::new(0x120);
    let mut cpu = Cpu::default();

    // Map linear page 0x400 (0x400000) onto physical page 3 and run from it.
    mem.map_page(0x400, 3, false);
    mem.ram_mut().write_from(0x3000, &[0xB8, 0x77, 0x66]); // mov ax, 0x6677

    *cpu.state.seg_mut(SegReg::Cs) = Segment {
        selector: 0,
        base: 0x0040_0000,
        limit: 0xFFFF,
        big: false,
    };
    cpu.state.set_real_segment(SegReg::Ss, STACK_SEG);
    cpu.state.set_reg16(GpReg::Esp, 0xFFFE);
    cpu.state.eip = 0;

    cpu.step(&mut mem).unwrap();
    assert_eq!(cpu.state.reg16(GpReg::Eax), 0x6677);
}

#[test]
fn run_batch_counts_instructions() {
    let (mut cpu, mut mem) = setup(&[0x40, 0x40, 0x40, 0xF4]); // inc ax ×3, hlt
    let result = cpu.run(&mut mem, 16).unwrap();
    assert_eq!(result.executed, 3);
    assert_eq!(result.exit, retrobox_cpu::RunExit::Halted);
    assert_eq!(cpu.state.reg16(GpReg::Eax), 3);
}
