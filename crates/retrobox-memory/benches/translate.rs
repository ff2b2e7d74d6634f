use criterion::{black_box, criterion_group, criterion_main, Criterion};
use retrobox_memory::Memory;

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;

fn setup_paged() -> Memory {
    let mut mem = Memory::new(64);
    // CR3 at 0x1000, one table at 0x2000 mapping 4 MiB worth of pages
    // back onto the low RAM pages.
    mem.ram_mut().write_u32(0x1000, 0x2000 | PTE_P | PTE_RW | PTE_US);
    for i in 0u32..64 {
        mem.ram_mut()
            .write_u32(0x2000 + i * 4, (i << 12) | PTE_P | PTE_RW | PTE_US);
    }
    mem.set_dir_base(0x1000);
    mem.enable_paging(true);
    mem
}

fn warm_tlb_read(c: &mut Criterion) {
    let mut mem = setup_paged();
    mem.read_u32(0x8000).unwrap();

    c.bench_function("warm_tlb_read_u32", |b| {
        b.iter(|| mem.read_u32(black_box(0x8000)).unwrap())
    });
}

fn cold_walk_read(c: &mut Criterion) {
    let mut mem = setup_paged();

    c.bench_function("cold_walk_read_u32", |b| {
        b.iter(|| {
            mem.clear_tlb();
            mem.read_u32(black_box(0x8000)).unwrap()
        })
    });
}

fn identity_read(c: &mut Criterion) {
    let mut mem = Memory::new(64);
    mem.read_u32(0x8000).unwrap();

    c.bench_function("identity_read_u32", |b| {
        b.iter(|| mem.read_u32(black_box(0x8000)).unwrap())
    });
}

criterion_group!(benches, warm_tlb_read, cold_walk_read, identity_read);
criterion_main!(benches);
