//! Memory substrate benchmarks

use karri::memory::mapper::{PAGE_SIZE, WORD_SIZE};
use karri::memory::pcb::{Pcb, PcbConfig};
use karri::memory::segments::{PageKind, PageTable, SegmentSlot, SEGMENT_SIZE};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn fresh_pcb() -> Pcb {
    Pcb::new(PcbConfig {
        guard_pages: false,
        ..PcbConfig::default()
    })
    .unwrap()
}

/// Bump a cons-cell sized request down the fast path
fn alloc_pairs(pcb: &mut Pcb, count: usize) {
    for _ in 0..count {
        pcb.alloc_unchecked(black_box(2 * WORD_SIZE)).unwrap();
    }
}

/// Cycle a page through the cache
fn page_round_trip(pcb: &mut Pcb) {
    let page = pcb.acquire_page().unwrap();
    pcb.release_page(black_box(page)).unwrap();
}

/// Look up page tags across a populated table
fn slot_lookups(table: &PageTable, base: usize) -> usize {
    (0..64)
        .filter(|i| table.slot_at(black_box(base + i * PAGE_SIZE)).kind() == PageKind::Data)
        .count()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut pcb = fresh_pcb();
    c.bench_function("alloc_pairs_1000", |b| b.iter(|| alloc_pairs(&mut pcb, 1000)));
    c.bench_function("page_cache_round_trip", |b| {
        b.iter(|| page_round_trip(&mut pcb))
    });

    let mut table = PageTable::new(4 * SEGMENT_SIZE, 5 * SEGMENT_SIZE);
    let base = 4 * SEGMENT_SIZE;
    table.tag_range(base, 32 * PAGE_SIZE, SegmentSlot::new(PageKind::Data, 0));
    c.bench_function("segment_slot_lookup", |b| {
        b.iter(|| slot_lookups(&table, base))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
