use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fsim_map::CachedMappingTable;
use fsim_types::{Lpa, Ppa, SectorBitmap, StreamId};

const CAPACITY: usize = 16 * 1024;

fn populated() -> CachedMappingTable {
    let mut cmt = CachedMappingTable::new(CAPACITY);
    let stream = StreamId(0);
    for lpa in 0..CAPACITY as u64 {
        cmt.reserve_slot(stream, Lpa(lpa)).unwrap();
        cmt.insert_new_mapping_info(stream, Lpa(lpa), Ppa(lpa * 7), SectorBitmap::full_page(8))
            .unwrap();
    }
    cmt
}

fn bench_cmt(c: &mut Criterion) {
    let stream = StreamId(0);

    c.bench_function("cmt_hit_with_lru_promotion", |b| {
        let mut cmt = populated();
        let mut lpa = 0u64;
        b.iter(|| {
            lpa = (lpa + 4099) % CAPACITY as u64;
            black_box(cmt.retrieve_ppa(stream, Lpa(lpa)).unwrap())
        });
    });

    c.bench_function("cmt_peek_without_promotion", |b| {
        let cmt = populated();
        let mut lpa = 0u64;
        b.iter(|| {
            lpa = (lpa + 4099) % CAPACITY as u64;
            black_box(cmt.peek_ppa(stream, Lpa(lpa)))
        });
    });

    c.bench_function("cmt_evict_reserve_insert_cycle", |b| {
        let mut cmt = populated();
        let mut next = CAPACITY as u64;
        b.iter(|| {
            let evicted = cmt.evict_one_slot().unwrap();
            black_box(evicted);
            cmt.reserve_slot(stream, Lpa(next)).unwrap();
            cmt.insert_new_mapping_info(stream, Lpa(next), Ppa(next), SectorBitmap::EMPTY)
                .unwrap();
            next += 1;
        });
    });
}

criterion_group!(benches, bench_cmt);
criterion_main!(benches);
