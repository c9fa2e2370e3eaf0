#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tephra_dbuf::RangeList;
use tephra_types::{BlockId, DatasetId, DbufKey, Level, ObjectId};

fn key_hash(c: &mut Criterion) {
    let keys: Vec<DbufKey> = (0..1024_u64)
        .map(|i| {
            DbufKey::new(
                DatasetId(i % 7),
                ObjectId(i * 37),
                Level((i % 4) as u8),
                BlockId(i * 131),
            )
        })
        .collect();
    c.bench_function("dbuf_key_hash64", |b| {
        b.iter(|| {
            let mut acc = 0_u64;
            for key in &keys {
                acc ^= black_box(key).hash64();
            }
            acc
        });
    });
}

fn range_accumulation(c: &mut Criterion) {
    const BLOCK: usize = 128 * 1024;
    c.bench_function("range_add_scattered", |b| {
        b.iter(|| {
            let mut ranges = RangeList::new();
            // Scattered writes that progressively coalesce.
            for i in 0..64_usize {
                let start = (i * 2048) % (BLOCK - 512);
                ranges.add(black_box(start), 512, BLOCK);
            }
            ranges.len()
        });
    });

    c.bench_function("range_holes", |b| {
        let mut ranges = RangeList::new();
        for i in 0..32_usize {
            ranges.add(i * 4096, 1024, BLOCK);
        }
        b.iter(|| black_box(&ranges).holes(BLOCK).len());
    });
}

criterion_group!(benches, key_hash, range_accumulation);
criterion_main!(benches);
