//! Memory management benchmarks using criterion.
//!
//! Run with: cargo bench --bench memory_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft_runtime::bitmap::BlockBitmap;
use weft_runtime::blocks::BlockAllocator;
use weft_runtime::chain::{ChainPool, SpinWait};
use weft_runtime::tagged::{Tag, TaggedAllocator, TaggedLayout};
use weft_runtime::vm::{HeapMemory, Reservation, BLOCK_SIZE};

fn tagged(blocks: usize) -> TaggedAllocator {
    let reservation = Reservation::new(Box::new(HeapMemory::new()), blocks * BLOCK_SIZE)
        .expect("reserve bench arena");
    TaggedAllocator::new(
        BlockAllocator::new(reservation).expect("commit header block"),
        TaggedLayout {
            drifter_heaps: 1,
            dynamic_heaps: 8,
            descriptor_log2: 10,
        },
    )
}

fn bench_bitmap(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap");

    for blocks in [64u32, 1024, 16384] {
        group.bench_with_input(BenchmarkId::new("claim_release", blocks), &blocks, |b, &blocks| {
            let bitmap = BlockBitmap::new(blocks);
            b.iter(|| {
                let block = bitmap.find_first_set(1, blocks);
                bitmap.release_range(black_box(block), 1);
            });
        });

        group.bench_with_input(BenchmarkId::new("best_fit_8", blocks), &blocks, |b, &blocks| {
            let bitmap = BlockBitmap::new(blocks);
            // Fragment the map so the scan has work to do.
            for block in (1..blocks).step_by(8) {
                bitmap.claim_range(block, 1);
            }
            b.iter(|| black_box(bitmap.best_fit_growth(1, blocks, 7)));
        });
    }

    group.finish();
}

fn bench_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("blocks");

    group.bench_function("allocate_release_committed", |b| {
        let reservation =
            Reservation::new(Box::new(HeapMemory::new()), 64 * BLOCK_SIZE).expect("reserve");
        let blocks = BlockAllocator::new(reservation).expect("boot");
        // Warm the committed prefix so the loop never commits.
        let start = blocks.allocate(16).expect("grow");
        blocks.release(start, 16);
        b.iter(|| {
            let start = blocks.allocate(black_box(4)).expect("committed run");
            blocks.release(start, 4);
        });
    });

    group.finish();
}

fn bench_tagged(c: &mut Criterion) {
    let mut group = c.benchmark_group("tagged");
    let pool = ChainPool::new(4);
    let wait = SpinWait::new(&pool);

    for size in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::new("bump_1000", size), &size, |b, &size| {
            let allocator = tagged(64);
            let tag = Tag::new(2);
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(allocator.alloc(tag, size, 16, 0, &wait));
                }
                allocator.free(tag);
            });
        });
    }

    group.bench_function("drifter_bump_1000", |b| {
        let allocator = tagged(64);
        b.iter(|| {
            for _ in 0..1000 {
                black_box(allocator.alloc(Tag::DRIFTER, 64, 8, 0, &wait));
            }
            allocator.free(Tag::DRIFTER);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_bitmap, bench_blocks, bench_tagged);

criterion_main!(benches);
