//! End-to-end scenarios: boot a runtime, run jobs, allocate under tags and
//! check the arena afterwards.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft_runtime::{
    start, start_with_memory, HeapMemory, Job, Runtime, RuntimeConfig, Tag, BLOCK_SIZE,
};

fn config(threads: usize, budget_blocks: usize) -> RuntimeConfig {
    RuntimeConfig::builder()
        .thread_count(threads)
        .fiber_count(32)
        .fiber_stack_size(64 * 1024)
        .memory_budget(budget_blocks * BLOCK_SIZE)
        .tagged_heap_count(8)
        .job_queue_log2_capacity(12)
        .allocation_queue_log2_capacity(8)
        .application_name("scenario")
        .build()
        .unwrap()
}

fn run<F>(threads: usize, budget_blocks: usize, main: F) -> i32
where
    F: FnOnce(&Runtime) -> i32 + Send + 'static,
{
    start_with_memory(config(threads, budget_blocks), Box::new(HeapMemory::new()), main).unwrap()
}

fn counting_jobs(n: usize, counter: &Arc<AtomicUsize>) -> Vec<Job> {
    (0..n)
        .map(|_| {
            let counter = counter.clone();
            Job::new("count", move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect()
}

#[test]
fn scenario_a_one_byte_allocation_is_block_backed() {
    let config = RuntimeConfig::builder()
        .thread_count(1)
        .fiber_count(8)
        .memory_budget(256 << 20)
        .build()
        .unwrap();

    let code = start(config, |rt| {
        let tagged = rt.tagged();
        let bitmap = tagged.blocks().bitmap();
        let free_before = bitmap.free_blocks();
        let tag = Tag::new(1000);

        let ptr = rt.alloc(tag, 1, 1).expect("one byte fits");
        let offset = tagged
            .blocks()
            .reservation()
            .offset_of(ptr.as_ptr())
            .expect("pointer inside the arena");
        let block = (offset / BLOCK_SIZE) as u32;
        assert_ne!(block, 0);
        assert!(!bitmap.is_free(block));
        unsafe { ptr.as_ptr().write(0xAB) };

        assert_eq!(rt.free(tag), 1);
        assert!(bitmap.is_free(block));
        assert_eq!(bitmap.free_blocks(), free_before);
        assert!(tagged.verify_bitmap().is_ok());
        0
    })
    .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn scenario_b_thousand_jobs_one_batch() {
    for threads in [1, 2, 4] {
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs_counter = counter.clone();
        let code = run(threads, 8, move |rt| {
            let chain = rt.split_work(counting_jobs(1000, &jobs_counter));
            rt.unchain(chain);
            jobs_counter.load(Ordering::Relaxed) as i32
        });
        assert_eq!(code, 1000, "threads = {}", threads);
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }
}

#[test]
fn scenario_c_oversized_request_leaves_bitmap_unchanged() {
    let code = run(1, 16, |rt| {
        let blocks = rt.tagged().blocks();
        let free_before = blocks.bitmap().free_blocks();
        let mark_before = blocks.high_water_mark();

        assert!(rt.alloc(Tag::new(77), 32 * BLOCK_SIZE, 16).is_none());

        assert_eq!(blocks.bitmap().free_blocks(), free_before);
        assert_eq!(blocks.high_water_mark(), mark_before);
        assert!(rt.tagged().verify_bitmap().is_ok());
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn scenario_c_size_near_usize_max_returns_none() {
    let code = run(1, 16, |rt| {
        let blocks = rt.tagged().blocks();
        let free_before = blocks.bitmap().free_blocks();
        let mark_before = blocks.high_water_mark();

        for size in [usize::MAX, usize::MAX - BLOCK_SIZE / 2] {
            assert!(rt.alloc(Tag::new(9), size, 8).is_none());
            assert!(rt.alloc(Tag::DRIFTER, size, 8).is_none());
        }

        assert_eq!(blocks.bitmap().free_blocks(), free_before);
        assert_eq!(blocks.high_water_mark(), mark_before);
        assert!(rt.tagged().verify_bitmap().is_ok());
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn scenario_d_shared_tag_from_two_threads() {
    const PER_JOB: usize = 10_000;
    const SIZE: usize = 4096;

    let code = run(2, 64, |rt| {
        let tag = Tag::new(4242);
        let started = Arc::new(AtomicUsize::new(0));
        let threads = Arc::new(Mutex::new(HashSet::new()));
        let jobs = (0..2)
            .map(|_| {
                let started = started.clone();
                let threads = threads.clone();
                Job::new("hammer", move |rt| {
                    threads.lock().unwrap().insert(rt.thread_index());
                    // Hold this thread until the other job is running too.
                    started.fetch_add(1, Ordering::AcqRel);
                    while started.load(Ordering::Acquire) < 2 {
                        std::hint::spin_loop();
                    }
                    for _ in 0..PER_JOB {
                        let ptr = rt.alloc(tag, SIZE, 16).expect("within budget");
                        unsafe { ptr.as_ptr().write(1) };
                    }
                })
            })
            .collect();
        let chain = rt.split_work(jobs);
        rt.unchain(chain);
        assert_eq!(threads.lock().unwrap().len(), 2);

        let expected = (2 * PER_JOB * SIZE).div_ceil(BLOCK_SIZE);
        let tagged = rt.tagged();
        assert_eq!(tagged.live_allocations(tag), expected);
        assert_eq!(tagged.live_blocks() as usize, expected + 1);
        assert_eq!(tagged.verify_bitmap(), Ok(()));

        rt.free(tag);
        assert_eq!(tagged.live_blocks(), 1);
        assert_eq!(tagged.verify_bitmap(), Ok(()));
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn fork_join_for_various_sizes() {
    for threads in [1, 3] {
        for n in [0, 1, 7, 64, 513] {
            let counter = Arc::new(AtomicUsize::new(0));
            let jobs_counter = counter.clone();
            let code = run(threads, 4, move |rt| {
                let chain = rt.split_work(counting_jobs(n, &jobs_counter));
                rt.unchain(chain);
                (jobs_counter.load(Ordering::Relaxed) == n) as i32
            });
            assert_eq!(code, 1, "threads = {}, n = {}", threads, n);
            assert_eq!(counter.load(Ordering::Relaxed), n);
        }
    }
}

#[test]
fn nested_batches() {
    let counter = Arc::new(AtomicUsize::new(0));
    let jobs_counter = counter.clone();
    let code = run(3, 4, move |rt| {
        let outer = (0..8)
            .map(|_| {
                let counter = jobs_counter.clone();
                Job::new("outer", move |rt| {
                    let chain = rt.split_work(counting_jobs(16, &counter));
                    rt.unchain(chain);
                })
            })
            .collect();
        let chain = rt.split_work(outer);
        rt.unchain(chain);
        0
    });
    assert_eq!(code, 0);
    assert_eq!(counter.load(Ordering::Relaxed), 8 * 16);
}

#[test]
fn single_fiber_fork_join_and_nesting() {
    for threads in [1, 3] {
        let config = RuntimeConfig::builder()
            .thread_count(threads)
            .fiber_count(1)
            .fiber_stack_size(256 * 1024)
            .memory_budget(4 * BLOCK_SIZE)
            .build()
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs_counter = counter.clone();

        let code = start_with_memory(config, Box::new(HeapMemory::new()), move |rt| {
            let chain = rt.split_work(counting_jobs(50, &jobs_counter));
            rt.unchain(chain);

            let outer = (0..4)
                .map(|_| {
                    let counter = jobs_counter.clone();
                    Job::new("outer", move |rt| {
                        let chain = rt.split_work(counting_jobs(8, &counter));
                        rt.unchain(chain);
                    })
                })
                .collect();
            let chain = rt.split_work(outer);
            rt.unchain(chain);
            0
        })
        .unwrap();

        assert_eq!(code, 0, "threads = {}", threads);
        assert_eq!(counter.load(Ordering::Relaxed), 50 + 4 * 8);
    }
}

#[test]
fn panicking_job_does_not_hang_unchain() {
    let counter = Arc::new(AtomicUsize::new(0));
    let jobs_counter = counter.clone();
    let code = run(2, 4, move |rt| {
        let mut jobs = counting_jobs(10, &jobs_counter);
        jobs.push(Job::new("explode", |_| panic!("job failure")));
        let chain = rt.split_work(jobs);
        rt.unchain(chain);

        let stats = rt.stats();
        assert_eq!(stats.panicked_jobs, 1);
        assert!(stats
            .last_panic
            .as_deref()
            .is_some_and(|message| message.contains("job failure")));
        0
    });
    assert_eq!(code, 0);
    assert_eq!(counter.load(Ordering::Relaxed), 10);
}

#[test]
fn submitted_jobs_run() {
    let counter = Arc::new(AtomicUsize::new(0));
    let jobs_counter = counter.clone();
    let code = run(2, 4, move |rt| {
        rt.submit(counting_jobs(50, &jobs_counter));
        // Waiting through a batch lets this fiber yield its thread.
        while jobs_counter.load(Ordering::Relaxed) < 50 {
            let chain = rt.split_work(vec![Job::new("tick", |_| {})]);
            rt.unchain(chain);
        }
        0
    });
    assert_eq!(code, 0);
    assert_eq!(counter.load(Ordering::Relaxed), 50);
}

#[test]
fn drifter_allocations_never_alias() {
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let jobs_ranges = ranges.clone();
    let code = run(4, 32, move |rt| {
        let jobs = (0..64)
            .map(|i| {
                let ranges = jobs_ranges.clone();
                Job::new("drift", move |rt| {
                    let size = 1024 + i * 97;
                    let ptr = rt.alloc(Tag::DRIFTER, size, 8).expect("within budget");
                    unsafe { ptr.as_ptr().write_bytes(i as u8, size) };
                    ranges.lock().unwrap().push((ptr.as_ptr() as usize, size, i as u8));
                })
            })
            .collect();
        let chain = rt.split_work(jobs);
        rt.unchain(chain);
        assert_eq!(rt.tagged().verify_bitmap(), Ok(()));
        rt.free(Tag::DRIFTER);
        assert_eq!(rt.tagged().live_allocations(Tag::DRIFTER), 0);
        0
    });
    assert_eq!(code, 0);

    let mut ranges = ranges.lock().unwrap().clone();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start, size, _) = pair[0];
        assert!(start + size <= pair[1].0, "drifter ranges overlap");
    }
}

#[test]
fn distinct_tags_never_alias() {
    let code = run(4, 32, |rt| {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let jobs = (0..4u64)
            .map(|t| {
                let seen = seen.clone();
                Job::new("tagged", move |rt| {
                    for _ in 0..256 {
                        let ptr = rt.alloc(Tag::new(100 + t), 8192, 64).expect("within budget");
                        assert_eq!(ptr.as_ptr() as usize % 64, 0);
                        assert!(seen.lock().unwrap().insert(ptr.as_ptr() as usize));
                    }
                })
            })
            .collect();
        let chain = rt.split_work(jobs);
        rt.unchain(chain);

        assert_eq!(rt.tagged().verify_bitmap(), Ok(()));
        for t in 0..4 {
            assert!(rt.free(Tag::new(100 + t)) > 0);
            assert_eq!(rt.free(Tag::new(100 + t)), 0);
        }
        assert_eq!(rt.tagged().bound_dynamic_heaps(), 0);
        assert_eq!(rt.tagged().live_blocks(), 1);
        0
    });
    assert_eq!(code, 0);
}
