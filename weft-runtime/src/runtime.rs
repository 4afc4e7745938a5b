//! # Runtime Context
//!
//! The [`Runtime`] owns every piece of scheduler and allocator state and is
//! handed by reference to each job. There is no global state: [`start`]
//! builds a runtime, runs the worker threads to completion and tears it
//! down.
//!
//! ## Boot
//!
//! 1. validate and resolve the [`RuntimeConfig`]
//! 2. reserve the arena, build the block and tagged allocators
//! 3. allocate the chain pool, the fiber stacks and the job queue
//! 4. queue the main job
//! 5. spawn workers `1..N`; the calling thread becomes worker 0
//! 6. freeze the thread registry, release every worker through a barrier
//!
//! The main job's return value becomes the exit code. When it returns (or
//! panics) one terminate job per worker is queued, every home loop drains
//! and stops, and [`start`] returns after joining the workers.
//!
//! Work queued with [`Runtime::submit`] is not tracked: the main job must
//! make sure it has finished before returning.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Barrier;
use std::thread;

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::blocks::BlockAllocator;
use crate::chain::{Chain, ChainPool, ChainWait, SpinWait};
use crate::config::{ConfigError, RuntimeConfig};
use crate::fiber::{FiberPool, FiberYield, INVALID_FIBER};
use crate::registry::ThreadRegistry;
use crate::ring::RingBuffer;
use crate::scheduler::{panic_message, Job, Task};
use crate::stats::{RuntimeCounters, RuntimeStats};
use crate::sync::Backoff;
use crate::tagged::{Tag, TaggedAllocator, TaggedLayout};
use crate::vm::{OsMemory, Reservation, VirtualMemory, VmError};

/// Exit code reported when the main job panics.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Failure to bring the runtime up. Nothing has run when this is returned.
#[derive(Debug, Error)]
pub enum BootError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The arena could not be reserved or its first block committed.
    #[error("failed to set up the memory arena")]
    Memory(#[from] VmError),
    /// Fiber stacks could not be allocated.
    #[error("failed to allocate fiber stacks")]
    FiberStack(#[source] io::Error),
}

/// Per-thread scheduler state.
pub(crate) struct ThreadSlot {
    pub(crate) current: AtomicU32,
}

/// Scheduler and allocator state shared by all workers.
pub struct Runtime {
    config: RuntimeConfig,
    pub(crate) tagged: TaggedAllocator,
    pub(crate) chains: ChainPool,
    pub(crate) fibers: FiberPool,
    pub(crate) jobs: RingBuffer<Task>,
    registry: ThreadRegistry,
    pub(crate) threads: Box<[CachePadded<ThreadSlot>]>,
    pub(crate) counters: RuntimeCounters,
    exit_code: AtomicI32,
}

/// Boot a runtime over OS virtual memory and run `main` as its first job.
///
/// Blocks until `main` returns and every worker has stopped, then returns
/// `main`'s exit code ([`PANIC_EXIT_CODE`] if it panicked).
///
/// # Example
///
/// ```rust,ignore
/// use weft_runtime::{start, Job, RuntimeConfig};
///
/// let code = start(RuntimeConfig::default(), |rt| {
///     let jobs = (0..8).map(|i| Job::new("square", move |_| { let _ = i * i; })).collect();
///     let chain = rt.split_work(jobs);
///     rt.unchain(chain);
///     0
/// })?;
/// ```
pub fn start<F>(config: RuntimeConfig, main: F) -> Result<i32, BootError>
where
    F: FnOnce(&Runtime) -> i32 + Send + 'static,
{
    start_with_memory(config, Box::new(OsMemory::new()), main)
}

/// Like [`start`], with the arena backed by `vm`.
pub fn start_with_memory<F>(
    config: RuntimeConfig,
    vm: Box<dyn VirtualMemory>,
    main: F,
) -> Result<i32, BootError>
where
    F: FnOnce(&Runtime) -> i32 + Send + 'static,
{
    config.validate()?;
    let runtime = Runtime::new(config.resolve(), vm)?;

    tracing::info!(
        app = %runtime.config.application_name,
        threads = runtime.config.thread_count,
        fibers = runtime.config.fiber_count,
        budget_mib = runtime.config.memory_budget >> 20,
        backing = runtime.tagged.blocks().reservation().backing(),
        "runtime starting"
    );

    runtime.push_task(Task::Run(Job::new("main", move |rt| {
        let code = match panic::catch_unwind(AssertUnwindSafe(|| main(rt))) {
            Ok(code) => code,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "main job panicked");
                rt.counters.record_panic(format!("main: {}", message));
                PANIC_EXIT_CODE
            }
        };
        rt.exit_code.store(code, Ordering::Release);
        rt.broadcast_terminate();
    })));

    runtime.run_threads();

    let code = runtime.exit_code.load(Ordering::Acquire);
    tracing::info!(code, jobs = runtime.counters.jobs_executed.get(), "runtime stopped");
    Ok(code)
}

impl Runtime {
    fn new(config: RuntimeConfig, vm: Box<dyn VirtualMemory>) -> Result<Self, BootError> {
        let reservation = Reservation::new(vm, config.memory_budget)?;
        let blocks = BlockAllocator::new(reservation)?;
        let tagged = TaggedAllocator::new(
            blocks,
            TaggedLayout {
                drifter_heaps: config.thread_count,
                dynamic_heaps: config.tagged_heap_count,
                descriptor_log2: config.allocation_queue_log2_capacity,
            },
        );

        // A fiber can hold a batch chain and a heap growth chain at once.
        let chains = ChainPool::new(2 * (config.fiber_count + config.thread_count));
        let fibers = FiberPool::new(config.fiber_count, config.fiber_stack_size)
            .map_err(BootError::FiberStack)?;
        let jobs = RingBuffer::with_capacity_log2(config.job_queue_log2_capacity);
        let threads = (0..config.thread_count)
            .map(|_| {
                CachePadded::new(ThreadSlot {
                    current: AtomicU32::new(INVALID_FIBER),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            config,
            tagged,
            chains,
            fibers,
            jobs,
            registry: ThreadRegistry::new(),
            threads,
            counters: RuntimeCounters::new(),
            exit_code: AtomicI32::new(0),
        })
    }

    fn run_threads(&self) {
        let count = self.config.thread_count;
        let barrier = Barrier::new(count);
        let cores = if self.config.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let pin = |index: usize| {
            if cores.is_empty() {
                return;
            }
            let core = cores[index % cores.len()];
            if !core_affinity::set_for_current(core) {
                tracing::warn!(thread = index, core = core.id, "failed to pin worker");
            }
        };

        thread::scope(|scope| {
            let handles = (1..count)
                .map(|index| {
                    let barrier = &barrier;
                    let pin = &pin;
                    thread::Builder::new()
                        .name(format!("{}-worker-{}", self.config.application_name, index))
                        .spawn_scoped(scope, move || {
                            pin(index);
                            barrier.wait();
                            self.home_loop(index as u32);
                        })
                        .expect("failed to spawn worker thread")
                })
                .collect::<Vec<_>>();

            self.registry.freeze(
                std::iter::once((thread::current().id(), 0)).chain(
                    handles
                        .iter()
                        .enumerate()
                        .map(|(i, handle)| (handle.thread().id(), i as u32 + 1)),
                ),
            );
            tracing::debug!(threads = count, "workers registered");

            pin(0);
            barrier.wait();
            self.home_loop(0);
        });
    }

    /// Queue a task, waiting for room.
    pub(crate) fn push_task(&self, mut task: Task) {
        let mut backoff = Backoff::new();
        while let Err(back) = self.jobs.enqueue(task) {
            task = back;
            backoff.spin();
        }
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Queue `jobs` as one batch and return the chain counting them down.
    ///
    /// The chain must be passed to [`Runtime::unchain`] exactly once.
    ///
    /// # Panics
    ///
    /// Panics if the batch does not fit in the job queue.
    #[must_use = "a chain must be passed to unchain"]
    pub fn split_work(&self, jobs: Vec<Job>) -> Chain {
        assert!(
            jobs.len() <= self.jobs.capacity(),
            "batch of {} jobs exceeds the job queue capacity {}",
            jobs.len(),
            self.jobs.capacity()
        );
        let count = u32::try_from(jobs.len()).unwrap_or(u32::MAX);
        let chain = self.chains.claim(count);

        for mut job in jobs {
            job.chain = Some(chain);
            if self.jobs.enqueue(Task::Run(job)).is_err() {
                panic!("job queue full ({} slots)", self.jobs.capacity());
            }
        }

        tracing::trace!(%chain, jobs = count, "batch queued");
        chain
    }

    /// Queue `jobs` without tracking their completion.
    ///
    /// # Panics
    ///
    /// Panics if the job queue is full.
    pub fn submit(&self, jobs: Vec<Job>) {
        for job in jobs {
            if self.jobs.enqueue(Task::Run(job)).is_err() {
                panic!("job queue full ({} slots)", self.jobs.capacity());
            }
        }
    }

    /// Wait for every job of `chain` to finish, then release the chain.
    ///
    /// Inside a job this runs queued jobs in place, then suspends the
    /// calling fiber; elsewhere it spins.
    pub fn unchain(&self, chain: Chain) {
        self.wait_for(chain);
        self.chains.release(chain);
    }

    fn wait_for(&self, chain: Chain) {
        if self.chains.is_done(chain) {
            return;
        }
        let Some(fiber) = self.current_fiber() else {
            SpinWait::new(&self.chains).wait(chain);
            return;
        };

        let slot = self.fibers.slot(fiber);
        while !self.chains.is_done(chain) {
            if self.run_queued_job() {
                continue;
            }
            // Safety: `current_fiber` only reports the fiber running on this
            // thread, and this code runs on its stack.
            unsafe { slot.suspend(FiberYield::Wait(chain)) };
        }
    }

    // Fibers migrate between threads, so the lookup is never inlined into
    // code that spans a suspension.
    #[inline(never)]
    fn current_fiber(&self) -> Option<u32> {
        let thread = self.try_thread_index()?;
        let fiber = self.threads[thread as usize].current.load(Ordering::Relaxed);
        (fiber != INVALID_FIBER).then_some(fiber)
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Index of the worker thread running the caller.
    ///
    /// Re-query after every [`Runtime::unchain`]: the job may resume on
    /// another thread.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread the runtime does not own.
    #[inline(never)]
    pub fn thread_index(&self) -> u32 {
        match self.try_thread_index() {
            Some(index) => index,
            None => panic!(
                "thread {:?} is not a worker of this runtime",
                thread::current().id()
            ),
        }
    }

    /// Index of the worker thread running the caller, if it is one.
    #[inline(never)]
    pub fn try_thread_index(&self) -> Option<u32> {
        self.registry.index_of(thread::current().id())
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Allocate `size` bytes aligned to `align` under `tag`.
    ///
    /// Memory stays valid until `tag` is freed. Returns `None` when the
    /// request is zero-sized or cannot be satisfied.
    pub fn alloc(&self, tag: Tag, size: usize, align: usize) -> Option<NonNull<u8>> {
        let thread = self.try_thread_index().unwrap_or(u32::MAX);
        self.tagged.alloc(tag, size, align, thread, self)
    }

    /// Free everything allocated under `tag` and return the number of
    /// allocation descriptors released.
    ///
    /// No other job may be allocating under `tag` at the same time.
    pub fn free(&self, tag: Tag) -> usize {
        self.tagged.free(tag)
    }

    /// The tagged allocator.
    pub fn tagged(&self) -> &TaggedAllocator {
        &self.tagged
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// The resolved configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Snapshot of runtime counters and memory usage.
    pub fn stats(&self) -> RuntimeStats {
        let reservation = self.tagged.blocks().reservation();
        RuntimeStats {
            jobs_executed: self.counters.jobs_executed.get(),
            fibers_materialized: self.counters.fibers_materialized.get(),
            fiber_suspensions: self.counters.fiber_suspensions.get(),
            panicked_jobs: self.counters.panicked_jobs.get(),
            last_panic: self.counters.last_panic(),
            committed_bytes: reservation.committed_len(),
            reserved_bytes: reservation.reserved_len(),
            live_descriptors: self.tagged.live_descriptors(),
            bound_heaps: self.tagged.bound_dynamic_heaps(),
        }
    }
}

impl ChainWait for Runtime {
    fn pool(&self) -> &ChainPool {
        &self.chains
    }

    fn wait(&self, chain: Chain) {
        self.wait_for(chain);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("app", &self.config.application_name)
            .field("threads", &self.thread_count())
            .field("fibers", &self.fibers)
            .field("chains", &self.chains)
            .field("jobs", &self.jobs.len())
            .field("tagged", &self.tagged)
            .finish()
    }
}
