//! # Cooperative Fiber Scheduler
//!
//! Jobs, the per-thread home loop, and batch continuation.
//!
//! ## Design
//!
//! Every worker thread runs a home loop on its native stack:
//!
//! 1. resume a parked fiber whose chain is done
//! 2. otherwise take a free fiber and a queued job, bind them and switch in
//! 3. otherwise back off
//!
//! A fiber runs its job and counts it off the job's chain. If the chain is
//! still pending and another job is queued, the same fiber runs that job in
//! place instead of switching back home. A terminate job picked up this way
//! is handed back to the home loop, which stops.
//!
//! What happens to a fiber after a switch is decided by the home loop from
//! the value it yields: parked on the waiting list, or back to the free list.
//! The fiber is off its stack by then, so no other thread can resume it
//! early.
//!
//! A job waiting on a chain first runs queued jobs in place, so a batch
//! finishes even when every fiber is parked.
//!
//! Panics inside a job are caught at the fiber boundary, logged and counted;
//! the job's chain is still completed.
//!
//! ## Technical References
//!
//! - [Parallelizing the Naughty Dog engine using fibers](https://www.gdcvault.com/play/1022186)

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use corosensei::CoroutineResult;

use crate::chain::Chain;
use crate::fiber::{FiberExit, FiberYield, FiberYielder, INVALID_FIBER};
use crate::runtime::Runtime;
use crate::sync::Backoff;

/// A unit of work.
pub struct Job {
    work: Box<dyn FnOnce(&Runtime) + Send + 'static>,
    name: &'static str,
    pub(crate) chain: Option<Chain>,
}

impl Job {
    /// Wrap `work` as a job named `name`.
    pub fn new<F>(name: &'static str, work: F) -> Self
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        Self {
            work: Box::new(work),
            name,
            chain: None,
        }
    }

    /// Name used in traces and panic reports.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .finish()
    }
}

/// Entry of the job queue.
pub(crate) enum Task {
    Run(Job),
    Terminate,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Runtime {
    /// Scheduler loop of worker `thread`; returns after a terminate job.
    pub(crate) fn home_loop(&self, thread: u32) {
        tracing::debug!(thread, "home loop started");
        let mut backoff = Backoff::new();

        loop {
            if let Some(fiber) = self.fibers.take_ready(&self.chains) {
                backoff.reset();
                if self.switch_to(thread, fiber) {
                    break;
                }
                continue;
            }

            if !self.jobs.is_empty() {
                if let Some(fiber) = self.fibers.claim_free() {
                    match self.jobs.dequeue() {
                        Some(Task::Run(job)) => {
                            backoff.reset();
                            self.materialize(fiber, job);
                            if self.switch_to(thread, fiber) {
                                break;
                            }
                            continue;
                        }
                        Some(Task::Terminate) => {
                            self.fibers.release_free(fiber);
                            break;
                        }
                        None => self.fibers.release_free(fiber),
                    }
                }
            }

            backoff.spin();
        }

        tracing::debug!(thread, "home loop finished");
    }

    /// Bind `job` to an owned free fiber.
    fn materialize(&self, fiber: u32, job: Job) {
        let runtime = NonNull::from(self);
        let entry = move |yielder: &FiberYielder, _thread: u32| {
            // Safety: `start` joins every worker before the runtime is
            // dropped, so it outlives all fibers.
            let runtime = unsafe { runtime.as_ref() };
            runtime.fibers.slot(fiber).set_yielder(yielder);
            runtime.fiber_main(job)
        };
        // Safety: the fiber was just taken off the free list by this thread.
        unsafe { self.fibers.slot(fiber).materialize(entry) };
        self.counters.fibers_materialized.inc();
    }

    /// Run an owned fiber until it yields or returns.
    ///
    /// Returns `true` when the home loop must stop.
    fn switch_to(&self, thread: u32, fiber: u32) -> bool {
        let current = &self.threads[thread as usize].current;
        let slot = self.fibers.slot(fiber);

        current.store(fiber, Ordering::Relaxed);
        // Safety: the fiber was taken off the free or waiting list by this
        // thread and is materialized.
        let result = unsafe { slot.resume(thread) };
        current.store(INVALID_FIBER, Ordering::Relaxed);

        match result {
            CoroutineResult::Yield(FiberYield::Wait(chain)) => {
                self.counters.fiber_suspensions.inc();
                self.fibers.park(fiber, chain);
                false
            }
            CoroutineResult::Return(exit) => {
                // Safety: the coroutine returned and the fiber is still ours.
                unsafe { slot.retire() };
                self.fibers.release_free(fiber);
                exit == FiberExit::Terminate
            }
        }
    }

    /// Body of every fiber: run the job, then keep going while its batch is
    /// unfinished and work is queued.
    fn fiber_main(&self, mut job: Job) -> FiberExit {
        loop {
            let chain = job.chain;
            self.execute(job);

            let Some(chain) = chain else {
                return FiberExit::Done;
            };
            if self.chains.is_done(chain) {
                return FiberExit::Done;
            }

            match self.jobs.dequeue() {
                Some(Task::Run(next)) => job = next,
                Some(Task::Terminate) => return FiberExit::Terminate,
                None => return FiberExit::Done,
            }
        }
    }

    fn execute(&self, job: Job) {
        let Job { work, name, chain } = job;
        tracing::trace!(job = name, "running job");

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| work(self))) {
            let message = panic_message(payload.as_ref());
            tracing::error!(job = name, %message, "job panicked");
            self.counters.record_panic(format!("{}: {}", name, message));
        }

        self.counters.jobs_executed.inc();
        if let Some(chain) = chain {
            self.chains.complete_one(chain);
        }
    }

    /// Run one queued job on the caller's stack.
    ///
    /// Returns `false` when nothing runnable was queued. A terminate job is
    /// put back for a home loop to pick up.
    pub(crate) fn run_queued_job(&self) -> bool {
        match self.jobs.dequeue() {
            Some(Task::Run(job)) => {
                self.execute(job);
                true
            }
            Some(Task::Terminate) => {
                self.push_task(Task::Terminate);
                false
            }
            None => false,
        }
    }

    /// Queue one terminate job per worker thread.
    pub(crate) fn broadcast_terminate(&self) {
        for _ in 0..self.thread_count() {
            self.push_task(Task::Terminate);
        }
        tracing::debug!(threads = self.thread_count(), "shutdown requested");
    }
}
