//! # Fiber Implementation
//!
//! Stackful execution contexts that jobs run on, recycled through a fixed
//! pool.
//!
//! ## Design
//!
//! - Every fiber owns a stack allocated at boot with a guard page below it,
//!   so an overflow faults instead of corrupting a neighbour
//! - A fiber is materialized as a coroutine over its stack when it picks up
//!   a job, and the stack is parked again once the coroutine returns
//! - Switching is asymmetric: a worker thread's home loop resumes a fiber,
//!   and the fiber yields back to whichever home loop resumed it. The value
//!   passed on resume is the index of the resuming thread, so a fiber that
//!   migrated while suspended learns where it now runs
//! - Each fiber is in exactly one state: free, running or waiting. Free and
//!   waiting fibers are tracked by index in slot arrays whose holes hold
//!   [`INVALID_FIBER`]
//!
//! ## Ownership
//!
//! Taking an index out of the free or waiting list (a successful CAS to
//! [`INVALID_FIBER`]) grants the taking thread exclusive access to that
//! fiber's slot until it puts the index back. Only the owning thread touches
//! the coroutine cell.
//!
//! ## Technical References
//!
//! - [corosensei](https://docs.rs/corosensei) for the context switch
//! - [Parallelizing the Naughty Dog engine using fibers](https://www.gdcvault.com/play/1022186)

use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::chain::{Chain, ChainPool, NO_CHAIN};
use crate::sync::Backoff;

/// Sentinel for "no fiber".
pub const INVALID_FIBER: u32 = u32::MAX;

/// Value a fiber hands to its home loop when it suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberYield {
    /// Park until the chain is done.
    Wait(Chain),
}

/// How a fiber's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberExit {
    /// The job (and any continued jobs) finished.
    Done,
    /// The fiber pulled a terminate job; the home loop must stop.
    Terminate,
}

pub(crate) type FiberYielder = Yielder<u32, FiberYield>;
type FiberCoroutine = Coroutine<u32, FiberYield, FiberExit, DefaultStack>;

enum FiberBody {
    Parked(DefaultStack),
    Running(FiberCoroutine),
    Empty,
}

/// One fiber: its stack or live coroutine, plus suspension bookkeeping.
pub(crate) struct FiberSlot {
    body: UnsafeCell<FiberBody>,
    yielder: AtomicPtr<FiberYielder>,
    wait_on: AtomicU64,
}

impl FiberSlot {
    fn new(stack: DefaultStack) -> Self {
        Self {
            body: UnsafeCell::new(FiberBody::Parked(stack)),
            yielder: AtomicPtr::new(std::ptr::null_mut()),
            wait_on: AtomicU64::new(NO_CHAIN),
        }
    }

    /// Bind `entry` to this fiber's stack.
    ///
    /// # Safety
    ///
    /// The caller must own the slot and the fiber must be parked.
    pub(crate) unsafe fn materialize<F>(&self, entry: F)
    where
        F: FnOnce(&FiberYielder, u32) -> FiberExit + 'static,
    {
        let body = &mut *self.body.get();
        *body = match mem::replace(body, FiberBody::Empty) {
            FiberBody::Parked(stack) => FiberBody::Running(Coroutine::with_stack(stack, entry)),
            _ => unreachable!("fiber materialized while running"),
        };
    }

    /// Switch into the fiber until it yields or returns.
    ///
    /// # Safety
    ///
    /// The caller must own the slot and the fiber must be materialized.
    pub(crate) unsafe fn resume(&self, thread: u32) -> CoroutineResult<FiberYield, FiberExit> {
        match &mut *self.body.get() {
            FiberBody::Running(coroutine) => coroutine.resume(thread),
            _ => unreachable!("resumed a fiber with no coroutine"),
        }
    }

    /// Recover the stack of a fiber whose coroutine has returned.
    ///
    /// # Safety
    ///
    /// The caller must own the slot and the coroutine must have returned.
    pub(crate) unsafe fn retire(&self) {
        let body = &mut *self.body.get();
        *body = match mem::replace(body, FiberBody::Empty) {
            FiberBody::Running(coroutine) => FiberBody::Parked(coroutine.into_stack()),
            _ => unreachable!("retired a fiber with no coroutine"),
        };
        self.yielder.store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    /// Record the suspension point of the running coroutine.
    pub(crate) fn set_yielder(&self, yielder: &FiberYielder) {
        self.yielder
            .store(yielder as *const _ as *mut _, Ordering::Relaxed);
    }

    /// Suspend the running fiber back to its home loop.
    ///
    /// Returns the index of the thread that resumed it.
    ///
    /// # Safety
    ///
    /// Must be called on this fiber's own stack.
    pub(crate) unsafe fn suspend(&self, value: FiberYield) -> u32 {
        let yielder = self.yielder.load(Ordering::Relaxed);
        debug_assert!(!yielder.is_null(), "suspend outside a running fiber");
        (*yielder).suspend(value)
    }

    /// Chain this fiber is parked on.
    pub(crate) fn waiting_on(&self) -> Option<Chain> {
        Chain::unpack(self.wait_on.load(Ordering::Acquire))
    }
}

/// Fixed list of fiber indices with [`INVALID_FIBER`] holes.
struct SlotList {
    entries: Box<[AtomicU32]>,
}

impl SlotList {
    fn new(len: usize, filled: bool) -> Self {
        let entries = (0..len)
            .map(|i| AtomicU32::new(if filled { i as u32 } else { INVALID_FIBER }))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { entries }
    }

    /// Take the first entry accepted by `ready`.
    fn take(&self, mut ready: impl FnMut(u32) -> bool) -> Option<u32> {
        for entry in self.entries.iter() {
            let fiber = entry.load(Ordering::Relaxed);
            if fiber == INVALID_FIBER || entry.load(Ordering::Acquire) != fiber || !ready(fiber) {
                continue;
            }
            if entry
                .compare_exchange(fiber, INVALID_FIBER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(fiber);
            }
        }
        None
    }

    /// Put `fiber` into the first hole.
    fn put(&self, fiber: u32) {
        let mut backoff = Backoff::new();
        loop {
            for entry in self.entries.iter() {
                if entry.load(Ordering::Relaxed) == INVALID_FIBER
                    && entry
                        .compare_exchange(
                            INVALID_FIBER,
                            fiber,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    return;
                }
            }
            backoff.spin();
        }
    }

    fn count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.load(Ordering::Relaxed) != INVALID_FIBER)
            .count()
    }
}

/// Fixed pool of fibers.
pub struct FiberPool {
    slots: Box<[FiberSlot]>,
    free: SlotList,
    waiting: SlotList,
    stack_size: usize,
}

// Safety: slot bodies are only touched by the thread that currently owns the
// fiber index (see the module docs); everything else is atomic.
unsafe impl Send for FiberPool {}
unsafe impl Sync for FiberPool {}

impl FiberPool {
    /// Allocate `count` fibers with `stack_size`-byte stacks.
    pub fn new(count: usize, stack_size: usize) -> io::Result<Self> {
        let slots = (0..count)
            .map(|_| DefaultStack::new(stack_size).map(FiberSlot::new))
            .collect::<io::Result<Vec<_>>>()?
            .into_boxed_slice();

        tracing::debug!(count, stack_size, "allocated fiber stacks");

        Ok(Self {
            slots,
            free: SlotList::new(count, true),
            waiting: SlotList::new(count, false),
            stack_size,
        })
    }

    /// Number of fibers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no fibers.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stack size of every fiber.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Fibers currently free.
    pub fn free_count(&self) -> usize {
        self.free.count()
    }

    /// Fibers currently parked on a chain.
    pub fn waiting_count(&self) -> usize {
        self.waiting.count()
    }

    pub(crate) fn slot(&self, fiber: u32) -> &FiberSlot {
        &self.slots[fiber as usize]
    }

    /// Take ownership of a free fiber.
    pub(crate) fn claim_free(&self) -> Option<u32> {
        self.free.take(|_| true)
    }

    /// Return an owned fiber to the free list.
    pub(crate) fn release_free(&self, fiber: u32) {
        self.slot(fiber).wait_on.store(NO_CHAIN, Ordering::Relaxed);
        self.free.put(fiber);
    }

    /// Park an owned, suspended fiber until `chain` is done.
    pub(crate) fn park(&self, fiber: u32, chain: Chain) {
        self.slot(fiber)
            .wait_on
            .store(chain.pack(), Ordering::Release);
        self.waiting.put(fiber);
    }

    /// Take ownership of a parked fiber whose chain is done.
    pub(crate) fn take_ready(&self, chains: &ChainPool) -> Option<u32> {
        self.waiting.take(|fiber| {
            self.slot(fiber)
                .waiting_on()
                .map_or(true, |chain| chains.is_done(chain))
        })
    }
}

impl fmt::Debug for FiberPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberPool")
            .field("fibers", &self.len())
            .field("stack_size", &self.stack_size)
            .field("free", &self.free_count())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_list_claim_release() {
        let pool = FiberPool::new(3, 64 * 1024).unwrap();
        assert_eq!(pool.free_count(), 3);

        let a = pool.claim_free().unwrap();
        let b = pool.claim_free().unwrap();
        let c = pool.claim_free().unwrap();
        assert!(pool.claim_free().is_none());
        assert_eq!(pool.free_count(), 0);

        let mut taken = vec![a, b, c];
        taken.sort_unstable();
        assert_eq!(taken, vec![0, 1, 2]);

        pool.release_free(b);
        assert_eq!(pool.claim_free(), Some(b));
    }

    #[test]
    fn test_waiting_list_respects_chain() {
        let chains = ChainPool::new(2);
        let pool = FiberPool::new(2, 64 * 1024).unwrap();
        let fiber = pool.claim_free().unwrap();
        let chain = chains.claim(1);

        pool.park(fiber, chain);
        assert_eq!(pool.waiting_count(), 1);
        assert!(pool.take_ready(&chains).is_none());

        chains.complete_one(chain);
        assert_eq!(pool.take_ready(&chains), Some(fiber));
        assert_eq!(pool.waiting_count(), 0);
        chains.release(chain);
    }

    #[test]
    fn test_materialize_suspend_resume_retire() {
        let chains = ChainPool::new(1);
        let chain = chains.claim(1);
        let pool = FiberPool::new(1, 64 * 1024).unwrap();
        let fiber = pool.claim_free().unwrap();
        let slot = pool.slot(fiber);

        unsafe {
            slot.materialize(move |yielder, thread| {
                assert_eq!(thread, 0);
                let moved_to = yielder.suspend(FiberYield::Wait(chain));
                assert_eq!(moved_to, 3);
                FiberExit::Done
            });

            match slot.resume(0) {
                CoroutineResult::Yield(FiberYield::Wait(c)) => assert_eq!(c, chain),
                CoroutineResult::Return(_) => panic!("fiber returned before suspending"),
            }
            match slot.resume(3) {
                CoroutineResult::Return(exit) => assert_eq!(exit, FiberExit::Done),
                CoroutineResult::Yield(_) => panic!("fiber suspended twice"),
            }
            slot.retire();

            // The stack is reusable.
            slot.materialize(|_, _| FiberExit::Terminate);
            assert!(matches!(
                slot.resume(1),
                CoroutineResult::Return(FiberExit::Terminate)
            ));
            slot.retire();
        }
        pool.release_free(fiber);
    }

    #[test]
    fn test_suspend_through_slot_pointer() {
        let chains = ChainPool::new(1);
        let chain = chains.claim(1);
        let pool: &'static FiberPool = Box::leak(Box::new(FiberPool::new(1, 64 * 1024).unwrap()));
        let fiber = pool.claim_free().unwrap();
        let slot: &'static FiberSlot = pool.slot(fiber);

        unsafe {
            slot.materialize(move |yielder, _| {
                slot.set_yielder(yielder);
                let thread = slot.suspend(FiberYield::Wait(chain));
                assert_eq!(thread, 7);
                FiberExit::Done
            });
            assert!(matches!(slot.resume(0), CoroutineResult::Yield(_)));
            assert!(matches!(slot.resume(7), CoroutineResult::Return(FiberExit::Done)));
            slot.retire();
        }
    }
}
