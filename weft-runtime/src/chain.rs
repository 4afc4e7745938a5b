//! # Chains
//!
//! Countdown cells for fork/join: a batch of `n` jobs shares one chain that
//! reaches zero when the last job completes.
//!
//! ## Design
//!
//! Cells live in a fixed pool sized at boot. Each cell packs a 32-bit
//! generation and a 32-bit remaining count into one `AtomicU64`. A [`Chain`]
//! handle remembers the generation it was claimed under, so a handle to a
//! released cell reads as done even after the cell has been reused.
//!
//! Claiming spins until a cell is free. The runtime sizes the pool to twice
//! the number of fibers plus threads: a context holds at most a batch chain
//! and a heap growth chain at once, so the spin always ends.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::sync::Backoff;

/// Packed value meaning "no chain".
pub const NO_CHAIN: u64 = u64::MAX;

/// Handle to a claimed chain cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chain {
    index: u32,
    generation: u32,
}

impl Chain {
    /// Cell index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the cell was claimed under.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single word.
    pub fn pack(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack a word produced by [`Chain::pack`].
    pub fn unpack(word: u64) -> Option<Self> {
        (word != NO_CHAIN).then(|| Self {
            index: word as u32,
            generation: (word >> 32) as u32,
        })
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain({}#{})", self.index, self.generation)
    }
}

#[inline]
fn pack_state(generation: u32, remaining: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(remaining)
}

#[inline]
fn generation_of(state: u64) -> u32 {
    (state >> 32) as u32
}

#[inline]
fn remaining_of(state: u64) -> u32 {
    state as u32
}

struct ChainCell {
    in_use: AtomicBool,
    state: AtomicU64,
}

/// Fixed pool of chain cells.
pub struct ChainPool {
    cells: Box<[ChainCell]>,
    cursor: AtomicUsize,
}

impl ChainPool {
    /// Create a pool of `capacity` cells.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "chain pool needs at least one cell");
        let cells = (0..capacity)
            .map(|_| ChainCell {
                in_use: AtomicBool::new(false),
                state: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cells,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of cells.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of cells currently claimed.
    pub fn in_use(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| cell.in_use.load(Ordering::Relaxed))
            .count()
    }

    /// Claim a cell counting down from `count`.
    pub fn claim(&self, count: u32) -> Chain {
        let len = self.cells.len();
        let mut backoff = Backoff::new();
        loop {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            for offset in 0..len {
                let index = (start + offset) % len;
                let cell = &self.cells[index];
                if cell.in_use.load(Ordering::Relaxed) {
                    continue;
                }
                if cell
                    .in_use
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    let generation = generation_of(cell.state.load(Ordering::Relaxed));
                    cell.state
                        .store(pack_state(generation, count), Ordering::Release);
                    return Chain {
                        index: index as u32,
                        generation,
                    };
                }
            }
            backoff.spin();
        }
    }

    /// Count one job of the chain as finished.
    pub fn complete_one(&self, chain: Chain) {
        let cell = &self.cells[chain.index as usize];
        let result = cell
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (generation_of(state) == chain.generation && remaining_of(state) > 0)
                    .then(|| state - 1)
            });
        debug_assert!(result.is_ok(), "completion on a finished or stale {}", chain);
    }

    /// Whether every job of the chain has finished.
    ///
    /// Handles to released cells always read as done.
    pub fn is_done(&self, chain: Chain) -> bool {
        let state = self.cells[chain.index as usize].state.load(Ordering::Acquire);
        generation_of(state) != chain.generation || remaining_of(state) == 0
    }

    /// Jobs still outstanding, or `None` for a stale handle.
    pub fn remaining(&self, chain: Chain) -> Option<u32> {
        let state = self.cells[chain.index as usize].state.load(Ordering::Acquire);
        (generation_of(state) == chain.generation).then(|| remaining_of(state))
    }

    /// Return the cell to the pool.
    ///
    /// Releasing a stale handle does nothing.
    pub fn release(&self, chain: Chain) {
        let cell = &self.cells[chain.index as usize];
        let next = pack_state(chain.generation.wrapping_add(1), 0);
        if cell
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (generation_of(state) == chain.generation).then_some(next)
            })
            .is_ok()
        {
            cell.in_use.store(false, Ordering::Release);
        }
    }
}

impl fmt::Debug for ChainPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

// ============================================================================
// Waiting
// ============================================================================

/// How a caller waits for a chain to finish.
///
/// The runtime suspends the current fiber; code running outside the
/// scheduler uses [`SpinWait`].
pub trait ChainWait {
    /// Pool the chains come from.
    fn pool(&self) -> &ChainPool;

    /// Return once `chain` is done.
    fn wait(&self, chain: Chain);
}

/// Waits by spinning the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct SpinWait<'a> {
    pool: &'a ChainPool,
}

impl<'a> SpinWait<'a> {
    /// Spin-wait on chains from `pool`.
    pub fn new(pool: &'a ChainPool) -> Self {
        Self { pool }
    }
}

impl ChainWait for SpinWait<'_> {
    fn pool(&self) -> &ChainPool {
        self.pool
    }

    fn wait(&self, chain: Chain) {
        let mut backoff = Backoff::new();
        while !self.pool.is_done(chain) {
            backoff.spin();
        }
    }
}
