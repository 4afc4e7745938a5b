//! # Block Allocator
//!
//! Hands out runs of [`BLOCK_SIZE`] blocks from the reservation, committing
//! physical memory on demand.
//!
//! ## Design
//!
//! The committed region is the prefix `[0, high_water_mark)` of the
//! reservation. Block claims are lock-free against the [`BlockBitmap`];
//! moving the high-water mark is serialized by a single spin guard.
//!
//! Blocks past the mark keep their bit set (free) but are never handed out:
//! a claim re-reads the mark after winning its bits and gives them back if
//! it landed past it. That makes lowering the mark safe while other threads
//! are scanning with a stale ceiling.
//!
//! Growth commits only the blocks that are missing, merging the free tail of
//! the committed region into the new run. Shrinking is advisory: it is
//! skipped whenever the guard is busy.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::bitmap::BlockBitmap;
use crate::sync::{Backoff, SpinLock};
use crate::vm::{Reservation, VmError, BLOCK_SIZE};

/// Block allocation failure.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The reservation has too few uncommitted blocks left.
    #[error("{requested} blocks requested but only {available} remain in the memory budget")]
    OutOfBudget {
        /// Blocks requested.
        requested: u32,
        /// Blocks that could still be committed.
        available: u32,
    },
    /// The OS refused to commit memory.
    #[error("failed to commit memory for new blocks")]
    Commit(#[from] VmError),
}

/// Lock-free block allocator over a [`Reservation`].
pub struct BlockAllocator {
    reservation: Reservation,
    bitmap: BlockBitmap,
    high_water: AtomicU32,
    guard: SpinLock<()>,
}

impl BlockAllocator {
    /// Take over a reservation, committing and claiming block 0 for the
    /// arena header.
    pub fn new(reservation: Reservation) -> Result<Self, VmError> {
        let blocks = u32::try_from(reservation.block_count()).unwrap_or(u32::MAX);
        let bitmap = BlockBitmap::new(blocks);

        reservation.commit(0, BLOCK_SIZE)?;
        let claimed = bitmap.claim_range(0, 1);
        debug_assert!(claimed);

        Ok(Self {
            reservation,
            bitmap,
            high_water: AtomicU32::new(1),
            guard: SpinLock::new(()),
        })
    }

    /// The underlying reservation.
    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// The block bitmap.
    pub fn bitmap(&self) -> &BlockBitmap {
        &self.bitmap
    }

    /// Blocks in the reservation.
    pub fn total_blocks(&self) -> u32 {
        self.bitmap.len()
    }

    /// Number of committed blocks.
    pub fn high_water_mark(&self) -> u32 {
        self.high_water.load(Ordering::Acquire)
    }

    /// Committed bytes.
    pub fn committed_bytes(&self) -> usize {
        self.reservation.committed_len()
    }

    /// Free blocks inside the committed region.
    pub fn free_committed_blocks(&self) -> u32 {
        let hwm = self.high_water_mark();
        self.bitmap.count_free(1, hwm.saturating_sub(1))
    }

    /// Address of the first byte of `block`.
    pub fn block_ptr(&self, block: u32) -> NonNull<u8> {
        self.reservation.ptr_at(block as usize * BLOCK_SIZE)
    }

    /// Allocate `n` contiguous blocks.
    pub fn allocate(&self, n: u32) -> Result<u32, BlockError> {
        assert!(n > 0, "zero-block allocation");
        if let Some(start) = self.claim_committed(n) {
            return Ok(start);
        }
        self.grow(n)
    }

    /// Return `n` blocks starting at `start`.
    pub fn release(&self, start: u32, n: u32) {
        debug_assert!(start > 0, "block 0 belongs to the arena header");
        self.bitmap.release_range(start, n);
    }

    /// Advise the allocator about memory demand.
    ///
    /// With `release == false`, allocates enough blocks for `size` bytes and
    /// returns the first one. With `release == true`, `size` is ignored and
    /// the free tail of the committed region is handed back to the OS; the
    /// result is the number of blocks decommitted.
    pub fn advise(&self, size: usize, release: bool) -> Result<u32, BlockError> {
        if release {
            return Ok(self.shrink());
        }
        let n = size
            .max(1)
            .checked_add(BLOCK_SIZE - 1)
            .map(|rounded| rounded / BLOCK_SIZE)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| BlockError::OutOfBudget {
                requested: u32::MAX,
                available: self.total_blocks() - self.high_water_mark(),
            })?;
        self.allocate(n)
    }

    /// Try to claim `n` blocks below the high-water mark.
    fn claim_committed(&self, n: u32) -> Option<u32> {
        let ceiling = self.high_water.load(Ordering::Acquire);

        if n == 1 {
            let block = self.bitmap.find_first_set(1, ceiling);
            if block == 0 {
                return None;
            }
            if block < self.high_water.load(Ordering::Acquire) {
                return Some(block);
            }
            // The mark dropped while we were scanning.
            self.bitmap.release_range(block, 1);
            return None;
        }

        let mut backoff = Backoff::new();
        loop {
            let start = self.bitmap.best_fit_growth(1, ceiling, n)?;
            if self.bitmap.claim_range(start, n) {
                if start + n <= self.high_water.load(Ordering::Acquire) {
                    return Some(start);
                }
                self.bitmap.release_range(start, n);
                return None;
            }
            backoff.spin();
        }
    }

    /// Commit new blocks past the high-water mark.
    fn grow(&self, n: u32) -> Result<u32, BlockError> {
        let _guard = self.guard.lock();

        // Another thread may have grown or freed while we waited.
        if let Some(start) = self.claim_committed(n) {
            return Ok(start);
        }

        let hwm = self.high_water.load(Ordering::Acquire);

        let mut tail = self.bitmap.trailing_free(1, hwm).min(n - 1);
        if tail > 0 && !self.bitmap.claim_range(hwm - tail, tail) {
            tail = 0;
        }
        let fresh = n - tail;

        let available = self.total_blocks() - hwm;
        if fresh > available {
            if tail > 0 {
                self.bitmap.release_range(hwm - tail, tail);
            }
            return Err(BlockError::OutOfBudget {
                requested: n,
                available: available + tail,
            });
        }

        // Bits past the mark can be held briefly by claimers with a stale
        // ceiling; they always give them back.
        let mut backoff = Backoff::new();
        while !self.bitmap.claim_range(hwm, fresh) {
            backoff.spin();
        }

        if let Err(err) = self
            .reservation
            .commit(hwm as usize * BLOCK_SIZE, fresh as usize * BLOCK_SIZE)
        {
            self.bitmap.release_range(hwm, fresh);
            if tail > 0 {
                self.bitmap.release_range(hwm - tail, tail);
            }
            tracing::warn!(blocks = fresh, error = %err, "block commit failed");
            return Err(err.into());
        }

        self.high_water.store(hwm + fresh, Ordering::Release);
        tracing::debug!(
            from = hwm,
            to = hwm + fresh,
            committed = self.committed_bytes(),
            "committed blocks"
        );

        Ok(hwm - tail)
    }

    /// Decommit the free tail of the committed region.
    fn shrink(&self) -> u32 {
        let Some(_guard) = self.guard.try_lock() else {
            return 0;
        };

        let hwm = self.high_water.load(Ordering::Acquire);
        let tail = self.bitmap.trailing_free(1, hwm);
        if tail == 0 {
            return 0;
        }
        let start = hwm - tail;
        if self.bitmap.count_free(start, tail) != tail || !self.bitmap.claim_range(start, tail) {
            return 0;
        }

        self.high_water.store(start, Ordering::Release);

        if let Err(err) = self
            .reservation
            .decommit(start as usize * BLOCK_SIZE, tail as usize * BLOCK_SIZE)
        {
            tracing::warn!(blocks = tail, error = %err, "block decommit failed");
            self.high_water.store(hwm, Ordering::Release);
            self.bitmap.release_range(start, tail);
            return 0;
        }

        self.bitmap.release_range(start, tail);
        tracing::debug!(from = hwm, to = start, "decommitted blocks");
        tail
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("total_blocks", &self.total_blocks())
            .field("high_water_mark", &self.high_water_mark())
            .field("committed_bytes", &self.committed_bytes())
            .field("free_committed", &self.free_committed_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::HeapMemory;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn allocator(blocks: usize) -> BlockAllocator {
        let reservation =
            Reservation::new(Box::new(HeapMemory::new()), blocks * BLOCK_SIZE).unwrap();
        BlockAllocator::new(reservation).unwrap()
    }

    #[test]
    fn test_boot_state() {
        let blocks = allocator(8);
        assert_eq!(blocks.high_water_mark(), 1);
        assert_eq!(blocks.committed_bytes(), BLOCK_SIZE);
        assert!(!blocks.bitmap().is_free(0));
        assert_eq!(blocks.free_committed_blocks(), 0);
    }

    #[test]
    fn test_grows_then_reuses() {
        let blocks = allocator(8);
        let a = blocks.allocate(1).unwrap();
        assert_eq!(a, 1);
        assert_eq!(blocks.high_water_mark(), 2);

        blocks.release(a, 1);
        let b = blocks.allocate(1).unwrap();
        assert_eq!(b, 1);
        assert_eq!(blocks.high_water_mark(), 2);
    }

    #[test]
    fn test_growth_merges_free_tail() {
        let blocks = allocator(16);
        let a = blocks.allocate(2).unwrap();
        let b = blocks.allocate(1).unwrap();
        assert_eq!((a, b), (1, 3));
        blocks.release(b, 1);

        // Block 3 is free at the tail; only two more need committing.
        let c = blocks.allocate(3).unwrap();
        assert_eq!(c, 3);
        assert_eq!(blocks.high_water_mark(), 6);
        assert_eq!(blocks.committed_bytes(), 6 * BLOCK_SIZE);
    }

    #[test]
    fn test_out_of_budget() {
        let blocks = allocator(4);
        blocks.allocate(3).unwrap();
        let err = blocks.allocate(1).unwrap_err();
        assert!(matches!(err, BlockError::OutOfBudget { requested: 1, available: 0 }));
    }

    #[test]
    fn test_commit_failure_is_recoverable() {
        let reservation = Reservation::new(
            Box::new(HeapMemory::with_commit_limit(2 * BLOCK_SIZE)),
            8 * BLOCK_SIZE,
        )
        .unwrap();
        let blocks = BlockAllocator::new(reservation).unwrap();

        blocks.allocate(1).unwrap();
        assert!(matches!(blocks.allocate(1), Err(BlockError::Commit(_))));
        assert_eq!(blocks.high_water_mark(), 2);
        assert!(blocks.bitmap().is_free(2));
    }

    #[test]
    fn test_shrink_decommits_free_tail() {
        let blocks = allocator(16);
        let a = blocks.allocate(1).unwrap();
        let b = blocks.allocate(4).unwrap();
        assert_eq!(blocks.high_water_mark(), 6);

        blocks.release(b, 4);
        assert_eq!(blocks.advise(0, true).unwrap(), 4);
        assert_eq!(blocks.high_water_mark(), 2);
        assert_eq!(blocks.committed_bytes(), 2 * BLOCK_SIZE);
        assert!(blocks.bitmap().is_free(b));

        // Nothing left to give back while `a` is live.
        assert_eq!(blocks.advise(0, true).unwrap(), 0);
        blocks.release(a, 1);
        assert_eq!(blocks.advise(0, true).unwrap(), 1);
        assert_eq!(blocks.high_water_mark(), 1);
    }

    #[test]
    fn test_advise_grow_rounds_to_blocks() {
        let blocks = allocator(8);
        let start = blocks.advise(BLOCK_SIZE + 1, false).unwrap();
        assert_eq!(start, 1);
        assert_eq!(blocks.high_water_mark(), 3);
    }

    #[test]
    fn test_advise_near_usize_max_is_out_of_budget() {
        let blocks = allocator(8);
        for size in [usize::MAX, usize::MAX - BLOCK_SIZE / 2, u32::MAX as usize * BLOCK_SIZE] {
            let err = blocks.advise(size, false).unwrap_err();
            assert!(matches!(err, BlockError::OutOfBudget { .. }), "size = {}", size);
        }
        assert_eq!(blocks.high_water_mark(), 1);
        assert_eq!(blocks.bitmap().free_blocks(), 7);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let blocks = Arc::new(allocator(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let blocks = blocks.clone();
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..200 {
                        let n = 1 + ((i + t) % 3) as u32;
                        if let Ok(start) = blocks.allocate(n) {
                            held.push((start, n));
                        }
                        if held.len() > 3 {
                            let (start, n) = held.remove(0);
                            blocks.release(start, n);
                        }
                        if i % 50 == 0 {
                            let _ = blocks.advise(0, true);
                        }
                    }
                    held
                })
            })
            .collect();

        let mut owned = HashSet::new();
        for handle in handles {
            for (start, n) in handle.join().unwrap() {
                for block in start..start + n {
                    assert!(owned.insert(block), "block {} owned twice", block);
                    assert!(block < blocks.high_water_mark());
                    assert!(!blocks.bitmap().is_free(block));
                }
            }
        }
    }
}
