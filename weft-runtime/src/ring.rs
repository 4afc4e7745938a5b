//! # MPMC Ring Buffer
//!
//! Bounded lock-free multi-producer multi-consumer queue.
//!
//! ## Design
//!
//! Every cell carries a sequence number next to its payload. A producer at
//! position `p` may write cell `p & mask` only once that cell's sequence
//! equals `p`; a consumer may read it only once the sequence equals `p + 1`.
//! Positions are claimed with a CAS on a monotonic counter, so a slot is
//! never handed to two threads and an item is never delivered twice.
//!
//! The queue never grows. Callers size it at boot; `enqueue` on a full ring
//! hands the item back.
//!
//! ## Technical References
//!
//! - [Bounded MPMC queue](https://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue)
//! - [crossbeam ArrayQueue](https://docs.rs/crossbeam-queue)

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::sync::Backoff;

/// One slot of the ring.
struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC queue with power-of-two capacity.
pub struct RingBuffer<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// Safety: a cell's payload is only touched by the thread that won the CAS on
// its position, and hand-off is ordered by the cell's sequence number.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is below 2 or not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "ring buffer capacity must be a power of two of at least 2, got {}",
            capacity
        );

        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Create a ring with `1 << log2` slots.
    pub fn with_capacity_log2(log2: u32) -> Self {
        Self::new(1usize << log2)
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate number of queued items.
    ///
    /// Exact only when no other thread is operating on the ring.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        let head = self.dequeue_pos.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// Whether the ring currently appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an item.
    ///
    /// Returns the item back if the ring is full.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut backoff = Backoff::new();
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: winning the CAS grants exclusive access to
                        // this cell until the sequence store below.
                        unsafe { (*cell.value.get()).write(item) };
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                // The consumer one lap behind has not freed this cell yet.
                return Err(item);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
                backoff.spin();
            }
        }
    }

    /// Pop an item, or `None` if the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the producer published this cell with the
                        // Release store we synchronized with above.
                        let item = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
                backoff.spin();
            }
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
