//! # Tagged Heaps
//!
//! Arena allocation grouped by tag: everything allocated under a tag is
//! released together by a single `free(tag)`.
//!
//! ## Design
//!
//! Each tagged heap is a singly linked chain of allocation descriptors, from
//! the newest (tail) back to the oldest. A descriptor owns a run of blocks
//! and a bump offset. Small requests bump into any descriptor of the chain
//! with room left; requests larger than a block always get fresh blocks.
//!
//! Tags come in three kinds:
//!
//! - [`Tag::ROOTS`]: allocated at boot, owns block 0 with the arena header,
//!   never freed
//! - [`Tag::DRIFTER`]: one heap per worker thread, no cross-thread
//!   synchronization on growth
//! - dynamic tags: any other value, each bound on first use to a heap from a
//!   fixed pool and unbound again by `free`
//!
//! Appending to a shared heap is serialized by a growth guard that holds a
//! chain handle. Contenders wait on that chain (suspending their fiber when
//! running under the scheduler) and then retry the bump.
//!
//! Descriptors are stored in one array created at boot; free indices are
//! recycled through a [`RingBuffer`].
//!
//! `free(tag)` must not race with allocations under the same tag.

use std::fmt;
use std::iter;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use thiserror::Error;

use crate::blocks::BlockAllocator;
use crate::chain::{Chain, ChainWait, NO_CHAIN};
use crate::ring::RingBuffer;
use crate::sync::SpinLock;
use crate::vm::{blocks_for, BLOCK_SIZE};

/// Null descriptor index.
const NO_DESCRIPTOR: u32 = u32::MAX;

/// Magic number at the start of the arena header ("WEFTAREN").
pub const ARENA_MAGIC: u64 = 0x5745_4654_4152_454E;

/// Allocation group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

impl Tag {
    /// Long-lived allocations; owns the arena header and is never freed.
    pub const ROOTS: Tag = Tag(0);
    /// Per-thread scratch heaps.
    pub const DRIFTER: Tag = Tag(1);
    /// Never a valid tag; marks unowned heaps.
    pub const INVALID: Tag = Tag(u64::MAX);

    /// Create a tag from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Whether this tag is bound to a heap from the dynamic pool.
    pub fn is_dynamic(&self) -> bool {
        !matches!(*self, Tag::ROOTS | Tag::DRIFTER | Tag::INVALID)
    }
}

impl From<u64> for Tag {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::ROOTS => write!(f, "roots"),
            Tag::DRIFTER => write!(f, "drifter"),
            Tag::INVALID => write!(f, "invalid"),
            Tag(raw) => write!(f, "tag:{}", raw),
        }
    }
}

/// Fixed header stored at offset 0 of the reservation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaHeader {
    /// [`ARENA_MAGIC`].
    pub magic: u64,
    /// Block size in bytes.
    pub block_size: u64,
    /// Blocks in the reservation.
    pub reserved_blocks: u64,
    /// Size of the descriptor array.
    pub descriptor_capacity: u32,
    /// Number of drifter heaps.
    pub drifter_heaps: u32,
    /// Number of dynamic heaps.
    pub dynamic_heaps: u32,
    _pad: u32,
}

/// Bytes at the start of block 0 that the roots heap never hands out.
const HEADER_RESERVED: usize = (std::mem::size_of::<ArenaHeader>() + 63) & !63;

/// Audit failure from [`TaggedAllocator::verify_bitmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("block {block} has {owners} owning descriptors but its bitmap bit reads {}", bit_state(.free))]
pub struct BitmapMismatch {
    /// Offending block.
    pub block: u32,
    /// Descriptors that claim the block.
    pub owners: u32,
    /// Bitmap state of the block.
    pub free: bool,
}

fn bit_state(free: &bool) -> &'static str {
    if *free {
        "free"
    } else {
        "used"
    }
}

struct Descriptor {
    prev: AtomicU32,
    block: AtomicU32,
    blocks: AtomicU32,
    used: AtomicU64,
}

impl Descriptor {
    fn new() -> Self {
        Self {
            prev: AtomicU32::new(NO_DESCRIPTOR),
            block: AtomicU32::new(0),
            blocks: AtomicU32::new(0),
            used: AtomicU64::new(0),
        }
    }
}

struct TaggedHeap {
    owner: AtomicU64,
    tail: AtomicU32,
    growth: AtomicU64,
}

impl TaggedHeap {
    fn new(owner: Tag) -> Self {
        Self {
            owner: AtomicU64::new(owner.0),
            tail: AtomicU32::new(NO_DESCRIPTOR),
            growth: AtomicU64::new(NO_CHAIN),
        }
    }

    fn owner(&self) -> Tag {
        Tag(self.owner.load(Ordering::Acquire))
    }
}

/// Sizes of the tagged allocator's fixed pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedLayout {
    /// One drifter heap per worker thread.
    pub drifter_heaps: usize,
    /// Heaps available to dynamic tags.
    pub dynamic_heaps: usize,
    /// log2 of the descriptor count.
    pub descriptor_log2: u32,
}

/// Tag-scoped arena allocator.
pub struct TaggedAllocator {
    blocks: BlockAllocator,
    descriptors: Box<[Descriptor]>,
    free_descriptors: RingBuffer<u32>,
    roots: TaggedHeap,
    drifters: Box<[TaggedHeap]>,
    dynamic: Box<[TaggedHeap]>,
    claim: SpinLock<()>,
}

impl TaggedAllocator {
    /// Build the allocator, writing the arena header into block 0 and
    /// handing that block to the roots heap.
    pub fn new(blocks: BlockAllocator, layout: TaggedLayout) -> Self {
        let free_descriptors = RingBuffer::with_capacity_log2(layout.descriptor_log2);
        let capacity = free_descriptors.capacity();
        let descriptors = (0..capacity)
            .map(|_| Descriptor::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        for index in 0..capacity as u32 {
            let pushed = free_descriptors.enqueue(index);
            debug_assert!(pushed.is_ok());
        }

        let heaps = |n: usize, owner: Tag| {
            (0..n)
                .map(|_| TaggedHeap::new(owner))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };

        let allocator = Self {
            drifters: heaps(layout.drifter_heaps, Tag::DRIFTER),
            dynamic: heaps(layout.dynamic_heaps, Tag::INVALID),
            roots: TaggedHeap::new(Tag::ROOTS),
            claim: SpinLock::new(()),
            blocks,
            descriptors,
            free_descriptors,
        };
        allocator.boot_roots(layout);
        allocator
    }

    fn boot_roots(&self, layout: TaggedLayout) {
        let header = ArenaHeader {
            magic: ARENA_MAGIC,
            block_size: BLOCK_SIZE as u64,
            reserved_blocks: u64::from(self.blocks.total_blocks()),
            descriptor_capacity: self.descriptors.len() as u32,
            drifter_heaps: layout.drifter_heaps as u32,
            dynamic_heaps: layout.dynamic_heaps as u32,
            _pad: 0,
        };
        // Safety: block 0 is committed by the block allocator and owned by
        // the roots heap from here on.
        unsafe {
            self.blocks
                .reservation()
                .typed_ptr::<ArenaHeader>(0)
                .as_ptr()
                .write(header)
        };

        // The ring was just filled, so this cannot come back empty.
        let index = self.free_descriptors.dequeue().unwrap_or(0);
        let descriptor = &self.descriptors[index as usize];
        descriptor.block.store(0, Ordering::Relaxed);
        descriptor.blocks.store(1, Ordering::Relaxed);
        descriptor
            .used
            .store(HEADER_RESERVED as u64, Ordering::Relaxed);
        self.roots.tail.store(index, Ordering::Release);

        tracing::debug!(
            blocks = header.reserved_blocks,
            descriptors = header.descriptor_capacity,
            drifters = header.drifter_heaps,
            dynamic = header.dynamic_heaps,
            "arena ready"
        );
    }

    /// The arena header in block 0.
    pub fn header(&self) -> ArenaHeader {
        // Safety: written at boot and never modified.
        unsafe {
            self.blocks
                .reservation()
                .typed_ptr::<ArenaHeader>(0)
                .as_ptr()
                .read()
        }
    }

    /// The block allocator underneath.
    pub fn blocks(&self) -> &BlockAllocator {
        &self.blocks
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes aligned to `align` under `tag`.
    ///
    /// `thread` selects the drifter heap. `wait` is used when another
    /// thread is growing the same shared heap.
    ///
    /// Returns `None` for zero-sized requests and when memory, descriptors
    /// or dynamic heaps run out.
    pub fn alloc(
        &self,
        tag: Tag,
        size: usize,
        align: usize,
        thread: u32,
        wait: &dyn ChainWait,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let align = align.clamp(1, BLOCK_SIZE).next_power_of_two();
        let small = size <= BLOCK_SIZE;

        let (heap, shared) = match tag {
            Tag::INVALID => {
                tracing::warn!("allocation under the invalid tag");
                return None;
            }
            Tag::ROOTS => (&self.roots, true),
            Tag::DRIFTER => match self.drifters.get(thread as usize) {
                Some(heap) => (heap, false),
                None => {
                    tracing::error!(thread, "no drifter heap for thread");
                    return None;
                }
            },
            _ => (self.claim_dynamic(tag)?, true),
        };

        if small {
            if let Some(ptr) = self.bump(heap, size, align) {
                return Some(ptr);
            }
        }

        if shared {
            self.grow_guarded(heap, tag, size, align, small, wait)
        } else {
            self.append(heap, tag, size)
        }
    }

    /// Bump-allocate from the first descriptor, newest first, with room.
    fn bump(&self, heap: &TaggedHeap, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut index = heap.tail.load(Ordering::Acquire);
        while index != NO_DESCRIPTOR {
            let descriptor = &self.descriptors[index as usize];
            let capacity = descriptor.blocks.load(Ordering::Relaxed) as usize * BLOCK_SIZE;
            let mut used = descriptor.used.load(Ordering::Relaxed) as usize;

            loop {
                let start = (used + align - 1) & !(align - 1);
                let end = start + size;
                if end > capacity {
                    break;
                }
                match descriptor.used.compare_exchange_weak(
                    used as u64,
                    end as u64,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let block = descriptor.block.load(Ordering::Relaxed) as usize;
                        return Some(self.blocks.reservation().ptr_at(block * BLOCK_SIZE + start));
                    }
                    Err(current) => used = current as usize,
                }
            }

            index = descriptor.prev.load(Ordering::Acquire);
        }
        None
    }

    /// Grow a shared heap under its growth guard.
    fn grow_guarded(
        &self,
        heap: &TaggedHeap,
        tag: Tag,
        size: usize,
        align: usize,
        small: bool,
        wait: &dyn ChainWait,
    ) -> Option<NonNull<u8>> {
        let pool = wait.pool();
        loop {
            if let Some(chain) = Chain::unpack(heap.growth.load(Ordering::Acquire)) {
                wait.wait(chain);
                if small {
                    if let Some(ptr) = self.bump(heap, size, align) {
                        return Some(ptr);
                    }
                }
                continue;
            }

            let chain = pool.claim(1);
            if heap
                .growth
                .compare_exchange(NO_CHAIN, chain.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                pool.release(chain);
                continue;
            }

            // The previous owner may have left room.
            let result = small
                .then(|| self.bump(heap, size, align))
                .flatten()
                .or_else(|| self.append(heap, tag, size));

            heap.growth.store(NO_CHAIN, Ordering::Release);
            pool.complete_one(chain);
            pool.release(chain);
            return result;
        }
    }

    /// Append a fresh descriptor with enough blocks for `size` bytes and
    /// return its first byte.
    fn append(&self, heap: &TaggedHeap, tag: Tag, size: usize) -> Option<NonNull<u8>> {
        let Some(index) = self.free_descriptors.dequeue() else {
            tracing::error!(%tag, size, "allocation descriptor pool exhausted");
            return None;
        };

        let start = match self.blocks.advise(size, false) {
            Ok(start) => start,
            Err(err) => {
                tracing::error!(%tag, size, error = %err, "tagged allocation failed");
                self.recycle(index);
                return None;
            }
        };

        let descriptor = &self.descriptors[index as usize];
        descriptor.block.store(start, Ordering::Relaxed);
        descriptor
            .blocks
            .store(blocks_for(size) as u32, Ordering::Relaxed);
        descriptor.used.store(size as u64, Ordering::Relaxed);
        descriptor
            .prev
            .store(heap.tail.load(Ordering::Acquire), Ordering::Relaxed);
        heap.tail.store(index, Ordering::Release);

        tracing::trace!(%tag, size, block = start, descriptor = index, "tagged heap grew");
        Some(self.blocks.block_ptr(start))
    }

    fn recycle(&self, index: u32) {
        let descriptor = &self.descriptors[index as usize];
        descriptor.prev.store(NO_DESCRIPTOR, Ordering::Relaxed);
        descriptor.used.store(0, Ordering::Relaxed);
        descriptor.blocks.store(0, Ordering::Relaxed);
        let pushed = self.free_descriptors.enqueue(index);
        debug_assert!(pushed.is_ok(), "descriptor ring overflow");
    }

    // ========================================================================
    // Dynamic heap pool
    // ========================================================================

    fn find_dynamic(&self, tag: Tag) -> Option<&TaggedHeap> {
        self.dynamic.iter().find(|heap| {
            heap.owner.load(Ordering::Relaxed) == tag.0
                && heap.owner.load(Ordering::Acquire) == tag.0
        })
    }

    fn claim_dynamic(&self, tag: Tag) -> Option<&TaggedHeap> {
        if let Some(heap) = self.find_dynamic(tag) {
            return Some(heap);
        }

        let _claim = self.claim.lock();
        if let Some(heap) = self.find_dynamic(tag) {
            return Some(heap);
        }
        for heap in self.dynamic.iter() {
            if heap
                .owner
                .compare_exchange(Tag::INVALID.0, tag.0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                tracing::debug!(%tag, "bound tagged heap");
                return Some(heap);
            }
        }

        tracing::error!(%tag, heaps = self.dynamic.len(), "tagged heap pool exhausted");
        None
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Release everything allocated under `tag`.
    ///
    /// Returns the number of descriptors released. The roots heap is never
    /// freed; unknown tags are ignored.
    pub fn free(&self, tag: Tag) -> usize {
        let released = match tag {
            Tag::INVALID => 0,
            Tag::ROOTS => {
                tracing::error!("the roots heap cannot be freed");
                0
            }
            Tag::DRIFTER => self.drifters.iter().map(|heap| self.release_chain(heap)).sum(),
            _ => match self.find_dynamic(tag) {
                Some(heap) => {
                    let released = self.release_chain(heap);
                    heap.owner.store(Tag::INVALID.0, Ordering::Release);
                    tracing::debug!(%tag, descriptors = released, "unbound tagged heap");
                    released
                }
                None => 0,
            },
        };

        if released > 0 {
            let _ = self.blocks.advise(0, true);
        }
        released
    }

    fn release_chain(&self, heap: &TaggedHeap) -> usize {
        let mut index = heap.tail.swap(NO_DESCRIPTOR, Ordering::AcqRel);
        let mut released = 0;
        while index != NO_DESCRIPTOR {
            let descriptor = &self.descriptors[index as usize];
            let prev = descriptor.prev.load(Ordering::Acquire);
            self.blocks.release(
                descriptor.block.load(Ordering::Relaxed),
                descriptor.blocks.load(Ordering::Relaxed),
            );
            self.recycle(index);
            released += 1;
            index = prev;
        }
        released
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    fn heaps(&self) -> impl Iterator<Item = &TaggedHeap> {
        iter::once(&self.roots)
            .chain(self.drifters.iter())
            .chain(self.dynamic.iter())
    }

    fn chain_of<'a>(&'a self, heap: &TaggedHeap) -> impl Iterator<Item = &'a Descriptor> + 'a {
        let mut index = heap.tail.load(Ordering::Acquire);
        iter::from_fn(move || {
            if index == NO_DESCRIPTOR {
                return None;
            }
            let descriptor = &self.descriptors[index as usize];
            index = descriptor.prev.load(Ordering::Acquire);
            Some(descriptor)
        })
    }

    /// Number of descriptors live under `tag`.
    pub fn live_allocations(&self, tag: Tag) -> usize {
        match tag {
            Tag::INVALID => 0,
            Tag::ROOTS => self.chain_of(&self.roots).count(),
            Tag::DRIFTER => self
                .drifters
                .iter()
                .map(|heap| self.chain_of(heap).count())
                .sum(),
            _ => self
                .find_dynamic(tag)
                .map_or(0, |heap| self.chain_of(heap).count()),
        }
    }

    /// Blocks owned by live descriptors, block 0 included.
    pub fn live_blocks(&self) -> u32 {
        self.heaps()
            .flat_map(|heap| self.chain_of(heap))
            .map(|descriptor| descriptor.blocks.load(Ordering::Relaxed))
            .sum()
    }

    /// Descriptors currently taken from the pool.
    pub fn live_descriptors(&self) -> usize {
        self.descriptors.len() - self.free_descriptors.len()
    }

    /// Dynamic heaps currently bound to a tag.
    pub fn bound_dynamic_heaps(&self) -> usize {
        self.dynamic
            .iter()
            .filter(|heap| heap.owner() != Tag::INVALID)
            .count()
    }

    /// Check that the used bits of the bitmap are exactly the blocks owned
    /// by live descriptors.
    ///
    /// Only meaningful while no allocation or free is in flight.
    pub fn verify_bitmap(&self) -> Result<(), BitmapMismatch> {
        let bitmap = self.blocks.bitmap();
        let mut owners = vec![0u32; bitmap.len() as usize];

        for descriptor in self.heaps().flat_map(|heap| self.chain_of(heap)) {
            let start = descriptor.block.load(Ordering::Relaxed);
            let n = descriptor.blocks.load(Ordering::Relaxed);
            for block in start..start + n {
                owners[block as usize] += 1;
            }
        }

        for (block, &count) in owners.iter().enumerate() {
            let block = block as u32;
            let free = bitmap.is_free(block);
            if count > 1 || (count == 0) != free {
                return Err(BitmapMismatch {
                    block,
                    owners: count,
                    free,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TaggedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedAllocator")
            .field("blocks", &self.blocks)
            .field("live_descriptors", &self.live_descriptors())
            .field("drifter_heaps", &self.drifters.len())
            .field("bound_dynamic_heaps", &self.bound_dynamic_heaps())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
