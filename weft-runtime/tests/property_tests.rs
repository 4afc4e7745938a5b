//! Property-based tests for the weft runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::collections::VecDeque;

use proptest::prelude::*;
use weft_runtime::bitmap::BlockBitmap;
use weft_runtime::blocks::BlockAllocator;
use weft_runtime::chain::{ChainPool, SpinWait};
use weft_runtime::tagged::{Tag, TaggedAllocator, TaggedLayout};
use weft_runtime::vm::{HeapMemory, Reservation, BLOCK_SIZE};
use weft_runtime::RingBuffer;

#[derive(Debug, Clone)]
enum QueueOp {
    Push(u32),
    Pop,
}

/// Strategy for queue operations, biased towards pushes
fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => any::<u32>().prop_map(QueueOp::Push),
        2 => Just(QueueOp::Pop),
    ]
}

/// Strategy for an allocation request: (tag, size, align)
fn alloc_request() -> impl Strategy<Value = (u64, usize, usize)> {
    (
        prop_oneof![Just(1u64), 2u64..6],
        prop_oneof![1usize..4096, 4096usize..(3 * BLOCK_SIZE)],
        (0u32..13).prop_map(|shift| 1usize << shift),
    )
}

fn tagged(blocks: usize) -> TaggedAllocator {
    let reservation =
        Reservation::new(Box::new(HeapMemory::new()), blocks * BLOCK_SIZE).unwrap();
    TaggedAllocator::new(
        BlockAllocator::new(reservation).unwrap(),
        TaggedLayout {
            drifter_heaps: 1,
            dynamic_heaps: 4,
            descriptor_log2: 8,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The ring behaves like a bounded FIFO
    #[test]
    fn ring_matches_fifo_model(log2 in 1u32..6, ops in prop::collection::vec(queue_op(), 0..200)) {
        let ring = RingBuffer::with_capacity_log2(log2);
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Push(value) => {
                    let accepted = ring.enqueue(value).is_ok();
                    prop_assert_eq!(accepted, model.len() < ring.capacity());
                    if accepted {
                        model.push_back(value);
                    }
                }
                QueueOp::Pop => prop_assert_eq!(ring.dequeue(), model.pop_front()),
            }
            prop_assert_eq!(ring.len(), model.len());
        }
    }

    /// Claiming and releasing any set of ranges restores the bitmap
    #[test]
    fn bitmap_claim_release_restores(
        len in 2u32..300,
        ranges in prop::collection::vec((1u32..300, 1u32..20), 0..40),
    ) {
        let bitmap = BlockBitmap::new(len);
        let initial = bitmap.free_blocks();
        let mut claimed = Vec::new();

        for (start, n) in ranges {
            if start + n > len {
                continue;
            }
            let before = bitmap.free_blocks();
            if bitmap.claim_range(start, n) {
                claimed.push((start, n));
                prop_assert_eq!(bitmap.free_blocks(), before - n);
            } else {
                prop_assert_eq!(bitmap.free_blocks(), before);
            }
        }

        for (start, n) in claimed.into_iter().rev() {
            bitmap.release_range(start, n);
        }
        prop_assert_eq!(bitmap.free_blocks(), initial);
    }

    /// Freeing every tag returns the arena to its boot state
    #[test]
    fn tagged_alloc_free_restores_arena(requests in prop::collection::vec(alloc_request(), 1..40)) {
        let allocator = tagged(48);
        let pool = ChainPool::new(4);
        let wait = SpinWait::new(&pool);
        let free_at_boot = allocator.blocks().bitmap().free_blocks();
        let mut tags = Vec::new();

        for (tag, size, align) in requests {
            let tag = Tag::new(tag);
            // A failed request may still have bound a heap to the tag.
            if !tags.contains(&tag) {
                tags.push(tag);
            }
            if let Some(ptr) = allocator.alloc(tag, size, align, 0, &wait) {
                prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
            }
            prop_assert_eq!(allocator.verify_bitmap(), Ok(()));
        }

        for tag in tags {
            allocator.free(tag);
        }
        prop_assert_eq!(allocator.verify_bitmap(), Ok(()));
        prop_assert_eq!(allocator.live_blocks(), 1);
        prop_assert_eq!(allocator.live_descriptors(), 1);
        prop_assert_eq!(allocator.blocks().bitmap().free_blocks(), free_at_boot);
        prop_assert_eq!(allocator.bound_dynamic_heaps(), 0);
    }
}
