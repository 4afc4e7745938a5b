//! # Block Bitmap
//!
//! One bit per block of the reservation: 1 = free, 0 = used.
//!
//! ## Design
//!
//! Bits are packed into `AtomicU8` bytes and only ever mutated through
//! per-byte atomic operations:
//!
//! - single-block claims read relaxed and then compare-exchange one bit
//! - range claims compare-exchange a mask per byte, rolling back the bytes
//!   already taken if a later byte is contended
//! - releases `fetch_or` the mask back in
//!
//! Block 0 holds the arena header and is never handed out, which lets
//! [`BlockBitmap::find_first_set`] use 0 as its not-found value.
//!
//! Bits for the padding past the last real block are stored as used so
//! scans never return them.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Atomic free-block bitmap.
pub struct BlockBitmap {
    bytes: Box<[AtomicU8]>,
    blocks: u32,
}

/// Per-byte masks covering `[start, start + n)`.
fn byte_masks(start: u32, n: u32) -> impl Iterator<Item = (usize, u8)> {
    let end = start + n;
    let first = start / 8;
    let last = if n == 0 { first } else { (end + 7) / 8 };
    (first..last).map(move |index| {
        let lo = (index * 8).max(start);
        let hi = ((index + 1) * 8).min(end);
        let width = hi - lo;
        let shift = lo - index * 8;
        let mask = if width == 8 {
            0xFF
        } else {
            (((1u16 << width) - 1) as u8) << shift
        };
        (index as usize, mask)
    })
}

impl BlockBitmap {
    /// Create a bitmap of `blocks` blocks, all free.
    pub fn new(blocks: u32) -> Self {
        let len = ((blocks as usize) + 7) / 8;
        let bytes = (0..len)
            .map(|i| {
                let remaining = blocks as usize - i * 8;
                let bits = if remaining >= 8 {
                    0xFF
                } else {
                    ((1u16 << remaining) - 1) as u8
                };
                AtomicU8::new(bits)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { bytes, blocks }
    }

    /// Number of blocks tracked.
    pub fn len(&self) -> u32 {
        self.blocks
    }

    /// Whether the bitmap tracks no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// Whether `block` is currently free.
    pub fn is_free(&self, block: u32) -> bool {
        if block >= self.blocks {
            return false;
        }
        let byte = self.bytes[(block / 8) as usize].load(Ordering::Acquire);
        byte & (1 << (block % 8)) != 0
    }

    /// Claim the first free block in `[from, ceiling)`.
    ///
    /// Returns the claimed block, or 0 if none is free. Block 0 is never
    /// returned.
    pub fn find_first_set(&self, from: u32, ceiling: u32) -> u32 {
        let ceiling = ceiling.min(self.blocks);
        let mut block = from.max(1);

        while block < ceiling {
            let index = block / 8;
            let byte = &self.bytes[index as usize];
            let byte_end = (index + 1) * 8;

            let mut mask = 0xFFu8 << (block % 8);
            if ceiling < byte_end {
                mask &= (1u8 << (ceiling % 8)) - 1;
            }

            let mut current = byte.load(Ordering::Relaxed);
            loop {
                let candidates = current & mask;
                if candidates == 0 {
                    break;
                }
                let bit = candidates.trailing_zeros();
                match byte.compare_exchange_weak(
                    current,
                    current & !(1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return index * 8 + bit,
                    Err(actual) => current = actual,
                }
            }

            block = byte_end;
        }

        0
    }

    /// Find the first run of `n` free blocks in `[from, ceiling)`.
    ///
    /// The run is not claimed; follow up with [`BlockBitmap::claim_range`]
    /// and rescan if that fails.
    pub fn best_fit_growth(&self, from: u32, ceiling: u32, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        let ceiling = ceiling.min(self.blocks);
        let mut block = from.max(1);
        let mut run_start = block;
        let mut run = 0u32;

        while block < ceiling {
            if block % 8 == 0 && block + 8 <= ceiling {
                match self.bytes[(block / 8) as usize].load(Ordering::Relaxed) {
                    0xFF => {
                        if run == 0 {
                            run_start = block;
                        }
                        run += 8;
                        if run >= n {
                            return Some(run_start);
                        }
                        block += 8;
                        continue;
                    }
                    0x00 => {
                        run = 0;
                        block += 8;
                        continue;
                    }
                    _ => {}
                }
            }

            if self.is_free(block) {
                if run == 0 {
                    run_start = block;
                }
                run += 1;
                if run >= n {
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
            block += 1;
        }

        None
    }

    /// Claim every block in `[start, start + n)`, or none of them.
    pub fn claim_range(&self, start: u32, n: u32) -> bool {
        assert!(start + n <= self.blocks, "claim past the end of the bitmap");

        for (index, mask) in byte_masks(start, n) {
            let byte = &self.bytes[index];
            let mut current = byte.load(Ordering::Relaxed);
            loop {
                if current & mask != mask {
                    self.rollback(start, n, index);
                    return false;
                }
                match byte.compare_exchange_weak(
                    current,
                    current & !mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
        true
    }

    /// Undo the bytes of a partial range claim that precede `failed_index`.
    fn rollback(&self, start: u32, n: u32, failed_index: usize) {
        for (index, mask) in byte_masks(start, n).take_while(|&(i, _)| i < failed_index) {
            self.bytes[index].fetch_or(mask, Ordering::Release);
        }
    }

    /// Mark every block in `[start, start + n)` free.
    ///
    /// Releasing a block that is already free is a programming error.
    pub fn release_range(&self, start: u32, n: u32) {
        assert!(start + n <= self.blocks, "release past the end of the bitmap");
        for (index, mask) in byte_masks(start, n) {
            let previous = self.bytes[index].fetch_or(mask, Ordering::Release);
            debug_assert_eq!(
                previous & mask,
                0,
                "double release of blocks in byte {}",
                index
            );
        }
    }

    /// Number of free blocks in `[start, start + n)`.
    pub fn count_free(&self, start: u32, n: u32) -> u32 {
        let n = n.min(self.blocks.saturating_sub(start));
        byte_masks(start, n)
            .map(|(index, mask)| (self.bytes[index].load(Ordering::Acquire) & mask).count_ones())
            .sum()
    }

    /// Length of the free run ending just before `end`, not reaching below
    /// `floor`.
    pub fn trailing_free(&self, floor: u32, end: u32) -> u32 {
        let end = end.min(self.blocks);
        let mut block = end;
        while block > floor && self.is_free(block - 1) {
            block -= 1;
        }
        end - block
    }

    /// Total free blocks.
    pub fn free_blocks(&self) -> u32 {
        self.count_free(0, self.blocks)
    }
}

impl fmt::Debug for BlockBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBitmap")
            .field("blocks", &self.blocks)
            .field("free", &self.free_blocks())
            .finish()
    }
}
