//! # Virtual Memory
//!
//! Address-space reservation and block-granular commit/decommit.
//!
//! ## Design
//!
//! The whole memory budget is reserved as one contiguous range at boot with
//! no physical backing. Physical memory is committed and decommitted later in
//! [`BLOCK_SIZE`] steps by the block allocator.
//!
//! The OS primitive sits behind the [`VirtualMemory`] trait:
//!
//! - [`OsMemory`]: `mmap(PROT_NONE)` / `mprotect` / `madvise` / `munmap`
//!   on unix targets, heap backing elsewhere
//! - [`HeapMemory`]: global-allocator backing, used by tests and by targets
//!   without a virtual-memory API
//!
//! [`Reservation`] is the arena view over a reserved range: base pointer,
//! committed length and reserved length, plus typed accessors.

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Granularity of commit, decommit and block allocation (2 MiB).
pub const BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Round `size` up to a multiple of [`BLOCK_SIZE`], saturating at the
/// largest such multiple.
pub const fn round_to_blocks(size: usize) -> usize {
    match size.checked_add(BLOCK_SIZE - 1) {
        Some(padded) => padded & !(BLOCK_SIZE - 1),
        None => usize::MAX & !(BLOCK_SIZE - 1),
    }
}

/// Number of blocks needed to hold `size` bytes.
pub const fn blocks_for(size: usize) -> usize {
    round_to_blocks(size) / BLOCK_SIZE
}

/// Virtual memory failure.
#[derive(Debug, Error)]
pub enum VmError {
    /// The address range could not be reserved.
    #[error("failed to reserve {size} bytes of address space")]
    Reserve {
        /// Requested size in bytes.
        size: usize,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// Physical backing could not be committed.
    #[error("failed to commit {len} bytes at offset {offset:#x}")]
    Commit {
        /// Offset into the reservation.
        offset: usize,
        /// Length in bytes.
        len: usize,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// Physical backing could not be returned to the OS.
    #[error("failed to decommit {len} bytes at offset {offset:#x}")]
    Decommit {
        /// Offset into the reservation.
        offset: usize,
        /// Length in bytes.
        len: usize,
        /// OS error.
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// VirtualMemory trait
// ============================================================================

/// Platform primitive for reserving and backing address space.
///
/// All pointers and lengths passed to `commit`, `decommit` and `release` lie
/// inside a range previously returned by `reserve` and are multiples of
/// [`BLOCK_SIZE`].
pub trait VirtualMemory: Send + Sync {
    /// Reserve `len` bytes of address space aligned to [`BLOCK_SIZE`].
    fn reserve(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Back `len` bytes at `ptr` with readable, writable memory.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live reservation.
    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Return the physical backing of `len` bytes at `ptr` to the OS.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live reservation and must not be in use.
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Release a whole reservation.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly what `reserve` returned and was asked
    /// for, and nothing may reference the range afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, len: usize);

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Heap backing
// ============================================================================

/// Virtual memory stand-in backed by the global allocator.
///
/// The whole range is allocated (zeroed) up front; commit only does
/// bookkeeping and decommit zero-fills, matching what anonymous OS memory
/// looks like after it is recommitted. An optional commit limit makes commit
/// failures reproducible in tests.
pub struct HeapMemory {
    committed: AtomicUsize,
    commit_limit: usize,
}

impl HeapMemory {
    /// Heap backing with no commit limit.
    pub fn new() -> Self {
        Self::with_commit_limit(usize::MAX)
    }

    /// Heap backing whose commits fail once `limit` bytes are committed.
    pub fn with_commit_limit(limit: usize) -> Self {
        Self {
            committed: AtomicUsize::new(0),
            commit_limit: limit,
        }
    }

    /// Bytes committed through this backing.
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapMemory")
            .field("committed", &self.committed())
            .field("commit_limit", &self.commit_limit)
            .finish()
    }
}

impl VirtualMemory for HeapMemory {
    fn reserve(&self, len: usize) -> io::Result<NonNull<u8>> {
        let layout = Layout::from_size_align(len, BLOCK_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if layout.size() == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty reservation"));
        }
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn commit(&self, _ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let result = self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(len)
                    .filter(|&next| next <= self.commit_limit)
            });
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(io::Error::from(io::ErrorKind::OutOfMemory)),
        }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        std::ptr::write_bytes(ptr.as_ptr(), 0, len);
        self.committed.fetch_sub(len, Ordering::AcqRel);
        Ok(())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        let layout = Layout::from_size_align_unchecked(len, BLOCK_SIZE);
        alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

// ============================================================================
// OS backing
// ============================================================================

/// Virtual memory provided by the operating system.
#[derive(Debug, Default)]
pub struct OsMemory {
    #[cfg(not(unix))]
    fallback: HeapMemory,
}

impl OsMemory {
    /// Create the OS backing.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use std::ptr;

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int =
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    impl VirtualMemory for OsMemory {
        fn reserve(&self, len: usize) -> io::Result<NonNull<u8>> {
            // Over-reserve by one block so the start can be block aligned,
            // then hand the slop on both sides back.
            let total = len
                .checked_add(BLOCK_SIZE)
                .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

            // Safety: anonymous mapping with no address hint.
            let raw = unsafe {
                libc::mmap(ptr::null_mut(), total, libc::PROT_NONE, RESERVE_FLAGS, -1, 0)
            };
            if raw == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let start = raw as usize;
            let aligned = (start + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
            let head = aligned - start;
            let tail = total - head - len;

            // Safety: both trims lie inside the mapping created above.
            unsafe {
                if head > 0 {
                    check(libc::munmap(raw, head))?;
                }
                if tail > 0 {
                    check(libc::munmap((aligned + len) as *mut libc::c_void, tail))?;
                }
            }

            NonNull::new(aligned as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::Other))
        }

        unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
            check(libc::mprotect(
                ptr.as_ptr().cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            ))
        }

        unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
            check(libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED))?;
            check(libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_NONE))
        }

        unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
            let _ = libc::munmap(ptr.as_ptr().cast(), len);
        }

        fn name(&self) -> &'static str {
            "os"
        }
    }
}

#[cfg(not(unix))]
impl VirtualMemory for OsMemory {
    fn reserve(&self, len: usize) -> io::Result<NonNull<u8>> {
        self.fallback.reserve(len)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.fallback.commit(ptr, len)
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.fallback.decommit(ptr, len)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        self.fallback.release(ptr, len)
    }

    fn name(&self) -> &'static str {
        "os-heap"
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// A reserved address range: base, committed length and reserved length.
pub struct Reservation {
    vm: Box<dyn VirtualMemory>,
    base: NonNull<u8>,
    reserved: usize,
    committed: AtomicUsize,
}

// Safety: the reservation only hands out addresses; synchronizing access to
// the memory behind them is the block allocator's job.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `budget` bytes (rounded up to whole blocks).
    pub fn new(vm: Box<dyn VirtualMemory>, budget: usize) -> Result<Self, VmError> {
        let reserved = round_to_blocks(budget.max(BLOCK_SIZE));
        let base = vm
            .reserve(reserved)
            .map_err(|source| VmError::Reserve { size: reserved, source })?;

        tracing::debug!(
            backing = vm.name(),
            reserved,
            base = format_args!("{:p}", base),
            "reserved address space"
        );

        Ok(Self {
            vm,
            base,
            reserved,
            committed: AtomicUsize::new(0),
        })
    }

    /// Start of the range.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Reserved bytes.
    pub fn reserved_len(&self) -> usize {
        self.reserved
    }

    /// Bytes currently committed.
    pub fn committed_len(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Number of blocks in the reservation.
    pub fn block_count(&self) -> usize {
        self.reserved / BLOCK_SIZE
    }

    /// Name of the backing primitive.
    pub fn backing(&self) -> &'static str {
        self.vm.name()
    }

    /// Commit the block-aligned range `[offset, offset + len)`.
    pub fn commit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        self.check_range(offset, len);
        // Safety: range checked against the reservation.
        unsafe { self.vm.commit(self.ptr_at(offset), len) }
            .map_err(|source| VmError::Commit { offset, len, source })?;
        self.committed.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    /// Decommit the block-aligned range `[offset, offset + len)`.
    ///
    /// The caller guarantees nothing lives in the range.
    pub fn decommit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        self.check_range(offset, len);
        // Safety: range checked against the reservation; emptiness is the
        // caller's contract.
        unsafe { self.vm.decommit(self.ptr_at(offset), len) }
            .map_err(|source| VmError::Decommit { offset, len, source })?;
        self.committed.fetch_sub(len, Ordering::AcqRel);
        Ok(())
    }

    /// Address of byte `offset`.
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.reserved, "offset {:#x} outside reservation", offset);
        // Safety: in bounds of the reservation, which does not wrap.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Typed address of `offset`.
    pub fn typed_ptr<T>(&self, offset: usize) -> NonNull<T> {
        assert!(
            offset + std::mem::size_of::<T>() <= self.reserved,
            "typed access past the reservation"
        );
        let ptr = self.ptr_at(offset).cast::<T>();
        debug_assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        ptr
    }

    /// Offset of `ptr` if it points into the reservation.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        (addr >= base && addr < base + self.reserved).then(|| addr - base)
    }

    fn check_range(&self, offset: usize, len: usize) {
        debug_assert_eq!(offset % BLOCK_SIZE, 0, "unaligned offset {:#x}", offset);
        debug_assert_eq!(len % BLOCK_SIZE, 0, "unaligned length {:#x}", len);
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.reserved),
            "range {:#x}+{:#x} outside reservation",
            offset,
            len
        );
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Safety: base/reserved are exactly what reserve produced.
        unsafe { self.vm.release(self.base, self.reserved) };
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("backing", &self.vm.name())
            .field("base", &self.base)
            .field("reserved", &self.reserved)
            .field("committed", &self.committed_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(round_to_blocks(0), 0);
        assert_eq!(round_to_blocks(1), BLOCK_SIZE);
        assert_eq!(round_to_blocks(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(round_to_blocks(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
        assert_eq!(blocks_for(5 * BLOCK_SIZE - 3), 5);
        assert_eq!(round_to_blocks(usize::MAX), usize::MAX & !(BLOCK_SIZE - 1));
    }

    #[test]
    fn test_heap_reservation_commit_cycle() {
        let reservation = Reservation::new(Box::new(HeapMemory::new()), 3 * BLOCK_SIZE + 7).unwrap();
        assert_eq!(reservation.reserved_len(), 4 * BLOCK_SIZE);
        assert_eq!(reservation.block_count(), 4);
        assert_eq!(reservation.base().as_ptr() as usize % BLOCK_SIZE, 0);

        reservation.commit(BLOCK_SIZE, 2 * BLOCK_SIZE).unwrap();
        assert_eq!(reservation.committed_len(), 2 * BLOCK_SIZE);

        let ptr = reservation.ptr_at(BLOCK_SIZE);
        unsafe { ptr.as_ptr().write(0xAB) };

        reservation.decommit(BLOCK_SIZE, 2 * BLOCK_SIZE).unwrap();
        assert_eq!(reservation.committed_len(), 0);
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0);
    }

    #[test]
    fn test_heap_commit_limit() {
        let reservation =
            Reservation::new(Box::new(HeapMemory::with_commit_limit(BLOCK_SIZE)), 4 * BLOCK_SIZE)
                .unwrap();
        reservation.commit(0, BLOCK_SIZE).unwrap();
        let err = reservation.commit(BLOCK_SIZE, BLOCK_SIZE).unwrap_err();
        assert!(matches!(err, VmError::Commit { offset, .. } if offset == BLOCK_SIZE));
        assert_eq!(reservation.committed_len(), BLOCK_SIZE);
    }

    #[test]
    fn test_offset_of() {
        let reservation = Reservation::new(Box::new(HeapMemory::new()), BLOCK_SIZE).unwrap();
        let ptr = reservation.ptr_at(128);
        assert_eq!(reservation.offset_of(ptr.as_ptr()), Some(128));
        assert_eq!(reservation.offset_of(std::ptr::null()), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_os_reservation_commit_cycle() {
        let reservation = Reservation::new(Box::new(OsMemory::new()), 8 * BLOCK_SIZE).unwrap();
        assert_eq!(reservation.base().as_ptr() as usize % BLOCK_SIZE, 0);

        reservation.commit(2 * BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let ptr = reservation.typed_ptr::<u64>(2 * BLOCK_SIZE);
        unsafe {
            ptr.as_ptr().write(0xDEAD_BEEF);
            assert_eq!(ptr.as_ptr().read(), 0xDEAD_BEEF);
        }
        reservation.decommit(2 * BLOCK_SIZE, BLOCK_SIZE).unwrap();

        // Recommitted anonymous memory reads back as zero.
        reservation.commit(2 * BLOCK_SIZE, BLOCK_SIZE).unwrap();
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0);
    }

    #[test]
    fn test_vm_error_display() {
        let err = VmError::Commit {
            offset: 0x200000,
            len: 4096,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };
        assert!(err.to_string().contains("0x200000"));
    }
}
