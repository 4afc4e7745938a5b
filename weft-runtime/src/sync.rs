//! # Spin Primitives
//!
//! Bounded-contention spinning for code that runs on fiber-hosting threads.
//!
//! ## Primitives
//!
//! - [`Backoff`] - Spin with a CPU hint, yielding to the OS after 128 spins
//! - [`SpinLock`] - Test-and-test-and-set lock with an RAII guard
//!
//! ## Design Notes
//!
//! A worker thread hosts many fibers, so parking it in the kernel stalls every
//! fiber it could otherwise run. Nothing here ever blocks in the OS; the only
//! concession to contention is `std::thread::yield_now`.

use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Number of failed spins before the thread yields to the OS scheduler.
pub const SPINS_BEFORE_YIELD: u32 = 128;

// ============================================================================
// Backoff
// ============================================================================

/// Contention backoff for lock-free retry loops.
///
/// Each call to [`Backoff::spin`] issues a CPU spin hint. Every
/// [`SPINS_BEFORE_YIELD`] calls the thread yields its time slice instead.
#[derive(Debug, Default)]
pub struct Backoff {
    spins: u32,
}

impl Backoff {
    /// Create a fresh backoff counter.
    pub const fn new() -> Self {
        Self { spins: 0 }
    }

    /// Back off once.
    #[inline]
    pub fn spin(&mut self) {
        self.spins += 1;
        if self.spins >= SPINS_BEFORE_YIELD {
            self.spins = 0;
            thread::yield_now();
        } else {
            hint::spin_loop();
        }
    }

    /// Reset after making progress.
    #[inline]
    pub fn reset(&mut self) {
        self.spins = 0;
    }

    /// Spins performed since the last yield or reset.
    pub fn spins(&self) -> u32 {
        self.spins
    }
}

// ============================================================================
// SpinLock
// ============================================================================

/// A spin lock protecting a value.
///
/// Used for short critical sections that must not put the host thread to
/// sleep, such as the virtual-memory growth guard.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `locked`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new lock in the unlocked state.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // Wait on a plain load so the cache line stays shared.
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    /// Returns whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.debug_struct("SpinLock").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backoff_wraps_after_yield() {
        let mut backoff = Backoff::new();
        for _ in 0..SPINS_BEFORE_YIELD - 1 {
            backoff.spin();
        }
        assert_eq!(backoff.spins(), SPINS_BEFORE_YIELD - 1);
        backoff.spin();
        assert_eq!(backoff.spins(), 0);
    }

    #[test]
    fn test_spin_lock_basic() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_spin_lock_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_spin_lock_debug() {
        let lock = SpinLock::new(7);
        assert!(format!("{:?}", lock).contains('7'));
        let _guard = lock.lock();
        assert!(format!("{:?}", lock).contains("<locked>"));
    }
}
