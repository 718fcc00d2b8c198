//! Interrupt-safe spinlock.
//!
//! [`Spinlock<T>`] is a test-and-test-and-set spinlock whose acquisition
//! also masks local interrupt delivery: the guard captures the interrupt
//! flags at lock time and restores them when it drops. This closes the
//! self-deadlock window where a CPU holding the lock is interrupted into a
//! handler taking the same lock.
//!
//! The guard is `!Send`: it embodies per-CPU interrupt state and must be
//! released on the CPU that created it.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::sync::rank::{self, LockRank};

/// A spinning mutual-exclusion lock with interrupt masking.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    rank: LockRank,
    data: UnsafeCell<T>,
}

// SAFETY: the lock provides exclusive access to the data.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates an unranked spinlock.
    ///
    /// Unranked locks are exempt from the rank discipline; prefer
    /// [`Spinlock::ranked`] for anything that can nest with other locks.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            rank: LockRank::None,
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a spinlock participating in the rank discipline.
    pub const fn ranked(rank: LockRank, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            rank,
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock, returning the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquires the lock, spinning until it is available.
    ///
    /// Interrupts are masked on the calling CPU for the guard's lifetime.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let saved_flags = arch::save_and_disable_interrupts();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            // Spin on a plain load to keep the cache line shared.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        rank::track_acquired(self.rank);
        SpinlockGuard {
            lock: self,
            saved_flags,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// On failure the interrupt flags are restored immediately.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let saved_flags = arch::save_and_disable_interrupts();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            rank::track_acquired(self.rank);
            Some(SpinlockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            arch::restore_interrupts(saved_flags);
            None
        }
    }

    /// Returns `true` if the lock is currently held (by anyone).
    ///
    /// Only meaningful for diagnostics; the answer may be stale immediately.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns the rank this lock was created with.
    pub fn rank(&self) -> LockRank {
        self.rank
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Spinlock").field("data", &&*guard).finish(),
            None => f.debug_struct("Spinlock").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard for [`Spinlock`]. Releases the lock and restores the saved
/// interrupt flags on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    saved_flags: u64,
    /// Ties the guard to the acquiring CPU (`!Send`, `!Sync`).
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        rank::track_released(self.lock.rank);
        self.lock.locked.store(false, Ordering::Release);
        arch::restore_interrupts(self.saved_flags);
    }
}
