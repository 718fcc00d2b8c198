//! Re-entrant spinlock.
//!
//! [`RecursiveSpinlock<T>`] lets the holder re-acquire without deadlocking:
//! an owner token plus a depth counter. The lock is only released to other
//! CPUs when the depth returns to zero.
//!
//! Because two guards can be live on the same CPU at once, the guard only
//! derefs to `&T`; interior mutability (atomics, cells) is the way to mutate
//! through it.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::sync::rank::{self, LockRank};

/// Sentinel owner token for an unheld lock.
const NO_OWNER: u32 = u32::MAX;

/// Returns the token identifying the current execution context.
///
/// On kernel targets this is the CPU id (kernel code holding a spinlock
/// cannot migrate: interrupts are masked). On the host each test thread gets
/// a distinct token so ownership semantics stay observable.
fn owner_token() -> u32 {
    #[cfg(target_os = "none")]
    {
        crate::cpu_local::current_cpu_id()
    }
    #[cfg(all(not(target_os = "none"), test))]
    {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        std::thread_local! {
            static TOKEN: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        TOKEN.with(|t| *t)
    }
    #[cfg(all(not(target_os = "none"), not(test)))]
    {
        0
    }
}

/// A spinlock that the holding CPU may re-acquire.
pub struct RecursiveSpinlock<T: ?Sized> {
    owner: AtomicU32,
    depth: AtomicU32,
    rank: LockRank,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive cross-CPU access; same-CPU aliasing is shared-only.
unsafe impl<T: ?Sized + Send> Send for RecursiveSpinlock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RecursiveSpinlock<T> {}

impl<T> RecursiveSpinlock<T> {
    /// Creates an unranked recursive spinlock.
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU32::new(NO_OWNER),
            depth: AtomicU32::new(0),
            rank: LockRank::None,
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a recursive spinlock participating in the rank discipline.
    ///
    /// Only the outermost acquisition is rank-checked; re-acquisition by the
    /// holder is always permitted.
    pub const fn ranked(rank: LockRank, value: T) -> Self {
        Self {
            owner: AtomicU32::new(NO_OWNER),
            depth: AtomicU32::new(0),
            rank,
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RecursiveSpinlock<T> {
    /// Acquires the lock, spinning if another CPU holds it. Re-acquisition
    /// by the holder succeeds immediately and bumps the depth.
    pub fn lock(&self) -> RecursiveSpinlockGuard<'_, T> {
        let token = owner_token();
        let saved_flags = arch::save_and_disable_interrupts();
        if self.owner.load(Ordering::Relaxed) == token {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return RecursiveSpinlockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            };
        }
        loop {
            if self
                .owner
                .compare_exchange_weak(NO_OWNER, token, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                core::hint::spin_loop();
            }
        }
        self.depth.store(1, Ordering::Relaxed);
        rank::track_acquired(self.rank);
        RecursiveSpinlockGuard {
            lock: self,
            saved_flags,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire without spinning.
    pub fn try_lock(&self) -> Option<RecursiveSpinlockGuard<'_, T>> {
        let token = owner_token();
        let saved_flags = arch::save_and_disable_interrupts();
        if self.owner.load(Ordering::Relaxed) == token {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(RecursiveSpinlockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            });
        }
        if self
            .owner
            .compare_exchange(NO_OWNER, token, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            rank::track_acquired(self.rank);
            Some(RecursiveSpinlockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            arch::restore_interrupts(saved_flags);
            None
        }
    }

    /// Current re-acquisition depth (diagnostics only).
    pub fn recursion_depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Returns `true` if the calling context holds this lock.
    pub fn is_locked_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == owner_token()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RecursiveSpinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveSpinlock")
            .field("depth", &self.recursion_depth())
            .finish_non_exhaustive()
    }
}

/// RAII guard for [`RecursiveSpinlock`]. Shared access only.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RecursiveSpinlockGuard<'a, T: ?Sized> {
    lock: &'a RecursiveSpinlock<T>,
    saved_flags: u64,
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for RecursiveSpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the owning context holds the lock; all aliasing guards on
        // this CPU are shared references.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RecursiveSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        let prev = self.lock.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "recursive lock depth underflow");
        if prev == 1 {
            rank::track_released(self.lock.rank);
            self.lock.owner.store(NO_OWNER, Ordering::Release);
        }
        arch::restore_interrupts(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reacquire_increments_depth() {
        let lock = RecursiveSpinlock::new(7u32);
        let a = lock.lock();
        assert_eq!(lock.recursion_depth(), 1);
        let b = lock.lock();
        let c = lock.lock();
        assert_eq!(lock.recursion_depth(), 3);
        assert_eq!(*a + *b + *c, 21);
        drop(b);
        drop(c);
        assert_eq!(lock.recursion_depth(), 1);
        assert!(lock.is_locked_by_current());
        drop(a);
        assert_eq!(lock.recursion_depth(), 0);
        assert!(!lock.is_locked_by_current());
    }

    #[test]
    fn other_thread_cannot_acquire_until_fully_released() {
        let lock = Arc::new(RecursiveSpinlock::new(()));
        let outer = lock.lock();
        let inner = lock.lock();

        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || contender.try_lock().is_some());
        assert!(!handle.join().unwrap());

        drop(inner);
        // Still held: one release is not enough.
        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || contender.try_lock().is_some());
        assert!(!handle.join().unwrap());

        drop(outer);
        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || contender.try_lock().is_some());
        assert!(handle.join().unwrap());
    }
}
