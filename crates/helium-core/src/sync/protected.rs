//! Closure-scoped lock access.
//!
//! [`SpinlockProtected<T>`] couples a value to its lock so tightly that the
//! only way in is a closure: `with` locks, runs the closure on `&mut T`, and
//! releases on every exit path (return, `?`, panic unwind). Holding a
//! reference past the critical section is structurally impossible.

use crate::sync::rank::LockRank;
use crate::sync::spinlock::Spinlock;

/// A value accessible only inside a locked closure.
pub struct SpinlockProtected<T> {
    inner: Spinlock<T>,
}

impl<T> SpinlockProtected<T> {
    /// Creates an unranked protected value.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Spinlock::new(value),
        }
    }

    /// Creates a protected value whose lock participates in the rank
    /// discipline.
    pub const fn ranked(rank: LockRank, value: T) -> Self {
        Self {
            inner: Spinlock::ranked(rank, value),
        }
    }

    /// Locks, runs `f` on the protected value, and unlocks.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Like [`SpinlockProtected::with`], but returns `None` instead of
    /// spinning when the lock is contended.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.try_lock()?;
        Some(f(&mut guard))
    }

    /// Consumes the wrapper, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
