//! Kernel synchronization primitives.
//!
//! All locks here are spin-based and interrupt-safe: acquiring saves the
//! local interrupt flags and masks delivery, releasing restores them, so a
//! lock can be taken from both thread and interrupt context without
//! self-deadlock (the window where a CPU holds a lock and can be interrupted
//! into code taking the same lock is closed by construction).
//!
//! Lock ordering is a [`rank::LockRank`] discipline: every ranked lock must
//! be acquired in strictly increasing rank order. Enforcement is compiled in
//! under `cfg(helium_lockrank)` (debug builds); release builds carry only the
//! rank byte.

pub mod critical;
pub mod protected;
pub mod rank;
pub mod recursive;
pub mod spinlock;

pub use critical::{InterruptDisabler, ScopedCritical};
pub use protected::SpinlockProtected;
pub use rank::LockRank;
pub use recursive::{RecursiveSpinlock, RecursiveSpinlockGuard};
pub use spinlock::{Spinlock, SpinlockGuard};
