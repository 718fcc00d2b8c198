//! Lock rank discipline.
//!
//! Every lock in the kernel carries a [`LockRank`]. Ranks are totally
//! ordered, and a CPU may only acquire a ranked lock whose rank is strictly
//! greater than every rank it already holds. Since all CPUs then acquire in
//! the same global order, cyclic lock dependencies cannot form.
//!
//! [`LockRank::None`] opts a lock out of tracking, for leaf locks with no
//! ordering relationship (the logger, short-lived wrappers).
//!
//! Enforcement is per-CPU state wired into the lock paths only under
//! `cfg(helium_lockrank)`; release builds carry just the rank byte. The
//! tracker assumes one thread of execution per CPU slot, so host tests that
//! enable enforcement exercise it from a single thread — the
//! [`RankTracker`] itself is a plain struct and is unit-tested directly.

/// Rank of a lock in the global acquisition order.
///
/// Listed in acquisition order: a lock later in the enum may be taken while
/// holding any lock earlier in it, never the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    /// Untracked; exempt from the rank discipline.
    None = 0,
    /// The memory manager's own state.
    MemoryManager = 1,
    /// A single address space (regions and page directory).
    AddressSpace = 2,
    /// The physical frame allocator.
    FrameAllocator = 3,
    /// The global process table.
    ProcessList = 4,
    /// Scheduler run queues.
    Scheduler = 5,
}

impl LockRank {
    /// Human-readable rank name for violation reports.
    pub const fn name(self) -> &'static str {
        match self {
            LockRank::None => "None",
            LockRank::MemoryManager => "MemoryManager",
            LockRank::AddressSpace => "AddressSpace",
            LockRank::FrameAllocator => "FrameAllocator",
            LockRank::ProcessList => "ProcessList",
            LockRank::Scheduler => "Scheduler",
        }
    }
}

/// Maximum number of ranked locks held simultaneously by one CPU.
pub const MAX_HELD_RANKS: usize = 16;

/// Tracks the ranked locks held by one CPU.
///
/// Because acquisition order is strictly increasing, at most one lock of any
/// given rank can be held at a time, and the held set is always sorted.
/// Release may happen out of LIFO order.
pub struct RankTracker {
    held: [LockRank; MAX_HELD_RANKS],
    depth: usize,
}

impl RankTracker {
    /// Creates an empty tracker.
    pub const fn new() -> Self {
        Self {
            held: [LockRank::None; MAX_HELD_RANKS],
            depth: 0,
        }
    }

    /// Number of ranked locks currently held.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Highest rank currently held, or `LockRank::None` when none are.
    #[inline]
    pub fn highest_held(&self) -> LockRank {
        if self.depth == 0 {
            LockRank::None
        } else {
            self.held[self.depth - 1]
        }
    }

    /// Records the acquisition of a lock of rank `rank`.
    ///
    /// Panics if `rank` is not strictly greater than every held rank, naming
    /// both ranks involved. `LockRank::None` is ignored.
    pub fn acquire(&mut self, rank: LockRank) {
        if rank == LockRank::None {
            return;
        }
        let highest = self.highest_held();
        assert!(
            rank > highest,
            "lock rank violation: acquiring {} while holding {}",
            rank.name(),
            highest.name()
        );
        assert!(self.depth < MAX_HELD_RANKS, "held-lock stack overflow");
        self.held[self.depth] = rank;
        self.depth += 1;
    }

    /// Records the release of a lock of rank `rank`.
    ///
    /// Releases need not be LIFO. `LockRank::None` is ignored; releasing a
    /// rank that is not held panics (unbalanced lock/unlock).
    pub fn release(&mut self, rank: LockRank) {
        if rank == LockRank::None {
            return;
        }
        let mut i = self.depth;
        while i > 0 {
            i -= 1;
            if self.held[i] == rank {
                // Shift the entries above down; the set stays sorted.
                self.held.copy_within(i + 1..self.depth, i);
                self.depth -= 1;
                self.held[self.depth] = LockRank::None;
                return;
            }
        }
        panic!("releasing rank {} that is not held", rank.name());
    }

    /// Clears all held state.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for RankTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-CPU tracking (cfg(helium_lockrank) only)
// ---------------------------------------------------------------------------

#[cfg(helium_lockrank)]
mod tracking {
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::{LockRank, RankTracker};
    use crate::cpu_local::{CpuLocal, MAX_CPUS};

    struct TrackerSlot {
        tracker: UnsafeCell<RankTracker>,
        /// Re-entrancy guard: the panic path may acquire tracked locks.
        busy: AtomicBool,
    }

    // SAFETY: each slot is only touched by its own CPU (single thread of
    // execution per slot), serialized further by the busy flag.
    unsafe impl Sync for TrackerSlot {}

    impl TrackerSlot {
        const fn new() -> Self {
            Self {
                tracker: UnsafeCell::new(RankTracker::new()),
                busy: AtomicBool::new(false),
            }
        }
    }

    static TRACKERS: CpuLocal<TrackerSlot> =
        CpuLocal::new([const { TrackerSlot::new() }; MAX_CPUS]);

    fn with_tracker(f: impl FnOnce(&mut RankTracker)) {
        let slot = TRACKERS.get();
        if slot.busy.swap(true, Ordering::Acquire) {
            // Re-entered from a panic or nested tracking path; skip.
            return;
        }
        // SAFETY: the busy flag excludes re-entry and the slot is CPU-local.
        f(unsafe { &mut *slot.tracker.get() });
        slot.busy.store(false, Ordering::Release);
    }

    /// Records a ranked lock acquisition on the calling CPU.
    pub fn track_acquired(rank: LockRank) {
        with_tracker(|t| t.acquire(rank));
    }

    /// Records a ranked lock release on the calling CPU.
    pub fn track_released(rank: LockRank) {
        with_tracker(|t| t.release(rank));
    }

    /// Clears the calling CPU's tracker, including a stuck busy flag.
    ///
    /// Test-only escape hatch for recovering after a `#[should_panic]`
    /// violation left the tracker mid-update.
    pub fn reset_current_cpu() {
        let slot = TRACKERS.get();
        slot.busy.swap(true, Ordering::Acquire);
        // SAFETY: busy flag held; CPU-local slot.
        unsafe { (*slot.tracker.get()).clear() };
        slot.busy.store(false, Ordering::Release);
    }
}

#[cfg(helium_lockrank)]
pub use tracking::{reset_current_cpu, track_acquired, track_released};

/// No-op when rank enforcement is compiled out.
#[cfg(not(helium_lockrank))]
#[inline(always)]
pub fn track_acquired(_rank: LockRank) {}

/// No-op when rank enforcement is compiled out.
#[cfg(not(helium_lockrank))]
#[inline(always)]
pub fn track_released(_rank: LockRank) {}

/// No-op when rank enforcement is compiled out.
#[cfg(not(helium_lockrank))]
#[inline(always)]
pub fn reset_current_cpu() {}
