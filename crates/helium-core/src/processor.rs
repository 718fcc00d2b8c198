//! Per-CPU processor state.
//!
//! One [`Processor`] record exists per CPU, reachable without locking via
//! [`Processor::current`]. It carries the scheduling-adjacent state the rest
//! of the kernel needs to consult cheaply: the logical CPU id, the currently
//! running thread, interrupt and critical-section nesting depths, the active
//! page-directory root, and a small table of per-CPU singleton addresses.
//!
//! All fields are atomics because interrupt handlers running on the same CPU
//! observe them, but there is no cross-CPU mutation: every field is written
//! only by its own CPU.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::addr::PhysAddr;
use crate::cpu_local::{CpuLocal, MAX_CPUS};

/// Byte offset of the CPU id field, read by the assembly in `cpu_local`.
pub const PROCESSOR_CPU_ID_OFFSET: usize = 8;

const _: () = assert!(core::mem::offset_of!(Processor, cpu_id) == PROCESSOR_CPU_ID_OFFSET);
const _: () = assert!(core::mem::offset_of!(Processor, self_ptr) == 0);

/// Identifier of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Sentinel for "no thread" in the atomic current-thread field.
const NO_THREAD: u64 = u64::MAX;

/// Sentinel for "no active directory". Physical addresses are at most 52
/// bits, so this can never collide with a real root (frame 0 can).
const NO_DIRECTORY: u64 = u64::MAX;

/// Sentinel for an empty processor slot.
const NO_SLOT: usize = 0;

/// Number of entries in the per-processor slot table.
pub const PROC_SLOT_COUNT: usize = 4;

/// Index into the per-processor slot table.
///
/// Slots hold the addresses of processor-specific singletons that
/// interrupt-context code must reach without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ProcSlot {
    /// The memory manager serving this CPU's page faults.
    MemoryManager = 0,
    /// The scheduler run queue of this CPU.
    RunQueue = 1,
    /// The idle thread of this CPU.
    IdleThread = 2,
    /// The local interrupt controller.
    InterruptController = 3,
}

/// Per-CPU processor record.
///
/// The first two fields are at fixed offsets: the self-pointer at 0 (loaded
/// into the CPU-local register during bring-up) and the CPU id at
/// [`PROCESSOR_CPU_ID_OFFSET`] (read by `current_cpu_id`).
#[repr(C)]
pub struct Processor {
    /// Address of this record; `gs:[0]` (or TPIDR_EL1 / `tp`) resolves it.
    self_ptr: AtomicU64,
    cpu_id: AtomicU32,
    initialized: AtomicBool,
    /// Running thread, `NO_THREAD` when idle or before scheduling starts.
    current_thread: AtomicU64,
    /// Depth of nested hardware interrupt entries (maintained by trap
    /// entry/exit).
    interrupt_nesting: AtomicU32,
    /// Depth of nested `ScopedCritical` guards; the scheduler must not
    /// preempt while this is non-zero.
    critical_depth: AtomicU32,
    /// Depth of nested `InterruptDisabler` guards.
    irq_disable_depth: AtomicU32,
    /// Interrupt flags saved by the outermost `InterruptDisabler`.
    saved_irq_flags: AtomicU64,
    /// Physical root of the page directory this CPU currently runs on.
    /// `NO_DIRECTORY` until memory management activates an address space.
    active_directory: AtomicU64,
    slots: [AtomicUsize; PROC_SLOT_COUNT],
}

/// The per-CPU processor table.
static PROCESSORS: CpuLocal<Processor> = CpuLocal::new([const { Processor::new() }; MAX_CPUS]);

impl Processor {
    /// Creates an uninitialized processor record.
    pub const fn new() -> Self {
        Self {
            self_ptr: AtomicU64::new(0),
            cpu_id: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            current_thread: AtomicU64::new(NO_THREAD),
            interrupt_nesting: AtomicU32::new(0),
            critical_depth: AtomicU32::new(0),
            irq_disable_depth: AtomicU32::new(0),
            saved_irq_flags: AtomicU64::new(0),
            active_directory: AtomicU64::new(NO_DIRECTORY),
            slots: [const { AtomicUsize::new(NO_SLOT) }; PROC_SLOT_COUNT],
        }
    }

    /// Initializes this record for the given logical CPU.
    ///
    /// Called once per CPU during bring-up, before any lock or guard is used
    /// on that CPU.
    pub fn init(&self, cpu_id: u32) {
        self.self_ptr
            .store(core::ptr::from_ref(self) as u64, Ordering::Relaxed);
        self.cpu_id.store(cpu_id, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Returns the processor record of the calling CPU.
    #[inline]
    pub fn current() -> &'static Processor {
        PROCESSORS.get()
    }

    /// Returns the processor record of the given CPU.
    #[inline]
    pub fn for_cpu(cpu: u32) -> &'static Processor {
        PROCESSORS.get_for(cpu)
    }

    /// Returns the logical CPU id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// Returns `true` once [`Processor::init`] has run.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // -- current thread -----------------------------------------------------

    /// Returns the id of the thread running on this CPU, if any.
    ///
    /// This is a non-owning reference by value: the scheduler owns the
    /// thread, the processor record only names it.
    #[inline]
    pub fn current_thread(&self) -> Option<ThreadId> {
        match self.current_thread.load(Ordering::Relaxed) {
            NO_THREAD => None,
            id => Some(ThreadId(id)),
        }
    }

    /// Records the thread now running on this CPU.
    #[inline]
    pub fn set_current_thread(&self, thread: Option<ThreadId>) {
        let raw = match thread {
            Some(ThreadId(id)) => {
                debug_assert!(id != NO_THREAD, "thread id collides with sentinel");
                id
            }
            None => NO_THREAD,
        };
        self.current_thread.store(raw, Ordering::Relaxed);
    }

    // -- interrupt nesting --------------------------------------------------

    /// Called by trap entry. Returns the new nesting depth.
    #[inline]
    pub fn enter_interrupt(&self) -> u32 {
        self.interrupt_nesting.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Called by trap exit.
    #[inline]
    pub fn leave_interrupt(&self) {
        let prev = self.interrupt_nesting.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "leave_interrupt without matching enter");
    }

    /// Returns `true` while executing in interrupt context.
    #[inline]
    pub fn in_interrupt(&self) -> bool {
        self.interrupt_nesting.load(Ordering::Relaxed) > 0
    }

    // -- critical sections --------------------------------------------------

    /// Enters a critical section (preemption must be deferred).
    #[inline]
    pub(crate) fn enter_critical(&self) {
        self.critical_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Leaves a critical section.
    #[inline]
    pub(crate) fn leave_critical(&self) {
        let prev = self.critical_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "leave_critical without matching enter");
    }

    /// Returns `true` while any `ScopedCritical` guard is live on this CPU.
    /// The scheduler consults this before preempting.
    #[inline]
    pub fn in_critical_section(&self) -> bool {
        self.critical_depth.load(Ordering::Relaxed) > 0
    }

    /// Current critical-section nesting depth.
    #[inline]
    pub fn critical_depth(&self) -> u32 {
        self.critical_depth.load(Ordering::Relaxed)
    }

    // -- interrupt disabler bookkeeping -------------------------------------

    /// First-entry bookkeeping for `InterruptDisabler`. Returns the previous
    /// depth; the caller saves `flags` only when it was zero.
    #[inline]
    pub(crate) fn enter_irq_disable(&self, flags: u64) -> u32 {
        let prev = self.irq_disable_depth.fetch_add(1, Ordering::Relaxed);
        if prev == 0 {
            self.saved_irq_flags.store(flags, Ordering::Relaxed);
        }
        prev
    }

    /// Matching exit; returns `Some(saved flags)` when the outermost guard
    /// drops.
    #[inline]
    pub(crate) fn leave_irq_disable(&self) -> Option<u64> {
        let prev = self.irq_disable_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "leave_irq_disable without matching enter");
        if prev == 1 {
            Some(self.saved_irq_flags.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Current `InterruptDisabler` nesting depth.
    #[inline]
    pub fn irq_disable_depth(&self) -> u32 {
        self.irq_disable_depth.load(Ordering::Relaxed)
    }

    // -- active page directory ----------------------------------------------

    /// Returns the physical root of the page directory this CPU last
    /// activated, or `None` before memory management brought one up.
    #[inline]
    pub fn active_page_directory(&self) -> Option<PhysAddr> {
        match self.active_directory.load(Ordering::Relaxed) {
            NO_DIRECTORY => None,
            root => Some(PhysAddr::new_truncate(root)),
        }
    }

    /// Records the page directory root now active on this CPU.
    #[inline]
    pub fn set_active_page_directory(&self, root: Option<PhysAddr>) {
        let raw = root.map_or(NO_DIRECTORY, PhysAddr::as_u64);
        self.active_directory.store(raw, Ordering::Relaxed);
    }

    // -- slot table ----------------------------------------------------------

    /// Publishes the address of a processor-local singleton.
    ///
    /// Passing 0 clears the slot.
    #[inline]
    pub fn set_slot(&self, slot: ProcSlot, addr: usize) {
        self.slots[slot as usize].store(addr, Ordering::Release);
    }

    /// Looks up a processor-local singleton address.
    ///
    /// Returns `None` for a cleared or never-set slot, so a torn-down
    /// singleton fails lookup instead of dangling.
    #[inline]
    pub fn slot(&self, slot: ProcSlot) -> Option<usize> {
        match self.slots[slot as usize].load(Ordering::Acquire) {
            NO_SLOT => None,
            addr => Some(addr),
        }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_publishes_id_and_self_ptr() {
        let proc = Processor::new();
        assert!(!proc.is_initialized());
        proc.init(5);
        assert!(proc.is_initialized());
        assert_eq!(proc.id(), 5);
    }

    #[test]
    fn current_thread_roundtrip() {
        let proc = Processor::new();
        assert_eq!(proc.current_thread(), None);
        proc.set_current_thread(Some(ThreadId(42)));
        assert_eq!(proc.current_thread(), Some(ThreadId(42)));
        proc.set_current_thread(None);
        assert_eq!(proc.current_thread(), None);
    }

    #[test]
    fn interrupt_nesting_depth() {
        let proc = Processor::new();
        assert!(!proc.in_interrupt());
        assert_eq!(proc.enter_interrupt(), 1);
        assert_eq!(proc.enter_interrupt(), 2);
        proc.leave_interrupt();
        assert!(proc.in_interrupt());
        proc.leave_interrupt();
        assert!(!proc.in_interrupt());
    }

    #[test]
    fn active_directory_roundtrip() {
        let proc = Processor::new();
        assert_eq!(proc.active_page_directory(), None);
        proc.set_active_page_directory(Some(PhysAddr::new(0x3000)));
        assert_eq!(proc.active_page_directory(), Some(PhysAddr::new(0x3000)));
        proc.set_active_page_directory(None);
        assert_eq!(proc.active_page_directory(), None);
    }

    #[test]
    fn frame_zero_is_a_valid_active_directory() {
        // A root in the first frame of a window based at physical 0 must not
        // read back as "none".
        let proc = Processor::new();
        proc.set_active_page_directory(Some(PhysAddr::zero()));
        assert_eq!(proc.active_page_directory(), Some(PhysAddr::zero()));
    }

    #[test]
    fn slot_lookup_fails_after_clear() {
        let proc = Processor::new();
        assert_eq!(proc.slot(ProcSlot::MemoryManager), None);
        proc.set_slot(ProcSlot::MemoryManager, 0xDEAD_0000);
        assert_eq!(proc.slot(ProcSlot::MemoryManager), Some(0xDEAD_0000));
        proc.set_slot(ProcSlot::MemoryManager, 0);
        assert_eq!(proc.slot(ProcSlot::MemoryManager), None);
    }

    #[test]
    fn slots_are_distinct() {
        let proc = Processor::new();
        proc.set_slot(ProcSlot::RunQueue, 0x1000);
        proc.set_slot(ProcSlot::IdleThread, 0x2000);
        assert_eq!(proc.slot(ProcSlot::RunQueue), Some(0x1000));
        assert_eq!(proc.slot(ProcSlot::IdleThread), Some(0x2000));
        assert_eq!(proc.slot(ProcSlot::InterruptController), None);
    }
}
