//! CPU-local storage.
//!
//! [`CpuLocal<T>`] is a fixed array of `T`, one slot per possible CPU,
//! indexed by [`current_cpu_id`]. Each CPU only touches its own slot, so no
//! locking is involved; cross-CPU access is possible through [`CpuLocal::get_for`]
//! but the caller owns the synchronization question.

/// Maximum number of CPUs supported.
pub const MAX_CPUS: usize = 64;

/// A value replicated per CPU.
///
/// The slot type is usually an atomic or an `UnsafeCell` wrapper; `CpuLocal`
/// itself only provides the indexing.
#[repr(align(64))]
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

// Each CPU accesses only its own slot.
unsafe impl<T> Sync for CpuLocal<T> {}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` from a full array of slots.
    ///
    /// Usually written as
    /// `CpuLocal::new([const { Slot::new() }; MAX_CPUS])`.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns the slot of the calling CPU.
    #[inline]
    pub fn get(&self) -> &T {
        &self.data[current_cpu_id() as usize]
    }

    /// Returns the slot of the given CPU.
    ///
    /// Panics if `cpu >= MAX_CPUS`.
    #[inline]
    pub fn get_for(&self, cpu: u32) -> &T {
        &self.data[cpu as usize]
    }
}

/// Returns the logical id of the calling CPU.
///
/// On kernel targets this reads the per-CPU [`crate::processor::Processor`]
/// record through the architecture's CPU-local register (GS base, TPIDR_EL1,
/// `tp`), so it must only be called after
/// [`crate::processor::Processor::init`] has run on this CPU. On the host it
/// always returns 0.
#[inline]
pub fn current_cpu_id() -> u32 {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        let id: u32;
        // SAFETY: GS base points at this CPU's Processor record; the CPU id
        // lives at the fixed offset asserted in processor.rs.
        unsafe {
            core::arch::asm!(
                "mov {0:e}, gs:[{1}]",
                out(reg) id,
                const crate::processor::PROCESSOR_CPU_ID_OFFSET,
                options(nomem, nostack, preserves_flags)
            );
        }
        id
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        let base: u64;
        // SAFETY: TPIDR_EL1 points at this CPU's Processor record.
        unsafe {
            core::arch::asm!("mrs {0}, tpidr_el1", out(reg) base, options(nomem, nostack, preserves_flags));
            *((base as usize + crate::processor::PROCESSOR_CPU_ID_OFFSET) as *const u32)
        }
    }
    #[cfg(all(target_os = "none", target_arch = "riscv64"))]
    {
        let base: u64;
        // SAFETY: tp points at this CPU's Processor record.
        unsafe {
            core::arch::asm!("mv {0}, tp", out(reg) base, options(nomem, nostack, preserves_flags));
            *((base as usize + crate::processor::PROCESSOR_CPU_ID_OFFSET) as *const u32)
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static COUNTERS: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

    #[test]
    fn get_resolves_to_cpu_zero_on_host() {
        assert_eq!(current_cpu_id(), 0);
        COUNTERS.get().store(7, Ordering::Relaxed);
        assert_eq!(COUNTERS.get_for(0).load(Ordering::Relaxed), 7);
    }

    #[test]
    fn slots_are_independent() {
        let local: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);
        local.get_for(3).store(3, Ordering::Relaxed);
        local.get_for(5).store(5, Ordering::Relaxed);
        assert_eq!(local.get_for(3).load(Ordering::Relaxed), 3);
        assert_eq!(local.get_for(5).load(Ordering::Relaxed), 5);
        assert_eq!(local.get_for(0).load(Ordering::Relaxed), 0);
    }
}
