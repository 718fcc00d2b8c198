//! Interrupt flag save/mask/restore.
//!
//! These two functions are the only code outside architecture bring-up that
//! is allowed to touch the local interrupt-enable state. Lock and guard types
//! save the flags, mask delivery, and restore the exact saved state on drop,
//! so nesting in any order is safe.
//!
//! On non-kernel targets (host tests) both functions are no-ops.

/// Saves the current interrupt state and disables interrupt delivery on the
/// calling CPU.
///
/// Returns an opaque token to pass to [`restore_interrupts`]. The token is
/// the architecture's flag register content (RFLAGS, DAIF, or sstatus), but
/// callers must not interpret it.
#[inline]
pub fn save_and_disable_interrupts() -> u64 {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        let flags: u64;
        // SAFETY: pushfq/pop reads RFLAGS; cli only masks interrupts.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {0}",
                "cli",
                out(reg) flags,
                options(nomem, preserves_flags)
            );
        }
        flags
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        let daif: u64;
        // SAFETY: reads DAIF and masks IRQ/FIQ; no memory access.
        unsafe {
            core::arch::asm!(
                "mrs {0}, daif",
                "msr daifset, #3",
                out(reg) daif,
                options(nomem, preserves_flags)
            );
        }
        daif
    }
    #[cfg(all(target_os = "none", target_arch = "riscv64"))]
    {
        let sstatus: u64;
        // SAFETY: atomically clears sstatus.SIE and returns the old value.
        unsafe {
            core::arch::asm!(
                "csrrci {0}, sstatus, 0x2",
                out(reg) sstatus,
                options(nomem, preserves_flags)
            );
        }
        sstatus
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Restores interrupt state previously saved by
/// [`save_and_disable_interrupts`].
///
/// Only re-enables delivery if it was enabled when the token was taken.
#[inline]
pub fn restore_interrupts(saved: u64) {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        // RFLAGS.IF is bit 9.
        if saved & (1 << 9) != 0 {
            // SAFETY: re-enables interrupts, matching the saved state.
            unsafe {
                core::arch::asm!("sti", options(nomem, preserves_flags));
            }
        }
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        // SAFETY: writes back the saved DAIF mask bits.
        unsafe {
            core::arch::asm!("msr daif, {0}", in(reg) saved, options(nomem, preserves_flags));
        }
    }
    #[cfg(all(target_os = "none", target_arch = "riscv64"))]
    {
        // sstatus.SIE is bit 1.
        if saved & 0x2 != 0 {
            // SAFETY: re-enables supervisor interrupts, matching saved state.
            unsafe {
                core::arch::asm!("csrsi sstatus, 0x2", options(nomem, preserves_flags));
            }
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = saved;
    }
}
