//! Architecture backends for the page-table interface.
//!
//! x86_64 is the reference backend and is always compiled: it reaches table
//! frames through a direct-map offset, so it is pure memory manipulation and
//! runs under host tests. The other architectures are stubs that fail fast —
//! an incomplete port must die loudly, not limp.

pub mod x86_64;

pub mod aarch64;
pub mod riscv64;

use helium_core::addr::PhysAddr;

/// Makes `root` the active translation root on the calling CPU.
///
/// On the host this is a no-op; the `Processor` record is the only state.
///
/// # Safety
///
/// `root` must be a valid root table mapping the currently executing code.
pub unsafe fn activate_root(root: PhysAddr) {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: caller guarantees the root is valid and maps the kernel.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(all(target_os = "none", not(target_arch = "x86_64")))]
    unimplemented!("address space activation is not ported to this architecture");
    #[cfg(not(target_os = "none"))]
    {
        let _ = root;
    }
}
