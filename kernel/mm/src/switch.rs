//! Scoped address-space switching.
//!
//! [`ScopedAddressSpaceSwitcher`] activates another page-directory root on
//! the calling CPU and restores the previous one when dropped, so a kernel
//! path that must read a foreign address space cannot leave the CPU on the
//! wrong root, early returns and unwinds included. Guards nest LIFO and are
//! not `Send`; the recorded root lives in the `Processor`, so a switch on
//! one CPU never disturbs another.
//!
//! [`ProcessPagingScope`] is the common entry point: it resolves an address
//! space handle through the memory manager and switches to that space's
//! root.

use core::marker::PhantomData;

use helium_core::addr::PhysAddr;
use helium_core::processor::Processor;

use crate::arch;
use crate::manager::{AddressSpaceHandle, MemoryManager};
use crate::mapper::PageTables;
use crate::region::RegionError;

/// RAII switch of the calling CPU to another translation root.
pub struct ScopedAddressSpaceSwitcher<'p> {
    processor: &'p Processor,
    previous: Option<PhysAddr>,
    switched: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'p> ScopedAddressSpaceSwitcher<'p> {
    /// Switches the calling CPU to `root`. Switching to the root that is
    /// already active is free.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table that maps the currently executing
    /// kernel code. Directories created through the memory manager satisfy
    /// this by kernel-half sharing.
    #[must_use = "the previous address space is restored when this guard drops"]
    pub unsafe fn new(root: PhysAddr) -> ScopedAddressSpaceSwitcher<'static> {
        // SAFETY: forwarded to the caller.
        unsafe { ScopedAddressSpaceSwitcher::on_processor(Processor::current(), root) }
    }

    /// Switches on an explicit processor record.
    ///
    /// # Safety
    ///
    /// Same as [`ScopedAddressSpaceSwitcher::new`], and `processor` must be
    /// the calling CPU's record.
    #[must_use = "the previous address space is restored when this guard drops"]
    pub unsafe fn on_processor(processor: &'p Processor, root: PhysAddr) -> Self {
        let previous = processor.active_page_directory();
        let switched = previous != Some(root);
        if switched {
            processor.set_active_page_directory(Some(root));
            // SAFETY: the caller guarantees `root` is valid.
            unsafe { arch::activate_root(root) };
        }
        Self {
            processor,
            previous,
            switched,
            _not_send: PhantomData,
        }
    }

    /// The root that will be restored on drop.
    pub fn previous_root(&self) -> Option<PhysAddr> {
        self.previous
    }
}

impl Drop for ScopedAddressSpaceSwitcher<'_> {
    fn drop(&mut self) {
        if !self.switched {
            return;
        }
        self.processor.set_active_page_directory(self.previous);
        if let Some(previous) = self.previous {
            // SAFETY: this root was active when the guard was created.
            unsafe { arch::activate_root(previous) };
        }
    }
}

/// Switches the calling CPU into a process address space for the guard's
/// lifetime.
pub struct ProcessPagingScope<'p> {
    _switcher: ScopedAddressSpaceSwitcher<'p>,
}

impl<'p> ProcessPagingScope<'p> {
    /// Resolves `handle` and switches the calling CPU to that space's root.
    pub fn enter<PT: PageTables>(
        manager: &MemoryManager<PT>,
        handle: AddressSpaceHandle,
    ) -> Result<ProcessPagingScope<'static>, RegionError> {
        let root = manager.space(handle)?.directory().root_phys();
        // SAFETY: manager-created directories map the kernel half.
        let switcher = unsafe { ScopedAddressSpaceSwitcher::new(root) };
        Ok(ProcessPagingScope {
            _switcher: switcher,
        })
    }

    /// Like [`ProcessPagingScope::enter`] on an explicit processor record.
    pub fn enter_on<PT: PageTables>(
        processor: &'p Processor,
        manager: &MemoryManager<PT>,
        handle: AddressSpaceHandle,
    ) -> Result<Self, RegionError> {
        let root = manager.space(handle)?.directory().root_phys();
        // SAFETY: manager-created directories map the kernel half.
        let switcher = unsafe { ScopedAddressSpaceSwitcher::on_processor(processor, root) };
        Ok(Self {
            _switcher: switcher,
        })
    }
}
