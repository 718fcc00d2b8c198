//! Page directories.
//!
//! A [`PageDirectory`] owns the root table frame of one address space and
//! funnels every table mutation through the arch backend. It records the
//! owning process by value — a weak back-reference; the directory never
//! touches process state.
//!
//! User directories share the kernel half: their upper root entries are
//! copied from the kernel directory at creation, so the kernel mapping is
//! identical in every address space by construction (the kernel's lower
//! table levels are shared, not duplicated).
//!
//! Directories carry no lock of their own; the `MemoryManager` that owns
//! them serializes all mutation.

use helium_core::addr::{PhysAddr, VirtAddr};
use helium_core::paging::{Page, PhysFrame, Size4KiB};

use crate::ProcessId;
use crate::mapper::{FrameSink, FrameSource, MapError, PageFlags, PageTables, UnmapError};

/// The root table of one address space.
pub struct PageDirectory {
    root: PhysFrame<Size4KiB>,
    owner: Option<ProcessId>,
}

impl PageDirectory {
    /// Creates the kernel's own directory (empty, no kernel half to copy).
    pub fn new_kernel<PT: PageTables>(
        tables: &PT,
        alloc: FrameSource<'_>,
    ) -> Result<Self, MapError> {
        // SAFETY: no source root is dereferenced.
        let root = unsafe { tables.create_root(None, alloc)? };
        Ok(Self { root, owner: None })
    }

    /// Creates a user directory for `owner`, sharing `kernel`'s upper half.
    pub fn new_user<PT: PageTables>(
        tables: &PT,
        kernel: &PageDirectory,
        owner: ProcessId,
        alloc: FrameSource<'_>,
    ) -> Result<Self, MapError> {
        // SAFETY: `kernel.root` is a valid root by construction.
        let root = unsafe { tables.create_root(Some(kernel.root_phys()), alloc)? };
        Ok(Self {
            root,
            owner: Some(owner),
        })
    }

    /// The root table frame.
    pub fn root(&self) -> PhysFrame<Size4KiB> {
        self.root
    }

    /// Physical address of the root table.
    pub fn root_phys(&self) -> PhysAddr {
        self.root.start_address()
    }

    /// The process this directory belongs to, `None` for the kernel's.
    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    /// Maps `page` to `frame`. The pending TLB flush is dispatched
    /// immediately; fresh mappings cost one spurious invalidation, which is
    /// cheaper than a stale entry is dangerous.
    pub fn map_page<PT: PageTables>(
        &self,
        tables: &PT,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: PageFlags,
        alloc: FrameSource<'_>,
    ) -> Result<(), MapError> {
        // SAFETY: the root is valid by construction.
        unsafe { tables.map(self.root_phys(), page, frame, flags, alloc)? }.flush();
        Ok(())
    }

    /// Unmaps `page`, returning the frame that backed it.
    pub fn unmap_page<PT: PageTables>(
        &self,
        tables: &PT,
        page: Page<Size4KiB>,
    ) -> Result<PhysFrame<Size4KiB>, UnmapError> {
        // SAFETY: the root is valid by construction.
        let (frame, flush) = unsafe { tables.unmap(self.root_phys(), page)? };
        flush.flush();
        Ok(frame)
    }

    /// Replaces the flags of an existing mapping.
    pub fn set_flags<PT: PageTables>(
        &self,
        tables: &PT,
        page: Page<Size4KiB>,
        flags: PageFlags,
    ) -> Result<(), UnmapError> {
        // SAFETY: the root is valid by construction.
        unsafe { tables.update_flags(self.root_phys(), page, flags)? }.flush();
        Ok(())
    }

    /// Translates a virtual address through this directory.
    pub fn translate<PT: PageTables>(&self, tables: &PT, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: the root is valid by construction.
        unsafe { tables.translate(self.root_phys(), virt) }
    }

    /// Destroys the directory: frees the user-half intermediate tables and
    /// the root frame into `dealloc`.
    ///
    /// Leaf data frames must already have been unmapped and freed by region
    /// teardown; this only releases the table skeleton.
    pub fn release<PT: PageTables>(self, tables: &PT, dealloc: FrameSink<'_>) {
        // SAFETY: the root is valid, and the caller has detached all users.
        unsafe { tables.release_user_tables(self.root_phys(), dealloc) };
        dealloc(self.root);
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirectory")
            .field("root", &self.root)
            .field("owner", &self.owner)
            .finish()
    }
}
