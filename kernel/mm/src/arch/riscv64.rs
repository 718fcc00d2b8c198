//! riscv64 (Sv48) page-table backend (not yet ported).
//!
//! Every operation aborts immediately: silently degrading memory management
//! on an incomplete port is worse than a clean panic at the first use.

use helium_core::addr::{PhysAddr, VirtAddr};
use helium_core::paging::{Page, PhysFrame, Size4KiB};

use crate::mapper::{FrameSink, FrameSource, MapError, PageFlags, PageTables, TlbFlush, UnmapError};

/// Placeholder backend for Sv48 translation tables.
pub struct Riscv64PageTables;

// SAFETY: no operation is implemented; each aborts before touching memory.
unsafe impl PageTables for Riscv64PageTables {
    unsafe fn create_root(
        &self,
        _kernel_root: Option<PhysAddr>,
        _alloc: FrameSource<'_>,
    ) -> Result<PhysFrame<Size4KiB>, MapError> {
        unimplemented!("riscv64 page tables")
    }

    unsafe fn map(
        &self,
        _root: PhysAddr,
        _page: Page<Size4KiB>,
        _frame: PhysFrame<Size4KiB>,
        _flags: PageFlags,
        _alloc: FrameSource<'_>,
    ) -> Result<TlbFlush, MapError> {
        unimplemented!("riscv64 page tables")
    }

    unsafe fn unmap(
        &self,
        _root: PhysAddr,
        _page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, TlbFlush), UnmapError> {
        unimplemented!("riscv64 page tables")
    }

    unsafe fn update_flags(
        &self,
        _root: PhysAddr,
        _page: Page<Size4KiB>,
        _flags: PageFlags,
    ) -> Result<TlbFlush, UnmapError> {
        unimplemented!("riscv64 page tables")
    }

    unsafe fn translate(&self, _root: PhysAddr, _virt: VirtAddr) -> Option<PhysAddr> {
        unimplemented!("riscv64 page tables")
    }

    unsafe fn release_user_tables(&self, _root: PhysAddr, _dealloc: FrameSink<'_>) {
        unimplemented!("riscv64 page tables")
    }

    unsafe fn frame_ptr(&self, _frame: PhysFrame<Size4KiB>) -> *mut u8 {
        unimplemented!("riscv64 page tables")
    }
}
