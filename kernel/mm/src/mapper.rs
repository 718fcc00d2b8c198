//! Architecture-independent page table interface.
//!
//! [`PageTables`] is the seam between common memory management and the
//! architecture: every operation takes the physical address of a root table
//! and manipulates that tree. Common code never interprets raw entry bits;
//! it speaks [`PageFlags`], and the backend owns the encoding.
//!
//! Intermediate table frames come from a caller-supplied frame source, so
//! the backend never talks to an allocator directly.
//!
//! # TLB flush decoupling
//!
//! Table mutations return a [`TlbFlush`]: a must-use pending single-page
//! invalidation dispatched through a callback registered at boot via
//! [`register_tlb_flush`]. Before registration (early boot, host tests) the
//! flush is a no-op.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use helium_core::addr::{PhysAddr, VirtAddr};
use helium_core::paging::{Page, PhysFrame, Size4KiB};

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    ///
    /// Presence is implied; an unmapped page has no flags at all.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable (if unset, no-execute is implied).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (survives address-space switches in the TLB).
        const GLOBAL        = 1 << 3;
        /// Caching disabled for this page.
        const CACHE_DISABLE = 1 << 4;
    }
}

/// Error from map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page already has a mapping.
    AlreadyMapped,
    /// The frame source ran dry while allocating an intermediate table.
    TableAllocFailed,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "page is already mapped"),
            Self::TableAllocFailed => write!(f, "out of frames for page tables"),
        }
    }
}

/// Error from unmap / update_flags operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
    /// The entry maps a different page size than requested (e.g. the address
    /// falls inside a huge page).
    SizeMismatch,
}

impl fmt::Display for UnmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "page is not mapped"),
            Self::SizeMismatch => write!(f, "entry maps a different page size"),
        }
    }
}

/// A source of zero-initialized 4 KiB frames for intermediate tables.
pub type FrameSource<'a> = &'a mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>;

/// A sink receiving freed table frames.
pub type FrameSink<'a> = &'a mut dyn FnMut(PhysFrame<Size4KiB>);

// ---------------------------------------------------------------------------
// Registered TLB flush callback
// ---------------------------------------------------------------------------

/// Registered TLB flush function. No-op by default.
static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture-specific single-page TLB flush (`invlpg` on
/// x86_64).
///
/// Must be called during early boot before any table modification that can
/// leave a stale TLB entry.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: only valid `fn(VirtAddr)` pointers are stored, starting with
    // `nop_flush`.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// A pending TLB invalidation for a single page.
///
/// Flushes on drop unless [`TlbFlush::flush`] or [`TlbFlush::ignore`] is
/// called first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
#[derive(Debug)]
pub struct TlbFlush {
    virt: VirtAddr,
    pending: bool,
}

impl TlbFlush {
    /// Creates a pending flush for the given virtual address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            pending: true,
        }
    }

    /// Flushes the TLB entry immediately.
    pub fn flush(mut self) {
        self.pending = false;
        arch_flush_page(self.virt);
    }

    /// Opts out of flushing (fresh mappings that cannot be in the TLB, or
    /// batch invalidation handled elsewhere).
    pub fn ignore(mut self) {
        self.pending = false;
    }
}

impl Drop for TlbFlush {
    fn drop(&mut self) {
        if self.pending {
            arch_flush_page(self.virt);
        }
    }
}

// ---------------------------------------------------------------------------
// PageTables trait
// ---------------------------------------------------------------------------

/// Architecture backend for page-table manipulation.
///
/// All operations take the root table's physical address; the backend knows
/// how to reach table frames in memory (on kernel targets through the
/// direct map, in host tests through a test arena).
///
/// # Safety
///
/// Implementations must manipulate the architecture's table format
/// correctly; callers hand them raw physical roots and trust the results.
pub unsafe trait PageTables {
    /// Allocates and initializes a new root table.
    ///
    /// With `kernel_root` given, the kernel half (upper 256 root entries) is
    /// copied from it, so the new space shares the kernel mapping by
    /// construction. The lower half is zeroed.
    ///
    /// # Safety
    ///
    /// `kernel_root`, if given, must be a valid root table; `alloc` must
    /// return unused frames.
    unsafe fn create_root(
        &self,
        kernel_root: Option<PhysAddr>,
        alloc: FrameSource<'_>,
    ) -> Result<PhysFrame<Size4KiB>, MapError>;

    /// Maps `page` to `frame` with the given flags, allocating intermediate
    /// tables as needed.
    ///
    /// Fails with [`MapError::AlreadyMapped`] if the page has a mapping, and
    /// with [`MapError::TableAllocFailed`] if `alloc` runs dry.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table; `frame` must not be in use by
    /// another mapping the caller does not intend to alias.
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: PageFlags,
        alloc: FrameSource<'_>,
    ) -> Result<TlbFlush, MapError>;

    /// Unmaps `page`, returning the frame that was mapped.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, TlbFlush), UnmapError>;

    /// Replaces the flags of an existing mapping.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        flags: PageFlags,
    ) -> Result<TlbFlush, UnmapError>;

    /// Translates a virtual address through the tree, any page size.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr>;

    /// Frees the intermediate table frames of the user half (lower 256 root
    /// entries) into `dealloc` and clears those entries. Leaf data frames
    /// are not touched; region teardown owns them. The root frame itself is
    /// also left to the caller.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table with no live user mappings still in
    /// use.
    unsafe fn release_user_tables(&self, root: PhysAddr, dealloc: FrameSink<'_>);

    /// Returns a pointer to the memory of a physical frame.
    ///
    /// Used by common code to zero-fill or populate frames it is about to
    /// map.
    ///
    /// # Safety
    ///
    /// `frame` must be backed by real memory reachable by this backend, and
    /// the caller must have exclusive access to it.
    unsafe fn frame_ptr(&self, frame: PhysFrame<Size4KiB>) -> *mut u8;
}
