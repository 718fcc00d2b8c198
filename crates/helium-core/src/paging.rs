//! Typed page and frame abstractions.
//!
//! [`Page<S>`] and [`PhysFrame<S>`] are size-parameterised wrappers whose
//! contained address is guaranteed to be aligned to the page size, so code
//! taking a `Page<Size4KiB>` never has to re-validate alignment.

use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::ops::{Add, Sub};

use crate::addr::{PhysAddr, VirtAddr};

/// Trait for page sizes.
///
/// The concurrency/memory core only maps 4 KiB pages; larger sizes plug in
/// through the same trait.
pub trait PageSize: Copy + Eq + PartialOrd + Ord {
    /// The size in bytes.
    const SIZE: u64;
    /// Human-readable size string for debug output.
    const SIZE_AS_DEBUG_STR: &'static str;
}

/// 4 KiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size4KiB;

impl PageSize for Size4KiB {
    const SIZE: u64 = 4096;
    const SIZE_AS_DEBUG_STR: &'static str = "4KiB";
}

/// Error type returned when an address is not aligned to the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotAligned;

// ---------------------------------------------------------------------------
// Page<S>
// ---------------------------------------------------------------------------

/// A virtual memory page of size `S`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page<S: PageSize> {
    start: VirtAddr,
    _marker: PhantomData<S>,
}

impl<S: PageSize> Page<S> {
    /// Returns the page that contains the given virtual address (aligns down).
    #[inline]
    pub fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a page from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this page.
    #[inline]
    pub const fn start_address(&self) -> VirtAddr {
        self.start
    }

    /// Returns the page size in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        S::SIZE
    }

    /// Creates an iterator over the pages in `[start, end)`.
    #[inline]
    pub fn range(start: Page<S>, end: Page<S>) -> PageRange<S> {
        PageRange { start, end }
    }
}

impl<S: PageSize> Add<u64> for Page<S> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Page::containing_address(self.start + rhs * S::SIZE)
    }
}

impl<S: PageSize> Sub<u64> for Page<S> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Page::containing_address(self.start - rhs * S::SIZE)
    }
}

impl<S: PageSize> fmt::Debug for Page<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page[{}]({:#x})",
            S::SIZE_AS_DEBUG_STR,
            self.start.as_u64()
        )
    }
}

// ---------------------------------------------------------------------------
// PhysFrame<S>
// ---------------------------------------------------------------------------

/// A physical memory frame of size `S`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame<S: PageSize> {
    start: PhysAddr,
    _marker: PhantomData<S>,
}

impl<S: PageSize> PhysFrame<S> {
    /// Returns the frame that contains the given physical address (aligns
    /// down).
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a frame from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }

    /// Returns the frame size in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        S::SIZE
    }

    /// Returns the frame number (start address divided by the frame size).
    #[inline]
    pub const fn number(&self) -> u64 {
        self.start.as_u64() / S::SIZE
    }

    /// Creates an iterator over the frames in `[start, end)`.
    #[inline]
    pub fn range(start: PhysFrame<S>, end: PhysFrame<S>) -> PhysFrameRange<S> {
        PhysFrameRange { start, end }
    }
}

impl<S: PageSize> Add<u64> for PhysFrame<S> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        PhysFrame::containing_address(self.start + rhs * S::SIZE)
    }
}

impl<S: PageSize> Sub<u64> for PhysFrame<S> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        PhysFrame::containing_address(self.start - rhs * S::SIZE)
    }
}

impl<S: PageSize> fmt::Debug for PhysFrame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysFrame[{}]({:#x})",
            S::SIZE_AS_DEBUG_STR,
            self.start.as_u64()
        )
    }
}

// ---------------------------------------------------------------------------
// Range iterators
// ---------------------------------------------------------------------------

/// An iterator over a range of [`Page`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageRange<S: PageSize> {
    start: Page<S>,
    end: Page<S>,
}

impl<S: PageSize> Iterator for PageRange<S> {
    type Item = Page<S>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start < self.end.start {
            let page = self.start;
            self.start = self.start + 1;
            Some(page)
        } else {
            None
        }
    }
}

impl<S: PageSize> FusedIterator for PageRange<S> {}

/// An iterator over a range of [`PhysFrame`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysFrameRange<S: PageSize> {
    start: PhysFrame<S>,
    end: PhysFrame<S>,
}

impl<S: PageSize> Iterator for PhysFrameRange<S> {
    type Item = PhysFrame<S>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start < self.end.start {
            let frame = self.start;
            self.start = self.start + 1;
            Some(frame)
        } else {
            None
        }
    }
}

impl<S: PageSize> FusedIterator for PhysFrameRange<S> {}
