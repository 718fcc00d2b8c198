//! Physical frame allocation.
//!
//! [`BitmapFrameAllocator`] tracks one contiguous physical window with a
//! bitmap (bit set = allocated): allocation scans for a zero bit starting at
//! a search hint, freeing clears the bit and pulls the hint back. The
//! backing bitmap storage is placed by the caller during bring-up (host
//! tests leak a `Vec`).
//!
//! On top of the bitmap sits the commit ledger used by
//! `AllocationStrategy::Reserve`: [`BitmapFrameAllocator::reserve`] records
//! a promise of frames to be allocated later and fails up front when the
//! promises would exceed what is free. The ledger is accounting only — it
//! does not pin specific frames, so a fault-time allocation can still come
//! up empty if memory was exhausted in the meantime, and the fault path must
//! report that.

use core::fmt;

use helium_core::addr::PhysAddr;
use helium_core::paging::{PageSize, PhysFrame, Size4KiB};

/// Error from frame allocation and commit accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocError {
    /// No physical frames left (or no room left under the commit ledger).
    OutOfMemory,
}

impl fmt::Display for FrameAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// Bitmap allocator over `[base, base + frames * 4096)`.
pub struct BitmapFrameAllocator {
    /// One bit per frame; set means allocated.
    bitmap: &'static mut [u64],
    base: PhysAddr,
    frames: usize,
    free: usize,
    committed: usize,
    /// Word index where the next scan starts.
    hint: usize,
}

impl BitmapFrameAllocator {
    /// Creates an allocator over `frames` frames starting at `base`, with
    /// every frame initially free.
    ///
    /// # Panics
    ///
    /// Panics if `base` is unaligned or `storage` is too small
    /// (`frames / 64` words, rounded up).
    ///
    /// # Safety
    ///
    /// The caller vouches that the described window is real, unused memory
    /// and that `storage` is not shared with anything else.
    pub unsafe fn new(storage: &'static mut [u64], base: PhysAddr, frames: usize) -> Self {
        assert!(base.is_aligned(Size4KiB::SIZE), "window base must be page aligned");
        assert!(storage.len() * 64 >= frames, "bitmap storage too small");
        storage.fill(0);
        // Mark the tail bits past the window as allocated so scans never
        // hand them out.
        for idx in frames..storage.len() * 64 {
            storage[idx / 64] |= 1 << (idx % 64);
        }
        Self {
            bitmap: storage,
            base,
            frames,
            free: frames,
            committed: 0,
            hint: 0,
        }
    }

    /// Allocates one frame, or `None` if the window is exhausted.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        if self.free == 0 {
            return None;
        }
        let words = self.bitmap.len();
        for step in 0..words {
            let w = (self.hint + step) % words;
            let word = self.bitmap[w];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let idx = w * 64 + bit;
            self.bitmap[w] |= 1 << bit;
            self.free -= 1;
            self.hint = w;
            return Some(PhysFrame::containing_address(
                self.base + (idx as u64) * Size4KiB::SIZE,
            ));
        }
        // free > 0 promised a zero bit somewhere.
        unreachable!("free count and bitmap disagree");
    }

    /// Returns a frame to the allocator.
    ///
    /// # Safety
    ///
    /// `frame` must have come from this allocator and must no longer be
    /// referenced by any mapping.
    pub unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let offset = frame.start_address() - self.base;
        let idx = (offset / Size4KiB::SIZE) as usize;
        assert!(idx < self.frames, "frame outside the managed window");
        let (w, bit) = (idx / 64, idx % 64);
        debug_assert!(self.bitmap[w] & (1 << bit) != 0, "double free of {frame:?}");
        self.bitmap[w] &= !(1 << bit);
        self.free += 1;
        if w < self.hint {
            self.hint = w;
        }
    }

    /// Records a promise of `frames` future allocations.
    ///
    /// Fails when the promise cannot be covered by currently free,
    /// unpromised frames. This is what makes `Reserve` mappings fail at
    /// creation instead of at first touch in the common case; it does not
    /// pin frames.
    pub fn reserve(&mut self, frames: usize) -> Result<(), FrameAllocError> {
        if self.committed + frames > self.free {
            return Err(FrameAllocError::OutOfMemory);
        }
        self.committed += frames;
        Ok(())
    }

    /// Returns `frames` unredeemed promises to the ledger.
    pub fn unreserve(&mut self, frames: usize) {
        debug_assert!(frames <= self.committed, "unreserve exceeds ledger");
        self.committed = self.committed.saturating_sub(frames);
    }

    /// Number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Number of promised-but-unredeemed frames.
    pub fn committed_frames(&self) -> usize {
        self.committed
    }

    /// Total frames in the managed window.
    pub fn total_frames(&self) -> usize {
        self.frames
    }
}

impl fmt::Debug for BitmapFrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapFrameAllocator")
            .field("base", &self.base)
            .field("frames", &self.frames)
            .field("free", &self.free)
            .field("committed", &self.committed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(frames: usize) -> BitmapFrameAllocator {
        let words = frames.div_ceil(64);
        let storage = Box::leak(vec![0u64; words].into_boxed_slice());
        // SAFETY: host test; the "window" is never dereferenced.
        unsafe { BitmapFrameAllocator::new(storage, PhysAddr::new(0x10_0000), frames) }
    }

    #[test]
    fn allocates_exactly_the_window() {
        let mut pmm = allocator(10);
        let mut seen = Vec::new();
        while let Some(frame) = pmm.allocate_frame() {
            assert!(frame.start_address() >= PhysAddr::new(0x10_0000));
            assert!(!seen.contains(&frame), "frame handed out twice");
            seen.push(frame);
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(pmm.free_frames(), 0);
    }

    #[test]
    fn freed_frames_are_reused() {
        let mut pmm = allocator(4);
        let a = pmm.allocate_frame().unwrap();
        let _b = pmm.allocate_frame().unwrap();
        // SAFETY: `a` came from this allocator.
        unsafe { pmm.deallocate_frame(a) };
        assert_eq!(pmm.free_frames(), 3);
        // The lowered hint makes the freed frame come back first.
        assert_eq!(pmm.allocate_frame(), Some(a));
    }

    #[test]
    fn tail_bits_are_never_allocated() {
        // 65 frames spans two words with 63 tail bits.
        let mut pmm = allocator(65);
        let mut count = 0;
        while pmm.allocate_frame().is_some() {
            count += 1;
        }
        assert_eq!(count, 65);
    }

    #[test]
    fn reserve_accounts_against_free() {
        let mut pmm = allocator(8);
        pmm.reserve(5).unwrap();
        assert_eq!(pmm.committed_frames(), 5);
        // Only 3 unpromised frames remain.
        assert_eq!(pmm.reserve(4), Err(FrameAllocError::OutOfMemory));
        pmm.reserve(3).unwrap();
        pmm.unreserve(8);
        assert_eq!(pmm.committed_frames(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught() {
        let mut pmm = allocator(2);
        let frame = pmm.allocate_frame().unwrap();
        // SAFETY: first free is legitimate; the second is the point.
        unsafe {
            pmm.deallocate_frame(frame);
            pmm.deallocate_frame(frame);
        }
    }
}
