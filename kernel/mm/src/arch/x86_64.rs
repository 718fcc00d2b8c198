//! x86_64 4-level page-table backend.
//!
//! Implements [`PageTables`] by walking PML4 → PDPT → PD → PT. Table frames
//! are reached through [`PhysMapper`], a direct-map offset translation, so
//! the walker never depends on the active CR3 and runs unmodified in host
//! tests where "physical memory" is a heap-allocated arena.

use helium_core::addr::{PhysAddr, VirtAddr};
use helium_core::paging::{Page, PageSize, PhysFrame, Size4KiB};

use crate::mapper::{FrameSink, FrameSource, MapError, PageFlags, PageTables, TlbFlush, UnmapError};

// Entry bits (Intel SDM Vol. 3A, 4.5).
const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_WRITABLE: u64 = 1 << 1;
const ENTRY_USER: u64 = 1 << 2;
const ENTRY_CACHE_DISABLE: u64 = 1 << 4;
const ENTRY_HUGE: u64 = 1 << 7;
const ENTRY_GLOBAL: u64 = 1 << 8;
const ENTRY_NO_EXECUTE: u64 = 1 << 63;

/// Physical address field of an entry (bits 12..51).
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Entries per table and the index of the first kernel-half root entry.
const ENTRY_COUNT: usize = 512;
const KERNEL_HALF_START: usize = 256;

/// Flags given to intermediate table entries. Permissive on purpose: the
/// leaf entry is what restricts access.
const INTERMEDIATE_FLAGS: u64 = ENTRY_PRESENT | ENTRY_WRITABLE | ENTRY_USER;

fn encode_flags(flags: PageFlags) -> u64 {
    let mut entry = ENTRY_PRESENT;
    if flags.contains(PageFlags::WRITABLE) {
        entry |= ENTRY_WRITABLE;
    }
    if !flags.contains(PageFlags::EXECUTABLE) {
        entry |= ENTRY_NO_EXECUTE;
    }
    if flags.contains(PageFlags::USER) {
        entry |= ENTRY_USER;
    }
    if flags.contains(PageFlags::GLOBAL) {
        entry |= ENTRY_GLOBAL;
    }
    if flags.contains(PageFlags::CACHE_DISABLE) {
        entry |= ENTRY_CACHE_DISABLE;
    }
    entry
}

/// Direct-map translation from physical addresses to accessible pointers.
///
/// On kernel targets the offset is the higher-half direct map established by
/// the bootloader; in host tests it is the base address of an arena.
#[derive(Debug, Clone, Copy)]
pub struct PhysMapper {
    offset: u64,
}

impl PhysMapper {
    /// Creates a mapper adding `offset` to every physical address.
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns a pointer to the memory behind `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must lie inside the physical range covered by the direct map.
    #[inline]
    pub unsafe fn ptr(&self, phys: PhysAddr) -> *mut u8 {
        (self.offset.wrapping_add(phys.as_u64())) as *mut u8
    }

    /// Returns a pointer to a page table at `phys`.
    ///
    /// # Safety
    ///
    /// Same as [`PhysMapper::ptr`], and `phys` must be 4 KiB aligned.
    #[inline]
    unsafe fn table(&self, phys: PhysAddr) -> *mut u64 {
        debug_assert!(phys.is_aligned(Size4KiB::SIZE));
        // SAFETY: forwarded to the caller.
        unsafe { self.ptr(phys).cast::<u64>() }
    }
}

/// The x86_64 [`PageTables`] backend.
pub struct X86PageTables {
    mapper: PhysMapper,
}

impl X86PageTables {
    /// Creates a backend reaching physical memory through `mapper`.
    pub const fn new(mapper: PhysMapper) -> Self {
        Self { mapper }
    }

    /// Reads entry `index` of the table at `table_phys`.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table frame inside the direct map.
    unsafe fn read_entry(&self, table_phys: PhysAddr, index: usize) -> u64 {
        debug_assert!(index < ENTRY_COUNT);
        // SAFETY: table frames are 4 KiB, index is in bounds.
        unsafe { self.mapper.table(table_phys).add(index).read_volatile() }
    }

    /// Writes entry `index` of the table at `table_phys`.
    ///
    /// # Safety
    ///
    /// As [`Self::read_entry`]; the caller owns consistency of the tree.
    unsafe fn write_entry(&self, table_phys: PhysAddr, index: usize, value: u64) {
        debug_assert!(index < ENTRY_COUNT);
        // SAFETY: table frames are 4 KiB, index is in bounds.
        unsafe { self.mapper.table(table_phys).add(index).write_volatile(value) }
    }

    /// Zeroes a whole table frame.
    ///
    /// # Safety
    ///
    /// `frame` must be inside the direct map and exclusively owned.
    unsafe fn zero_frame(&self, frame: PhysFrame<Size4KiB>) {
        // SAFETY: the frame is 4 KiB of exclusively owned memory.
        unsafe { core::ptr::write_bytes(self.mapper.ptr(frame.start_address()), 0, 4096) }
    }

    /// Walks from `root` down to the page table (level 0), creating missing
    /// intermediate tables from `alloc`.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn walk_create(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        alloc: FrameSource<'_>,
    ) -> Result<PhysAddr, MapError> {
        let mut table = root;
        for level in (1..=3).rev() {
            let index = virt.table_index(level);
            // SAFETY: `table` is a valid table frame by induction from root.
            let entry = unsafe { self.read_entry(table, index) };
            if entry & ENTRY_PRESENT == 0 {
                let frame = alloc().ok_or(MapError::TableAllocFailed)?;
                // SAFETY: freshly allocated, exclusively owned.
                unsafe { self.zero_frame(frame) };
                // SAFETY: in-bounds entry write of a valid next-level link.
                unsafe {
                    self.write_entry(
                        table,
                        index,
                        frame.start_address().as_u64() | INTERMEDIATE_FLAGS,
                    );
                }
                table = frame.start_address();
            } else if entry & ENTRY_HUGE != 0 {
                // The range is covered by a huge mapping already.
                return Err(MapError::AlreadyMapped);
            } else {
                table = PhysAddr::new_truncate(entry & ENTRY_ADDR_MASK);
            }
        }
        Ok(table)
    }

    /// Walks from `root` down to the page table (level 0) without creating
    /// anything.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn walk(&self, root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
        let mut table = root;
        for level in (1..=3).rev() {
            let index = virt.table_index(level);
            // SAFETY: `table` is a valid table frame by induction from root.
            let entry = unsafe { self.read_entry(table, index) };
            if entry & ENTRY_PRESENT == 0 {
                return Err(UnmapError::NotMapped);
            }
            if entry & ENTRY_HUGE != 0 {
                return Err(UnmapError::SizeMismatch);
            }
            table = PhysAddr::new_truncate(entry & ENTRY_ADDR_MASK);
        }
        Ok(table)
    }
}

// SAFETY: the walker follows the x86_64 4-level format exactly; all frame
// access goes through the direct map handed in at construction.
unsafe impl PageTables for X86PageTables {
    unsafe fn create_root(
        &self,
        kernel_root: Option<PhysAddr>,
        alloc: FrameSource<'_>,
    ) -> Result<PhysFrame<Size4KiB>, MapError> {
        let frame = alloc().ok_or(MapError::TableAllocFailed)?;
        // SAFETY: freshly allocated, exclusively owned.
        unsafe { self.zero_frame(frame) };
        if let Some(kernel_root) = kernel_root {
            for index in KERNEL_HALF_START..ENTRY_COUNT {
                // SAFETY: both tables are valid frames; copying root entries
                // shares the kernel's lower levels rather than duplicating
                // them.
                unsafe {
                    let entry = self.read_entry(kernel_root, index);
                    self.write_entry(frame.start_address(), index, entry);
                }
            }
        }
        Ok(frame)
    }

    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: PageFlags,
        alloc: FrameSource<'_>,
    ) -> Result<TlbFlush, MapError> {
        let virt = page.start_address();
        // SAFETY: forwarded from the caller.
        let pt = unsafe { self.walk_create(root, virt, alloc)? };
        let index = virt.table_index(0);
        // SAFETY: `pt` is a valid page table.
        let entry = unsafe { self.read_entry(pt, index) };
        if entry & ENTRY_PRESENT != 0 {
            return Err(MapError::AlreadyMapped);
        }
        // SAFETY: in-bounds leaf entry write.
        unsafe {
            self.write_entry(
                pt,
                index,
                frame.start_address().as_u64() | encode_flags(flags),
            );
        }
        Ok(TlbFlush::new(virt))
    }

    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, TlbFlush), UnmapError> {
        let virt = page.start_address();
        // SAFETY: forwarded from the caller.
        let pt = unsafe { self.walk(root, virt)? };
        let index = virt.table_index(0);
        // SAFETY: `pt` is a valid page table.
        let entry = unsafe { self.read_entry(pt, index) };
        if entry & ENTRY_PRESENT == 0 {
            return Err(UnmapError::NotMapped);
        }
        // SAFETY: clearing a present leaf entry.
        unsafe { self.write_entry(pt, index, 0) };
        let frame =
            PhysFrame::containing_address(PhysAddr::new_truncate(entry & ENTRY_ADDR_MASK));
        Ok((frame, TlbFlush::new(virt)))
    }

    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        flags: PageFlags,
    ) -> Result<TlbFlush, UnmapError> {
        let virt = page.start_address();
        // SAFETY: forwarded from the caller.
        let pt = unsafe { self.walk(root, virt)? };
        let index = virt.table_index(0);
        // SAFETY: `pt` is a valid page table.
        let entry = unsafe { self.read_entry(pt, index) };
        if entry & ENTRY_PRESENT == 0 {
            return Err(UnmapError::NotMapped);
        }
        let addr = entry & ENTRY_ADDR_MASK;
        // SAFETY: rewriting a present leaf entry, address unchanged.
        unsafe { self.write_entry(pt, index, addr | encode_flags(flags)) };
        Ok(TlbFlush::new(virt))
    }

    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table = root;
        for level in (1..=3).rev() {
            let index = virt.table_index(level);
            // SAFETY: `table` is a valid table frame by induction from root.
            let entry = unsafe { self.read_entry(table, index) };
            if entry & ENTRY_PRESENT == 0 {
                return None;
            }
            if entry & ENTRY_HUGE != 0 {
                // 1 GiB (level 2) or 2 MiB (level 1) leaf.
                let size = 1u64 << (12 + 9 * level);
                let base = entry & ENTRY_ADDR_MASK & !(size - 1);
                return Some(PhysAddr::new_truncate(base + (virt.as_u64() & (size - 1))));
            }
            table = PhysAddr::new_truncate(entry & ENTRY_ADDR_MASK);
        }
        let index = virt.table_index(0);
        // SAFETY: `table` is now a valid page table.
        let entry = unsafe { self.read_entry(table, index) };
        if entry & ENTRY_PRESENT == 0 {
            return None;
        }
        Some(PhysAddr::new_truncate(
            (entry & ENTRY_ADDR_MASK) + virt.page_offset(),
        ))
    }

    unsafe fn release_user_tables(&self, root: PhysAddr, dealloc: FrameSink<'_>) {
        for i in 0..KERNEL_HALF_START {
            // SAFETY: `root` is a valid root table.
            let e3 = unsafe { self.read_entry(root, i) };
            if e3 & ENTRY_PRESENT == 0 {
                continue;
            }
            let pdpt = PhysAddr::new_truncate(e3 & ENTRY_ADDR_MASK);
            for j in 0..ENTRY_COUNT {
                // SAFETY: present non-huge entries link valid tables.
                let e2 = unsafe { self.read_entry(pdpt, j) };
                if e2 & ENTRY_PRESENT == 0 || e2 & ENTRY_HUGE != 0 {
                    continue;
                }
                let pd = PhysAddr::new_truncate(e2 & ENTRY_ADDR_MASK);
                for k in 0..ENTRY_COUNT {
                    // SAFETY: present non-huge entries link valid tables.
                    let e1 = unsafe { self.read_entry(pd, k) };
                    if e1 & ENTRY_PRESENT == 0 || e1 & ENTRY_HUGE != 0 {
                        continue;
                    }
                    dealloc(PhysFrame::containing_address(PhysAddr::new_truncate(
                        e1 & ENTRY_ADDR_MASK,
                    )));
                }
                dealloc(PhysFrame::containing_address(pd));
            }
            dealloc(PhysFrame::containing_address(pdpt));
            // SAFETY: clearing the root entry after its subtree is freed.
            unsafe { self.write_entry(root, i, 0) };
        }
    }

    unsafe fn frame_ptr(&self, frame: PhysFrame<Size4KiB>) -> *mut u8 {
        // SAFETY: forwarded to the caller.
        unsafe { self.mapper.ptr(frame.start_address()) }
    }
}

/// Single-page TLB invalidation, for [`crate::mapper::register_tlb_flush`].
pub fn flush_page(virt: VirtAddr) {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: invlpg only drops a TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    {
        let _ = virt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A little physical-memory arena: frame 0 is handed out first.
    struct Arena {
        memory: Vec<u8>,
        next: u64,
        frames: u64,
    }

    impl Arena {
        fn new(frames: u64) -> Self {
            Self {
                // Over-allocate so the arena can be aligned to 4 KiB.
                memory: vec![0u8; (frames as usize + 1) * 4096],
                next: 0,
                frames,
            }
        }

        fn base(&self) -> u64 {
            (self.memory.as_ptr() as u64 + 4095) & !4095
        }

        fn tables(&self) -> X86PageTables {
            X86PageTables::new(PhysMapper::new(self.base()))
        }

        fn alloc(&mut self) -> Option<PhysFrame<Size4KiB>> {
            if self.next == self.frames {
                return None;
            }
            let frame = PhysFrame::containing_address(PhysAddr::new(self.next * 4096));
            self.next += 1;
            Some(frame)
        }
    }

    fn page(addr: u64) -> Page<Size4KiB> {
        Page::from_start_address(VirtAddr::new(addr)).unwrap()
    }

    fn frame(addr: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::from_start_address(PhysAddr::new(addr)).unwrap()
    }

    #[test]
    fn map_translate_unmap() {
        let mut arena = Arena::new(16);
        let tables = arena.tables();
        let root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };

        unsafe {
            tables
                .map(
                    root,
                    page(0x40_0000),
                    frame(0xA000),
                    PageFlags::WRITABLE,
                    &mut || arena.alloc(),
                )
                .unwrap()
                .ignore();
        }

        let phys = unsafe { tables.translate(root, VirtAddr::new(0x40_0123)) };
        assert_eq!(phys, Some(PhysAddr::new(0xA123)));
        assert_eq!(unsafe { tables.translate(root, VirtAddr::new(0x41_0000)) }, None);

        let (freed, flush) = unsafe { tables.unmap(root, page(0x40_0000)).unwrap() };
        flush.ignore();
        assert_eq!(freed, frame(0xA000));
        assert_eq!(unsafe { tables.translate(root, VirtAddr::new(0x40_0123)) }, None);
    }

    #[test]
    fn double_map_rejected() {
        let mut arena = Arena::new(16);
        let tables = arena.tables();
        let root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        unsafe {
            tables
                .map(root, page(0x1000), frame(0x2000), PageFlags::empty(), &mut || {
                    arena.alloc()
                })
                .unwrap()
                .ignore();
            assert_eq!(
                tables
                    .map(root, page(0x1000), frame(0x3000), PageFlags::empty(), &mut || {
                        arena.alloc()
                    })
                    .unwrap_err(),
                MapError::AlreadyMapped
            );
        }
    }

    #[test]
    fn map_fails_when_arena_dry() {
        // One frame: the root eats it; mapping needs three more tables.
        let mut arena = Arena::new(1);
        let tables = arena.tables();
        let root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        let result = unsafe {
            tables.map(root, page(0x1000), frame(0x2000), PageFlags::empty(), &mut || {
                arena.alloc()
            })
        };
        assert_eq!(result.unwrap_err(), MapError::TableAllocFailed);
    }

    #[test]
    fn unmap_unmapped_is_not_mapped() {
        let mut arena = Arena::new(8);
        let tables = arena.tables();
        let root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        assert_eq!(
            unsafe { tables.unmap(root, page(0x1000)) }.unwrap_err(),
            UnmapError::NotMapped
        );
    }

    #[test]
    fn update_flags_preserves_address() {
        let mut arena = Arena::new(16);
        let tables = arena.tables();
        let root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        unsafe {
            tables
                .map(root, page(0x1000), frame(0x5000), PageFlags::WRITABLE, &mut || {
                    arena.alloc()
                })
                .unwrap()
                .ignore();
            tables
                .update_flags(root, page(0x1000), PageFlags::empty())
                .unwrap()
                .ignore();
        }
        assert_eq!(
            unsafe { tables.translate(root, VirtAddr::new(0x1004)) },
            Some(PhysAddr::new(0x5004))
        );
    }

    #[test]
    fn kernel_half_is_shared_into_new_roots() {
        let mut arena = Arena::new(32);
        let tables = arena.tables();
        let kernel_root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        let kernel_addr = VirtAddr::new(0xFFFF_8000_0000_0000);
        unsafe {
            tables
                .map(
                    kernel_root,
                    Page::from_start_address(kernel_addr).unwrap(),
                    frame(0x7000),
                    PageFlags::WRITABLE | PageFlags::GLOBAL,
                    &mut || arena.alloc(),
                )
                .unwrap()
                .ignore();
        }

        let user_root = unsafe {
            tables
                .create_root(Some(kernel_root), &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        // The kernel mapping resolves identically through the user root.
        assert_eq!(
            unsafe { tables.translate(user_root, kernel_addr + 0x42) },
            Some(PhysAddr::new(0x7042))
        );
    }

    #[test]
    fn release_user_tables_returns_intermediates_and_keeps_kernel_half() {
        let mut arena = Arena::new(32);
        let tables = arena.tables();
        let kernel_root = unsafe {
            tables
                .create_root(None, &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        unsafe {
            tables
                .map(
                    kernel_root,
                    Page::from_start_address(VirtAddr::new(0xFFFF_8000_0000_0000)).unwrap(),
                    frame(0x7000),
                    PageFlags::WRITABLE,
                    &mut || arena.alloc(),
                )
                .unwrap()
                .ignore();
        }
        let user_root = unsafe {
            tables
                .create_root(Some(kernel_root), &mut || arena.alloc())
                .unwrap()
                .start_address()
        };
        unsafe {
            tables
                .map(user_root, page(0x40_0000), frame(0xA000), PageFlags::USER, &mut || {
                    arena.alloc()
                })
                .unwrap()
                .ignore();
        }

        let mut freed = Vec::new();
        unsafe { tables.release_user_tables(user_root, &mut |f| freed.push(f)) };
        // Three intermediate tables for the single user mapping.
        assert_eq!(freed.len(), 3);
        assert_eq!(unsafe { tables.translate(user_root, VirtAddr::new(0x40_0000)) }, None);
        // The kernel half is untouched.
        assert_eq!(
            unsafe { tables.translate(user_root, VirtAddr::new(0xFFFF_8000_0000_0000)) },
            Some(PhysAddr::new(0x7000))
        );
    }
}
