//! The memory manager.
//!
//! [`MemoryManager`] is an explicitly constructed context object — there is
//! no hidden global. It owns the physical frame allocator, the kernel's own
//! address space, and an arena of user [`AddressSpace`] slots addressed by
//! generation-checked [`AddressSpaceHandle`]s: a handle to a torn-down space
//! fails with `RegionError::StaleHandle` instead of touching reused memory.
//!
//! The manager itself is not a lock; callers wrap it in a
//! `SpinlockProtected` ranked `LockRank::MemoryManager` (or hold it uniquely
//! during bring-up and tests).

use alloc::vec::Vec;
use core::fmt;

use helium_core::addr::{PhysAddr, VirtAddr};
use helium_core::paging::{Page, PageSize, PhysFrame, Size4KiB};
use helium_core::{kdebug, kwarn};

use crate::fault::{PageFault, PageFaultResponse};
use crate::mapper::{MapError, PageFlags, PageTables};
use crate::page_directory::PageDirectory;
use crate::phys::BitmapFrameAllocator;
use crate::region::{
    AllocationStrategy, Region, RegionAccess, RegionBacking, RegionError, RegionSet,
};
use crate::{PAGE_SIZE, ProcessId};

/// A generation-checked reference to an address space slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceHandle {
    index: u32,
    generation: u32,
}

/// One address space: a page directory plus its region set.
pub struct AddressSpace {
    directory: PageDirectory,
    regions: RegionSet,
}

impl AddressSpace {
    /// The space's page directory.
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    /// The space's regions.
    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }
}

struct Slot {
    generation: u32,
    space: Option<AddressSpace>,
}

/// Error from a page provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderError;

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backing store could not produce the page")
    }
}

/// Source of page contents for file- and shared-backed regions.
///
/// Implemented by the VFS / shared-memory collaborator and passed into
/// [`MemoryManager::handle_page_fault`]. A failure becomes a
/// [`PageFaultResponse::BusError`].
pub trait PageProvider {
    /// Fills `dst` (one page) with the content at `offset` bytes into the
    /// backing object.
    fn provide_page(
        &mut self,
        backing: &RegionBacking,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), ProviderError>;
}

/// The kernel's memory management context.
pub struct MemoryManager<PT: PageTables> {
    tables: PT,
    frames: BitmapFrameAllocator,
    kernel: AddressSpace,
    slots: Vec<Slot>,
}

impl<PT: PageTables> MemoryManager<PT> {
    /// Creates a manager over the given backend and frame allocator,
    /// building the kernel's own (initially empty) address space.
    pub fn new(tables: PT, mut frames: BitmapFrameAllocator) -> Result<Self, RegionError> {
        let directory = PageDirectory::new_kernel(&tables, &mut || frames.allocate_frame())
            .map_err(map_to_region_error)?;
        Ok(Self {
            tables,
            frames,
            kernel: AddressSpace {
                directory,
                regions: RegionSet::new(),
            },
            slots: Vec::new(),
        })
    }

    /// Physical root of the kernel's page directory.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel.directory.root_phys()
    }

    /// The kernel's address space.
    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    /// The frame allocator (accounting queries).
    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    // -- address space lifecycle ---------------------------------------------

    /// Creates an empty address space for `owner`, sharing the kernel half.
    pub fn create_address_space(
        &mut self,
        owner: ProcessId,
    ) -> Result<AddressSpaceHandle, RegionError> {
        let tables = &self.tables;
        let frames = &mut self.frames;
        let directory =
            PageDirectory::new_user(tables, &self.kernel.directory, owner, &mut || {
                frames.allocate_frame()
            })
            .map_err(map_to_region_error)?;
        let space = AddressSpace {
            directory,
            regions: RegionSet::new(),
        };

        let index = match self.slots.iter().position(|slot| slot.space.is_none()) {
            Some(free) => {
                self.slots[free].space = Some(space);
                free
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    space: Some(space),
                });
                self.slots.len() - 1
            }
        };
        kdebug!("mm: created address space {index} for {owner:?}");
        Ok(AddressSpaceHandle {
            index: index as u32,
            generation: self.slots[index].generation,
        })
    }

    /// Tears an address space down: unmaps and frees every region's
    /// resident frames, releases commit reservations, then destroys the
    /// directory. The handle (and any copy of it) becomes stale.
    pub fn teardown_address_space(
        &mut self,
        handle: AddressSpaceHandle,
    ) -> Result<(), RegionError> {
        let index = self.resolve(handle)?;
        let tables = &self.tables;
        let frames = &mut self.frames;
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let mut space = slot.space.take().ok_or(RegionError::StaleHandle)?;

        for region in space.regions.take_all() {
            release_region(tables, frames, &space.directory, &region);
        }
        space
            .directory
            .release(tables, &mut |frame| {
                // SAFETY: table frames came from this allocator and are no
                // longer referenced.
                unsafe { frames.deallocate_frame(frame) };
            });
        kdebug!("mm: tore down address space {index}");
        Ok(())
    }

    // -- regions ---------------------------------------------------------------

    /// Creates a region in a user address space.
    ///
    /// `AllocateNow` commits and maps every page before returning (frames
    /// zero-filled); `Reserve` records a commit reservation only; `None`
    /// records just the region.
    pub fn map_region(
        &mut self,
        handle: AddressSpaceHandle,
        start: VirtAddr,
        size: u64,
        access: RegionAccess,
        strategy: AllocationStrategy,
        backing: RegionBacking,
    ) -> Result<(), RegionError> {
        let index = self.resolve(handle)?;
        let space = self.slots[index]
            .space
            .as_mut()
            .ok_or(RegionError::StaleHandle)?;
        map_region_in(
            &self.tables,
            &mut self.frames,
            space,
            start,
            size,
            access,
            strategy,
            backing,
        )
    }

    /// Creates a region in the kernel's own address space.
    pub fn map_kernel_region(
        &mut self,
        start: VirtAddr,
        size: u64,
        access: RegionAccess,
        strategy: AllocationStrategy,
    ) -> Result<(), RegionError> {
        map_region_in(
            &self.tables,
            &mut self.frames,
            &mut self.kernel,
            start,
            size,
            access,
            strategy,
            RegionBacking::Anonymous,
        )
    }

    /// Removes the region starting at `start`, unmapping and freeing its
    /// resident frames and returning unredeemed reservations.
    pub fn unmap_region(
        &mut self,
        handle: AddressSpaceHandle,
        start: VirtAddr,
    ) -> Result<(), RegionError> {
        let index = self.resolve(handle)?;
        let tables = &self.tables;
        let frames = &mut self.frames;
        let space = self.slots[index]
            .space
            .as_mut()
            .ok_or(RegionError::StaleHandle)?;
        let region = space.regions.remove(start).ok_or(RegionError::NotFound)?;
        release_region(tables, frames, &space.directory, &region);
        Ok(())
    }

    // -- faults ------------------------------------------------------------

    /// The page-fault decision procedure.
    ///
    /// Deterministic for unchanged state: the same fault against the same
    /// manager state yields the same response.
    pub fn handle_page_fault(
        &mut self,
        handle: AddressSpaceHandle,
        fault: &PageFault,
        mut provider: Option<&mut dyn PageProvider>,
    ) -> PageFaultResponse {
        let Ok(index) = self.resolve(handle) else {
            kwarn!("mm: page fault at {} in stale address space", fault.address);
            return PageFaultResponse::ShouldCrash;
        };
        let tables = &self.tables;
        let frames = &mut self.frames;
        let Some(space) = self.slots[index].space.as_mut() else {
            return PageFaultResponse::ShouldCrash;
        };

        // User mode never demand-pages the kernel half; those mappings are
        // shared into the space but are not part of its layout. Kernel-mode
        // faults on user regions are legitimate (user-copy paths) and take
        // the normal path below.
        if fault.from_user && fault.address.is_kernel() {
            kwarn!("mm: user-mode fault at kernel address {}", fault.address);
            return PageFaultResponse::ShouldCrash;
        }

        // No owning region: the access is outside the layout.
        let Some(region) = space.regions.find_containing_mut(fault.address) else {
            return PageFaultResponse::ShouldCrash;
        };
        // Present but forbidden: a protection violation, not a missing page.
        if !region.access().allows(fault.access) {
            return PageFaultResponse::ShouldCrash;
        }

        let page_index = region.page_index(fault.address);
        if region.is_resident(page_index) {
            // Raced with another CPU resolving the same fault, or a stale
            // TLB entry; the mapping is in place, just retry.
            return PageFaultResponse::Continue;
        }

        // A hole: nothing was promised and nothing backs it.
        if matches!(region.strategy(), AllocationStrategy::None)
            && matches!(region.backing(), RegionBacking::Anonymous)
        {
            return PageFaultResponse::BusError;
        }

        let Some(frame) = frames.allocate_frame() else {
            return PageFaultResponse::OutOfMemory;
        };
        // SAFETY: freshly allocated frame, exclusively ours.
        let contents = unsafe {
            core::slice::from_raw_parts_mut(tables.frame_ptr(frame), PAGE_SIZE)
        };
        match region.backing() {
            RegionBacking::Anonymous => contents.fill(0),
            backing @ (RegionBacking::File { .. } | RegionBacking::Shared { .. }) => {
                let Some(provider) = provider.as_deref_mut() else {
                    // SAFETY: unmapped, just allocated.
                    unsafe { frames.deallocate_frame(frame) };
                    return PageFaultResponse::BusError;
                };
                let offset = backing_offset(&backing, page_index);
                if provider.provide_page(&backing, offset, contents).is_err() {
                    // SAFETY: unmapped, just allocated.
                    unsafe { frames.deallocate_frame(frame) };
                    return PageFaultResponse::BusError;
                }
            }
        }

        let page = Page::containing_address(fault.address);
        let flags = page_flags(region.access(), space.directory.owner().is_some());
        match space
            .directory
            .map_page(tables, page, frame, flags, &mut || frames.allocate_frame())
        {
            Ok(()) => {}
            Err(MapError::TableAllocFailed) => {
                // SAFETY: unmapped, just allocated.
                unsafe { frames.deallocate_frame(frame) };
                return PageFaultResponse::OutOfMemory;
            }
            Err(MapError::AlreadyMapped) => {
                // The residency bitmap and the tables disagree; that is a
                // kernel bug, not a recoverable fault.
                kwarn!("mm: table entry exists for non-resident page at {}", fault.address);
                // SAFETY: unmapped, just allocated.
                unsafe { frames.deallocate_frame(frame) };
                return PageFaultResponse::ShouldCrash;
            }
        }
        region.set_resident(page_index);
        if matches!(region.strategy(), AllocationStrategy::Reserve) {
            // The promise is redeemed by the allocation above.
            frames.unreserve(1);
        }
        PageFaultResponse::Continue
    }

    // -- queries -------------------------------------------------------------

    /// The address space behind `handle`.
    pub fn space(&self, handle: AddressSpaceHandle) -> Result<&AddressSpace, RegionError> {
        let index = self.resolve(handle)?;
        self.slots[index]
            .space
            .as_ref()
            .ok_or(RegionError::StaleHandle)
    }

    /// Translates `virt` through an address space's directory.
    pub fn physical_address_of(
        &self,
        handle: AddressSpaceHandle,
        virt: VirtAddr,
    ) -> Result<Option<PhysAddr>, RegionError> {
        let space = self.space(handle)?;
        Ok(space.directory.translate(&self.tables, virt))
    }

    /// Translates `virt` through the kernel directory.
    pub fn kernel_physical_address(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.kernel.directory.translate(&self.tables, virt)
    }

    fn resolve(&self, handle: AddressSpaceHandle) -> Result<usize, RegionError> {
        let index = handle.index as usize;
        let slot = self.slots.get(index).ok_or(RegionError::StaleHandle)?;
        if slot.generation != handle.generation || slot.space.is_none() {
            return Err(RegionError::StaleHandle);
        }
        Ok(index)
    }
}

/// Converts region access into mapping flags.
fn page_flags(access: RegionAccess, user: bool) -> PageFlags {
    let mut flags = PageFlags::empty();
    if access.contains(RegionAccess::WRITE) {
        flags |= PageFlags::WRITABLE;
    }
    if access.contains(RegionAccess::EXECUTE) {
        flags |= PageFlags::EXECUTABLE;
    }
    if user {
        flags |= PageFlags::USER;
    } else {
        flags |= PageFlags::GLOBAL;
    }
    flags
}

/// Byte offset into the backing object for a region page.
fn backing_offset(backing: &RegionBacking, page_index: usize) -> u64 {
    let page_bytes = page_index as u64 * Size4KiB::SIZE;
    match backing {
        RegionBacking::File { offset, .. } => offset + page_bytes,
        _ => page_bytes,
    }
}

fn map_to_region_error(err: MapError) -> RegionError {
    match err {
        MapError::TableAllocFailed => RegionError::OutOfMemory,
        // A fresh root cannot collide with an existing mapping.
        MapError::AlreadyMapped => RegionError::Overlap,
    }
}

/// Unmaps and frees a removed region's resident frames and returns its
/// unredeemed reservations.
fn release_region<PT: PageTables>(
    tables: &PT,
    frames: &mut BitmapFrameAllocator,
    directory: &PageDirectory,
    region: &Region,
) {
    for page_index in region.resident_page_indices() {
        let page = Page::containing_address(
            region.start() + page_index as u64 * Size4KiB::SIZE,
        );
        match directory.unmap_page(tables, page) {
            Ok(frame) => {
                // SAFETY: just unmapped; the region owned this frame.
                unsafe { frames.deallocate_frame(frame) };
            }
            Err(err) => {
                kwarn!("mm: resident page {page:?} failed to unmap: {err}");
            }
        }
    }
    if matches!(region.strategy(), AllocationStrategy::Reserve) {
        frames.unreserve(region.page_count() - region.resident_pages());
    }
}

/// Shared implementation of region creation for kernel and user spaces.
#[allow(clippy::too_many_arguments)]
fn map_region_in<PT: PageTables>(
    tables: &PT,
    frames: &mut BitmapFrameAllocator,
    space: &mut AddressSpace,
    start: VirtAddr,
    size: u64,
    access: RegionAccess,
    strategy: AllocationStrategy,
    backing: RegionBacking,
) -> Result<(), RegionError> {
    let mut region = Region::new(start, size, access, strategy, backing)?;
    space.regions.check_overlap(region.start(), region.size())?;

    match strategy {
        AllocationStrategy::AllocateNow => {
            let pages = region.page_count();
            // Take all data frames up front so a partial failure has one
            // rollback path.
            let mut data_frames: Vec<PhysFrame<Size4KiB>> = Vec::with_capacity(pages);
            for _ in 0..pages {
                match frames.allocate_frame() {
                    Some(frame) => data_frames.push(frame),
                    None => {
                        for frame in data_frames {
                            // SAFETY: never mapped.
                            unsafe { frames.deallocate_frame(frame) };
                        }
                        return Err(RegionError::OutOfMemory);
                    }
                }
            }
            let flags = page_flags(access, space.directory.owner().is_some());
            for (page_index, frame) in data_frames.iter().enumerate() {
                // SAFETY: freshly allocated frame, exclusively ours.
                unsafe {
                    core::slice::from_raw_parts_mut(tables.frame_ptr(*frame), PAGE_SIZE)
                        .fill(0);
                }
                let page = Page::containing_address(
                    start + page_index as u64 * Size4KiB::SIZE,
                );
                if let Err(err) = space.directory.map_page(tables, page, *frame, flags, &mut || {
                    frames.allocate_frame()
                }) {
                    // Roll back everything mapped so far, then the rest.
                    release_region(tables, frames, &space.directory, &region);
                    for unmapped in &data_frames[page_index..] {
                        // SAFETY: never mapped.
                        unsafe { frames.deallocate_frame(*unmapped) };
                    }
                    return Err(map_to_region_error(err));
                }
                region.set_resident(page_index);
            }
        }
        AllocationStrategy::Reserve => {
            frames
                .reserve(region.page_count())
                .map_err(|_| RegionError::OutOfMemory)?;
        }
        AllocationStrategy::None => {}
    }

    space.regions.insert(region)
}
