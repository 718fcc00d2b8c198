//! Virtual memory regions.
//!
//! A [`Region`] is a page-aligned span of one address space with an access
//! policy, a population strategy, a backing source, and a per-page residency
//! bitmap (which pages actually have a frame). Regions never overlap inside
//! a [`RegionSet`]; insertion enforces that deterministically.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use helium_core::addr::VirtAddr;
use helium_core::paging::{PageSize, Size4KiB};

use crate::fault::FaultAccess;

bitflags::bitflags! {
    /// What a region permits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionAccess: u8 {
        /// Loads are allowed.
        const READ    = 1 << 0;
        /// Stores are allowed.
        const WRITE   = 1 << 1;
        /// Instruction fetch is allowed.
        const EXECUTE = 1 << 2;
    }
}

impl RegionAccess {
    /// Returns `true` if the region permits the given kind of access.
    pub fn allows(self, access: FaultAccess) -> bool {
        match access {
            FaultAccess::Read => self.contains(Self::READ),
            FaultAccess::Write => self.contains(Self::WRITE),
            FaultAccess::Execute => self.contains(Self::EXECUTE),
        }
    }
}

/// When a region's pages get physical frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Every page is allocated and mapped before region creation returns.
    AllocateNow,
    /// Frames are promised in the commit ledger now, allocated at first
    /// touch.
    Reserve,
    /// Nothing is promised or allocated; touching an anonymous page here is
    /// an error.
    None,
}

/// Identifier of a filesystem vnode. Opaque to memory management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VnodeId(pub u64);

/// Where a region's page contents come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionBacking {
    /// Zero-filled memory.
    Anonymous,
    /// Pages read from a file through the registered page provider.
    File {
        /// The backing vnode.
        vnode: VnodeId,
        /// Byte offset of the region's first page within the vnode.
        offset: u64,
    },
    /// Pages of a named shared memory object, also served by the provider.
    Shared {
        /// The shared object handle.
        handle: u64,
    },
}

/// Error from region and address-space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// Start or size is not page aligned.
    Unaligned,
    /// The region would be empty.
    ZeroSize,
    /// The range intersects an existing region.
    Overlap,
    /// No region with that start address exists.
    NotFound,
    /// The address-space handle refers to a torn-down space.
    StaleHandle,
    /// The frame allocator (or its commit ledger) is exhausted.
    OutOfMemory,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned => write!(f, "region is not page aligned"),
            Self::ZeroSize => write!(f, "region is empty"),
            Self::Overlap => write!(f, "region overlaps an existing region"),
            Self::NotFound => write!(f, "no such region"),
            Self::StaleHandle => write!(f, "address space handle is stale"),
            Self::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// One span of an address space.
pub struct Region {
    start: VirtAddr,
    size: u64,
    access: RegionAccess,
    strategy: AllocationStrategy,
    backing: RegionBacking,
    /// One bit per page; set means a frame is mapped.
    resident: Vec<u64>,
    resident_count: usize,
}

impl Region {
    /// Creates a region covering `[start, start + size)`.
    pub fn new(
        start: VirtAddr,
        size: u64,
        access: RegionAccess,
        strategy: AllocationStrategy,
        backing: RegionBacking,
    ) -> Result<Self, RegionError> {
        if size == 0 {
            return Err(RegionError::ZeroSize);
        }
        if !start.is_aligned(Size4KiB::SIZE) || size % Size4KiB::SIZE != 0 {
            return Err(RegionError::Unaligned);
        }
        let pages = (size / Size4KiB::SIZE) as usize;
        Ok(Self {
            start,
            size,
            access,
            strategy,
            backing,
            resident: vec![0u64; pages.div_ceil(64)],
            resident_count: 0,
        })
    }

    /// First address of the region.
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// One past the last address of the region.
    ///
    /// Wraps to zero for a region ending at the top of the address space;
    /// range arithmetic elsewhere works on `start` and `size` for that
    /// reason.
    pub fn end(&self) -> VirtAddr {
        self.start + self.size
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        (self.size / Size4KiB::SIZE) as usize
    }

    /// The region's access policy.
    pub fn access(&self) -> RegionAccess {
        self.access
    }

    /// The region's population strategy.
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// The region's backing source.
    pub fn backing(&self) -> RegionBacking {
        self.backing
    }

    /// Returns `true` if `addr` falls inside the region.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        // Subtraction, not `start + size`: the end of a region at the top of
        // the address space does not fit in a u64.
        addr >= self.start && addr.as_u64() - self.start.as_u64() < self.size
    }

    /// Page index of `addr` within the region. `addr` must be contained.
    pub fn page_index(&self, addr: VirtAddr) -> usize {
        debug_assert!(self.contains(addr));
        ((addr - self.start) / Size4KiB::SIZE) as usize
    }

    /// Returns `true` if the page at `index` has a mapped frame.
    pub fn is_resident(&self, index: usize) -> bool {
        self.resident[index / 64] & (1 << (index % 64)) != 0
    }

    pub(crate) fn set_resident(&mut self, index: usize) {
        debug_assert!(!self.is_resident(index));
        self.resident[index / 64] |= 1 << (index % 64);
        self.resident_count += 1;
    }

    /// Number of pages with a mapped frame.
    pub fn resident_pages(&self) -> usize {
        self.resident_count
    }

    /// Bytes of physical memory currently backing the region.
    pub fn physical_backing_bytes(&self) -> u64 {
        self.resident_count as u64 * Size4KiB::SIZE
    }

    /// Iterates the indices of resident pages.
    pub fn resident_page_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.page_count()).filter(|&i| self.is_resident(i))
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("start", &self.start)
            .field("size", &self.size)
            .field("access", &self.access)
            .field("strategy", &self.strategy)
            .field("backing", &self.backing)
            .field("resident", &self.resident_count)
            .finish()
    }
}

/// The non-overlapping set of regions of one address space, keyed by start
/// address.
#[derive(Default)]
pub struct RegionSet {
    regions: BTreeMap<u64, Region>,
}

impl RegionSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Checks that `[start, start + size)` intersects no existing region.
    ///
    /// Distances, not end addresses, so regions reaching the top of the
    /// address space compare correctly.
    pub fn check_overlap(&self, start: VirtAddr, size: u64) -> Result<(), RegionError> {
        // Closest region starting at or below `start`.
        if let Some((_, below)) = self.regions.range(..=start.as_u64()).next_back() {
            if start.as_u64() - below.start().as_u64() < below.size() {
                return Err(RegionError::Overlap);
            }
        }
        // Closest region starting above `start`.
        if let Some((&above_start, _)) = self.regions.range(start.as_u64() + 1..).next() {
            if above_start - start.as_u64() < size {
                return Err(RegionError::Overlap);
            }
        }
        Ok(())
    }

    /// Inserts a region, failing on any overlap.
    pub fn insert(&mut self, region: Region) -> Result<(), RegionError> {
        self.check_overlap(region.start(), region.size())?;
        self.regions.insert(region.start().as_u64(), region);
        Ok(())
    }

    /// Removes and returns the region starting exactly at `start`.
    pub fn remove(&mut self, start: VirtAddr) -> Option<Region> {
        self.regions.remove(&start.as_u64())
    }

    /// Finds the region containing `addr`.
    pub fn find_containing(&self, addr: VirtAddr) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr.as_u64()).next_back()?;
        region.contains(addr).then_some(region)
    }

    /// Finds the region containing `addr`, mutably.
    pub fn find_containing_mut(&mut self, addr: VirtAddr) -> Option<&mut Region> {
        let (_, region) = self.regions.range_mut(..=addr.as_u64()).next_back()?;
        region.contains(addr).then_some(region)
    }

    /// Iterates all regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Removes and returns all regions, for address-space teardown.
    pub fn take_all(&mut self) -> impl Iterator<Item = Region> {
        core::mem::take(&mut self.regions).into_values()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` if the set has no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
