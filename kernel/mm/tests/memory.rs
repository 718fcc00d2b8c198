//! End-to-end memory management tests.
//!
//! The harness stands in for early boot: a leaked heap block plays the part
//! of physical memory (physical address 0 lands at the block's base, which
//! is also the direct-map offset handed to the x86_64 backend), and a bitmap
//! allocator hands out its frames. Everything above that is the real code
//! under test.

use helium_core::addr::{PhysAddr, VirtAddr};
use helium_core::processor::Processor;
use helium_mm::ProcessId;
use helium_mm::arch::x86_64::{PhysMapper, X86PageTables};
use helium_mm::fault::{FaultAccess, PageFault, PageFaultResponse};
use helium_mm::manager::{AddressSpaceHandle, MemoryManager, PageProvider, ProviderError};
use helium_mm::phys::BitmapFrameAllocator;
use helium_mm::region::{AllocationStrategy, RegionAccess, RegionBacking, RegionError, VnodeId};
use helium_mm::switch::ProcessPagingScope;

const PAGE: u64 = 4096;

/// A manager over `frames` frames of leaked host memory, plus the host
/// address where physical address 0 lives.
fn manager(frames: usize) -> (MemoryManager<X86PageTables>, u64) {
    let memory = Box::leak(vec![0u8; (frames + 1) * PAGE as usize].into_boxed_slice());
    let host_base = (memory.as_ptr() as u64 + PAGE - 1) & !(PAGE - 1);
    let tables = X86PageTables::new(PhysMapper::new(host_base));

    let storage = Box::leak(vec![0u64; frames.div_ceil(64)].into_boxed_slice());
    // SAFETY: the window is backed by the leaked block above.
    let pmm = unsafe { BitmapFrameAllocator::new(storage, PhysAddr::new(0), frames) };
    (MemoryManager::new(tables, pmm).unwrap(), host_base)
}

fn write_fault(address: u64) -> PageFault {
    PageFault {
        address: VirtAddr::new(address),
        access: FaultAccess::Write,
        from_user: true,
    }
}

fn read_fault(address: u64) -> PageFault {
    PageFault {
        address: VirtAddr::new(address),
        access: FaultAccess::Read,
        from_user: true,
    }
}

fn region_backing_bytes(
    mm: &MemoryManager<X86PageTables>,
    handle: AddressSpaceHandle,
    start: u64,
) -> u64 {
    mm.space(handle)
        .unwrap()
        .regions()
        .find_containing(VirtAddr::new(start))
        .unwrap()
        .physical_backing_bytes()
}

#[test]
fn reserve_fault_populates_one_page() {
    let (mut mm, _) = manager(64);
    let handle = mm.create_address_space(ProcessId(1)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        4 * PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::Reserve,
        RegionBacking::Anonymous,
    )
    .unwrap();
    assert_eq!(region_backing_bytes(&mm, handle, 0x40_0000), 0);
    assert_eq!(mm.frames().committed_frames(), 4);

    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x40_1500), None),
        PageFaultResponse::Continue
    );
    // Exactly the touched page is now backed, the promise redeemed.
    assert_eq!(region_backing_bytes(&mm, handle, 0x40_0000), PAGE);
    assert_eq!(mm.frames().committed_frames(), 3);
    let phys = mm
        .physical_address_of(handle, VirtAddr::new(0x40_1500))
        .unwrap()
        .expect("faulted page must be mapped");
    assert_eq!(phys.as_u64() % PAGE, 0x500);

    // A repeat fault on the same page is a benign race: resolved without
    // another frame.
    let free = mm.frames().free_frames();
    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x40_1000), None),
        PageFaultResponse::Continue
    );
    assert_eq!(mm.frames().free_frames(), free);
}

#[test]
fn fault_outside_any_region_crashes() {
    let (mut mm, _) = manager(32);
    let handle = mm.create_address_space(ProcessId(2)).unwrap();
    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x9000), None),
        PageFaultResponse::ShouldCrash
    );
}

#[test]
fn access_violation_crashes() {
    let (mut mm, _) = manager(32);
    let handle = mm.create_address_space(ProcessId(3)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        PAGE,
        RegionAccess::READ,
        AllocationStrategy::Reserve,
        RegionBacking::Anonymous,
    )
    .unwrap();

    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x40_0000), None),
        PageFaultResponse::ShouldCrash
    );
    let exec = PageFault {
        address: VirtAddr::new(0x40_0000),
        access: FaultAccess::Execute,
        from_user: true,
    };
    assert_eq!(
        mm.handle_page_fault(handle, &exec, None),
        PageFaultResponse::ShouldCrash
    );
    // The permitted access still works.
    assert_eq!(
        mm.handle_page_fault(handle, &read_fault(0x40_0000), None),
        PageFaultResponse::Continue
    );
}

#[test]
fn reserve_fault_reports_exhaustion() {
    let (mut mm, _) = manager(16);
    let handle = mm.create_address_space(ProcessId(4)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::Reserve,
        RegionBacking::Anonymous,
    )
    .unwrap();

    // Drain physical memory with eagerly backed pages in the same 2 MiB
    // window, so the reserved page's fault needs exactly one frame.
    let mut next = 0x40_1000;
    while mm.frames().free_frames() > 0 {
        mm.map_region(
            handle,
            VirtAddr::new(next),
            PAGE,
            RegionAccess::READ | RegionAccess::WRITE,
            AllocationStrategy::AllocateNow,
            RegionBacking::Anonymous,
        )
        .unwrap();
        next += PAGE;
    }

    // The ledger's promise could not be pinned to a frame; the fault path
    // must say so rather than crash the process.
    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x40_0000), None),
        PageFaultResponse::OutOfMemory
    );
}

#[test]
fn reserve_refuses_overcommit_up_front() {
    let (mut mm, _) = manager(16);
    let handle = mm.create_address_space(ProcessId(5)).unwrap();
    let free = mm.frames().free_frames() as u64;
    assert_eq!(
        mm.map_region(
            handle,
            VirtAddr::new(0x40_0000),
            (free + 1) * PAGE,
            RegionAccess::READ,
            AllocationStrategy::Reserve,
            RegionBacking::Anonymous,
        ),
        Err(RegionError::OutOfMemory)
    );
    // The failed promise left no trace.
    assert_eq!(mm.frames().committed_frames(), 0);
    assert!(mm.space(handle).unwrap().regions().is_empty());
}

#[test]
fn allocate_now_is_immediately_backed_and_zeroed() {
    let (mut mm, host_base) = manager(64);
    let handle = mm.create_address_space(ProcessId(6)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        3 * PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::AllocateNow,
        RegionBacking::Anonymous,
    )
    .unwrap();

    assert_eq!(region_backing_bytes(&mm, handle, 0x40_0000), 3 * PAGE);
    for page in 0..3u64 {
        let virt = VirtAddr::new(0x40_0000 + page * PAGE);
        let phys = mm
            .physical_address_of(handle, virt)
            .unwrap()
            .expect("eagerly backed page must be mapped");
        // SAFETY: the harness block backs every physical frame.
        let contents =
            unsafe { std::slice::from_raw_parts((host_base + phys.as_u64()) as *const u8, 4096) };
        assert!(contents.iter().all(|&b| b == 0), "page {page} not zeroed");
    }
    // Eager backing consumed no commit ledger.
    assert_eq!(mm.frames().committed_frames(), 0);
}

#[test]
fn unbacked_hole_is_a_bus_error() {
    let (mut mm, _) = manager(32);
    let handle = mm.create_address_space(ProcessId(7)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::None,
        RegionBacking::Anonymous,
    )
    .unwrap();
    assert_eq!(
        mm.handle_page_fault(handle, &read_fault(0x40_0000), None),
        PageFaultResponse::BusError
    );
}

/// Serves pages whose bytes encode the backing offset, and can be switched
/// to fail.
struct PatternProvider {
    calls: Vec<u64>,
    fail: bool,
}

impl PageProvider for PatternProvider {
    fn provide_page(
        &mut self,
        _backing: &RegionBacking,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), ProviderError> {
        if self.fail {
            return Err(ProviderError);
        }
        self.calls.push(offset);
        let marker = (offset / PAGE) as u8;
        dst.fill(marker);
        Ok(())
    }
}

#[test]
fn file_backed_pages_come_from_the_provider() {
    let (mut mm, host_base) = manager(64);
    let handle = mm.create_address_space(ProcessId(8)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        2 * PAGE,
        RegionAccess::READ,
        AllocationStrategy::None,
        RegionBacking::File {
            vnode: VnodeId(3),
            offset: 2 * PAGE,
        },
    )
    .unwrap();

    let mut provider = PatternProvider {
        calls: Vec::new(),
        fail: false,
    };
    // Touch the second page: file offset = region offset + one page.
    assert_eq!(
        mm.handle_page_fault(handle, &read_fault(0x40_1000), Some(&mut provider)),
        PageFaultResponse::Continue
    );
    assert_eq!(provider.calls, vec![3 * PAGE]);

    let phys = mm
        .physical_address_of(handle, VirtAddr::new(0x40_1000))
        .unwrap()
        .unwrap();
    // SAFETY: the harness block backs every physical frame.
    let contents =
        unsafe { std::slice::from_raw_parts((host_base + phys.as_u64()) as *const u8, 4096) };
    assert!(contents.iter().all(|&b| b == 3));
}

#[test]
fn provider_failure_is_a_bus_error_without_leaking() {
    let (mut mm, _) = manager(32);
    let handle = mm.create_address_space(ProcessId(9)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        PAGE,
        RegionAccess::READ,
        AllocationStrategy::None,
        RegionBacking::Shared { handle: 11 },
    )
    .unwrap();

    let free = mm.frames().free_frames();
    let mut provider = PatternProvider {
        calls: Vec::new(),
        fail: true,
    };
    assert_eq!(
        mm.handle_page_fault(handle, &read_fault(0x40_0000), Some(&mut provider)),
        PageFaultResponse::BusError
    );
    // No provider at all reads the same way.
    assert_eq!(
        mm.handle_page_fault(handle, &read_fault(0x40_0000), None),
        PageFaultResponse::BusError
    );
    assert_eq!(mm.frames().free_frames(), free);
    assert_eq!(region_backing_bytes(&mm, handle, 0x40_0000), 0);
}

#[test]
fn overlapping_regions_are_rejected() {
    let (mut mm, _) = manager(32);
    let handle = mm.create_address_space(ProcessId(10)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        4 * PAGE,
        RegionAccess::READ,
        AllocationStrategy::None,
        RegionBacking::Anonymous,
    )
    .unwrap();
    assert_eq!(
        mm.map_region(
            handle,
            VirtAddr::new(0x40_2000),
            4 * PAGE,
            RegionAccess::READ,
            AllocationStrategy::Reserve,
            RegionBacking::Anonymous,
        ),
        Err(RegionError::Overlap)
    );
    assert_eq!(mm.frames().committed_frames(), 0);
}

#[test]
fn unmap_region_returns_frames_and_promises() {
    let (mut mm, _) = manager(64);
    let handle = mm.create_address_space(ProcessId(11)).unwrap();
    let free_before = mm.frames().free_frames();

    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        4 * PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::Reserve,
        RegionBacking::Anonymous,
    )
    .unwrap();
    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x40_0000), None),
        PageFaultResponse::Continue
    );
    assert_eq!(mm.frames().committed_frames(), 3);

    mm.unmap_region(handle, VirtAddr::new(0x40_0000)).unwrap();
    assert_eq!(mm.frames().committed_frames(), 0);
    // The data frame came back; intermediate tables stay until teardown.
    assert_eq!(mm.frames().free_frames(), free_before - 3);
    assert_eq!(
        mm.physical_address_of(handle, VirtAddr::new(0x40_0000)),
        Ok(None)
    );
    assert_eq!(
        mm.unmap_region(handle, VirtAddr::new(0x40_0000)),
        Err(RegionError::NotFound)
    );
}

#[test]
fn teardown_recovers_every_frame() {
    let (mut mm, _) = manager(64);
    let free_before = mm.frames().free_frames();

    let handle = mm.create_address_space(ProcessId(12)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        8 * PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::Reserve,
        RegionBacking::Anonymous,
    )
    .unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x7000_0000),
        2 * PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::AllocateNow,
        RegionBacking::Anonymous,
    )
    .unwrap();
    assert_eq!(
        mm.handle_page_fault(handle, &write_fault(0x40_3000), None),
        PageFaultResponse::Continue
    );

    mm.teardown_address_space(handle).unwrap();
    // Root, intermediate tables, data frames, promises: all returned.
    assert_eq!(mm.frames().free_frames(), free_before);
    assert_eq!(mm.frames().committed_frames(), 0);
}

#[test]
fn stale_handles_are_refused() {
    let (mut mm, _) = manager(64);
    let handle = mm.create_address_space(ProcessId(13)).unwrap();
    mm.teardown_address_space(handle).unwrap();

    assert_eq!(
        mm.map_region(
            handle,
            VirtAddr::new(0x40_0000),
            PAGE,
            RegionAccess::READ,
            AllocationStrategy::None,
            RegionBacking::Anonymous,
        ),
        Err(RegionError::StaleHandle)
    );
    assert_eq!(
        mm.handle_page_fault(handle, &read_fault(0x40_0000), None),
        PageFaultResponse::ShouldCrash
    );
    assert_eq!(
        mm.teardown_address_space(handle),
        Err(RegionError::StaleHandle)
    );

    // The slot may be reused, but the old handle stays dead.
    let reused = mm.create_address_space(ProcessId(14)).unwrap();
    assert_ne!(reused, handle);
    assert!(mm.space(handle).is_err());
    assert!(mm.space(reused).is_ok());
}

#[test]
fn kernel_half_is_shared_into_user_spaces() {
    let (mut mm, _) = manager(64);
    let kernel_virt = VirtAddr::new(0xFFFF_8000_0010_0000);
    mm.map_kernel_region(
        kernel_virt,
        PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::AllocateNow,
    )
    .unwrap();
    let phys = mm.kernel_physical_address(kernel_virt).unwrap();

    // A user space created afterwards sees the same mapping at the same
    // physical frame.
    let handle = mm.create_address_space(ProcessId(15)).unwrap();
    assert_eq!(
        mm.physical_address_of(handle, kernel_virt).unwrap(),
        Some(phys)
    );
}

#[test]
fn fault_privilege_is_honored() {
    let (mut mm, _) = manager(64);
    let kernel_virt = VirtAddr::new(0xFFFF_8000_0010_0000);
    mm.map_kernel_region(
        kernel_virt,
        PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::AllocateNow,
    )
    .unwrap();
    let handle = mm.create_address_space(ProcessId(17)).unwrap();
    mm.map_region(
        handle,
        VirtAddr::new(0x40_0000),
        PAGE,
        RegionAccess::READ | RegionAccess::WRITE,
        AllocationStrategy::Reserve,
        RegionBacking::Anonymous,
    )
    .unwrap();

    // User mode touching the kernel half crashes outright, even though the
    // mapping is shared into the space.
    let user_on_kernel = PageFault {
        address: kernel_virt,
        access: FaultAccess::Read,
        from_user: true,
    };
    assert_eq!(
        mm.handle_page_fault(handle, &user_on_kernel, None),
        PageFaultResponse::ShouldCrash
    );

    // A kernel-mode fault on a user region demand-pages normally (the
    // user-copy paths depend on it).
    let kernel_on_user = PageFault {
        address: VirtAddr::new(0x40_0000),
        access: FaultAccess::Write,
        from_user: false,
    };
    assert_eq!(
        mm.handle_page_fault(handle, &kernel_on_user, None),
        PageFaultResponse::Continue
    );
    assert_eq!(region_backing_bytes(&mm, handle, 0x40_0000), PAGE);
}

#[test]
fn paging_scope_switches_and_restores() {
    let (mut mm, _) = manager(64);
    let handle = mm.create_address_space(ProcessId(16)).unwrap();
    let user_root = mm.space(handle).unwrap().directory().root_phys();

    let proc = Processor::new();
    proc.set_active_page_directory(Some(mm.kernel_root()));
    {
        let _scope = ProcessPagingScope::enter_on(&proc, &mm, handle).unwrap();
        assert_eq!(proc.active_page_directory(), Some(user_root));
    }
    assert_eq!(proc.active_page_directory(), Some(mm.kernel_root()));

    mm.teardown_address_space(handle).unwrap();
    assert_eq!(
        ProcessPagingScope::enter_on(&proc, &mm, handle).err(),
        Some(RegionError::StaleHandle)
    );
}
