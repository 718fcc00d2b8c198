//! Page fault descriptors and responses.
//!
//! The trap layer decodes the architecture's fault information into a
//! [`PageFault`] and hands it to the memory manager; the returned
//! [`PageFaultResponse`] tells it how to resume (or not).

use core::fmt;

use helium_core::addr::VirtAddr;

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    /// A load.
    Read,
    /// A store.
    Write,
    /// An instruction fetch.
    Execute,
}

/// A decoded page fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting virtual address.
    pub address: VirtAddr,
    /// What the instruction was trying to do.
    pub access: FaultAccess,
    /// `true` if the fault came from user mode.
    pub from_user: bool,
}

/// What the fault handler should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// The fault was resolved (a frame was mapped, or the mapping already
    /// existed); retry the faulting instruction.
    Continue,
    /// A frame was needed and none could be allocated. The caller decides
    /// between killing the process and an OOM response.
    OutOfMemory,
    /// The access hit a region whose backing could not produce the page
    /// (truncated file, failed provider, unbacked hole). Maps to SIGBUS for
    /// user faults.
    BusError,
    /// The access violated the address space layout or permissions. The
    /// caller crashes the process (or panics for kernel-mode faults).
    ShouldCrash,
}

impl fmt::Display for PageFaultResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::BusError => write!(f, "bus error"),
            Self::ShouldCrash => write!(f, "should crash"),
        }
    }
}
