//! Virtual memory management for the Helium kernel.
//!
//! The crate is layered bottom-up:
//!
//! - [`mapper`] — the architecture-independent page-table interface
//!   ([`mapper::PageTables`]) plus [`mapper::PageFlags`] and the `TlbFlush`
//!   guard. Common code never interprets raw table entry bits.
//! - [`arch`] — the x86_64 reference backend, a 4-level walker reaching
//!   physical table frames through a direct-map offset so it also runs under
//!   host tests against an in-memory frame arena.
//! - [`phys`] — the bitmap physical frame allocator with commit accounting
//!   for [`region::AllocationStrategy::Reserve`].
//! - [`region`] — virtual memory regions with access flags, backing, and
//!   per-page residency; non-overlapping sets per address space.
//! - [`page_directory`] — one address space's root table, sharing the kernel
//!   half into every user directory.
//! - [`manager`] — the [`manager::MemoryManager`] context object tying it
//!   all together, including the page-fault decision procedure.
//! - [`switch`] — scoped address-space activation.
//!
//! All locking is the caller's: a `MemoryManager` is typically stored in a
//! `SpinlockProtected` ranked `LockRank::MemoryManager`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod fault;
pub mod manager;
pub mod mapper;
pub mod page_directory;
pub mod phys;
pub mod region;
pub mod switch;

/// Size in bytes of the pages this crate maps.
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a process.
///
/// Memory management never owns or dereferences a process; it only records
/// which process an address space belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);
