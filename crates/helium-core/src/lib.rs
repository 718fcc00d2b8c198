//! Core types, per-CPU state, and synchronization primitives for the Helium
//! kernel.
//!
//! This crate is the host-testable foundation of the kernel: typed physical
//! and virtual addresses, page/frame wrappers, CPU-local storage, the per-CPU
//! [`processor::Processor`] record, the locking primitives with their rank
//! discipline, and the kernel logging facade. It contains no allocator and no
//! architecture bring-up; everything here compiles and runs under `cargo test`
//! on the host as well as on kernel targets.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod cpu_local;
pub mod log;
pub mod paging;
pub mod processor;
pub mod sync;
