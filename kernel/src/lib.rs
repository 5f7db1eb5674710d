//! Stenzel VM: demand-paged virtual memory for the Stenzel kernel.
//!
//! Pages are declared lazily, materialized on the first fault from swap or
//! from a mapped file, evicted under memory pressure with a clock policy and
//! shared copy-on-write across address-space duplication.
//!
//! The hardware-facing pieces (physical allocator, page-table manager, block
//! device, files) are traits; `mm::phys`, `mm::paging`, `storage::ramdisk` and
//! `fs::memfile` provide software implementations of each.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fs;
pub mod mm;
pub mod storage;
pub mod util;

pub use mm::{Vm, VmConfig};
pub use util::{KError, KResult};
