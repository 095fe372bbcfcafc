//! A hardened heap.
//!
//! Allocations live in size-classed zones: a guard-page-bracketed user
//! region paired with a guard-page-bracketed occupancy bitmap. Freed
//! chunks are poisoned and sealed with address-keyed canaries, double
//! frees and foreign frees abort, and the zone registry's own pointers
//! are XOR-masked against tampering. Linear overflow in any direction
//! runs into an inaccessible page or a canary.
//!
//! Rust callers use this crate directly; the `palisade-ffi` member
//! builds the cdylib/staticlib C surface on top of it.

#![cfg_attr(not(test), no_std)]

mod platform;
pub mod heap;

pub use heap::{
    ZoneHandle, alloc, alloc_from_zone, calloc, chunk_size_of, destroy_zone, free, free_permanent,
    new_zone, protect_root, teardown, unprotect_root, verify_all,
};
