//! A standalone `no_std` memory allocator library: a vmem-style arena allocator
//! (`mm::vmem`) layered over a buddy physical-page allocator (`mm::page`), and a
//! slab/object-cache allocator (`mm::kmem`) layered over the arenas.
//!
//! This crate owns no boot sequence, no scheduler, and no device drivers — it is meant
//! to be linked into a kernel (or exercised directly under `cargo test` on the host)
//! that supplies a set of physical memory regions and, optionally, a [`log::Log`]
//! implementation for diagnostics. See [`mm::init`] for the entry point.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod macros;

pub mod arch;
pub mod base;
pub mod errno;
pub mod gfp;
pub mod mm;
pub mod util;
