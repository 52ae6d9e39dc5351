#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod arena;
mod free_list;
mod mutex;
mod pool;
mod size_class;
mod system;
mod typed;

pub use arena::GrowthPolicy;
pub use mutex::{Lock, SingleThreadedLock};
pub use pool::{PoolAllocator, PoolConfig, PoolStats};
pub use size_class::{SizeClass, ALIGN, MAX_BYTES, NUM_CLASSES};
pub use system::{OomHandler, SystemAllocator};
pub use typed::NodeAllocator;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// The layout of a `size`-byte block at the pool's fixed alignment.
#[inline]
fn block_layout(size: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(size, ALIGN).map_err(|_| AllocError)
}

/// Is `layout` something the size-classed pool can serve?
#[inline]
fn is_pooled(layout: Layout) -> bool {
    layout.size() != 0 && layout.size() <= MAX_BYTES && layout.align() <= ALIGN
}
