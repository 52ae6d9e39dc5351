//! The size-classed pool allocator.
//!
//! Requests of at most [`MAX_BYTES`] bytes are rounded up to a multiple of
//! [`ALIGN`] and served from one free list per size class. Popping and
//! pushing are O(1), with no coalescing. When a class's free list is empty, it
//! is refilled with a batch of blocks carved from the arena (see the `arena`
//! module). Larger requests bypass the pool entirely and go to the system
//! tier.

use core::ptr;

use super::*;
use crate::{
    arena::{Arena, GrowthPolicy},
    free_list::FreeList,
    mutex::Mutex,
};

/// Construction-time tuning knobs for a [`PoolAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// How many blocks to carve when refilling an empty free list. Clamped to
    /// at least one.
    pub refill_batch: usize,

    /// How much to request from the system tier when the arena runs dry.
    pub growth: GrowthPolicy,
}

impl PoolConfig {
    /// The default configuration: batches of 20 blocks, amortized doubling
    /// growth.
    pub const DEFAULT: PoolConfig = PoolConfig {
        refill_batch: 20,
        growth: GrowthPolicy::Amortized { multiplier: 2 },
    };
}

impl Default for PoolConfig {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A point-in-time snapshot of a pool's internal accounting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Cumulative bytes obtained from the system tier for arenas.
    pub heap_size: usize,

    /// Bytes not yet carved from the current arena.
    pub arena_remaining: usize,

    /// Number of regions currently owned.
    pub regions: usize,

    /// Length of each size class's free list.
    pub free_blocks: [usize; NUM_CLASSES],
}

impl PoolStats {
    /// Length of `class`'s free list.
    #[inline]
    pub fn free_blocks_in(&self, class: SizeClass) -> usize {
        self.free_blocks[class.index()]
    }

    /// Bytes sitting in free lists, across all classes.
    pub fn free_bytes(&self) -> usize {
        SizeClass::all()
            .map(|c| c.block_size() * self.free_blocks_in(c))
            .sum()
    }
}

struct PoolState {
    free_lists: [FreeList; NUM_CLASSES],
    arena: Arena,
    refill_batch: usize,
}

impl PoolState {
    /// Replenish `class`'s empty free list from the arena and return one
    /// block for the caller.
    fn refill<A: Allocator, L: Lock>(
        &mut self,
        system: &SystemAllocator<A, L>,
        class: SizeClass,
    ) -> Result<NonNull<u8>, AllocError> {
        let size = class.block_size();
        let chunk =
            self.arena
                .chunk_alloc(&mut self.free_lists, system, size, self.refill_batch)?;
        log::trace!(
            "refilled size class {} with {} blocks",
            class.index(),
            chunk.count
        );

        if chunk.count > 1 {
            // Safety: the chunk is `count` fresh, contiguous, `ALIGN`-aligned
            // blocks of this class's size that nobody else references.
            unsafe {
                self.free_lists[class.index()].push_run(
                    chunk.start.add(size),
                    size,
                    chunk.count - 1,
                );
            }
        }
        Ok(chunk.start)
    }
}

// Safety: the free lists and arena exclusively own the memory their pointers
// reach, and it is only ever touched through this state.
unsafe impl Send for PoolState {}

/// A two-tier allocator: size-classed free lists over a growable arena for
/// small blocks, and a retrying [`SystemAllocator`] for everything else.
///
/// Because this crate is `no_std` and does not assume the presence of an
/// operating system, you must provide your own locking mechanism via the `L`
/// type parameter. See the [`Lock`] trait for details. The pool is `Sync`
/// exactly when `A` and `L` are.
///
/// Every block must be deallocated with the same size it was allocated with.
/// In debug builds, returning a block to the pool that the pool never handed
/// out triggers an assertion failure; in release builds it silently corrupts
/// the free lists.
pub struct PoolAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    system: SystemAllocator<A, L>,
    state: Mutex<PoolState, L>,
}

impl<A, L> PoolAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create a new `PoolAllocator` over the given `inner` allocator with the
    /// default configuration.
    ///
    /// `lock` guards the pool's state. The out-of-memory handler slot gets a
    /// lock of its own from `L::default()`.
    #[inline]
    pub fn new(inner: A, lock: L) -> Self
    where
        L: Default,
    {
        Self::with_config(inner, lock, PoolConfig::DEFAULT)
    }

    /// Create a new `PoolAllocator` over the given `inner` allocator.
    #[inline]
    pub fn with_config(inner: A, lock: L, config: PoolConfig) -> Self
    where
        L: Default,
    {
        Self::with_system(SystemAllocator::new(inner, L::default()), lock, config)
    }

    /// Create a new `PoolAllocator` over an existing system tier.
    pub const fn with_system(system: SystemAllocator<A, L>, lock: L, config: PoolConfig) -> Self {
        let refill_batch = if config.refill_batch == 0 {
            1
        } else {
            config.refill_batch
        };
        let state = PoolState {
            free_lists: [const { FreeList::new() }; NUM_CLASSES],
            arena: Arena::new(config.growth),
            refill_batch,
        };
        PoolAllocator {
            system,
            state: Mutex::new(state, lock),
        }
    }

    /// Get the system tier.
    #[inline]
    pub fn system(&self) -> &SystemAllocator<A, L> {
        &self.system
    }

    /// Install an out-of-memory handler, returning the previous one.
    ///
    /// See [`SystemAllocator::set_oom_handler`].
    #[inline]
    pub fn set_oom_handler(&self, handler: OomHandler) -> Option<OomHandler> {
        self.system.set_oom_handler(handler)
    }

    /// Allocate `n` bytes.
    ///
    /// The returned block is aligned to [`ALIGN`]. A zero-byte request is
    /// served as the smallest size class.
    pub fn allocate_bytes(&self, n: usize) -> Result<NonNull<u8>, AllocError> {
        match SizeClass::for_size(n) {
            Some(class) => self.allocate_pooled(class),
            None => self.system.allocate(n),
        }
    }

    /// Deallocate an `n`-byte block.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by this pool's `allocate_bytes` or
    /// `reallocate_bytes` for exactly `n` bytes, and must not be used again.
    pub unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, n: usize) {
        match SizeClass::for_size(n) {
            Some(class) => self.deallocate_pooled(ptr, class),
            None => self.system.deallocate(ptr, n),
        }
    }

    /// Resize an `old`-byte block to `new` bytes, preserving the first
    /// `min(old, new)` bytes of its contents.
    ///
    /// Resizes within one size class return `ptr` unchanged. On failure,
    /// `ptr` is still valid for `old` bytes.
    ///
    /// ### Safety
    ///
    /// Same as [`PoolAllocator::deallocate_bytes`] for `ptr` and `old`.
    pub unsafe fn reallocate_bytes(
        &self,
        ptr: NonNull<u8>,
        old: usize,
        new: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        match (SizeClass::for_size(old), SizeClass::for_size(new)) {
            (None, None) => self.system.reallocate(ptr, old, new),
            (Some(a), Some(b)) if a == b => Ok(ptr),
            _ => {
                let new_ptr = self.allocate_bytes(new)?;
                ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old.min(new));
                self.deallocate_bytes(ptr, old);
                Ok(new_ptr)
            }
        }
    }

    /// Take a snapshot of this pool's accounting.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut free_blocks = [0; NUM_CLASSES];
        for (n, list) in free_blocks.iter_mut().zip(&state.free_lists) {
            *n = list.len();
        }
        PoolStats {
            heap_size: state.arena.heap_size(),
            arena_remaining: state.arena.remaining(),
            regions: state.arena.num_regions(),
            free_blocks,
        }
    }

    /// Call `f` with every block in `class`'s free list, from head to tail.
    ///
    /// `f` must not call back into this pool.
    pub fn for_each_free_block(&self, class: SizeClass, f: impl FnMut(NonNull<u8>)) {
        let state = self.state.lock();
        state.free_lists[class.index()].for_each(f);
    }

    fn allocate_pooled(&self, class: SizeClass) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        if let Some(block) = state.free_lists[class.index()].pop() {
            return Ok(block);
        }
        state.refill(&self.system, class)
    }

    unsafe fn deallocate_pooled(&self, ptr: NonNull<u8>, class: SizeClass) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            ptr.as_ptr() as usize % ALIGN,
            0,
            "{ptr:#p} returned to size class {} is not aligned to {ALIGN}",
            class.index()
        );
        debug_assert!(
            state.arena.owns(ptr),
            "{ptr:#p} returned to size class {} was not allocated by this pool",
            class.index()
        );
        state.free_lists[class.index()].push(ptr);
    }

    /// The size class serving `layout` through the `Allocator` interface, if
    /// any.
    #[inline]
    fn pooled_class(layout: Layout) -> Option<SizeClass> {
        if is_pooled(layout) {
            SizeClass::for_size(layout.size())
        } else {
            None
        }
    }

    /// Shared implementation of `grow` and `shrink`.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        match (Self::pooled_class(old_layout), Self::pooled_class(new_layout)) {
            (Some(a), Some(b)) if a == b => {
                return Ok(NonNull::slice_from_raw_parts(ptr, b.block_size()));
            }
            (None, None)
                if old_layout.size() != 0
                    && new_layout.size() != 0
                    && old_layout.align() == new_layout.align() =>
            {
                return self.system.reallocate_layout(ptr, old_layout, new_layout);
            }
            _ => {}
        }

        let new_ptr = self.allocate(new_layout)?;
        ptr::copy_nonoverlapping(
            ptr.as_ptr().cast_const(),
            new_ptr.cast::<u8>().as_ptr(),
            old_layout.size().min(new_layout.size()),
        );
        self.deallocate(ptr, old_layout);
        Ok(new_ptr)
    }
}

impl<A, L> Drop for PoolAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // Safety: we are being dropped, so no pooled block can be used again.
        unsafe { state.arena.release(&self.system) };
    }
}

unsafe impl<A, L> Allocator for PoolAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        match Self::pooled_class(layout) {
            Some(class) => {
                let ptr = self.allocate_pooled(class)?;
                Ok(NonNull::slice_from_raw_parts(ptr, class.block_size()))
            }
            None => {
                let ptr = self.system.allocate_layout(layout)?;
                Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
            }
        }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match Self::pooled_class(layout) {
            Some(class) => self.deallocate_pooled(ptr, class),
            None => self.system.deallocate_layout(ptr, layout),
        }
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.resize(ptr, old_layout, new_layout)
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        self.resize(ptr, old_layout, new_layout)
    }
}
