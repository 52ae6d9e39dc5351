//! The arena manager.
//!
//! The arena is a contiguous byte range `[cursor, end)` that pooled blocks are
//! carved from, front to back. The cursor only ever moves forward. When the
//! arena cannot hold even one more object of the requested size, a fresh arena
//! is obtained by trying, in order:
//!
//! 1. A new region from the system tier (a single attempt, no handler).
//! 2. Scavenging: adopting a free block of the requested class or any larger
//!    class as the arena.
//! 3. The system tier again, this time through its out-of-memory retry
//!    protocol.
//!
//! Any fresh arena holds at least one object of the requested size, so the
//! serve that follows always succeeds.
//!
//! Every region obtained from the system tier begins with a [`RegionHeader`]
//! linking it to the previously obtained region, so that all regions can be
//! released exactly once when the pool is dropped.

use core::{mem, ptr};

use super::*;
use crate::{
    free_list::FreeList,
    size_class::{checked_round_up, round_up, SizeClass},
};

/// How many bytes to request from the system tier when the arena must grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Request `multiplier` times the bytes needed plus a sixteenth of
    /// everything obtained so far, so that growth accelerates with the heap.
    Amortized {
        /// How many times over to provision the current request.
        multiplier: usize,
    },

    /// Request exactly the bytes needed.
    Exact,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        GrowthPolicy::Amortized { multiplier: 2 }
    }
}

impl GrowthPolicy {
    /// The usable bytes to request for a new arena, given the bytes needed
    /// right now and the cumulative heap size so far.
    ///
    /// Never less than `requested`.
    pub fn region_size(self, requested: usize, heap_size: usize) -> usize {
        match self {
            GrowthPolicy::Amortized { multiplier } => requested
                .saturating_mul(multiplier.max(1))
                .saturating_add(round_up(heap_size >> 4)),
            GrowthPolicy::Exact => requested,
        }
    }
}

/// Bookkeeping at the start of every region obtained from the system tier.
#[repr(C)]
struct RegionHeader {
    /// The previously obtained region.
    prev: Option<NonNull<RegionHeader>>,
    /// Total size of this region, header included.
    size: usize,
}

/// Header size, padded so that the payload stays [`ALIGN`]-aligned.
const REGION_HEADER_SIZE: usize = round_up(mem::size_of::<RegionHeader>());

/// A run of blocks carved from the arena.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Chunk {
    pub(crate) start: NonNull<u8>,
    pub(crate) count: usize,
}

pub(crate) struct Arena {
    cursor: *mut u8,
    end: *mut u8,
    heap_size: usize,
    regions: Option<NonNull<RegionHeader>>,
    num_regions: usize,
    policy: GrowthPolicy,
}

impl Arena {
    pub(crate) const fn new(policy: GrowthPolicy) -> Self {
        Arena {
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
            heap_size: 0,
            regions: None,
            num_regions: 0,
            policy,
        }
    }

    /// Bytes left in the current arena.
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.end as usize - self.cursor as usize
    }

    /// Cumulative bytes obtained from the system tier.
    #[inline]
    pub(crate) fn heap_size(&self) -> usize {
        self.heap_size
    }

    #[inline]
    pub(crate) fn num_regions(&self) -> usize {
        self.num_regions
    }

    /// Does `ptr` point into the payload of one of our regions?
    pub(crate) fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let mut cursor = self.regions;
        while let Some(region) = cursor {
            // Safety: every linked header was written by `add_region` and the
            // region is still allocated.
            let header = unsafe { region.as_ref() };
            let start = region.as_ptr() as usize + REGION_HEADER_SIZE;
            let end = region.as_ptr() as usize + header.size;
            if (start..end).contains(&addr) {
                return true;
            }
            cursor = header.prev;
        }
        false
    }

    /// Carve `count` objects of `size` bytes, or as many whole objects as fit,
    /// from the current arena. `None` if not even one fits.
    fn serve(&mut self, size: usize, count: usize) -> Option<Chunk> {
        let fit = count.min(self.remaining() / size);
        if fit == 0 {
            return None;
        }
        // Safety: `fit * size <= remaining`, so the new cursor stays within
        // the arena and the arena is non-null.
        let start = unsafe { NonNull::new_unchecked(self.cursor) };
        self.cursor = unsafe { self.cursor.add(fit * size) };
        Some(Chunk { start, count: fit })
    }

    /// Hand the leftover tail of the current arena to the free list whose
    /// class matches its size exactly, leaving the arena empty.
    fn donate_remainder(&mut self, free_lists: &mut [FreeList; NUM_CLASSES]) {
        let remainder = self.remaining();
        if remainder == 0 {
            return;
        }
        debug_assert_eq!(remainder % ALIGN, 0);
        if let Some(class) = SizeClass::for_size(remainder) {
            debug_assert_eq!(class.block_size(), remainder);
            log::debug!("donating {remainder} leftover arena bytes to size class {}", class.index());
            // Safety: the remainder is unused arena memory of exactly this
            // class's size, aligned to `ALIGN`.
            unsafe {
                free_lists[class.index()].push(NonNull::new_unchecked(self.cursor));
            }
        }
        self.cursor = self.end;
    }

    /// Record a region freshly obtained from the system tier and make its
    /// payload the current arena.
    ///
    /// ### Safety
    ///
    /// `region` must be a live, `ALIGN`-aligned allocation of `size` bytes,
    /// with `size > REGION_HEADER_SIZE`, owned by this arena from now on.
    unsafe fn add_region(&mut self, region: NonNull<u8>, size: usize) {
        let header = region.cast::<RegionHeader>();
        header.write(RegionHeader {
            prev: self.regions,
            size,
        });
        self.regions = Some(header);
        self.num_regions += 1;
        self.heap_size += size;
        self.cursor = region.as_ptr().add(REGION_HEADER_SIZE);
        self.end = region.as_ptr().add(size);
    }

    /// Adopt a scavenged free block as the current arena.
    ///
    /// ### Safety
    ///
    /// `block` must be a `size`-byte block inside one of our regions that is
    /// no longer referenced by any free list.
    unsafe fn adopt(&mut self, block: NonNull<u8>, size: usize) {
        self.cursor = block.as_ptr();
        self.end = block.as_ptr().add(size);
    }

    /// Take a spare block from `class` or any larger class.
    fn scavenge(
        free_lists: &mut [FreeList; NUM_CLASSES],
        class: SizeClass,
    ) -> Option<(NonNull<u8>, usize)> {
        class.and_larger().find_map(|c| {
            let block = free_lists[c.index()].pop()?;
            log::debug!(
                "scavenged a {}-byte block to serve size class {}",
                c.block_size(),
                class.index()
            );
            Some((block, c.block_size()))
        })
    }

    /// Carve up to `count` objects of `size` bytes, growing the arena when it
    /// cannot hold even one.
    ///
    /// `size` must be one of the pool's class sizes.
    pub(crate) fn chunk_alloc<A: Allocator, L: Lock>(
        &mut self,
        free_lists: &mut [FreeList; NUM_CLASSES],
        system: &SystemAllocator<A, L>,
        size: usize,
        count: usize,
    ) -> Result<Chunk, AllocError> {
        if let Some(chunk) = self.serve(size, count) {
            return Ok(chunk);
        }

        // Nothing usable is left here, so make sure the tail is not lost
        // before moving on to a new arena.
        self.donate_remainder(free_lists);

        let class = SizeClass::for_size(size).ok_or(AllocError)?;
        let planned = self.region_layout(size, count);

        // An unrepresentable region size counts as a failed first attempt.
        let grown = planned.and_then(|(n, layout)| Ok((n, system.try_allocate_layout(layout)?)));

        // Safety: regions come straight from the system tier with their
        // layout, and scavenged blocks were just popped from their free list.
        match grown {
            Ok((region_size, region)) => unsafe { self.add_region(region, region_size) },
            Err(_) => match Self::scavenge(free_lists, class) {
                Some((block, block_size)) => unsafe { self.adopt(block, block_size) },
                None => {
                    let (region_size, layout) = planned?;
                    let region = system.allocate_layout(layout)?;
                    unsafe { self.add_region(region, region_size) }
                }
            },
        }
        log::debug!(
            "arena refreshed with {} bytes for size class {}; heap size is now {}",
            self.remaining(),
            class.index(),
            self.heap_size
        );

        // A fresh arena always holds at least one object.
        self.serve(size, count).ok_or(AllocError)
    }

    /// The total size and layout of a new region for `count` objects of `size`
    /// bytes under the growth policy, header included.
    fn region_layout(&self, size: usize, count: usize) -> Result<(usize, Layout), AllocError> {
        let wanted = self
            .policy
            .region_size(size.saturating_mul(count), self.heap_size);
        let region_size = wanted
            .checked_add(REGION_HEADER_SIZE)
            .and_then(checked_round_up)
            .ok_or(AllocError)?;
        Ok((region_size, block_layout(region_size)?))
    }

    /// Release every region back to the system tier.
    ///
    /// ### Safety
    ///
    /// No block carved from any region may be used afterwards.
    pub(crate) unsafe fn release<A: Allocator, L: Lock>(&mut self, system: &SystemAllocator<A, L>) {
        let mut cursor = self.regions.take();
        while let Some(region) = cursor {
            let RegionHeader { prev, size } = region.as_ptr().read();
            cursor = prev;
            if let Ok(layout) = block_layout(size) {
                system.deallocate_layout(region.cast(), layout);
            }
        }
        self.num_regions = 0;
        self.cursor = ptr::null_mut();
        self.end = ptr::null_mut();
    }
}
