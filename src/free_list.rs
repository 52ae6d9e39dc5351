//! Intrusive free lists of same-sized blocks.
//!
//! While a block sits in a free list, its first word holds the link to the
//! next free block. Once popped, the block is opaque client memory again. The
//! link is only ever touched through [`FreeList::push`] and [`FreeList::pop`].

use core::ptr::{self, NonNull};

/// The view of a free block while it is linked into a [`FreeList`].
#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// A LIFO stack of free blocks that all have the same size.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<FreeBlock>>,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Push a block onto the head of this list.
    ///
    /// ### Safety
    ///
    /// * `block` must be valid for writes of at least one machine word and
    ///   aligned for a pointer.
    ///
    /// * `block` must be exactly this list's block size and must not be
    ///   referenced by anything else until it is popped again.
    #[inline]
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        let block = block.cast::<FreeBlock>();
        ptr::write(block.as_ptr(), FreeBlock { next: self.head });
        self.head = Some(block);
        self.len += 1;
    }

    /// Pop the most recently pushed block, if any.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        // Safety: every block in the list was written by `push` and is owned
        // by this list.
        self.head = unsafe { ptr::read(block.as_ptr()).next };
        self.len -= 1;
        Some(block.cast())
    }

    /// Link `count` consecutive blocks of `size` bytes starting at `start`
    /// into this list, so that popping yields them in ascending address
    /// order.
    ///
    /// ### Safety
    ///
    /// Same as [`FreeList::push`] for every block in the run.
    pub(crate) unsafe fn push_run(&mut self, start: NonNull<u8>, size: usize, count: usize) {
        for i in (0..count).rev() {
            self.push(start.add(i * size));
        }
    }

    /// Walk the list from head to tail.
    pub(crate) fn for_each(&self, mut f: impl FnMut(NonNull<u8>)) {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            f(block.cast());
            // Safety: see `pop`.
            cursor = unsafe { (*block.as_ptr()).next };
        }
    }
}
