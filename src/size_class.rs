//! Size-class arithmetic.
//!
//! Every pooled request is rounded up to a multiple of [`ALIGN`] and served
//! from the free list of its class. Class `i` holds blocks of exactly
//! `(i + 1) * ALIGN` bytes.

/// The alignment of every pooled block, and the granularity of size classes.
pub const ALIGN: usize = 8;

/// The largest request, in bytes, served by the pool. Anything larger goes
/// straight to the system tier.
pub const MAX_BYTES: usize = 128;

/// The number of size classes.
pub const NUM_CLASSES: usize = MAX_BYTES / ALIGN;

// A free block must be able to hold its `next` link.
const _: () = assert!(ALIGN >= core::mem::size_of::<usize>());
const _: () = assert!(ALIGN.is_power_of_two());
const _: () = assert!(MAX_BYTES % ALIGN == 0);

/// Round `bytes` up to the next multiple of [`ALIGN`].
#[inline]
pub(crate) const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// Like [`round_up`], but `None` on overflow.
#[inline]
pub(crate) const fn checked_round_up(bytes: usize) -> Option<usize> {
    match bytes.checked_add(ALIGN - 1) {
        Some(b) => Some(b & !(ALIGN - 1)),
        None => None,
    }
}

/// A bucket of requests that share the same rounded block size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// The size class serving requests of `bytes` bytes, or `None` if the
    /// request is larger than [`MAX_BYTES`].
    ///
    /// Zero-byte requests are served by the smallest class.
    #[inline]
    pub const fn for_size(bytes: usize) -> Option<SizeClass> {
        if bytes > MAX_BYTES {
            return None;
        }
        let index = if bytes == 0 { 0 } else { (bytes - 1) / ALIGN };
        Some(SizeClass(index as u8))
    }

    /// The size class with the given index, or `None` if `index >=
    /// NUM_CLASSES`.
    #[inline]
    pub const fn from_index(index: usize) -> Option<SizeClass> {
        if index < NUM_CLASSES {
            Some(SizeClass(index as u8))
        } else {
            None
        }
    }

    /// This class's index into the free-list table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The exact size of every block in this class.
    #[inline]
    pub const fn block_size(self) -> usize {
        (self.0 as usize + 1) * ALIGN
    }

    /// Iterate over every size class, smallest first.
    pub fn all() -> impl DoubleEndedIterator<Item = SizeClass> + ExactSizeIterator {
        (0..NUM_CLASSES as u8).map(SizeClass)
    }

    /// Iterate over this class and every larger one.
    pub(crate) fn and_larger(self) -> impl Iterator<Item = SizeClass> {
        (self.0..NUM_CLASSES as u8).map(SizeClass)
    }
}
