//! The typed facade that containers allocate their nodes through.

use core::{fmt, marker::PhantomData, mem};

use super::*;

/// Allocates uninitialized storage for `T`s from a [`PoolAllocator`].
///
/// Requests whose total size fits a size class (and whose alignment is at most
/// [`ALIGN`]) come from the pool; everything else goes to the system tier.
/// This type never constructs or drops `T`s: that is up to the container.
pub struct NodeAllocator<'a, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    pool: &'a PoolAllocator<A, L>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T, A, L> NodeAllocator<'a, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create a `NodeAllocator` for `T`s backed by `pool`.
    #[inline]
    pub const fn new(pool: &'a PoolAllocator<A, L>) -> Self {
        NodeAllocator {
            pool,
            _marker: PhantomData,
        }
    }

    /// The pool backing this allocator.
    #[inline]
    pub fn pool(&self) -> &'a PoolAllocator<A, L> {
        self.pool
    }

    /// Allocate uninitialized storage for `n` consecutive `T`s.
    ///
    /// Zero-sized requests return a dangling, well-aligned pointer without
    /// touching the pool.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::array::<T>(n).map_err(|_| AllocError)?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        let ptr = if is_pooled(layout) {
            self.pool.allocate_bytes(layout.size())?
        } else {
            self.pool.system().allocate_layout(layout)?
        };
        Ok(ptr.cast())
    }

    /// Allocate uninitialized storage for a single `T`.
    #[inline]
    pub fn allocate_one(&self) -> Result<NonNull<T>, AllocError> {
        self.allocate(1)
    }

    /// Deallocate storage for `n` consecutive `T`s.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by `allocate(n)` on an allocator for the
    /// same pool, with the same `n`. Any `T`s in the storage must already have
    /// been dropped or moved out, and `ptr` must not be used again.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let Ok(layout) = Layout::array::<T>(n) else {
            debug_assert!(false, "deallocating {n} elements, which could never be allocated");
            return;
        };
        if layout.size() == 0 {
            return;
        }
        if is_pooled(layout) {
            self.pool.deallocate_bytes(ptr.cast(), layout.size());
        } else {
            self.pool.system().deallocate_layout(ptr.cast(), layout);
        }
    }

    /// Deallocate storage for a single `T`.
    ///
    /// ### Safety
    ///
    /// Same as [`NodeAllocator::deallocate`] with `n = 1`.
    #[inline]
    pub unsafe fn deallocate_one(&self, ptr: NonNull<T>) {
        self.deallocate(ptr, 1);
    }
}

impl<T, A, L> Clone for NodeAllocator<'_, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A, L> Copy for NodeAllocator<'_, T, A, L>
where
    A: Allocator,
    L: Lock,
{
}

impl<T, A, L> fmt::Debug for NodeAllocator<'_, T, A, L>
where
    A: Allocator,
    L: Lock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeAllocator")
            .field("element", &core::any::type_name::<T>())
            .field("size", &mem::size_of::<T>())
            .field("pool", &(self.pool as *const PoolAllocator<A, L>))
            .finish()
    }
}
