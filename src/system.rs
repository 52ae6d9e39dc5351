//! The system tier: a retrying wrapper around an underlying allocator.
//!
//! Every request is attempted once against the inner allocator. When that
//! fails and an out-of-memory handler is installed, the handler is invoked and
//! the request is retried, for as long as the handler keeps returning. The
//! handler is expected to release memory somewhere or to escalate (panic,
//! abort or exit). A handler that does neither spins forever, since retries
//! are not capped. Without a handler, failure is reported immediately.

use alloc::boxed::Box;

use super::*;
use crate::mutex::Mutex;

/// An out-of-memory callback.
pub type OomHandler = Box<dyn FnMut() + Send>;

/// The bottom allocation tier, wrapping an inner allocator `A`.
///
/// The out-of-memory handler slot is guarded by its own `L`.
pub struct SystemAllocator<A, L>
where
    L: Lock,
{
    inner: A,
    oom_handler: Mutex<Option<OomHandler>, L>,
}

impl<A, L> SystemAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Wrap `inner`, with no out-of-memory handler installed.
    #[inline]
    pub const fn new(inner: A, lock: L) -> Self {
        SystemAllocator {
            inner,
            oom_handler: Mutex::new(None, lock),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Install `handler`, returning the previously installed one.
    pub fn set_oom_handler(&self, handler: OomHandler) -> Option<OomHandler> {
        self.oom_handler.lock().replace(handler)
    }

    /// Remove and return the installed handler.
    pub fn take_oom_handler(&self) -> Option<OomHandler> {
        self.oom_handler.lock().take()
    }

    /// Is an out-of-memory handler currently installed?
    ///
    /// While the handler is running it is out of its slot, so this returns
    /// `false` from inside the handler (and from any other thread) unless a
    /// replacement has been installed in the meantime.
    pub fn has_oom_handler(&self) -> bool {
        self.oom_handler.lock().is_some()
    }

    /// Run the installed handler once. Returns `false` if there is none.
    ///
    /// The handler is moved out of its slot, and the slot unlocked, while it
    /// runs. It may therefore install a replacement, and the replacement wins.
    /// A concurrent failure on another thread finds the slot empty and fails.
    fn run_oom_handler(&self) -> bool {
        let Some(mut handler) = self.oom_handler.lock().take() else {
            return false;
        };
        handler();
        let mut slot = self.oom_handler.lock();
        if slot.is_none() {
            *slot = Some(handler);
        }
        true
    }

    /// Drive `attempt` through the out-of-memory retry protocol.
    fn retry<T>(
        &self,
        what: &str,
        size: usize,
        mut attempt: impl FnMut() -> Result<T, AllocError>,
    ) -> Result<T, AllocError> {
        loop {
            if let Ok(x) = attempt() {
                return Ok(x);
            }
            log::warn!("system {what} of {size} bytes failed; invoking out-of-memory handler");
            if !self.run_oom_handler() {
                log::warn!("no out-of-memory handler installed; {what} of {size} bytes failed");
                return Err(AllocError);
            }
        }
    }

    /// Make a single attempt at allocating `layout`, without invoking the
    /// out-of-memory handler on failure.
    #[inline]
    pub fn try_allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.inner.allocate(layout).map(|p| p.cast())
    }

    /// Allocate `layout`, invoking the out-of-memory handler on failure.
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.retry("allocation", layout.size(), || {
            self.try_allocate_layout(layout)
        })
    }

    /// Allocate `n` bytes aligned to [`ALIGN`], invoking the out-of-memory
    /// handler on failure.
    #[inline]
    pub fn allocate(&self, n: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_layout(block_layout(n)?)
    }

    /// Return a block to the inner allocator.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been allocated by this tier with exactly `layout`.
    #[inline]
    pub unsafe fn deallocate_layout(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
    }

    /// Return an `n`-byte block to the inner allocator.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by [`SystemAllocator::allocate`] (or
    /// [`SystemAllocator::reallocate`]) for exactly `n` bytes.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, n: usize) {
        // Any `n` that was successfully allocated has a valid layout.
        if let Ok(layout) = block_layout(n) {
            self.deallocate_layout(ptr, layout);
        }
    }

    /// Resize a block from `old` to `new`, invoking the out-of-memory handler
    /// on failure. On failure the original block is left untouched.
    ///
    /// ### Safety
    ///
    /// `ptr` must currently be allocated by this tier with exactly `old`, and
    /// `new.align()` must equal `old.align()`.
    pub unsafe fn reallocate_layout(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert_eq!(old.align(), new.align());
        self.retry("reallocation", new.size(), || {
            if new.size() >= old.size() {
                self.inner.grow(ptr, old, new)
            } else {
                self.inner.shrink(ptr, old, new)
            }
        })
    }

    /// Resize an `old`-byte block to `new` bytes, invoking the out-of-memory
    /// handler on failure.
    ///
    /// ### Safety
    ///
    /// `ptr` must currently be allocated by this tier for exactly `old` bytes.
    #[inline]
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: usize,
        new: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let old = block_layout(old)?;
        let new = block_layout(new)?;
        self.reallocate_layout(ptr, old, new).map(|p| p.cast())
    }
}
