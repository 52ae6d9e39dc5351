//! An allocator with a byte budget, for provoking system-tier failures on
//! demand.

use allocator_api2::alloc::Global;
use node_pool::{AllocError, Allocator};
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

/// `Budget::limit` value meaning "no limit".
const UNLIMITED: usize = usize::MAX;

#[derive(Debug)]
struct Budget {
    limit: AtomicUsize,
    in_use: AtomicUsize,
    live: AtomicUsize,
    failures: AtomicUsize,
}

impl Default for Budget {
    fn default() -> Self {
        Budget {
            limit: AtomicUsize::new(UNLIMITED),
            in_use: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }
}

/// Wraps the global allocator, failing any allocation that would push the
/// total live bytes past a configurable limit.
///
/// Clones share the same budget, so a test can keep a handle to inspect or
/// adjust the budget while a pool owns another.
#[derive(Clone, Debug, Default)]
pub struct BudgetAllocator {
    budget: Arc<Budget>,
}

impl BudgetAllocator {
    /// An allocator that never fails on its own.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// An allocator that fails once `limit` bytes are live.
    pub fn with_limit(limit: usize) -> Self {
        let a = Self::default();
        a.set_limit(Some(limit));
        a
    }

    /// Replace the limit. `None` removes it.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.budget.limit.store(limit.unwrap_or(UNLIMITED), SeqCst);
    }

    /// Set the limit to exactly what is live now, so that every further
    /// allocation fails until something is deallocated.
    pub fn exhaust(&self) {
        self.set_limit(Some(self.in_use()));
    }

    /// Bytes currently allocated.
    pub fn in_use(&self) -> usize {
        self.budget.in_use.load(SeqCst)
    }

    /// Number of allocations currently live.
    pub fn live(&self) -> usize {
        self.budget.live.load(SeqCst)
    }

    /// Number of allocation attempts refused so far.
    pub fn failures(&self) -> usize {
        self.budget.failures.load(SeqCst)
    }
}

unsafe impl Allocator for BudgetAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let b = &self.budget;
        let limit = b.limit.load(SeqCst);
        let reserved = b.in_use.fetch_update(SeqCst, SeqCst, |in_use| {
            in_use
                .checked_add(layout.size())
                .filter(|total| limit == UNLIMITED || *total <= limit)
        });
        if reserved.is_err() {
            b.failures.fetch_add(1, SeqCst);
            return Err(AllocError);
        }
        match Global.allocate(layout) {
            Ok(ptr) => {
                b.live.fetch_add(1, SeqCst);
                Ok(ptr)
            }
            Err(e) => {
                b.in_use.fetch_sub(layout.size(), SeqCst);
                Err(e)
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let b = &self.budget;
        Global.deallocate(ptr, layout);
        b.in_use.fetch_sub(layout.size(), SeqCst);
        b.live.fetch_sub(1, SeqCst);
    }
}
