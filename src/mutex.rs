//! The serialization point for pool state.
//!
//! Rather than hard-wiring a lock, the pool's free lists and arena, and the
//! system tier's out-of-memory handler slot, live in [`Mutex`]es that are
//! generic over any [`Lock`], so embedders can plug in whatever exclusion
//! their environment offers.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

/// A trait for guarding a pool's free lists and arena.
///
/// Use [`SingleThreadedLock`] when the pool is only ever touched from one
/// execution context.
///
/// # Safety
///
/// If the implementing type is `Sync`, then a pool using it will be `Sync`, so
/// `lock` must provide real mutual exclusion across threads.
///
/// Implementations must also refuse re-entrant locking: calling `lock` while the
/// lock is already held must panic, abort, or never return. Otherwise a
/// re-entrant pool operation (for example from inside an out-of-memory
/// handler) would observe free lists in the middle of an update.
pub unsafe trait Lock {
    /// Acquire the lock.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A [`Lock`] for single-threaded use that panics on re-entrance.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    held: Cell<bool>,
}

impl SingleThreadedLock {
    /// Construct a new, unheld `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            held: Cell::new(false),
        }
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(
            !self.held.get(),
            "re-entrant use of a pool allocator is not supported"
        );
        self.held.set(true);
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.held.get());
        self.held.set(false);
    }
}

pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: sending the mutex sends its lock and value, nothing more.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: mutual exclusion is upheld by the `Lock` contract. `T: Send` is
// required because a guard taken on another thread hands out `&mut T`.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        Mutex {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the lock is held for as long as the guard lives.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, and the guard is borrowed exclusively.
        unsafe { &mut *self.mutex.value.get() }
    }
}
