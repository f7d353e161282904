//! Synchronization primitives used by the arena and slab allocators.
//!
//! [`SpinLockPure`] is the host's plain spinlock: lock/unlock semantics only, no data
//! guarding, no IRQ handling. [`IrqSpinLockPure`] is the thin, mechanical extension the
//! allocator's concurrency model actually requires: it additionally saves and disables
//! the local IRQ state for the duration of the critical section, so a timer interrupt on
//! the same hart can never re-enter a lock its own interrupted thread already holds.
//!
//! [`IrqSpinLockPure`] exposes manual `lock`/`unlock` (returning/consuming the saved flags)
//! rather than a RAII guard, because the arena allocator's one suspension point
//! (`__add_more_btags` dropping and reacquiring its own lock around a call into the
//! source arena) needs to unlock in the middle of a function and relock later — a shape
//! a guard's `Drop` can't express. [`IrqSpinLock<T>`] layers a conventional RAII,
//! data-guarding lock on top for callers (kmem caches, the arena/cache registries) that
//! never need to suspend mid-section.

mod spin_lock;

pub use spin_lock::{SpinLockPure, SpinLockPureGuard};

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use crate::base::irq;

/// An IRQ-safe spinlock with manual lock/unlock, for critical sections that must be
/// able to drop and reacquire the lock partway through.
pub struct IrqSpinLockPure {
    inner: SpinLockPure,
}

impl IrqSpinLockPure {
    #[inline]
    pub const fn new() -> Self {
        Self { inner: SpinLockPure::new() }
    }

    /// Disable local IRQs, then spin for the lock. Returns the saved IRQ flags, to be
    /// passed back to [`unlock`](Self::unlock).
    #[inline]
    pub fn lock(&self) -> usize {
        let flags = irq::local_irq_save();
        self.inner.lock();
        flags
    }

    /// Release the lock and restore the IRQ state saved by the matching [`lock`](Self::lock).
    #[inline]
    pub fn unlock(&self, flags: usize) {
        self.inner.unlock();
        irq::local_irq_restore(flags);
    }
}

impl Default for IrqSpinLockPure {
    fn default() -> Self {
        Self::new()
    }
}

/// An IRQ-safe spinlock guarding a `T`, with a RAII guard. Use this wherever the
/// critical section is lexically scoped (it never needs to drop the lock mid-section).
pub struct IrqSpinLock<T> {
    lock: IrqSpinLockPure,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self { lock: IrqSpinLockPure::new(), data: UnsafeCell::new(data) }
    }

    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let flags = self.lock.lock();
        IrqSpinLockGuard { lock: self, flags }
    }

    /// Get a mutable reference to the inner data, bypassing the lock.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access (e.g. during single-threaded init).
    #[inline]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    flags: usize,
}

impl<'a, T> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqSpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqSpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.lock.unlock(self.flags);
    }
}
