//! Interrupt-safe exclusion primitive shared by the VMM (per-AS lock)
//! and the HEAP (per-heap lock). `acquire()`/`release()` from the spec
//! are modeled as a guard: the cookie (prior interrupt-enable state)
//! lives inside the guard and is restored on `Drop`, so a release can
//! never be forgotten or doubled.
//!
//! Single-CPU only: nested acquisition of the same lock is forbidden
//! by the spec, and here it deadlocks against the inner spinlock
//! rather than silently re-entering — callers route through internal
//! non-locking helpers when a public operation needs to both read and
//! write.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::arch::x86_64::{disable_interrupts_save, restore_interrupts};

pub struct IrqLock<T> {
    inner: Mutex<T>,
}

pub struct IrqGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    were_enabled: bool,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqGuard<'_, T> {
        let were_enabled = disable_interrupts_save();
        let guard = self.inner.lock();
        IrqGuard {
            guard,
            were_enabled,
        }
    }

    /// # Safety
    /// Caller must guarantee no other context holds this lock; used
    /// only for teardown of a structure about to be destroyed.
    pub unsafe fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        restore_interrupts(self.were_enabled);
    }
}
