//! Interrupt-safe locking.
//!
//! A plain spin lock is not enough for state that the timer interrupt can reach: if the tick fires
//! while the lock is held on the same core, the handler spins forever. [`IrqMutex`] therefore
//! disables interrupts for as long as the guard lives and restores the exact interrupt-enable
//! state it found once the guard is dropped.

use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use spin::{Mutex, MutexGuard};

use crate::interrupts;

/// Spin lock that keeps interrupts disabled while held.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Disables interrupts, then spins until the lock is acquired.
    ///
    /// The interrupt flag observed on entry is restored verbatim when the guard is dropped, so
    /// nesting inside an outer interrupts-off section never re-enables interrupts early.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let were_enabled = interrupts::are_enabled();
        if were_enabled {
            interrupts::disable();
        }

        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            were_enabled,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Releases the lock without a guard, leaving the interrupt flag as it is.
    ///
    /// # Safety
    ///
    /// Whoever holds the lock must never touch the data again.
    pub unsafe fn force_unlock(&self) {
        unsafe { self.inner.force_unlock() };
    }
}

/// Guard returned by [`IrqMutex::lock`]. Releases the lock, then restores the interrupt flag.
pub struct IrqMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    were_enabled: bool,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the inner guard is dropped exactly once, here, and never touched again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };

        if self.were_enabled {
            interrupts::enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_disables_and_restores_enabled_interrupts() {
        interrupts::enable();
        let lock = IrqMutex::new(5u32);
        {
            let mut guard = lock.lock();
            assert!(!interrupts::are_enabled());
            *guard += 1;
        }
        assert!(interrupts::are_enabled());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn release_keeps_interrupts_disabled_when_they_were_disabled() {
        interrupts::disable();
        let lock = IrqMutex::new(());
        drop(lock.lock());
        assert!(!interrupts::are_enabled());
    }

    #[test]
    fn nested_guards_restore_in_reverse_order() {
        interrupts::enable();
        let outer = IrqMutex::new(1u8);
        let inner = IrqMutex::new(2u8);

        let outer_guard = outer.lock();
        {
            let _inner_guard = inner.lock();
            assert!(!interrupts::are_enabled());
        }
        // the inner guard saw interrupts already off and must not turn them back on
        assert!(!interrupts::are_enabled());
        drop(outer_guard);
        assert!(interrupts::are_enabled());
    }

    #[test]
    fn force_unlock_frees_an_abandoned_lock() {
        interrupts::disable();
        let lock = IrqMutex::new(7u8);
        core::mem::forget(lock.lock());
        assert!(lock.is_locked());

        unsafe { lock.force_unlock() };
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 7);
    }
}
