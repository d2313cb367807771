//! Interrupt-disabling spinlock.
//!
//! Holding a `SpinLock` implies interrupts are disabled on this hart:
//! `lock` goes through [`cpu::push_off`] before spinning and the guard's
//! drop goes through [`cpu::pop_off`], so nested acquisitions only restore
//! interrupts when the outermost lock is released. The owning cpu is
//! recorded so `holding` can answer "does *this* hart hold the lock".

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::cpu;

/// No owner sentinel for the owner word (cpu ids are stored +1).
const NO_OWNER: usize = 0;

pub struct SpinLock<T> {
    locked: AtomicBool,
    /// Owning cpu id plus one; 0 means unheld.
    owner: AtomicUsize,
    name: &'static str,
    value: UnsafeCell<T>,
}

// SAFETY: the lock protocol guarantees exclusive access to the inner value.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            name,
            value: UnsafeCell::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, disabling interrupts on this hart for the
    /// duration of the hold.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        cpu::push_off();
        assert!(
            !self.holding_nocheck(),
            "spinlock {}: recursive acquire",
            self.name
        );
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner.store(arch::cpu_id() + 1, Ordering::Relaxed);
        SpinGuard { lock: self }
    }

    /// Does the current hart hold this lock?
    pub fn holding(&self) -> bool {
        cpu::push_off();
        let held = self.holding_nocheck();
        cpu::pop_off();
        held
    }

    fn holding_nocheck(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == arch::cpu_id() + 1
    }

    /// Release a lock that is held but has no live guard.
    ///
    /// # Safety
    ///
    /// The lock must be held by this hart with no `SpinGuard` alive (the
    /// guard was forgotten, or the lock was inherited across a context
    /// switch as in the scheduler's first-return path). No references into
    /// the protected value may outlive this call.
    pub unsafe fn force_unlock(&self) {
        assert!(self.holding_nocheck(), "force_unlock of unheld {}", self.name);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        cpu::pop_off();
    }

    /// Access the protected value while the lock is known to be held by
    /// this hart without a live guard.
    ///
    /// # Safety
    ///
    /// The caller must guarantee this hart holds the lock (e.g. it was
    /// acquired by the scheduler before switching here) and that no other
    /// reference to the value exists.
    pub unsafe fn assume_locked(&self) -> &mut T {
        debug_assert!(self.holding_nocheck());
        // SAFETY: exclusivity is the caller's contract.
        unsafe { &mut *self.value.get() }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinGuard<'a, T> {
    /// Release the guard and hand back the lock so it can be re-acquired
    /// later (the sleep path releases the condition lock this way).
    pub fn unlock(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        drop(self);
        lock
    }

    /// The lock this guard was taken from.
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held by this hart.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        cpu::pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip() {
        let _serial = crate::cpu::test_support::serialize();
        let lock = SpinLock::new("test", 41usize);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.holding());
        }
        assert!(!lock.holding());
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn unlock_returns_lock() {
        let _serial = crate::cpu::test_support::serialize();
        let lock = SpinLock::new("test", 7usize);
        let g = lock.lock();
        let handle = g.unlock();
        assert!(!lock.holding());
        assert_eq!(*handle.lock(), 7);
    }
}
