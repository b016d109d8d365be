//! Ticket spinlock.
//!
//! Waiters take a ticket by incrementing `tail` and spin until `head`
//! reaches it; unlock advances `head`. Tickets are served strictly in issue
//! order, so no waiter starves. The two 16-bit counters are packed into one
//! 32-bit word.
//!
//! Run-queue and AP-boot critical sections are entered through
//! [`SpinLock::lock_irqsave`], which disables interrupts for the duration of
//! the guard and restores the captured flag state exactly on drop.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, Ordering};

use x86_64::instructions::interrupts;

use super::barrier::cpu_relax;

/// The bare ticket counters, usable without a protected value (AP boot
/// rendezvous, cross-call serialization).
#[repr(C)]
pub struct RawTicketLock {
    head: AtomicU16,
    tail: AtomicU16,
}

impl RawTicketLock {
    pub const fn new() -> Self {
        Self {
            head: AtomicU16::new(0),
            tail: AtomicU16::new(0),
        }
    }

    /// Acquire, returning the ticket that was served (exposed so fairness
    /// is observable).
    pub fn lock(&self) -> u16 {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        while self.head.load(Ordering::Acquire) != ticket {
            cpu_relax();
        }
        ticket
    }

    pub fn unlock(&self) {
        self.head.fetch_add(1, Ordering::Release);
    }

    /// Non-blocking acquire. Fails whenever any ticket is outstanding.
    pub fn try_lock(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if head != tail {
            return false;
        }
        self.tail
            .compare_exchange(tail, tail.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.head.load(Ordering::Relaxed) != self.tail.load(Ordering::Relaxed)
    }
}

/// A value guarded by a ticket lock.
pub struct SpinLock<T: ?Sized> {
    raw: RawTicketLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawTicketLock::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard {
            lock: self,
            irq_state: None,
        }
    }

    /// Disable interrupts, then acquire. The guard restores the captured
    /// interrupt-enable flag when dropped, after releasing the lock.
    pub fn lock_irqsave(&self) -> SpinLockGuard<'_, T> {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        self.raw.lock();
        SpinLockGuard {
            lock: self,
            irq_state: Some(was_enabled),
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard {
                lock: self,
                irq_state: None,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    irq_state: Option<bool>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
        if let Some(true) = self.irq_state {
            interrupts::enable();
        }
    }
}
