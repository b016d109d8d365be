//! Reader/writer spinlock.
//!
//! A signed counter holds the lock state: 0 free, positive = reader count,
//! -1 = writer. Writers serialize on an internal ticket lock and raise a
//! pending flag while waiting for readers to drain; new readers back off
//! while the flag is up, so a stream of readers cannot starve a writer.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use super::barrier::cpu_relax;
use super::spinlock::RawTicketLock;

pub struct RwSpinLock<T: ?Sized> {
    count: AtomicI32,
    writer_pending: AtomicBool,
    writer: RawTicketLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwSpinLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            count: AtomicI32::new(0),
            writer_pending: AtomicBool::new(false),
            writer: RawTicketLock::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwSpinLock<T> {
    pub fn read(&self) -> RwReadGuard<'_, T> {
        loop {
            if self.writer_pending.load(Ordering::Relaxed) {
                cpu_relax();
                continue;
            }
            let count = self.count.load(Ordering::Relaxed);
            if count >= 0
                && self
                    .count
                    .compare_exchange(count, count + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwReadGuard { lock: self };
            }
            cpu_relax();
        }
    }

    pub fn try_read(&self) -> Option<RwReadGuard<'_, T>> {
        if self.writer_pending.load(Ordering::Relaxed) {
            return None;
        }
        let count = self.count.load(Ordering::Relaxed);
        if count >= 0
            && self
                .count
                .compare_exchange(count, count + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            Some(RwReadGuard { lock: self })
        } else {
            None
        }
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        self.writer.lock();
        self.writer_pending.store(true, Ordering::Relaxed);
        while self
            .count
            .compare_exchange(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cpu_relax();
        }
        self.writer_pending.store(false, Ordering::Relaxed);
        RwWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwWriteGuard<'_, T>> {
        if !self.writer.try_lock() {
            return None;
        }
        if self
            .count
            .compare_exchange(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RwWriteGuard { lock: self })
        } else {
            self.writer.unlock();
            None
        }
    }
}

pub struct RwReadGuard<'a, T: ?Sized> {
    lock: &'a RwSpinLock<T>,
}

impl<T: ?Sized> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.count.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwWriteGuard<'a, T: ?Sized> {
    lock: &'a RwSpinLock<T>,
}

impl<T: ?Sized> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.count.store(0, Ordering::Release);
        self.lock.writer.unlock();
    }
}
