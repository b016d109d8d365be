//! Sequence lock for read-mostly data.
//!
//! Writers hold a ticket lock and bump the sequence counter around the
//! update (odd = write in progress). Readers snapshot the sequence, copy the
//! value, and retry if the sequence moved or was odd.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use super::barrier::cpu_relax;
use super::spinlock::RawTicketLock;

pub struct SeqLock<T: Copy> {
    sequence: AtomicU32,
    writer: RawTicketLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            sequence: AtomicU32::new(0),
            writer: RawTicketLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Take a consistent snapshot of the value.
    pub fn read(&self) -> T {
        loop {
            let start = self.sequence.load(Ordering::Acquire);
            if start & 1 != 0 {
                cpu_relax();
                continue;
            }
            let value = unsafe { core::ptr::read_volatile(self.data.get()) };
            if self.sequence.load(Ordering::Acquire) == start {
                return value;
            }
            cpu_relax();
        }
    }

    /// Run `f` over the value under the write lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.writer.lock();
        self.sequence.fetch_add(1, Ordering::AcqRel);
        let result = f(unsafe { &mut *self.data.get() });
        self.sequence.fetch_add(1, Ordering::Release);
        self.writer.unlock();
        result
    }

    /// Current sequence value, for diagnostics.
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }
}
