//! Per-CPU run queue.
//!
//! A 5x32 matrix of FIFO priority buckets with two-level bitmaps on top:
//! `active_bitmap[class]` marks non-empty levels, `class_bitmap` marks
//! non-empty classes, so pick-next is two bit scans. Buckets are intrusive
//! lists of tids; the prev/next link nodes live inside the queue (one per
//! possible tid), so queue surgery never touches the thread arena.
//!
//! The queue is guarded by one ticket spinlock taken with IRQs disabled;
//! this type holds only the data and leaves locking to the owner.

use super::thread::Tid;
use crate::config::{MAX_THREADS, NUM_SCHED_CLASSES, PRIO_LEVELS_PER_CLASS};

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct Bucket {
    head: u32,
    tail: u32,
    count: u32,
}

impl Bucket {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        count: 0,
    };
}

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

impl Link {
    const FREE: Self = Self {
        prev: NIL,
        next: NIL,
    };
}

pub struct RunQueue {
    pub cpu_id: u32,

    buckets: [[Bucket; PRIO_LEVELS_PER_CLASS]; NUM_SCHED_CLASSES],
    active_bitmap: [u32; NUM_SCHED_CLASSES],
    class_bitmap: u32,

    pub nr_running: u32,
    pub nr_switches: u64,
    pub load: u64,

    pub last_balance_ns: u64,
    pub current: Option<Tid>,
    pub idle: Option<Tid>,

    /// Run-queue clock, nanoseconds.
    pub clock_ns: u64,
    pub tick_count: u64,

    links: [Link; MAX_THREADS],
}

impl RunQueue {
    pub const fn new(cpu_id: u32) -> Self {
        Self {
            cpu_id,
            buckets: [[Bucket::EMPTY; PRIO_LEVELS_PER_CLASS]; NUM_SCHED_CLASSES],
            active_bitmap: [0; NUM_SCHED_CLASSES],
            class_bitmap: 0,
            nr_running: 0,
            nr_switches: 0,
            load: 0,
            last_balance_ns: 0,
            current: None,
            idle: None,
            clock_ns: 0,
            tick_count: 0,
            links: [Link::FREE; MAX_THREADS],
        }
    }

    /// Reset in place (used when the queue memory comes from the page
    /// allocator zeroed, where the link sentinels are wrong).
    pub fn init(&mut self, cpu_id: u32) {
        *self = Self::new(cpu_id);
    }

    /// Append `tid` to the tail of bucket `(class, level)`.
    pub fn enqueue_tail(&mut self, tid: Tid, class: usize, level: usize) {
        debug_assert!(class < NUM_SCHED_CLASSES && level < PRIO_LEVELS_PER_CLASS);
        debug_assert!((tid as usize) < MAX_THREADS);

        let bucket = &mut self.buckets[class][level];
        let index = tid;

        self.links[index as usize] = Link {
            prev: bucket.tail,
            next: NIL,
        };
        if bucket.tail != NIL {
            self.links[bucket.tail as usize].next = index;
        } else {
            bucket.head = index;
        }
        bucket.tail = index;
        bucket.count += 1;

        self.nr_running += 1;
        self.active_bitmap[class] |= 1 << level;
        self.class_bitmap |= 1 << class;
    }

    /// Unlink `tid` from bucket `(class, level)`, clearing the bitmap bits
    /// when the bucket empties.
    pub fn dequeue(&mut self, tid: Tid, class: usize, level: usize) {
        debug_assert!(class < NUM_SCHED_CLASSES && level < PRIO_LEVELS_PER_CLASS);

        let link = self.links[tid as usize];
        let bucket = &mut self.buckets[class][level];

        if link.prev != NIL {
            self.links[link.prev as usize].next = link.next;
        } else {
            bucket.head = link.next;
        }
        if link.next != NIL {
            self.links[link.next as usize].prev = link.prev;
        } else {
            bucket.tail = link.prev;
        }
        self.links[tid as usize] = Link::FREE;

        debug_assert!(bucket.count > 0);
        bucket.count -= 1;
        self.nr_running -= 1;

        if bucket.count == 0 {
            self.active_bitmap[class] &= !(1 << level);
            if self.active_bitmap[class] == 0 {
                self.class_bitmap &= !(1 << class);
            }
        }
    }

    /// Highest-priority runnable thread: MSB of the class bitmap, then MSB
    /// of that class's level bitmap, then the FIFO head of the bucket.
    pub fn peek_highest(&self) -> Option<(Tid, usize, usize)> {
        if self.class_bitmap == 0 {
            return None;
        }
        let class = 31 - self.class_bitmap.leading_zeros() as usize;
        let levels = self.active_bitmap[class];
        debug_assert!(levels != 0);
        let level = 31 - levels.leading_zeros() as usize;
        let head = self.buckets[class][level].head;
        debug_assert!(head != NIL);
        Some((head, class, level))
    }

    /// FIFO-order walk of one bucket.
    pub fn bucket_iter(&self, class: usize, level: usize) -> BucketIter<'_> {
        BucketIter {
            rq: self,
            next: self.buckets[class][level].head,
        }
    }

    pub fn bucket_count(&self, class: usize, level: usize) -> u32 {
        self.buckets[class][level].count
    }

    pub fn active_bitmap(&self, class: usize) -> u32 {
        self.active_bitmap[class]
    }

    pub fn class_bitmap(&self) -> u32 {
        self.class_bitmap
    }
}

pub struct BucketIter<'a> {
    rq: &'a RunQueue,
    next: u32,
}

impl Iterator for BucketIter<'_> {
    type Item = Tid;

    fn next(&mut self) -> Option<Tid> {
        if self.next == NIL {
            return None;
        }
        let tid = self.next;
        self.next = self.rq.links[tid as usize].next;
        Some(tid)
    }
}
