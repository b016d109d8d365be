//! Run-queue structure invariants: bucket/bitmap consistency, FIFO order
//! within a bucket, and the two-bit-scan pick order.

use crate::config::{NUM_SCHED_CLASSES, PRIO_LEVELS_PER_CLASS};
use crate::runqueue::RunQueue;
use crate::thread::SchedClass;

fn assert_consistent(rq: &RunQueue) {
    // Invariants: a bucket is non-empty iff its bit is set; a class bit is
    // set iff its level bitmap is non-zero; nr_running is the sum of the
    // bucket counts.
    let mut total = 0;
    for class in 0..NUM_SCHED_CLASSES {
        let mut level_bits = 0u32;
        for level in 0..PRIO_LEVELS_PER_CLASS {
            let count = rq.bucket_count(class, level);
            total += count;
            let bit = rq.active_bitmap(class) & (1 << level) != 0;
            assert_eq!(count > 0, bit, "class {} level {}", class, level);
            if count > 0 {
                level_bits |= 1 << level;
            }
            assert_eq!(
                rq.bucket_iter(class, level).count() as u32,
                count,
                "list length disagrees with count"
            );
        }
        assert_eq!(rq.active_bitmap(class), level_bits);
        assert_eq!(
            rq.class_bitmap() & (1 << class) != 0,
            level_bits != 0,
            "class bitmap for class {}",
            class
        );
    }
    assert_eq!(rq.nr_running, total);
}

#[test]
fn empty_queue_has_clear_bitmaps() {
    let rq = RunQueue::new(0);
    assert_eq!(rq.class_bitmap(), 0);
    assert_eq!(rq.nr_running, 0);
    assert!(rq.peek_highest().is_none());
    assert_consistent(&rq);
}

#[test]
fn enqueue_sets_bits_dequeue_clears_them() {
    let mut rq = RunQueue::new(0);
    let class = SchedClass::Regular.index();

    rq.enqueue_tail(5, class, 16);
    assert_eq!(rq.nr_running, 1);
    assert!(rq.active_bitmap(class) & (1 << 16) != 0);
    assert!(rq.class_bitmap() & (1 << class) != 0);
    assert_consistent(&rq);

    rq.dequeue(5, class, 16);
    assert_eq!(rq.nr_running, 0);
    assert_eq!(rq.active_bitmap(class), 0);
    assert_eq!(rq.class_bitmap(), 0);
    assert_consistent(&rq);
}

#[test]
fn enqueue_dequeue_leaves_queue_bit_identical() {
    let mut rq = RunQueue::new(0);
    let class = SchedClass::Regular.index();

    for tid in [10, 11, 12] {
        rq.enqueue_tail(tid, class, 8);
    }
    rq.enqueue_tail(20, SchedClass::Server.index(), 3);

    let order_before: Vec<_> = rq.bucket_iter(class, 8).collect();
    let bitmap_before = rq.active_bitmap(class);
    let classes_before = rq.class_bitmap();
    let running_before = rq.nr_running;

    rq.enqueue_tail(42, class, 8);
    rq.dequeue(42, class, 8);

    assert_eq!(rq.bucket_iter(class, 8).collect::<Vec<_>>(), order_before);
    assert_eq!(rq.active_bitmap(class), bitmap_before);
    assert_eq!(rq.class_bitmap(), classes_before);
    assert_eq!(rq.nr_running, running_before);
    assert_consistent(&rq);
}

#[test]
fn buckets_are_fifo() {
    let mut rq = RunQueue::new(0);
    let class = SchedClass::Regular.index();

    for tid in [3, 1, 4, 1 + 4, 9] {
        rq.enqueue_tail(tid, class, 0);
    }
    assert_eq!(
        rq.bucket_iter(class, 0).collect::<Vec<_>>(),
        vec![3, 1, 4, 5, 9]
    );

    // Removal from the middle keeps the remaining order.
    rq.dequeue(4, class, 0);
    assert_eq!(
        rq.bucket_iter(class, 0).collect::<Vec<_>>(),
        vec![3, 1, 5, 9]
    );
    assert_consistent(&rq);
}

#[test]
fn pick_prefers_highest_class_then_highest_level() {
    let mut rq = RunQueue::new(0);

    rq.enqueue_tail(1, SchedClass::Idle.index(), 31);
    rq.enqueue_tail(2, SchedClass::Regular.index(), 16);
    rq.enqueue_tail(3, SchedClass::Regular.index(), 30);
    rq.enqueue_tail(4, SchedClass::TimeCritical.index(), 0);

    // Time-critical level 0 beats Regular level 30: class dominates.
    let (tid, class, level) = rq.peek_highest().unwrap();
    assert_eq!((tid, class, level), (4, SchedClass::TimeCritical.index(), 0));
    rq.dequeue(tid, class, level);

    // Then the highest level within the highest remaining class.
    let (tid, class, level) = rq.peek_highest().unwrap();
    assert_eq!((tid, class, level), (3, SchedClass::Regular.index(), 30));
    rq.dequeue(tid, class, level);

    let (tid, ..) = rq.peek_highest().unwrap();
    assert_eq!(tid, 2);
    assert_consistent(&rq);
}

#[test]
fn pick_is_fifo_within_a_bucket() {
    let mut rq = RunQueue::new(0);
    let class = SchedClass::Server.index();

    for tid in [7, 8, 9] {
        rq.enqueue_tail(tid, class, 12);
    }

    for expected in [7, 8, 9] {
        let (tid, c, l) = rq.peek_highest().unwrap();
        assert_eq!(tid, expected);
        rq.dequeue(tid, c, l);
    }
    assert!(rq.peek_highest().is_none());
}

#[test]
fn interleaved_ops_keep_invariants() {
    let mut rq = RunQueue::new(2);

    // A deterministic pseudo-random walk over enqueues and dequeues.
    let mut present: Vec<(u32, usize, usize)> = Vec::new();
    let mut seed = 0x9E37u32;
    for step in 0..500u32 {
        seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
        let class = (seed >> 3) as usize % NUM_SCHED_CLASSES;
        let level = (seed >> 7) as usize % PRIO_LEVELS_PER_CLASS;

        if step % 3 != 2 || present.is_empty() {
            let tid = step % 200;
            if present.iter().any(|&(t, _, _)| t == tid) {
                continue;
            }
            rq.enqueue_tail(tid, class, level);
            present.push((tid, class, level));
        } else {
            let victim = present.remove((seed as usize) % present.len());
            rq.dequeue(victim.0, victim.1, victim.2);
        }
        assert_consistent(&rq);
    }

    for (tid, class, level) in present {
        rq.dequeue(tid, class, level);
    }
    assert_eq!(rq.nr_running, 0);
    assert_eq!(rq.class_bitmap(), 0);
}
