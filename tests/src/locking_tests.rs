//! Ticket lock, reader/writer lock, and sequence lock behavior, including
//! the fairness guarantee the ticket algorithm exists for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread as host_thread;
use std::time::Duration;

use crate::rwlock::RwSpinLock;
use crate::seqlock::SeqLock;
use crate::spinlock::{RawTicketLock, SpinLock};

#[test]
fn ticket_lock_starts_free() {
    let lock = RawTicketLock::new();
    assert!(!lock.is_locked());
    assert!(lock.try_lock());
    assert!(lock.is_locked());
    lock.unlock();
    assert!(!lock.is_locked());
}

#[test]
fn try_lock_fails_while_held() {
    let lock = RawTicketLock::new();
    lock.lock();
    assert!(!lock.try_lock());
    lock.unlock();
    assert!(lock.try_lock());
    lock.unlock();
}

#[test]
fn lock_unlock_is_identity_for_other_cpus() {
    // After any number of lock/unlock pairs the lock is indistinguishable
    // from fresh: free, and try_lock succeeds immediately.
    let lock = RawTicketLock::new();
    for _ in 0..1000 {
        lock.lock();
        lock.unlock();
    }
    assert!(!lock.is_locked());
    assert!(lock.try_lock());
    lock.unlock();
}

#[test]
fn guard_provides_mutual_exclusion() {
    let counter = Arc::new(SpinLock::new(0u64));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let counter = Arc::clone(&counter);
        handles.push(host_thread::spawn(move || {
            for _ in 0..1000 {
                *counter.lock() += 1;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*counter.lock(), 8_000);
}

#[test]
fn tickets_are_served_in_issue_order() {
    // 8 threads each take the lock 200 times. Inside the critical section
    // we record the ticket that was just served; since recording happens
    // under the lock, the recorded sequence is the service order, which
    // must be exactly the issue order: 0, 1, 2, ...
    let lock = Arc::new(RawTicketLock::new());
    let served = Arc::new(SpinLock::new(Vec::new()));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let lock = Arc::clone(&lock);
        let served = Arc::clone(&served);
        handles.push(host_thread::spawn(move || {
            let mut mine = Vec::new();
            for _ in 0..200 {
                let ticket = lock.lock();
                served.lock().push(ticket);
                lock.unlock();
                mine.push(ticket);
            }
            mine
        }));
    }

    let mut per_thread = Vec::new();
    for handle in handles {
        per_thread.push(handle.join().unwrap());
    }

    // Global service order equals issue order.
    let served = served.lock();
    for (position, &ticket) in served.iter().enumerate() {
        assert_eq!(ticket as usize, position);
    }

    // Each thread's own tickets are strictly increasing.
    for mine in per_thread {
        for pair in mine.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}

#[test]
fn rwlock_allows_concurrent_readers() {
    let lock = RwSpinLock::new(7u32);
    let first = lock.read();
    let second = lock.try_read().expect("second reader must be admitted");
    assert_eq!(*first, 7);
    assert_eq!(*second, 7);
}

#[test]
fn rwlock_writer_excludes_readers() {
    let lock = RwSpinLock::new(0u32);
    {
        let mut guard = lock.write();
        *guard = 42;
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
    }
    assert_eq!(*lock.read(), 42);
}

#[test]
fn pending_writer_blocks_new_readers() {
    let lock = Arc::new(RwSpinLock::new(0u32));
    let reader = lock.read();

    let writer_done = Arc::new(AtomicBool::new(false));
    let writer = {
        let lock = Arc::clone(&lock);
        let writer_done = Arc::clone(&writer_done);
        host_thread::spawn(move || {
            let mut guard = lock.write();
            *guard = 1;
            writer_done.store(true, Ordering::SeqCst);
        })
    };

    // Give the writer time to start spinning on the held read lock; from
    // then on new readers must back off instead of starving it.
    host_thread::sleep(Duration::from_millis(50));
    assert!(!writer_done.load(Ordering::SeqCst));
    assert!(lock.try_read().is_none());

    drop(reader);
    writer.join().unwrap();
    assert!(writer_done.load(Ordering::SeqCst));
    assert_eq!(*lock.read(), 1);
}

#[test]
fn seqlock_snapshots_are_consistent() {
    #[derive(Clone, Copy)]
    struct Pair {
        a: u64,
        b: u64,
    }

    let lock = Arc::new(SeqLock::new(Pair { a: 0, b: 0 }));
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let lock = Arc::clone(&lock);
        let stop = Arc::clone(&stop);
        host_thread::spawn(move || {
            let mut value = 0u64;
            while !stop.load(Ordering::Relaxed) {
                value += 1;
                lock.write(|pair| {
                    pair.a = value;
                    pair.b = value;
                });
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        let stop = Arc::clone(&stop);
        readers.push(host_thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let snapshot = lock.read();
                assert_eq!(snapshot.a, snapshot.b);
            }
        }));
    }

    host_thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // An idle seqlock always shows an even sequence.
    assert_eq!(lock.sequence() % 2, 0);
}
