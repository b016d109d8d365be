//! Scheduling policy: OS/2 priority mapping, boost decay, time-slice
//! accounting, and the load-balancer's migration rules.

use crate::balance::{find_busiest, select_victim};
use crate::config::{CACHE_HOT_NS, DEFAULT_TIMESLICE_TICKS};
use crate::error::SchedError;
use crate::runqueue::RunQueue;
use crate::thread::{
    os2_delta_to_level, SchedClass, Thread, ThreadState, ThreadTable,
};

#[test]
fn os2_class_mapping() {
    assert_eq!(SchedClass::from_os2(1), Ok(SchedClass::Idle));
    assert_eq!(SchedClass::from_os2(2), Ok(SchedClass::Regular));
    assert_eq!(SchedClass::from_os2(3), Ok(SchedClass::TimeCritical));
    assert_eq!(SchedClass::from_os2(4), Ok(SchedClass::Server));
    assert_eq!(SchedClass::from_os2(5), Err(SchedError::InvalidPriorityClass));
    assert_eq!(SchedClass::from_os2(0), Err(SchedError::InvalidPriorityClass));
}

#[test]
fn os2_delta_boundaries() {
    // The full delta range maps into 0..=31; one past either end is
    // rejected.
    assert_eq!(os2_delta_to_level(-31), Ok(0));
    assert_eq!(os2_delta_to_level(0), Ok(15));
    assert_eq!(os2_delta_to_level(31), Ok(31));
    assert_eq!(os2_delta_to_level(-32), Err(SchedError::InvalidPriorityDelta));
    assert_eq!(os2_delta_to_level(32), Err(SchedError::InvalidPriorityDelta));
}

#[test]
fn os2_delta_is_monotonic() {
    let mut last = 0;
    for delta in -31..=31 {
        let level = os2_delta_to_level(delta).unwrap();
        assert!(level >= last);
        last = level;
    }
}

#[test]
fn dynamic_priority_clamps_to_class_range() {
    let mut thread = Thread::new(1, "t", SchedClass::Regular, 28);
    thread.apply_boost(10, 5);
    assert_eq!(thread.dynamic_priority, 31);

    thread.apply_boost(-31, 5);
    assert_eq!(thread.dynamic_priority, 0);
}

#[test]
fn boost_decays_back_to_base_priority() {
    // boost(d, n) followed by n ticks restores the base priority exactly.
    let mut thread = Thread::new(1, "t", SchedClass::Regular, 16);
    thread.apply_boost(8, 4);
    assert_eq!(thread.dynamic_priority, 24);

    for _ in 0..4 {
        thread.tick();
    }
    assert_eq!(thread.dynamic_priority, 16);
    assert_eq!(thread.priority_boost, 0);
    assert_eq!(thread.boost_ticks, 0);
}

#[test]
fn timeslice_exhaustion_requests_reschedule() {
    let mut thread = Thread::new(1, "t", SchedClass::Regular, 16);
    for tick in 1..=DEFAULT_TIMESLICE_TICKS {
        let expired = thread.tick();
        assert_eq!(expired, tick == DEFAULT_TIMESLICE_TICKS);
    }
    // Exhausted stays exhausted until the scheduler refills it.
    assert!(thread.tick());
}

#[test]
fn thread_table_recycles_slots() {
    let mut table = ThreadTable::new();
    let a = table.insert(Thread::new(0, "a", SchedClass::Regular, 16)).unwrap();
    let b = table.insert(Thread::new(0, "b", SchedClass::Regular, 16)).unwrap();
    assert_ne!(a, b);
    assert_eq!(table.len(), 2);

    table.remove(a);
    assert_eq!(table.len(), 1);
    let c = table.insert(Thread::new(0, "c", SchedClass::Regular, 16)).unwrap();
    assert_eq!(c, a);
    assert_eq!(table.get(c).unwrap().name, "c");
}

#[test]
fn busiest_cpu_respects_imbalance_threshold() {
    // Our load 2: a queue of 3 is within threshold, 4 is a donor.
    assert_eq!(find_busiest(&[(1, 3)], 2), None);
    assert_eq!(find_busiest(&[(1, 4)], 2), Some(1));
    assert_eq!(find_busiest(&[(1, 4), (2, 6), (3, 5)], 2), Some(2));
    assert_eq!(find_busiest(&[], 0), None);
}

fn ready_thread(table: &mut ThreadTable, rq: &mut RunQueue, level: u8) -> u32 {
    let mut thread = Thread::new(0, "w", SchedClass::Regular, level);
    thread.state = ThreadState::Ready;
    thread.last_run_ns = 0;
    let tid = table.insert(thread).unwrap();
    table.get_mut(tid).unwrap().on_rq = Some(rq.cpu_id);
    rq.enqueue_tail(tid, SchedClass::Regular.index(), level as usize);
    tid
}

#[test]
fn victim_selection_honors_affinity_and_bound() {
    let mut table = ThreadTable::new();
    let mut rq = RunQueue::new(0);
    let now = CACHE_HOT_NS * 10;

    let pinned = ready_thread(&mut table, &mut rq, 4);
    table.get_mut(pinned).unwrap().affinity = 1 << 0;

    let bound = ready_thread(&mut table, &mut rq, 5);
    table.get_mut(bound).unwrap().bound = true;

    let movable = ready_thread(&mut table, &mut rq, 6);

    // Pulling to CPU 1: the pinned thread does not allow CPU 1 and the
    // bound one may never migrate.
    assert_eq!(select_victim(&rq, &table, 1, now, true), Some(movable));
}

#[test]
fn cache_hot_threads_stay_unless_idle_pull() {
    let mut table = ThreadTable::new();
    let mut rq = RunQueue::new(0);
    let now = CACHE_HOT_NS * 10;

    let hot = ready_thread(&mut table, &mut rq, 4);
    table.get_mut(hot).unwrap().last_run_ns = now - CACHE_HOT_NS / 2;

    // The periodic balancer skips it; the idle path takes anything.
    assert_eq!(select_victim(&rq, &table, 1, now, true), None);
    assert_eq!(select_victim(&rq, &table, 1, now, false), Some(hot));
}

#[test]
fn victims_come_from_the_lowest_class_first() {
    let mut table = ThreadTable::new();
    let mut rq = RunQueue::new(0);
    let now = CACHE_HOT_NS * 10;

    let mut critical = Thread::new(0, "crit", SchedClass::TimeCritical, 10);
    critical.state = ThreadState::Ready;
    let critical = table.insert(critical).unwrap();
    rq.enqueue_tail(critical, SchedClass::TimeCritical.index(), 10);

    let regular = ready_thread(&mut table, &mut rq, 16);

    // High-priority work keeps its cache locality; the Regular thread is
    // migrated first.
    assert_eq!(select_victim(&rq, &table, 1, now, true), Some(regular));
}

#[test]
fn migrating_threads_are_skipped() {
    let mut table = ThreadTable::new();
    let mut rq = RunQueue::new(0);
    let now = CACHE_HOT_NS * 10;

    let in_flight = ready_thread(&mut table, &mut rq, 4);
    table.get_mut(in_flight).unwrap().migrating = true;

    assert_eq!(select_victim(&rq, &table, 1, now, true), None);
}

#[test]
fn one_migration_resolves_a_four_zero_imbalance() {
    // Four runnable threads on CPU 0, CPU 1 idle: the balancer moves
    // exactly one thread, giving (3, 1).
    let mut table = ThreadTable::new();
    let mut donor = RunQueue::new(0);
    let mut receiver = RunQueue::new(1);
    let now = CACHE_HOT_NS * 10;

    for _ in 0..4 {
        ready_thread(&mut table, &mut donor, 16);
    }

    let busiest = find_busiest(&[(0, donor.nr_running)], receiver.nr_running);
    assert_eq!(busiest, Some(0));

    let victim = select_victim(&donor, &table, 1, now, true).unwrap();
    let thread = table.get_mut(victim).unwrap();
    let (class, level) = (thread.sched_class.index(), thread.bucket_level() as usize);
    donor.dequeue(victim, class, level);
    thread.on_rq = Some(1);
    thread.preferred_cpu = 1;
    receiver.enqueue_tail(victim, class, level);

    assert_eq!(donor.nr_running, 3);
    assert_eq!(receiver.nr_running, 1);

    // A later pass moves one more, and (2, 2) is equilibrium.
    let victim = select_victim(&donor, &table, 1, now, true).unwrap();
    let thread = table.get_mut(victim).unwrap();
    let (class, level) = (thread.sched_class.index(), thread.bucket_level() as usize);
    donor.dequeue(victim, class, level);
    receiver.enqueue_tail(victim, class, level);

    assert_eq!((donor.nr_running, receiver.nr_running), (2, 2));
    assert_eq!(
        find_busiest(&[(0, donor.nr_running)], receiver.nr_running),
        None
    );
}
