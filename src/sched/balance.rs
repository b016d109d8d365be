//! Load-balance policy (pull model).
//!
//! Pure decision functions: given queue lengths, find the busiest donor;
//! given the donor's queue, find one migratable thread. The locking and the
//! actual migration live in `sched::core`. Victims are searched lowest
//! class first and, within a class, lowest level first, so high-priority
//! work keeps its cache locality and is moved last.

use super::runqueue::RunQueue;
use super::thread::{ThreadTable, Tid};
use crate::config::{CACHE_HOT_NS, IMBALANCE_THRESHOLD, NUM_SCHED_CLASSES, PRIO_LEVELS_PER_CLASS};

/// Find the CPU with the longest queue that exceeds ours by more than the
/// imbalance threshold. `loads` holds `(cpu, nr_running)` for online
/// siblings (the caller excludes us).
pub fn find_busiest(loads: &[(u32, u32)], this_load: u32) -> Option<u32> {
    let mut busiest = None;
    let mut max_load = this_load + IMBALANCE_THRESHOLD;

    for &(cpu, load) in loads {
        if load > max_load {
            max_load = load;
            busiest = Some(cpu);
        }
    }

    busiest
}

/// Pick one thread to pull from `donor` onto `this_cpu`. A candidate must
/// allow `this_cpu` in its affinity mask, must not be bound, and (for the
/// periodic balancer) must not have run within the cache-hot window. At
/// most one thread moves per invocation, to damp oscillation.
pub fn select_victim(
    donor: &RunQueue,
    threads: &ThreadTable,
    this_cpu: u32,
    now_ns: u64,
    skip_cache_hot: bool,
) -> Option<Tid> {
    for class in 0..NUM_SCHED_CLASSES {
        if donor.class_bitmap() & (1 << class) == 0 {
            continue;
        }
        for level in 0..PRIO_LEVELS_PER_CLASS {
            if donor.active_bitmap(class) & (1 << level) == 0 {
                continue;
            }
            for tid in donor.bucket_iter(class, level) {
                let Some(thread) = threads.get(tid) else {
                    continue;
                };
                if thread.affinity & (1u64 << this_cpu) == 0 {
                    continue;
                }
                if thread.bound || thread.migrating {
                    continue;
                }
                if skip_cache_hot && now_ns.saturating_sub(thread.last_run_ns) < CACHE_HOT_NS {
                    continue;
                }
                return Some(tid);
            }
        }
    }
    None
}
