//! Scheduler subsystem.
//!
//! Per-CPU run queues with priority-class-aware O(1) dispatch. Five
//! scheduling classes (the four OS/2 priority classes plus internal
//! Realtime) each hold 32 FIFO levels; two bitmap scans find the highest
//! runnable thread. Cross-CPU wakes and affinity changes lock only the
//! target queue and signal with a reschedule IPI, and the pull-model load
//! balancer resolves imbalance one thread at a time.
//!
//! ## Module organization
//!
//! - `thread`: thread control blocks, states, classes, the tid arena
//! - `runqueue`: bucket matrix, bitmaps, intrusive FIFO lists
//! - `core`: schedule/tick/block/wake, affinity, boost, idle loop
//! - `balance`: load-balance policy (busiest CPU, victim selection)
//! - `context`: callee-saved context switch
//!
//! ## Lock ordering (acquire left to right)
//!
//! 1. `Scheduler::global_lock`
//! 2. one run-queue lock (never two)
//! 3. the thread arena lock
//! 4. the cross-call broadcast lock (`smp::ipi`)

pub mod balance;
pub mod context;
#[allow(clippy::module_inception)]
mod core;
pub mod runqueue;
pub mod thread;

pub use self::core::{
    block, boost, collect_owned, current_tid, dequeue, enqueue, get_affinity, idle_loop, init,
    init_cpu, kill,
    load_balance, maybe_balance, reap, resume, schedule, set_affinity, set_clock_hz,
    set_priority, sleep_ns, suspend, thread_create, thread_exit, tick, unblock, wake_channel,
    yield_now, CreateFlags,
};
