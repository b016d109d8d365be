//! WarpOS test suite.
//!
//! Tests kernel code by including the kernel sources directly. This
//! bypasses no_std restrictions while testing the actual kernel logic:
//!
//! 1. Stub macros (`kinfo!`, `ktrace!`, ...) replace the kernel's logging
//!    macros.
//! 2. `#[path = "..."]` pulls in kernel source files. Modules that refer
//!    to siblings via `super::` or `crate::` resolve against the same
//!    module names re-created at this crate's root.
//! 3. `core::` references work because std re-exports core.
//!
//! Hardware-bound modules (APIC, SMP boot, per-CPU segment) stay out; the
//! pure scheduling, locking, and topology logic is what runs here.

#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {{}};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[FATAL] {}", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[ERROR] {}", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[WARN] {}", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[INFO] {}", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{}};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{}};
}

// ===========================================================================
// Kernel sources under test
// ===========================================================================

#[path = "../../src/config.rs"]
pub mod config;

#[path = "../../src/error.rs"]
pub mod error;

#[path = "../../src/sync/barrier.rs"]
pub mod barrier;

#[path = "../../src/sync/spinlock.rs"]
pub mod spinlock;

#[path = "../../src/sync/rwlock.rs"]
pub mod rwlock;

#[path = "../../src/sync/seqlock.rs"]
pub mod seqlock;

#[path = "../../src/sched/context.rs"]
pub mod context;

#[path = "../../src/sched/thread.rs"]
pub mod thread;

#[path = "../../src/sched/runqueue.rs"]
pub mod runqueue;

#[path = "../../src/sched/balance.rs"]
pub mod balance;

#[path = "../../src/topology.rs"]
pub mod topology;

// ===========================================================================
// Test modules
// ===========================================================================

#[cfg(test)]
mod locking_tests;

#[cfg(test)]
mod runqueue_tests;

#[cfg(test)]
mod sched_policy_tests;

#[cfg(test)]
mod topology_tests;
