//! SMP-safe synchronization primitives.
//!
//! All locks here are built on `core::sync::atomic` (lock-free on x86_64)
//! and the pause hint in [`barrier`]. Run queues and the AP boot path use
//! the ticket lock for FIFO fairness; read-mostly data uses the
//! reader/writer and sequence locks.

pub mod barrier;
pub mod rwlock;
pub mod seqlock;
pub mod spinlock;

pub use rwlock::RwSpinLock;
pub use seqlock::SeqLock;
pub use spinlock::{SpinLock, SpinLockGuard};
