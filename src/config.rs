//! Scheduler and SMP tuning constants.
//!
//! The IPI vectors are kernel ABI: the AP trampoline and the OS/2 personality
//! both hard-code them, so they must not change once established.

/// Maximum logical CPUs. Bounded by the 64-bit affinity mask exposed through
/// `DosSetThreadAffinity`.
pub const MAX_CPUS: usize = 64;

/// Maximum threads in the system-wide thread arena.
pub const MAX_THREADS: usize = 256;

/// Scheduling classes (OS/2 priority classes plus internal Realtime).
pub const NUM_SCHED_CLASSES: usize = 5;

/// Priority levels within each class.
pub const PRIO_LEVELS_PER_CLASS: usize = 32;

/// Default time slice in scheduler ticks (the OS/2 default of 31 ms at the
/// 100 Hz tick rate rounds to one tick per ms).
pub const DEFAULT_TIMESLICE_TICKS: u32 = 31;

/// Scheduler tick rate programmed into the local APIC timer.
pub const SCHED_HZ: u32 = 100;

/// Periodic load balance interval, in ticks.
pub const LOAD_BALANCE_INTERVAL: u64 = 100;

/// Idle balance interval, in ticks.
pub const IDLE_BALANCE_INTERVAL: u64 = 1;

/// A queue must be at least this much longer than ours before we pull.
pub const IMBALANCE_THRESHOLD: u32 = 1;

/// Threads that ran within this window are considered cache hot and are not
/// migrated by the periodic balancer.
pub const CACHE_HOT_NS: u64 = 1_000_000;

/// How long the BSP waits for an AP to signal readiness.
pub const AP_STARTUP_TIMEOUT_MS: u64 = 1_000;

/// Kernel stack size for each AP (16 KiB minimum).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Physical address of the AP trampoline page (must stay below 1 MiB).
pub const AP_TRAMPOLINE_ADDR: u64 = 0x8000;

/// STARTUP IPI vector encodes the trampoline page number.
pub const AP_STARTUP_VECTOR: u8 = (AP_TRAMPOLINE_ADDR >> 12) as u8;

// Interrupt vector assignments. Fixed ABI, see module docs.
pub const VECTOR_SPURIOUS: u8 = 0xFF;
pub const VECTOR_ERROR: u8 = 0xFE;
pub const VECTOR_TIMER: u8 = 0xFD;
pub const VECTOR_IPI_RESCHED: u8 = 0xFA;
pub const VECTOR_IPI_CALL: u8 = 0xF9;
pub const VECTOR_IPI_TLB: u8 = 0xF8;
pub const VECTOR_IPI_STOP: u8 = 0xF7;

/// Base vector for I/O APIC routed external interrupts.
pub const VECTOR_IRQ_BASE: u8 = 0x20;
