//! Global SMP state.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::sync::spinlock::RawTicketLock;

/// Set once the BSP finishes bring-up (regardless of how many APs made it).
pub static SMP_READY: AtomicBool = AtomicBool::new(false);

/// Bit per online logical CPU.
pub static ONLINE_MASK: AtomicU64 = AtomicU64::new(0);

/// CPUs that came online.
pub static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// CPUs the firmware advertises.
pub static CPU_POSSIBLE: AtomicUsize = AtomicUsize::new(1);

/// Logical id of the bootstrap processor.
pub static BSP_ID: AtomicU32 = AtomicU32::new(0);

/// APs that finished their own scheduler init.
pub static READY_COUNT: AtomicU32 = AtomicU32::new(0);

/// AP boot rendezvous. The BSP publishes the logical id of the CPU being
/// started under `lock`; the AP writes `done = 1` exactly once.
pub struct ApBootCell {
    pub lock: RawTicketLock,
    pub cpu_id: AtomicU32,
    pub done: AtomicBool,
}

pub static AP_BOOT: ApBootCell = ApBootCell {
    lock: RawTicketLock::new(),
    cpu_id: AtomicU32::new(0),
    done: AtomicBool::new(false),
};

pub fn is_ready() -> bool {
    SMP_READY.load(Ordering::Acquire)
}

pub fn online_mask() -> u64 {
    ONLINE_MASK.load(Ordering::Acquire)
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

pub fn cpu_possible() -> usize {
    CPU_POSSIBLE.load(Ordering::Acquire)
}

pub fn bsp_id() -> u32 {
    BSP_ID.load(Ordering::Acquire)
}

pub fn set_online(cpu: u32) {
    ONLINE_MASK.fetch_or(1u64 << cpu, Ordering::AcqRel);
}

pub fn set_offline(cpu: u32) {
    ONLINE_MASK.fetch_and(!(1u64 << cpu), Ordering::AcqRel);
}

pub fn is_online(cpu: u32) -> bool {
    online_mask() & (1u64 << cpu) != 0
}
