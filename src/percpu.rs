//! Per-CPU state.
//!
//! Each CPU owns one cache-line-aligned [`CpuInfo`], reachable two ways:
//! through the `cpu_by_id` pointer table (any CPU, any time) and through the
//! GS segment base, which is programmed to point at the local block so that
//! `cpu_id()` is a single `mov gs:[0]` load. The logical CPU id therefore
//! sits at offset 0 of the struct.
//!
//! The BSP block is static; AP blocks are allocated on the target CPU's
//! NUMA node before the AP is released.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

use crate::config::MAX_CPUS;
use crate::error::SchedError;
use crate::mm;
use crate::sched::thread::Tid;

/// Lifecycle of a logical CPU.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    Offline = 0,
    Starting = 1,
    Online = 2,
    Halted = 3,
}

impl CpuState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CpuState::Starting,
            2 => CpuState::Online,
            3 => CpuState::Halted,
            _ => CpuState::Offline,
        }
    }
}

bitflags! {
    /// Feature bits detected via CPUID, one sweep per CPU at bring-up.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CpuFeatures: u64 {
        const FPU           = 1 << 0;
        const SSE           = 1 << 1;
        const SSE2          = 1 << 2;
        const SSE3          = 1 << 3;
        const SSSE3         = 1 << 4;
        const SSE4_1        = 1 << 5;
        const SSE4_2        = 1 << 6;
        const AVX           = 1 << 7;
        const AVX2          = 1 << 8;
        const AVX512F       = 1 << 9;
        const AES           = 1 << 10;
        const XSAVE         = 1 << 11;
        const RDRAND        = 1 << 12;
        const INVARIANT_TSC = 1 << 13;
        const X2APIC        = 1 << 14;
        const PCID          = 1 << 15;
        const INVPCID       = 1 << 16;
    }
}

/// Per-CPU info block. `cpu_id` must stay the first field: the GS segment
/// base points here and `cpu_id()` reads `gs:[0]`.
#[repr(C, align(64))]
pub struct CpuInfo {
    pub cpu_id: u32,
    pub apic_id: u32,
    pub firmware_id: u32,
    pub numa_node: u32,
    pub package_id: u8,
    pub core_id: u8,
    pub smt_id: u8,
    state: AtomicU8,
    features: AtomicU64,

    /// Frequency triplet from CPUID leaf 0x16, in MHz (0 when unreported).
    pub base_freq_mhz: AtomicU32,
    pub max_freq_mhz: AtomicU32,
    pub bus_freq_mhz: AtomicU32,

    pub idle_ns: AtomicU64,
    pub busy_ns: AtomicU64,
    pub irq_count: AtomicU64,
    pub switch_count: AtomicU64,

    current_tid: AtomicU32,
    idle_tid: AtomicU32,

    preempt_count: AtomicU32,
    need_resched: AtomicBool,

    /// Calibrated local APIC timer rate, shared by every AP.
    pub lapic_ticks_per_ms: AtomicU32,
    pub tsc_hz: AtomicU64,

    pub stack_base: AtomicU64,
}

const NO_TID: u32 = u32::MAX;

impl CpuInfo {
    pub fn new(cpu_id: u32, apic_id: u32, firmware_id: u32, numa_node: u32) -> Self {
        Self {
            cpu_id,
            apic_id,
            firmware_id,
            numa_node,
            package_id: 0,
            core_id: 0,
            smt_id: 0,
            state: AtomicU8::new(CpuState::Offline as u8),
            features: AtomicU64::new(0),
            base_freq_mhz: AtomicU32::new(0),
            max_freq_mhz: AtomicU32::new(0),
            bus_freq_mhz: AtomicU32::new(0),
            idle_ns: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
            irq_count: AtomicU64::new(0),
            switch_count: AtomicU64::new(0),
            current_tid: AtomicU32::new(NO_TID),
            idle_tid: AtomicU32::new(NO_TID),
            preempt_count: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            lapic_ticks_per_ms: AtomicU32::new(0),
            tsc_hz: AtomicU64::new(0),
            stack_base: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn features(&self) -> CpuFeatures {
        CpuFeatures::from_bits_truncate(self.features.load(Ordering::Relaxed))
    }

    pub fn set_features(&self, features: CpuFeatures) {
        self.features.store(features.bits(), Ordering::Relaxed);
    }

    pub fn current_tid(&self) -> Option<Tid> {
        match self.current_tid.load(Ordering::Acquire) {
            NO_TID => None,
            tid => Some(tid as Tid),
        }
    }

    pub fn set_current_tid(&self, tid: Option<Tid>) {
        self.current_tid
            .store(tid.map(|t| t as u32).unwrap_or(NO_TID), Ordering::Release);
    }

    pub fn idle_tid(&self) -> Option<Tid> {
        match self.idle_tid.load(Ordering::Acquire) {
            NO_TID => None,
            tid => Some(tid as Tid),
        }
    }

    pub fn set_idle_tid(&self, tid: Tid) {
        self.idle_tid.store(tid as u32, Ordering::Release);
    }

    pub fn set_need_resched(&self, value: bool) {
        self.need_resched.store(value, Ordering::Release);
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub fn take_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    pub fn preempt_count(&self) -> u32 {
        self.preempt_count.load(Ordering::Relaxed)
    }

    pub fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::Relaxed);
        core::sync::atomic::compiler_fence(Ordering::SeqCst);
    }

    /// Returns true when the count reached zero with a reschedule pending.
    pub fn preempt_enable(&self) -> bool {
        core::sync::atomic::compiler_fence(Ordering::SeqCst);
        let previous = self.preempt_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0);
        previous == 1 && self.need_resched()
    }
}

static PERCPU_SEGMENT_READY: AtomicBool = AtomicBool::new(false);
static CPU_READY: [AtomicBool; MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; MAX_CPUS]
};
static CPU_PTRS: [AtomicU64; MAX_CPUS] = {
    const INIT: AtomicU64 = AtomicU64::new(0);
    [INIT; MAX_CPUS]
};

static mut BSP_INFO: Option<CpuInfo> = None;

/// Install the BSP's info block (static storage, runs before the allocator
/// is needed).
pub fn install_bsp(info: CpuInfo) -> &'static CpuInfo {
    let cpu_id = info.cpu_id as usize;
    let stored = unsafe {
        BSP_INFO = Some(info);
        (*core::ptr::addr_of!(BSP_INFO)).as_ref().unwrap_or_else(|| unreachable!())
    };
    CPU_PTRS[cpu_id].store(stored as *const CpuInfo as u64, Ordering::Release);
    CPU_READY[cpu_id].store(true, Ordering::Release);
    stored
}

/// Allocate and install an AP's info block on its NUMA node.
pub fn install_ap(info: CpuInfo) -> Result<&'static CpuInfo, SchedError> {
    let cpu_id = info.cpu_id as usize;
    if cpu_id >= MAX_CPUS {
        return Err(SchedError::InvalidParameter);
    }

    let page = mm::alloc_pages_node(0, info.numa_node)?;
    let ptr = page as *mut CpuInfo;
    unsafe {
        ptr.write(info);
    }
    CPU_PTRS[cpu_id].store(page, Ordering::Release);
    CPU_READY[cpu_id].store(true, Ordering::Release);
    Ok(unsafe { &*ptr })
}

/// Cross-CPU lookup. Initialized for every CPU before any AP is released.
pub fn cpu_by_id(cpu_id: usize) -> Option<&'static CpuInfo> {
    if cpu_id >= MAX_CPUS || !CPU_READY[cpu_id].load(Ordering::Acquire) {
        return None;
    }
    let ptr = CPU_PTRS[cpu_id].load(Ordering::Acquire) as *const CpuInfo;
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { &*ptr })
}

/// Point GS at this CPU's info block so `cpu_id()` becomes one load.
pub fn install_segment(info: &'static CpuInfo) {
    GsBase::write(VirtAddr::new(info as *const CpuInfo as u64));
    PERCPU_SEGMENT_READY.store(true, Ordering::Release);
}

/// Logical id of the executing CPU. One `mov gs:[0]` once the per-CPU
/// segment is installed; 0 during early BSP boot.
#[inline]
pub fn cpu_id() -> u32 {
    if !PERCPU_SEGMENT_READY.load(Ordering::Acquire) {
        return 0;
    }
    let id: u32;
    unsafe {
        core::arch::asm!("mov {0:e}, gs:[0]", out(reg) id, options(nostack, readonly));
    }
    id
}

/// Info block of the executing CPU. Panics only if called before the BSP
/// block is installed, which would be a boot-order bug.
#[inline]
pub fn cpu_info() -> &'static CpuInfo {
    cpu_by_id(cpu_id() as usize).unwrap_or_else(|| unreachable!())
}

pub fn preempt_disable() {
    if let Some(info) = cpu_by_id(cpu_id() as usize) {
        info.preempt_disable();
    }
}

/// Decrement the preemption counter; schedules if it hit zero with a
/// reschedule pending.
pub fn preempt_enable() {
    if let Some(info) = cpu_by_id(cpu_id() as usize) {
        if info.preempt_enable() {
            crate::sched::schedule();
        }
    }
}

/// CPUID sweep, stored into `info`. Mirrors what the firmware-visible OS/2
/// personality later reports through `DosQuerySysInfo`.
pub fn detect_features(info: &CpuInfo) {
    use core::arch::x86_64::{__cpuid, __cpuid_count};

    let mut features = CpuFeatures::empty();

    let leaf1 = unsafe { __cpuid(1) };
    if leaf1.edx & (1 << 0) != 0 {
        features |= CpuFeatures::FPU;
    }
    if leaf1.edx & (1 << 25) != 0 {
        features |= CpuFeatures::SSE;
    }
    if leaf1.edx & (1 << 26) != 0 {
        features |= CpuFeatures::SSE2;
    }
    if leaf1.ecx & (1 << 0) != 0 {
        features |= CpuFeatures::SSE3;
    }
    if leaf1.ecx & (1 << 9) != 0 {
        features |= CpuFeatures::SSSE3;
    }
    if leaf1.ecx & (1 << 19) != 0 {
        features |= CpuFeatures::SSE4_1;
    }
    if leaf1.ecx & (1 << 20) != 0 {
        features |= CpuFeatures::SSE4_2;
    }
    if leaf1.ecx & (1 << 25) != 0 {
        features |= CpuFeatures::AES;
    }
    if leaf1.ecx & (1 << 26) != 0 {
        features |= CpuFeatures::XSAVE;
    }
    if leaf1.ecx & (1 << 28) != 0 {
        features |= CpuFeatures::AVX;
    }
    if leaf1.ecx & (1 << 30) != 0 {
        features |= CpuFeatures::RDRAND;
    }
    if leaf1.ecx & (1 << 21) != 0 {
        features |= CpuFeatures::X2APIC;
    }
    if leaf1.ecx & (1 << 17) != 0 {
        features |= CpuFeatures::PCID;
    }

    let leaf7 = unsafe { __cpuid_count(7, 0) };
    if leaf7.ebx & (1 << 5) != 0 {
        features |= CpuFeatures::AVX2;
    }
    if leaf7.ebx & (1 << 16) != 0 {
        features |= CpuFeatures::AVX512F;
    }
    if leaf7.ebx & (1 << 10) != 0 {
        features |= CpuFeatures::INVPCID;
    }

    let ext7 = unsafe { __cpuid(0x8000_0007) };
    if ext7.edx & (1 << 8) != 0 {
        features |= CpuFeatures::INVARIANT_TSC;
    }

    info.set_features(features);

    let leaf16 = unsafe { __cpuid(0x16) };
    info.base_freq_mhz.store(leaf16.eax & 0xFFFF, Ordering::Relaxed);
    info.max_freq_mhz.store(leaf16.ebx & 0xFFFF, Ordering::Relaxed);
    info.bus_freq_mhz.store(leaf16.ecx & 0xFFFF, Ordering::Relaxed);
}
