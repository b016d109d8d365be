//! Local APIC driver.
//!
//! Supports both access modes and picks at runtime: legacy memory-mapped
//! xAPIC at the firmware-reported base, or MSR-based x2APIC when the CPU
//! advertises it (preferred). Register programming at bring-up goes through
//! the per-CPU [`LocalApic`] handle; IPI sends and EOI are free functions
//! because they run from interrupt and scheduler contexts. The xAPIC ICR
//! write pair is protected by disabling interrupts so the two stores cannot
//! be torn by a preempting sender on the same CPU.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::Msr;

use crate::arch;
use crate::config::{SCHED_HZ, VECTOR_ERROR, VECTOR_SPURIOUS, VECTOR_TIMER};
use crate::error::SchedError;
use crate::mm;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_X2APIC: u64 = 1 << 10;
const APIC_BASE_ADDR_MASK: u64 = 0xFFFF_F000;

// Register offsets (xAPIC MMIO). The x2APIC MSR index is 0x800 + (offset >> 4).
const REG_ID: u32 = 0x020;
const REG_VERSION: u32 = 0x030;
const REG_TPR: u32 = 0x080;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_ESR: u32 = 0x280;
const REG_ICR_LO: u32 = 0x300;
const REG_ICR_HI: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_LVT_LINT0: u32 = 0x350;
const REG_LVT_LINT1: u32 = 0x360;
const REG_LVT_ERROR: u32 = 0x370;
const REG_TIMER_ICR: u32 = 0x380;
const REG_TIMER_CCR: u32 = 0x390;
const REG_TIMER_DCR: u32 = 0x3E0;

const X2APIC_MSR_BASE: u32 = 0x800;
const X2APIC_MSR_ICR: u32 = 0x830;

const SVR_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;
const TIMER_PERIODIC: u32 = 1 << 17;
const TIMER_DIV_16: u32 = 0x3;

// ICR fields.
pub const ICR_FIXED: u32 = 0 << 8;
pub const ICR_INIT: u32 = 5 << 8;
pub const ICR_STARTUP: u32 = 6 << 8;
pub const ICR_PHYSICAL: u32 = 0 << 11;
pub const ICR_ASSERT: u32 = 1 << 14;
pub const ICR_LEVEL_TRIGGER: u32 = 1 << 15;
pub const ICR_DELIVERY_PENDING: u32 = 1 << 12;

/// Poll budget for the xAPIC delivery-status bit before reporting
/// `ApicTimeout`.
const DELIVERY_POLL_LIMIT: u32 = 1_000_000;

const MODE_NONE: u8 = 0;
const MODE_XAPIC: u8 = 1;
const MODE_X2APIC: u8 = 2;

static APIC_MODE: AtomicU8 = AtomicU8::new(MODE_NONE);
static MMIO_BASE: AtomicU64 = AtomicU64::new(0);
static TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

/// Compose the low ICR word for a fixed-vector IPI.
#[inline]
pub const fn icr_fixed(vector: u8) -> u32 {
    ICR_FIXED | ICR_PHYSICAL | ICR_ASSERT | vector as u32
}

/// Compose the low ICR word for the INIT IPI.
#[inline]
pub const fn icr_init() -> u32 {
    ICR_INIT | ICR_PHYSICAL | ICR_ASSERT | ICR_LEVEL_TRIGGER
}

/// Compose the low ICR word for a STARTUP IPI; the vector is the trampoline
/// page number.
#[inline]
pub const fn icr_startup(page: u8) -> u32 {
    ICR_STARTUP | ICR_PHYSICAL | ICR_ASSERT | page as u32
}

/// Pack an x2APIC ICR MSR value: destination in the upper half, command in
/// the lower, written as one 64-bit store.
#[inline]
pub const fn x2apic_icr(dest_apic_id: u32, command: u32) -> u64 {
    ((dest_apic_id as u64) << 32) | command as u64
}

fn read_register(offset: u32) -> u32 {
    match APIC_MODE.load(Ordering::Acquire) {
        MODE_X2APIC => unsafe { Msr::new(X2APIC_MSR_BASE + (offset >> 4)).read() as u32 },
        _ => {
            let base = MMIO_BASE.load(Ordering::Acquire);
            unsafe { read_volatile((base + offset as u64) as *const u32) }
        }
    }
}

fn write_register(offset: u32, value: u32) {
    match APIC_MODE.load(Ordering::Acquire) {
        MODE_X2APIC => unsafe {
            Msr::new(X2APIC_MSR_BASE + (offset >> 4)).write(value as u64);
        },
        _ => {
            let base = MMIO_BASE.load(Ordering::Acquire);
            unsafe { write_volatile((base + offset as u64) as *mut u32, value) }
        }
    }
}

/// APIC id of the executing CPU.
pub fn current_apic_id() -> u32 {
    match APIC_MODE.load(Ordering::Acquire) {
        MODE_X2APIC => read_register(REG_ID),
        MODE_XAPIC => read_register(REG_ID) >> 24,
        _ => raw_apic_id(),
    }
}

/// APIC id straight from CPUID, usable before the APIC is enabled.
pub fn raw_apic_id() -> u32 {
    let leaf1 = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf1.ebx >> 24
}

/// Calibrated timer rate; valid after the BSP's [`LocalApic::calibrate_timer`].
pub fn ticks_per_ms() -> u32 {
    TICKS_PER_MS.load(Ordering::Acquire)
}

/// Per-CPU programming handle. Obtained once per CPU during bring-up; the
/// `&mut self` receivers serialize register-file programming on that CPU.
pub struct LocalApic {
    _private: (),
}

impl LocalApic {
    /// BSP-side bring-up: choose the access mode, globally enable the APIC,
    /// and program the baseline LVT set.
    pub fn init_bsp(lapic_phys: u64, has_x2apic: bool) -> Result<Self, SchedError> {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let mut base_msr = unsafe { msr.read() };

        if has_x2apic {
            base_msr |= APIC_BASE_ENABLE | APIC_BASE_X2APIC;
            unsafe { msr.write(base_msr) };
            APIC_MODE.store(MODE_X2APIC, Ordering::Release);
            crate::kinfo!("lapic: x2APIC mode enabled");
        } else {
            let phys = if lapic_phys != 0 {
                lapic_phys
            } else {
                base_msr & APIC_BASE_ADDR_MASK
            };
            let virt = mm::map_io(phys, 4096)?;
            MMIO_BASE.store(virt, Ordering::Release);

            base_msr &= !APIC_BASE_X2APIC;
            base_msr = (base_msr & !APIC_BASE_ADDR_MASK) | (phys & APIC_BASE_ADDR_MASK);
            base_msr |= APIC_BASE_ENABLE;
            unsafe { msr.write(base_msr) };
            APIC_MODE.store(MODE_XAPIC, Ordering::Release);
            crate::kinfo!("lapic: xAPIC mode, base {:#x}", phys);
        }

        let mut apic = Self { _private: () };
        apic.enable_registers();

        let version = read_register(REG_VERSION);
        crate::kinfo!(
            "lapic: version {:#x}, max LVT {}, id {:#x}",
            version & 0xFF,
            ((version >> 16) & 0xFF) + 1,
            current_apic_id()
        );

        Ok(apic)
    }

    /// AP-side bring-up: re-assert the enable bits for this CPU and reuse
    /// the BSP's calibration value. No recalibration.
    pub fn init_ap() -> Self {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let mut base_msr = unsafe { msr.read() };
        base_msr |= APIC_BASE_ENABLE;
        if APIC_MODE.load(Ordering::Acquire) == MODE_X2APIC {
            base_msr |= APIC_BASE_X2APIC;
        }
        unsafe { msr.write(base_msr) };

        let mut apic = Self { _private: () };
        apic.enable_registers();
        apic
    }

    /// Common register-level enable: spurious vector, masked LINTs, error
    /// LVT, cleared error status, open task priority.
    fn enable_registers(&mut self) {
        write_register(REG_SVR, SVR_ENABLE | VECTOR_SPURIOUS as u32);
        write_register(REG_LVT_LINT0, LVT_MASKED);
        write_register(REG_LVT_LINT1, LVT_MASKED);
        write_register(REG_LVT_ERROR, VECTOR_ERROR as u32);

        // Two writes, as the hardware demands.
        write_register(REG_ESR, 0);
        write_register(REG_ESR, 0);

        write_register(REG_TPR, 0);
    }

    /// Calibrate the timer against the PIT: free-run from the maximum count
    /// for 10 ms, read back, derive ticks/ms. BSP only; APs reuse the value.
    pub fn calibrate_timer(&mut self) -> u32 {
        write_register(REG_TIMER_DCR, TIMER_DIV_16);
        write_register(REG_LVT_TIMER, LVT_MASKED);
        write_register(REG_TIMER_ICR, 0xFFFF_FFFF);

        arch::pit_wait_ms(10);

        let current = read_register(REG_TIMER_CCR);
        let ticks = (0xFFFF_FFFFu32 - current) / 10;
        TICKS_PER_MS.store(ticks, Ordering::Release);

        crate::kinfo!("lapic: timer calibrated, {} ticks/ms", ticks);
        ticks
    }

    /// Arm the periodic scheduler tick on `VECTOR_TIMER`.
    pub fn start_timer(&mut self) {
        let ticks = TICKS_PER_MS.load(Ordering::Acquire);
        let period = ticks.saturating_mul(1000 / SCHED_HZ).max(1);
        write_register(REG_TIMER_DCR, TIMER_DIV_16);
        write_register(REG_LVT_TIMER, TIMER_PERIODIC | VECTOR_TIMER as u32);
        write_register(REG_TIMER_ICR, period);
    }

    pub fn stop_timer(&mut self) {
        write_register(REG_LVT_TIMER, LVT_MASKED);
        write_register(REG_TIMER_ICR, 0);
    }

    /// Read and clear the error status register.
    pub fn read_error(&mut self) -> u32 {
        write_register(REG_ESR, 0);
        read_register(REG_ESR)
    }
}

/// Signal end-of-interrupt for the in-service vector.
pub fn eoi() {
    write_register(REG_EOI, 0);
}

fn send_raw(dest_apic_id: u32, command: u32) -> Result<(), SchedError> {
    if APIC_MODE.load(Ordering::Acquire) == MODE_X2APIC {
        // Single 64-bit MSR store; the hardware needs no delivery poll.
        unsafe { Msr::new(X2APIC_MSR_ICR).write(x2apic_icr(dest_apic_id, command)) };
        return Ok(());
    }

    let was_enabled = interrupts::are_enabled();
    interrupts::disable();

    write_register(REG_ICR_HI, dest_apic_id << 24);
    write_register(REG_ICR_LO, command);

    let mut budget = DELIVERY_POLL_LIMIT;
    let result = loop {
        if read_register(REG_ICR_LO) & ICR_DELIVERY_PENDING == 0 {
            break Ok(());
        }
        if budget == 0 {
            break Err(SchedError::ApicTimeout);
        }
        budget -= 1;
        core::hint::spin_loop();
    };

    if was_enabled {
        interrupts::enable();
    }

    if result.is_err() {
        crate::kerror!(
            "lapic: IPI delivery to APIC {:#x} never cleared (cmd {:#x})",
            dest_apic_id,
            command
        );
    }
    result
}

/// Fixed-vector IPI to one CPU.
pub fn send_ipi(dest_apic_id: u32, vector: u8) -> Result<(), SchedError> {
    send_raw(dest_apic_id, icr_fixed(vector))
}

/// INIT IPI used to reset an AP before STARTUP.
pub fn send_init(dest_apic_id: u32) -> Result<(), SchedError> {
    send_raw(dest_apic_id, icr_init())
}

/// STARTUP IPI; `page` is the trampoline physical page number.
pub fn send_startup(dest_apic_id: u32, page: u8) -> Result<(), SchedError> {
    send_raw(dest_apic_id, icr_startup(page))
}
