//! CPU bring-up.
//!
//! The BSP validates the firmware topology, initializes its own APIC and
//! run queue, installs the trampoline, and then boots each enabled AP in
//! turn: INIT, 10 ms, STARTUP twice 200 us apart, then a 1 s poll on the
//! rendezvous cell. A CPU that fails to report stays Offline and the boot
//! continues on the processors that came up.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::interrupts as irq;

use crate::arch;
use crate::config::{AP_STARTUP_TIMEOUT_MS, AP_STARTUP_VECTOR, KERNEL_STACK_SIZE};
use crate::error::SchedError;
use crate::lapic::{self, LocalApic};
use crate::percpu::{self, CpuFeatures, CpuInfo, CpuState};
use crate::topology::{self, CpuEntry, TopologySnapshot};
use crate::{interrupts, ioapic, logger, mm, sched};

use super::state::{
    AP_BOOT, BSP_ID, CPU_COUNT, CPU_POSSIBLE, READY_COUNT, SMP_READY,
};
use super::{state, trampoline};

/// TSC frequency measured on the BSP and reused by every AP.
static TSC_HZ: AtomicU64 = AtomicU64::new(1_000_000_000);

/// Measure the TSC against the PIT over a 50 ms window.
fn calibrate_tsc() -> u64 {
    let start = arch::rdtsc();
    arch::pit_wait_ms(50);
    let end = arch::rdtsc();
    end.wrapping_sub(start) * 20
}

/// Bring the system up from the BSP. Returns the number of online CPUs.
///
/// The calling context is registered as the BSP's idle thread; once the
/// caller has finished its own setup it should drop into
/// [`crate::sched::idle_loop`].
pub fn init(snapshot: &TopologySnapshot) -> Result<usize, SchedError> {
    logger::init();

    let bsp_apic = lapic::raw_apic_id();
    topology::import(snapshot, bsp_apic)?;
    let topo = topology::get();

    let possible = topo.enabled_cpus().count();
    CPU_POSSIBLE.store(possible, Ordering::Release);

    let bsp_entry = *topo
        .enabled_cpus()
        .find(|c| c.apic_id == bsp_apic)
        .ok_or(SchedError::TopologyInconsistent)?;
    BSP_ID.store(bsp_entry.logical_id, Ordering::Release);

    // BSP per-CPU block, feature detection, clock calibration.
    let info = percpu::install_bsp(CpuInfo::new(
        bsp_entry.logical_id,
        bsp_entry.apic_id,
        bsp_entry.firmware_id,
        bsp_entry.numa_node,
    ));
    info.set_state(CpuState::Online);
    percpu::detect_features(info);

    let tsc_hz = calibrate_tsc();
    TSC_HZ.store(tsc_hz, Ordering::Release);
    info.tsc_hz.store(tsc_hz, Ordering::Relaxed);
    sched::set_clock_hz(tsc_hz);
    logger::set_tsc_frequency(tsc_hz);
    crate::kinfo!(
        "smp: BSP is CPU {} (APIC {:#x}), TSC {}.{:03} MHz, features {:?}",
        bsp_entry.logical_id,
        bsp_apic,
        tsc_hz / 1_000_000,
        (tsc_hz % 1_000_000) / 1_000,
        info.features()
    );

    // Interrupt plumbing before the APIC can deliver anything.
    interrupts::init();
    let mut apic = LocalApic::init_bsp(0, info.features().contains(CpuFeatures::X2APIC))?;
    ioapic::init()?;

    // Scheduler globals, BSP run queue, per-CPU segment.
    sched::init();
    sched::init_cpu(bsp_entry.logical_id)?;
    percpu::install_segment(info);

    state::set_online(bsp_entry.logical_id);
    CPU_COUNT.store(1, Ordering::Release);

    let ticks = apic.calibrate_timer();
    info.lapic_ticks_per_ms.store(ticks, Ordering::Relaxed);
    apic.start_timer();

    // Trampoline, then one AP at a time.
    unsafe {
        trampoline::install(ap_entry as usize as u64)?;
    }

    let mut slot = 0;
    let mut online = 1usize;
    for entry in topo.enabled_cpus() {
        if entry.apic_id == bsp_apic {
            continue;
        }
        match boot_cpu(entry, slot) {
            Ok(()) => online += 1,
            Err(err) => {
                crate::kwarn!(
                    "smp: CPU {} (APIC {:#x}) failed to start: {}",
                    entry.logical_id,
                    entry.apic_id,
                    err
                );
            }
        }
        slot += 1;
    }

    CPU_COUNT.store(online, Ordering::Release);
    SMP_READY.store(true, Ordering::Release);
    crate::kinfo!("smp: {} of {} CPUs online", online, possible);
    Ok(online)
}

/// Boot one AP: allocate its per-CPU block and stack on the target NUMA
/// node, publish the trampoline lookup entry, fire INIT/STARTUP, and wait
/// for the rendezvous flag.
pub fn boot_cpu(entry: &CpuEntry, slot: usize) -> Result<(), SchedError> {
    let cpu = entry.logical_id;
    crate::kinfo!("smp: starting CPU {} (APIC {:#x})", cpu, entry.apic_id);

    let info = percpu::install_ap(CpuInfo::new(
        cpu,
        entry.apic_id,
        entry.firmware_id,
        entry.numa_node,
    ))?;
    info.set_state(CpuState::Starting);
    info.tsc_hz.store(TSC_HZ.load(Ordering::Acquire), Ordering::Relaxed);
    info.lapic_ticks_per_ms
        .store(lapic::ticks_per_ms(), Ordering::Relaxed);

    let stack_pages = (KERNEL_STACK_SIZE / mm::PAGE_SIZE).max(1);
    let order = stack_pages.next_power_of_two().trailing_zeros();
    let stack_base = match mm::alloc_pages_node(order, entry.numa_node) {
        Ok(base) => base,
        Err(err) => {
            info.set_state(CpuState::Offline);
            return Err(err);
        }
    };
    let stack_top = stack_base + KERNEL_STACK_SIZE as u64;
    info.stack_base.store(stack_base, Ordering::Relaxed);

    unsafe {
        trampoline::publish_cpu(slot, entry.apic_id, cpu, stack_top);
        trampoline::publish_cpu_count(slot + 1);
    }

    // Rendezvous: publish who is booting, clear the done flag, fire the
    // INIT/SIPI sequence, and poll.
    AP_BOOT.lock.lock();
    AP_BOOT.cpu_id.store(cpu, Ordering::Release);
    AP_BOOT.done.store(false, Ordering::Release);

    let tsc_hz = TSC_HZ.load(Ordering::Acquire);
    let result = (|| {
        lapic::send_init(entry.apic_id)?;
        arch::pit_wait_ms(10);

        // The hardware wants STARTUP delivered twice.
        lapic::send_startup(entry.apic_id, AP_STARTUP_VECTOR)?;
        arch::tsc_delay_us(200, tsc_hz);
        lapic::send_startup(entry.apic_id, AP_STARTUP_VECTOR)?;

        let mut timeout = AP_STARTUP_TIMEOUT_MS;
        while !AP_BOOT.done.load(Ordering::Acquire) {
            if timeout == 0 {
                return Err(SchedError::ApStartupTimeout);
            }
            arch::pit_wait_ms(1);
            timeout -= 1;
        }
        Ok(())
    })();
    AP_BOOT.lock.unlock();

    match result {
        Ok(()) => {
            info.set_state(CpuState::Online);
            state::set_online(cpu);
            crate::kinfo!("smp: CPU {} online", cpu);
            Ok(())
        }
        Err(err) => {
            info.set_state(CpuState::Offline);
            mm::free_pages(stack_base, order);
            Err(err)
        }
    }
}

/// 64-bit AP entry, called by the trampoline with the logical id and the
/// published stack already in place.
extern "C" fn ap_entry(logical_id: u32) -> ! {
    let Some(info) = percpu::cpu_by_id(logical_id as usize) else {
        arch::halt_loop();
    };

    interrupts::load_ap();
    let mut apic = LocalApic::init_ap();

    percpu::install_segment(info);
    percpu::detect_features(info);
    info.tsc_hz.store(TSC_HZ.load(Ordering::Acquire), Ordering::Relaxed);

    if sched::init_cpu(logical_id).is_err() {
        crate::kerror!("smp: CPU {} failed scheduler init", logical_id);
        arch::halt_loop();
    }

    apic.start_timer();

    READY_COUNT.fetch_add(1, Ordering::AcqRel);
    AP_BOOT.done.store(true, Ordering::Release);

    crate::kinfo!("smp: CPU {} entering idle loop", logical_id);
    irq::enable();
    sched::idle_loop()
}
