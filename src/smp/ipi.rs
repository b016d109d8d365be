//! Cross-CPU notifications.
//!
//! Four logical IPIs on fixed vectors: Reschedule (0xFA), CrossCall (0xF9),
//! TLBFlush (0xF8), Stop (0xF7). The handlers live in `interrupts`; this
//! module owns the send paths and the cross-call protocol.

use core::mem;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use x86_64::registers::control::Cr3;

use crate::config::{VECTOR_IPI_CALL, VECTOR_IPI_RESCHED, VECTOR_IPI_STOP, VECTOR_IPI_TLB};
use crate::percpu;
use crate::sync::barrier::cpu_relax;
use crate::sync::spinlock::RawTicketLock;
use crate::{lapic, smp};

pub type CrossCallFn = fn(usize);

static CALL_LOCK: RawTicketLock = RawTicketLock::new();
static CALL_FN: AtomicUsize = AtomicUsize::new(0);
static CALL_ARG: AtomicUsize = AtomicUsize::new(0);
static CALL_PENDING: AtomicU32 = AtomicU32::new(0);

/// Fixed-vector IPI to one online CPU; offline targets are dropped.
fn send_to_cpu(cpu: u32, vector: u8) {
    if !smp::state::is_online(cpu) {
        return;
    }
    if let Some(info) = percpu::cpu_by_id(cpu as usize) {
        let _ = lapic::send_ipi(info.apic_id, vector);
    }
}

/// IPI to every online CPU except the caller.
fn broadcast(vector: u8) {
    let self_id = percpu::cpu_id();
    let mut mask = smp::online_mask();
    while mask != 0 {
        let cpu = mask.trailing_zeros();
        mask &= mask - 1;
        if cpu != self_id {
            send_to_cpu(cpu, vector);
        }
    }
}

/// Ask `cpu` to run through its scheduler at the next opportunity.
pub fn send_reschedule(cpu: u32) {
    send_to_cpu(cpu, VECTOR_IPI_RESCHED);
}

/// Flush the local TLB and shoot down every other online CPU's.
pub fn flush_tlb_all() {
    flush_local_tlb();
    broadcast(VECTOR_IPI_TLB);
}

/// Full TLB flush by reloading the page-table root.
pub fn flush_local_tlb() {
    let (frame, flags) = Cr3::read();
    unsafe { Cr3::write(frame, flags) };
}

/// Final halt for every CPU but this one (panic/shutdown path).
pub fn stop_others() {
    broadcast(VECTOR_IPI_STOP);
}

/// Run `func(arg)` on every online CPU, including this one. With `wait`,
/// returns only after the last CPU finished. Serialized by the cross-call
/// lock, which is the innermost lock of the hierarchy.
pub fn smp_call(func: CrossCallFn, arg: usize, wait: bool) {
    let others = smp::cpu_count().saturating_sub(1);
    if others == 0 || !smp::is_ready() {
        func(arg);
        return;
    }

    CALL_LOCK.lock();
    CALL_FN.store(func as usize, Ordering::Relaxed);
    CALL_ARG.store(arg, Ordering::Relaxed);
    CALL_PENDING.store(others as u32, Ordering::Release);

    broadcast(VECTOR_IPI_CALL);
    func(arg);

    if wait {
        while CALL_PENDING.load(Ordering::Acquire) > 0 {
            cpu_relax();
        }
    }
    CALL_LOCK.unlock();
}

/// CrossCall IPI handler body: execute the published function, then count
/// this CPU done.
pub fn handle_cross_call() {
    let raw = CALL_FN.load(Ordering::Acquire);
    if raw != 0 {
        let func: CrossCallFn = unsafe { mem::transmute(raw) };
        func(CALL_ARG.load(Ordering::Acquire));
    }
    CALL_PENDING.fetch_sub(1, Ordering::AcqRel);
}
