//! Interrupt table and handler wiring.
//!
//! One IDT shared by every CPU: the BSP builds and loads it, each AP loads
//! it during its own bring-up. The scheduler tick arrives on the local
//! APIC timer vector; the four IPI vectors carry reschedule, cross-call,
//! TLB shootdown, and stop. Every handler acknowledges with an EOI before
//! any context switch can happen.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use crate::config::{
    VECTOR_ERROR, VECTOR_IPI_CALL, VECTOR_IPI_RESCHED, VECTOR_IPI_STOP, VECTOR_IPI_TLB,
    VECTOR_SPURIOUS, VECTOR_TIMER,
};
use crate::{arch, lapic, percpu, sched, smp};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt[VECTOR_TIMER].set_handler_fn(timer_handler);
        idt[VECTOR_SPURIOUS].set_handler_fn(spurious_handler);
        idt[VECTOR_ERROR].set_handler_fn(error_handler);
        idt[VECTOR_IPI_RESCHED].set_handler_fn(ipi_reschedule_handler);
        idt[VECTOR_IPI_CALL].set_handler_fn(ipi_cross_call_handler);
        idt[VECTOR_IPI_TLB].set_handler_fn(ipi_tlb_flush_handler);
        idt[VECTOR_IPI_STOP].set_handler_fn(ipi_stop_handler);
        idt
    };
}

/// Build and load the IDT on the BSP.
pub fn init() {
    IDT.load();
    crate::kinfo!("interrupts: IDT loaded (timer {:#x}, IPIs {:#x}..{:#x})",
        VECTOR_TIMER, VECTOR_IPI_STOP, VECTOR_IPI_RESCHED);
}

/// Load the shared IDT on an AP.
pub fn load_ap() {
    IDT.load();
}

fn irq_entry() {
    if let Some(info) = percpu::cpu_by_id(percpu::cpu_id() as usize) {
        info.irq_count.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }
}

/// Run the scheduler from an interrupt tail when nothing forbids it.
fn preempt_if_needed() {
    if let Some(info) = percpu::cpu_by_id(percpu::cpu_id() as usize) {
        if info.need_resched() && info.preempt_count() == 0 {
            sched::schedule();
        }
    }
}

/// Scheduler tick: slice accounting, sleeper wakeup, balance flag, then
/// the switch if the running thread's slice ran out.
extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    irq_entry();
    sched::tick();
    lapic::eoi();
    sched::maybe_balance();
    preempt_if_needed();
}

/// Spurious vector: no EOI, by the APIC's rules.
extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn error_handler(_frame: InterruptStackFrame) {
    irq_entry();
    crate::kerror!("lapic: error interrupt on CPU {}", percpu::cpu_id());
    lapic::eoi();
}

/// Another CPU asked us to reschedule: raise the flag, acknowledge, and
/// let the interrupt tail perform the switch.
extern "x86-interrupt" fn ipi_reschedule_handler(_frame: InterruptStackFrame) {
    irq_entry();
    if let Some(info) = percpu::cpu_by_id(percpu::cpu_id() as usize) {
        info.set_need_resched(true);
    }
    lapic::eoi();
    preempt_if_needed();
}

extern "x86-interrupt" fn ipi_cross_call_handler(_frame: InterruptStackFrame) {
    irq_entry();
    smp::ipi::handle_cross_call();
    lapic::eoi();
}

extern "x86-interrupt" fn ipi_tlb_flush_handler(_frame: InterruptStackFrame) {
    irq_entry();
    smp::ipi::flush_local_tlb();
    lapic::eoi();
}

/// Stop: acknowledge, mark this CPU halted, and never return.
extern "x86-interrupt" fn ipi_stop_handler(_frame: InterruptStackFrame) {
    lapic::eoi();
    if let Some(info) = percpu::cpu_by_id(percpu::cpu_id() as usize) {
        info.set_state(percpu::CpuState::Halted);
    }
    x86_64::instructions::interrupts::disable();
    arch::halt_loop();
}
