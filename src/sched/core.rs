//! Scheduler core: the operations behind every context switch.
//!
//! Most operations lock the local run queue and then the thread arena;
//! cross-CPU operations (wake, affinity change, migration) lock the target
//! CPU's queue instead and signal it with a reschedule IPI. Two run-queue
//! locks are never held at once; the balancer releases the donor before
//! enqueueing on the receiver, covering the hand-off with the thread's
//! `migrating` flag.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use super::balance;
use super::context::{context_switch, Context};
use super::runqueue::RunQueue;
use super::thread::{
    CpuMask, SchedClass, Thread, ThreadState, ThreadTable, Tid, WaitChannel, PRIO_MAX,
};
use crate::arch;
use crate::config::{
    DEFAULT_TIMESLICE_TICKS, KERNEL_STACK_SIZE, LOAD_BALANCE_INTERVAL, MAX_CPUS,
};
use crate::error::SchedError;
use crate::percpu;
use crate::sync::spinlock::{RawTicketLock, SpinLock};
use crate::{mm, smp, topology};

/// Global scheduler state. Run queues hang off the pointer table below so
/// they can be placed on their CPU's NUMA node.
struct Scheduler {
    global_lock: RawTicketLock,
    need_balance: AtomicBool,
    total_threads: AtomicU32,
}

static SCHEDULER: Scheduler = Scheduler {
    global_lock: RawTicketLock::new(),
    need_balance: AtomicBool::new(false),
    total_threads: AtomicU32::new(0),
};

static THREADS: SpinLock<ThreadTable> = SpinLock::new(ThreadTable::new());

static RUNQUEUES: [AtomicPtr<SpinLock<RunQueue>>; MAX_CPUS] = {
    const INIT: AtomicPtr<SpinLock<RunQueue>> = AtomicPtr::new(ptr::null_mut());
    [INIT; MAX_CPUS]
};

/// TSC frequency backing the run-queue clock; a safe default until the
/// boot-time calibration replaces it.
static CLOCK_TSC_HZ: AtomicU64 = AtomicU64::new(1_000_000_000);

/// Wait channels in this range are the per-thread sleep channels.
const SLEEP_CHANNEL_BASE: WaitChannel = 0x5EEB_0000;

pub fn set_clock_hz(hz: u64) {
    if hz > 0 {
        CLOCK_TSC_HZ.store(hz, Ordering::Relaxed);
    }
}

fn now_ns() -> u64 {
    let hz = CLOCK_TSC_HZ.load(Ordering::Relaxed);
    let mhz = (hz / 1_000_000).max(1);
    arch::rdtsc().wrapping_mul(1000) / mhz
}

fn runqueue(cpu: u32) -> Option<&'static SpinLock<RunQueue>> {
    if cpu as usize >= MAX_CPUS {
        return None;
    }
    let ptr = RUNQUEUES[cpu as usize].load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Initialize scheduler globals. BSP, before any per-CPU setup.
pub fn init() {
    SCHEDULER.need_balance.store(false, Ordering::Relaxed);
    crate::kinfo!(
        "sched: {} classes x {} levels, {}-tick slices, balance every {} ticks",
        crate::config::NUM_SCHED_CLASSES,
        crate::config::PRIO_LEVELS_PER_CLASS,
        DEFAULT_TIMESLICE_TICKS,
        LOAD_BALANCE_INTERVAL
    );
}

/// Bring up scheduling for one CPU: allocate its run queue on the local
/// NUMA node and register the calling context as the CPU's idle thread.
pub fn init_cpu(cpu: u32) -> Result<(), SchedError> {
    if cpu as usize >= MAX_CPUS {
        return Err(SchedError::InvalidParameter);
    }
    if !RUNQUEUES[cpu as usize].load(Ordering::Acquire).is_null() {
        return Ok(());
    }

    let node = topology::cpu_to_node(cpu);
    let page = mm::alloc_pages_node(1, node)?;
    let rq_ptr = page as *mut SpinLock<RunQueue>;
    unsafe {
        rq_ptr.write(SpinLock::new(RunQueue::new(cpu)));
    }
    RUNQUEUES[cpu as usize].store(rq_ptr, Ordering::Release);

    let mut idle = Thread::new(0, "idle", SchedClass::Idle, 0);
    idle.affinity = 1u64 << cpu;
    idle.bound = true;
    idle.is_idle = true;
    idle.last_cpu = cpu;
    idle.preferred_cpu = cpu;
    idle.state = ThreadState::Running;

    let idle_tid = THREADS.lock_irqsave().insert(idle)?;

    {
        let rq_lock = runqueue(cpu).unwrap_or_else(|| unreachable!());
        let mut rq = rq_lock.lock_irqsave();
        rq.idle = Some(idle_tid);
        rq.current = Some(idle_tid);
    }

    if let Some(info) = percpu::cpu_by_id(cpu as usize) {
        info.set_idle_tid(idle_tid);
        info.set_current_tid(Some(idle_tid));
    }

    crate::kdebug!("sched: CPU {} run queue ready (idle tid {})", cpu, idle_tid);
    Ok(())
}

/// Combined class+level ordering used for preemption decisions.
#[inline]
fn effective_priority(class: SchedClass, dynamic: u8) -> u32 {
    class.index() as u32 * 32 + dynamic as u32
}

fn lowest_allowed_cpu(mask: CpuMask) -> Option<u32> {
    let allowed = mask & smp::online_mask();
    if allowed == 0 {
        None
    } else {
        Some(allowed.trailing_zeros())
    }
}

/// Place a Ready thread on a run queue: the preferred CPU when allowed
/// and online, else the lowest-indexed allowed CPU. Kicks the target if
/// the new arrival outranks its current thread.
pub fn enqueue(tid: Tid) -> Result<(), SchedError> {
    // Placement decision from a snapshot; verified again under the lock.
    let (preferred, affinity) = {
        let threads = THREADS.lock_irqsave();
        let thread = threads.get(tid).ok_or(SchedError::InvalidThreadId)?;
        match thread.state {
            ThreadState::Ready => {}
            // Enqueue of a Running thread must go through schedule().
            _ => return Err(SchedError::InvalidParameter),
        }
        if thread.on_rq.is_some() {
            return Ok(());
        }
        (thread.preferred_cpu, thread.affinity)
    };

    let online = smp::online_mask();
    let target = if affinity & online & (1u64 << preferred) != 0 {
        preferred
    } else {
        lowest_allowed_cpu(affinity).ok_or(SchedError::InvalidParameter)?
    };

    let rq_lock = runqueue(target).ok_or(SchedError::InvalidParameter)?;
    let mut ipi_target = None;
    {
        let mut rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.state != ThreadState::Ready || thread.on_rq.is_some() {
            return Ok(());
        }

        let class = thread.sched_class.index();
        let level = thread.bucket_level() as usize;
        thread.on_rq = Some(target);
        let new_priority = effective_priority(thread.sched_class, thread.dynamic_priority);
        rq.enqueue_tail(tid, class, level);

        if let Some(cur_tid) = rq.current {
            if let Some(current) = threads.get_mut(cur_tid) {
                let cur_priority = if current.is_idle {
                    0
                } else {
                    effective_priority(current.sched_class, current.dynamic_priority)
                };
                if current.is_idle || new_priority > cur_priority {
                    current.resched_requested = true;
                    if let Some(info) = percpu::cpu_by_id(target as usize) {
                        info.set_need_resched(true);
                    }
                    if target != percpu::cpu_id() {
                        ipi_target = Some(target);
                    }
                }
            }
        }
    }

    if let Some(cpu) = ipi_target {
        smp::ipi::send_reschedule(cpu);
    }
    Ok(())
}

/// Remove a Ready thread from whichever queue holds it.
pub fn dequeue(tid: Tid) -> Result<(), SchedError> {
    loop {
        let holder = {
            let threads = THREADS.lock_irqsave();
            threads.get(tid).ok_or(SchedError::InvalidThreadId)?.on_rq
        };
        let Some(cpu) = holder else {
            return Ok(());
        };
        let rq_lock = runqueue(cpu).ok_or(SchedError::InvalidParameter)?;
        let mut rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.on_rq != Some(cpu) {
            // Raced with a migration; chase the new holder.
            continue;
        }
        let class = thread.sched_class.index();
        let level = thread.bucket_level() as usize;
        rq.dequeue(tid, class, level);
        thread.on_rq = None;
        return Ok(());
    }
}

/// Main scheduler entry: account the outgoing thread, pick the highest
/// runnable one, and switch. No-op while preemption is disabled unless the
/// current thread is leaving the Running state (blocking or exiting).
pub fn schedule() {
    let cpu = percpu::cpu_id();
    let Some(rq_lock) = runqueue(cpu) else {
        return;
    };
    let Some(info) = percpu::cpu_by_id(cpu as usize) else {
        return;
    };

    if info.preempt_count() > 0 {
        let threads = THREADS.lock_irqsave();
        let still_running = info
            .current_tid()
            .and_then(|tid| threads.get(tid))
            .map(|t| t.state == ThreadState::Running)
            .unwrap_or(false);
        if still_running {
            return;
        }
    }

    let mut old_ctx: *mut Context = ptr::null_mut();
    let mut new_ctx = Context::zero();
    let mut switched = false;

    {
        let mut rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();

        let now = now_ns();
        rq.clock_ns = now;

        let prev_tid = rq.current;
        let mut prev_was_running = false;
        if let Some(ptid) = prev_tid {
            if let Some(prev) = threads.get_mut(ptid) {
                prev.resched_requested = false;
                if prev.last_run_ns != 0 {
                    let ran = now.saturating_sub(prev.last_run_ns);
                    prev.total_runtime_ns += ran;
                    if prev.is_idle {
                        info.idle_ns.fetch_add(ran, Ordering::Relaxed);
                    } else {
                        info.busy_ns.fetch_add(ran, Ordering::Relaxed);
                    }
                }
                if prev.state == ThreadState::Running {
                    prev_was_running = true;
                    prev.state = ThreadState::Ready;
                    // The idle thread never sits in a bucket.
                    if !prev.is_idle {
                        let class = prev.sched_class.index();
                        let level = prev.bucket_level() as usize;
                        prev.on_rq = Some(cpu);
                        rq.enqueue_tail(ptid, class, level);
                    }
                }
            }
        }

        let next_tid = if rq.nr_running == 0 {
            match rq.idle {
                Some(idle) => idle,
                None => return,
            }
        } else {
            let (tid, class, level) = match rq.peek_highest() {
                Some(pick) => pick,
                None => return,
            };
            rq.dequeue(tid, class, level);
            tid
        };

        {
            let Some(next) = threads.get_mut(next_tid) else {
                return;
            };
            next.on_rq = None;
            next.state = ThreadState::Running;
            next.last_cpu = cpu;
            next.last_run_ns = now;
            next.timeslice = next.timeslice_max;
        }

        rq.current = Some(next_tid);
        info.set_current_tid(Some(next_tid));
        info.set_need_resched(false);

        if prev_tid != Some(next_tid) {
            rq.nr_switches += 1;
            info.switch_count.fetch_add(1, Ordering::Relaxed);

            if let Some(next) = threads.get_mut(next_tid) {
                next.context_switches += 1;
                new_ctx = next.context;
            }
            if let Some(ptid) = prev_tid {
                if let Some(prev) = threads.get_mut(ptid) {
                    if prev_was_running {
                        prev.involuntary_switches += 1;
                    } else {
                        prev.voluntary_switches += 1;
                    }
                    old_ctx = &mut prev.context as *mut Context;
                }
            }
            switched = true;
        }
    }

    if switched {
        // Locks are released and the IRQ flag restored; the switch target
        // resumes either in kthread_entry or after its own context_switch.
        unsafe { context_switch(old_ctx, &new_ctx) };
    }
}

/// APIC timer tick. Decrements the running thread's slice, decays its
/// boost, wakes expired sleepers, and raises the balance flag on interval.
pub fn tick() {
    let cpu = percpu::cpu_id();
    let Some(rq_lock) = runqueue(cpu) else {
        return;
    };
    let Some(info) = percpu::cpu_by_id(cpu as usize) else {
        return;
    };

    let mut wakeups = [0 as Tid; 8];
    let mut wakeup_count = 0;

    {
        let mut rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();

        rq.tick_count += 1;
        let now = now_ns();
        rq.clock_ns = now;

        for thread in threads.iter_mut() {
            if thread.state == ThreadState::Blocked
                && thread.wake_time_ns != 0
                && now >= thread.wake_time_ns
                && wakeup_count < wakeups.len()
            {
                thread.wake_time_ns = 0;
                thread.wait_channel = None;
                thread.state = ThreadState::Ready;
                wakeups[wakeup_count] = thread.tid;
                wakeup_count += 1;
            }
        }

        if let Some(cur_tid) = rq.current {
            if let Some(current) = threads.get_mut(cur_tid) {
                if !current.is_idle && current.tick() {
                    current.resched_requested = true;
                    info.set_need_resched(true);
                }
            }
        }

        // Queue-length moving average, scaled by 1024.
        rq.load = (rq.load * 7 + rq.nr_running as u64 * 1024) / 8;

        if rq.tick_count % LOAD_BALANCE_INTERVAL == 0 {
            SCHEDULER.need_balance.store(true, Ordering::Release);
        }
    }

    for &tid in wakeups[..wakeup_count].iter() {
        let _ = enqueue(tid);
    }
}

/// Consume the periodic balance flag; called on the tick path.
pub fn maybe_balance() {
    if SCHEDULER.need_balance.swap(false, Ordering::AcqRel) {
        load_balance(false);
    }
}

/// Voluntarily give up the CPU to the next thread of equal priority.
pub fn yield_now() {
    {
        let Some(rq_lock) = runqueue(percpu::cpu_id()) else {
            return;
        };
        let rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();
        if let Some(cur_tid) = rq.current {
            if let Some(current) = threads.get_mut(cur_tid) {
                current.timeslice = 0;
                current.voluntary_switches += 1;
            }
        }
    }
    schedule();
}

/// Block the current thread on `channel` and switch away.
pub fn block(channel: WaitChannel) {
    {
        let Some(rq_lock) = runqueue(percpu::cpu_id()) else {
            return;
        };
        let rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();
        if let Some(cur_tid) = rq.current {
            if let Some(current) = threads.get_mut(cur_tid) {
                if current.is_idle {
                    return;
                }
                current.state = ThreadState::Blocked;
                current.wait_channel = Some(channel);
                current.voluntary_switches += 1;
            }
        }
    }
    schedule();
}

/// Blocked -> Ready transition plus requeue.
pub fn unblock(tid: Tid) -> Result<(), SchedError> {
    {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.state != ThreadState::Blocked {
            return Err(SchedError::InvalidParameter);
        }
        thread.state = ThreadState::Ready;
        thread.wait_channel = None;
        thread.wake_time_ns = 0;
    }
    enqueue(tid)
}

/// Wake every thread blocked on `channel`. Returns how many woke.
pub fn wake_channel(channel: WaitChannel) -> usize {
    let mut woken = [0 as Tid; 16];
    let mut count = 0;
    {
        let mut threads = THREADS.lock_irqsave();
        for thread in threads.iter_mut() {
            if thread.state == ThreadState::Blocked
                && thread.wait_channel == Some(channel)
                && count < woken.len()
            {
                thread.state = ThreadState::Ready;
                thread.wait_channel = None;
                thread.wake_time_ns = 0;
                woken[count] = thread.tid;
                count += 1;
            }
        }
    }
    for &tid in woken[..count].iter() {
        let _ = enqueue(tid);
    }
    count
}

/// Sleep for `ns` nanoseconds; woken by the tick scan or by a wake on this
/// thread's sleep channel.
pub fn sleep_ns(ns: u64) {
    let Some(tid) = current_tid() else {
        return;
    };
    {
        let mut threads = THREADS.lock_irqsave();
        if let Some(thread) = threads.get_mut(tid) {
            thread.wake_time_ns = now_ns().saturating_add(ns);
        }
    }
    block(SLEEP_CHANNEL_BASE + tid as WaitChannel);
}

/// Change a thread's affinity mask. The mask must intersect the online
/// set; a Ready thread parked on a now-forbidden CPU is migrated, a
/// Running one is kicked so it re-schedules onto an allowed CPU.
pub fn set_affinity(tid: Tid, mask: CpuMask) -> Result<(), SchedError> {
    if mask & smp::online_mask() == 0 {
        return Err(SchedError::InvalidParameter);
    }

    SCHEDULER.global_lock.lock();
    let result = set_affinity_locked(tid, mask);
    SCHEDULER.global_lock.unlock();
    result
}

fn set_affinity_locked(tid: Tid, mask: CpuMask) -> Result<(), SchedError> {
    let (state, holder, last_cpu) = {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.bound {
            return Err(SchedError::InvalidParameter);
        }
        thread.affinity = mask;
        (thread.state, thread.on_rq, thread.last_cpu)
    };

    match state {
        ThreadState::Ready => {
            if let Some(cpu) = holder {
                if mask & (1u64 << cpu) == 0 {
                    dequeue(tid)?;
                    let preferred =
                        lowest_allowed_cpu(mask).ok_or(SchedError::InvalidParameter)?;
                    {
                        let mut threads = THREADS.lock_irqsave();
                        if let Some(thread) = threads.get_mut(tid) {
                            thread.preferred_cpu = preferred;
                        }
                    }
                    enqueue(tid)?;
                }
            }
        }
        ThreadState::Running => {
            if mask & (1u64 << last_cpu) == 0 {
                if let Some(info) = percpu::cpu_by_id(last_cpu as usize) {
                    info.set_need_resched(true);
                }
                if last_cpu != percpu::cpu_id() {
                    smp::ipi::send_reschedule(last_cpu);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

pub fn get_affinity(tid: Tid) -> Result<CpuMask, SchedError> {
    let threads = THREADS.lock_irqsave();
    threads
        .get(tid)
        .map(|t| t.affinity)
        .ok_or(SchedError::InvalidThreadId)
}

/// Apply a transient priority boost; the boost decays in `tick` and the
/// thread is requeued into its new bucket when Ready.
pub fn boost(tid: Tid, delta: i8, ticks: u8) -> Result<(), SchedError> {
    if !(-31..=31).contains(&(delta as i32)) {
        return Err(SchedError::InvalidPriorityDelta);
    }

    let was_queued = {
        let threads = THREADS.lock_irqsave();
        let thread = threads.get(tid).ok_or(SchedError::InvalidThreadId)?;
        thread.on_rq.is_some()
    };
    if was_queued {
        dequeue(tid)?;
    }
    {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        thread.apply_boost(delta, ticks);
    }
    if was_queued {
        enqueue(tid)?;
    }
    Ok(())
}

/// Change class and/or base level (class `None` = keep). Requeues a Ready
/// thread into the bucket matching its new dynamic priority.
pub fn set_priority(
    tid: Tid,
    class: Option<SchedClass>,
    base: u8,
) -> Result<(), SchedError> {
    if base > PRIO_MAX {
        return Err(SchedError::InvalidPriorityDelta);
    }

    let was_queued = {
        let threads = THREADS.lock_irqsave();
        let thread = threads.get(tid).ok_or(SchedError::InvalidThreadId)?;
        thread.on_rq.is_some()
    };
    if was_queued {
        dequeue(tid)?;
    }
    {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if let Some(class) = class {
            thread.sched_class = class;
        }
        thread.base_priority = base;
        thread.recompute_dynamic();
    }
    if was_queued {
        enqueue(tid)?;
    }
    Ok(())
}

/// Raise the suspend count; a Ready target leaves its queue, a Running one
/// is kicked off its CPU.
pub fn suspend(tid: Tid) -> Result<(), SchedError> {
    let (state, last_cpu) = {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.is_idle {
            return Err(SchedError::InvalidParameter);
        }
        thread.suspend_count += 1;
        (thread.state, thread.last_cpu)
    };

    match state {
        ThreadState::Ready => {
            dequeue(tid)?;
            let mut threads = THREADS.lock_irqsave();
            if let Some(thread) = threads.get_mut(tid) {
                thread.state = ThreadState::Suspended;
            }
        }
        ThreadState::Running => {
            {
                let mut threads = THREADS.lock_irqsave();
                if let Some(thread) = threads.get_mut(tid) {
                    thread.state = ThreadState::Suspended;
                }
            }
            if Some(tid) == current_tid() {
                schedule();
            } else {
                smp::ipi::send_reschedule(last_cpu);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Drop the suspend count; at zero a Suspended thread re-enters Ready.
pub fn resume(tid: Tid) -> Result<(), SchedError> {
    let requeue = {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.suspend_count == 0 {
            return Err(SchedError::NotFrozen);
        }
        thread.suspend_count -= 1;
        if thread.suspend_count == 0 && thread.state == ThreadState::Suspended {
            thread.state = ThreadState::Ready;
            true
        } else {
            false
        }
    };
    if requeue {
        enqueue(tid)?;
    }
    Ok(())
}

/// Mark a thread terminating: wake it if blocked, kick its CPU if it is
/// running elsewhere so it observes the flag at the next preemption point.
pub fn kill(tid: Tid) -> Result<(), SchedError> {
    let (state, last_cpu) = {
        let mut threads = THREADS.lock_irqsave();
        let thread = threads.get_mut(tid).ok_or(SchedError::InvalidThreadId)?;
        if thread.is_idle {
            return Err(SchedError::InvalidThreadId);
        }
        thread.terminating = true;
        (thread.state, thread.last_cpu)
    };

    match state {
        ThreadState::Blocked => {
            let _ = unblock(tid);
        }
        ThreadState::Running => {
            if last_cpu != percpu::cpu_id() {
                smp::ipi::send_reschedule(last_cpu);
            }
        }
        _ => {}
    }
    Ok(())
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct CreateFlags: u32 {
        /// Enqueue immediately instead of starting Suspended.
        const READY = 1 << 0;
    }
}

/// Create a kernel thread. Starts Ready or Suspended per `flags`.
///
/// `stack_size` is rounded up to a page boundary; requests below the
/// kernel minimum get `KERNEL_STACK_SIZE`.
pub fn thread_create(
    name: &'static str,
    entry: fn(usize),
    arg: usize,
    class: SchedClass,
    priority: u8,
    stack_size: usize,
    flags: CreateFlags,
) -> Result<Tid, SchedError> {
    if priority > PRIO_MAX {
        return Err(SchedError::InvalidPriorityDelta);
    }

    let stack_size = stack_size
        .max(KERNEL_STACK_SIZE)
        .next_multiple_of(mm::PAGE_SIZE);
    let stack_pages = stack_size / mm::PAGE_SIZE;
    let order = stack_pages.next_power_of_two().trailing_zeros();
    let stack_base = mm::alloc_pages(order)?;
    let stack_top = stack_base + stack_size as u64;

    let mut thread = Thread::new(0, name, class, priority);
    thread.entry = Some(entry);
    thread.entry_arg = arg;
    thread.stack_base = stack_base;
    thread.stack_size = stack_size as u32;
    thread.preferred_cpu = percpu::cpu_id();
    thread.context = Context::new_kernel(kthread_entry as usize as u64, stack_top);
    thread.state = if flags.contains(CreateFlags::READY) {
        ThreadState::Ready
    } else {
        ThreadState::Suspended
    };
    if thread.state == ThreadState::Suspended {
        thread.suspend_count = 1;
    }

    let tid = THREADS.lock_irqsave().insert(thread)?;
    SCHEDULER.total_threads.fetch_add(1, Ordering::Relaxed);

    if flags.contains(CreateFlags::READY) {
        enqueue(tid)?;
    }
    Ok(tid)
}

/// First frame of every kernel thread: runs the entry function, then
/// exits. Entered from `context_switch` with interrupts enabled.
extern "C" fn kthread_entry() -> ! {
    let (entry, arg) = {
        let threads = THREADS.lock_irqsave();
        let tid = percpu::cpu_info().current_tid().unwrap_or(0);
        match threads.get(tid) {
            Some(thread) => (thread.entry, thread.entry_arg),
            None => (None, 0),
        }
    };

    if let Some(entry) = entry {
        entry(arg);
    }
    thread_exit()
}

/// Terminate the calling thread. The slot is reaped later by `reap`.
pub fn thread_exit() -> ! {
    {
        let Some(rq_lock) = runqueue(percpu::cpu_id()) else {
            arch::halt_loop();
        };
        let rq = rq_lock.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();
        if let Some(cur_tid) = rq.current {
            if let Some(current) = threads.get_mut(cur_tid) {
                current.state = ThreadState::Zombie;
            }
        }
    }
    schedule();
    // A Zombie is never picked again.
    arch::halt_loop()
}

/// Release a Zombie thread's slot.
pub fn reap(tid: Tid) -> Result<(), SchedError> {
    let mut threads = THREADS.lock_irqsave();
    match threads.get(tid) {
        Some(thread) if thread.state == ThreadState::Zombie => {
            threads.remove(tid);
            SCHEDULER.total_threads.fetch_sub(1, Ordering::Relaxed);
            Ok(())
        }
        Some(_) => Err(SchedError::InvalidParameter),
        None => Err(SchedError::InvalidThreadId),
    }
}

pub fn current_tid() -> Option<Tid> {
    percpu::cpu_by_id(percpu::cpu_id() as usize).and_then(|info| info.current_tid())
}

/// Collect the tids owned by a process into `out`; returns the count.
pub fn collect_owned(owner: super::thread::Pid, out: &mut [Tid]) -> usize {
    let threads = THREADS.lock_irqsave();
    let mut count = 0;
    for thread in threads.iter() {
        if thread.owner == owner && !thread.is_idle && count < out.len() {
            out[count] = thread.tid;
            count += 1;
        }
    }
    count
}

/// Pull-model load balance. Finds the busiest online CPU, takes one
/// migratable thread from it, and enqueues it here. `idle_path` drops the
/// cache-hot guard: an idle puller benefits from any thread.
pub fn load_balance(idle_path: bool) {
    let this_cpu = percpu::cpu_id();
    let Some(this_rq) = runqueue(this_cpu) else {
        return;
    };

    let this_load = this_rq.lock_irqsave().nr_running;

    let mut loads = [(0u32, 0u32); MAX_CPUS];
    let mut count = 0;
    let online = smp::online_mask();
    for cpu in 0..MAX_CPUS as u32 {
        if cpu == this_cpu || online & (1u64 << cpu) == 0 {
            continue;
        }
        if let Some(rq_lock) = runqueue(cpu) {
            loads[count] = (cpu, rq_lock.lock_irqsave().nr_running);
            count += 1;
        }
    }

    let Some(busiest) = balance::find_busiest(&loads[..count], this_load) else {
        return;
    };
    let Some(busiest_rq) = runqueue(busiest) else {
        return;
    };

    let victim = {
        let mut rq = busiest_rq.lock_irqsave();
        let mut threads = THREADS.lock_irqsave();
        let Some(victim) = balance::select_victim(
            &rq,
            &threads,
            this_cpu,
            now_ns(),
            !idle_path,
        ) else {
            return;
        };
        let Some(thread) = threads.get_mut(victim) else {
            return;
        };
        let class = thread.sched_class.index();
        let level = thread.bucket_level() as usize;
        rq.dequeue(victim, class, level);
        thread.on_rq = None;
        thread.preferred_cpu = this_cpu;
        thread.migrating = true;
        victim
    };

    // Donor lock released before touching our own queue; the migrating
    // flag keeps concurrent dequeues off the thread during the hand-off.
    let _ = enqueue(victim);
    if let Some(thread) = THREADS.lock_irqsave().get_mut(victim) {
        thread.migrating = false;
    }

    crate::kdebug!(
        "sched: pulled tid {} from CPU {} to CPU {}",
        victim,
        busiest,
        this_cpu
    );
}

/// Idle thread body: balance, then run whatever became ready, else halt
/// until the next interrupt.
pub fn idle_loop() -> ! {
    let cpu = percpu::cpu_id();
    loop {
        load_balance(true);

        let runnable = runqueue(cpu)
            .map(|rq| rq.lock_irqsave().nr_running > 0)
            .unwrap_or(false);

        if runnable {
            schedule();
        } else {
            arch::enable_interrupts_and_halt();
        }
    }
}
