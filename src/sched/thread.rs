//! Thread control blocks and the system-wide thread arena.
//!
//! Threads, run queues, and CPU info blocks reference each other in a
//! cycle, so nothing holds a pointer: threads live in a fixed arena
//! addressed by `Tid`, and every other structure stores tids. A thread's
//! position in a run queue is tracked by `on_rq` (the owning CPU) while the
//! queue itself keeps the intrusive links.

use super::context::Context;
use crate::config::{DEFAULT_TIMESLICE_TICKS, MAX_THREADS, PRIO_LEVELS_PER_CLASS};
use crate::error::SchedError;

pub type Tid = u32;
pub type Pid = u32;

/// Opaque wait token; the blocker and the waker agree on the value.
pub type WaitChannel = usize;

pub type CpuMask = u64;

pub const PRIO_MIN: u8 = 0;
pub const PRIO_MAX: u8 = (PRIO_LEVELS_PER_CLASS - 1) as u8;

/// Scheduling classes, lowest to highest. The first four are the OS/2
/// priority classes; Realtime is internal to the kernel.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedClass {
    Idle = 0,
    Regular = 1,
    TimeCritical = 2,
    Server = 3,
    Realtime = 4,
}

impl SchedClass {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SchedClass::Idle),
            1 => Some(SchedClass::Regular),
            2 => Some(SchedClass::TimeCritical),
            3 => Some(SchedClass::Server),
            4 => Some(SchedClass::Realtime),
            _ => None,
        }
    }

    /// OS/2 priority class (1..=4) to scheduling class.
    pub fn from_os2(class: u32) -> Result<Self, SchedError> {
        match class {
            1 => Ok(SchedClass::Idle),
            2 => Ok(SchedClass::Regular),
            3 => Ok(SchedClass::TimeCritical),
            4 => Ok(SchedClass::Server),
            _ => Err(SchedError::InvalidPriorityClass),
        }
    }
}

/// OS/2 priority delta (-31..=31) to a level within the class.
pub fn os2_delta_to_level(delta: i32) -> Result<u8, SchedError> {
    if !(-31..=31).contains(&delta) {
        return Err(SchedError::InvalidPriorityDelta);
    }
    let level = (delta + 31) / 2;
    Ok((level as u8).min(PRIO_MAX))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Suspended,
    Zombie,
}

/// Thread control block.
#[derive(Clone, Copy)]
pub struct Thread {
    pub tid: Tid,
    /// Owning process (weak reference by id; 0 is the kernel process).
    pub owner: Pid,
    pub name: &'static str,

    pub sched_class: SchedClass,
    pub base_priority: u8,
    pub dynamic_priority: u8,
    pub state: ThreadState,

    pub timeslice: u32,
    pub timeslice_max: u32,
    pub total_runtime_ns: u64,
    pub last_run_ns: u64,

    pub affinity: CpuMask,
    pub last_cpu: u32,
    pub preferred_cpu: u32,
    /// CPU whose run queue currently holds this thread, if Ready.
    pub on_rq: Option<u32>,

    pub priority_boost: i8,
    pub boost_ticks: u8,

    pub suspend_count: u32,
    pub wait_channel: Option<WaitChannel>,
    /// Absolute wake time for sleeps, 0 when not sleeping.
    pub wake_time_ns: u64,

    pub bound: bool,
    pub migrating: bool,
    pub terminating: bool,
    pub resched_requested: bool,
    pub is_idle: bool,

    pub context_switches: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,

    pub stack_base: u64,
    pub stack_size: u32,
    pub entry: Option<fn(usize)>,
    pub entry_arg: usize,
    pub context: Context,
}

impl Thread {
    pub const fn new(tid: Tid, name: &'static str, class: SchedClass, priority: u8) -> Self {
        Self {
            tid,
            owner: 0,
            name,
            sched_class: class,
            base_priority: priority,
            dynamic_priority: priority,
            state: ThreadState::Suspended,
            timeslice: DEFAULT_TIMESLICE_TICKS,
            timeslice_max: DEFAULT_TIMESLICE_TICKS,
            total_runtime_ns: 0,
            last_run_ns: 0,
            affinity: CpuMask::MAX,
            last_cpu: 0,
            preferred_cpu: 0,
            on_rq: None,
            priority_boost: 0,
            boost_ticks: 0,
            suspend_count: 0,
            wait_channel: None,
            wake_time_ns: 0,
            bound: false,
            migrating: false,
            terminating: false,
            resched_requested: false,
            is_idle: false,
            context_switches: 0,
            voluntary_switches: 0,
            involuntary_switches: 0,
            stack_base: 0,
            stack_size: 0,
            entry: None,
            entry_arg: 0,
            context: Context::zero(),
        }
    }

    /// `dynamic_priority = clamp(base + boost, 0, 31)`.
    pub fn recompute_dynamic(&mut self) {
        let raw = self.base_priority as i32 + self.priority_boost as i32;
        self.dynamic_priority = raw.clamp(PRIO_MIN as i32, PRIO_MAX as i32) as u8;
    }

    /// Apply a temporary boost. The caller requeues the thread if Ready.
    pub fn apply_boost(&mut self, delta: i8, ticks: u8) {
        self.priority_boost = delta;
        self.boost_ticks = ticks;
        self.recompute_dynamic();
    }

    /// Per-tick bookkeeping for the running thread. Returns true when the
    /// slice is exhausted and a reschedule is due.
    pub fn tick(&mut self) -> bool {
        if self.timeslice > 0 {
            self.timeslice -= 1;
        }

        if self.boost_ticks > 0 {
            self.boost_ticks -= 1;
            if self.boost_ticks == 0 {
                self.priority_boost = 0;
                self.dynamic_priority = self.base_priority;
            }
        }

        self.timeslice == 0
    }

    /// Bucket level inside the class matrix.
    #[inline]
    pub fn bucket_level(&self) -> u8 {
        self.dynamic_priority % PRIO_LEVELS_PER_CLASS as u8
    }
}

/// Fixed arena of thread slots; the slot index is the tid.
pub struct ThreadTable {
    slots: [Option<Thread>; MAX_THREADS],
    live: usize,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_THREADS],
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Claim a free slot and store the thread there; its tid is rewritten
    /// to the slot index.
    pub fn insert(&mut self, mut thread: Thread) -> Result<Tid, SchedError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                thread.tid = index as Tid;
                *slot = Some(thread);
                self.live += 1;
                return Ok(index as Tid);
            }
        }
        Err(SchedError::OutOfMemory)
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.slots.get(tid as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.slots.get_mut(tid as usize).and_then(|s| s.as_mut())
    }

    /// Release a Zombie slot.
    pub fn remove(&mut self, tid: Tid) -> Option<Thread> {
        let slot = self.slots.get_mut(tid as usize)?;
        let taken = slot.take();
        if taken.is_some() {
            self.live -= 1;
        }
        taken
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }
}
