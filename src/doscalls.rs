//! OS/2 DOSCALLS thread API, as a thin adapter over the scheduler.
//!
//! TIDs on this surface are 1-based the way OS/2 numbers them; 0 names the
//! calling thread where OS/2 allowed it. Internally they map onto the
//! scheduler's 0-based arena tids.
//!
//! `DosSetThreadAffinity`/`DosGetThreadAffinity` and the processor fields
//! of `DosQuerySysInfo` are the SMP extensions of this personality; the
//! rest is the classic Warp surface.

use crate::config::PRIO_LEVELS_PER_CLASS;
use crate::error::SchedError;
use crate::percpu;
use crate::sched::thread::{os2_delta_to_level, CpuMask, Pid, SchedClass, Tid};
use crate::{sched, smp};

pub type ApiRet = u32;

pub const NO_ERROR: ApiRet = 0;
pub const ERROR_NOT_ENOUGH_MEMORY: ApiRet = 8;
pub const ERROR_INVALID_PARAMETER: ApiRet = 87;
pub const ERROR_INVALID_PCLASS: ApiRet = 307;
pub const ERROR_INVALID_PDELTA: ApiRet = 308;
pub const ERROR_INVALID_THREADID: ApiRet = 309;
pub const ERROR_INVALID_SCOPE: ApiRet = 313;
pub const ERROR_NOT_FROZEN: ApiRet = 471;
pub const ERROR_CRITSEC_UNDERFLOW: ApiRet = 474;

/// Priority scopes accepted by `DosSetPriority`.
pub const PRTYS_PROCESS: u32 = 0;
pub const PRTYS_PROCESSTREE: u32 = 1;
pub const PRTYS_THREAD: u32 = 2;

/// OS/2 priority classes. 0 means "no change".
pub const PRTYC_NOCHANGE: u32 = 0;
pub const PRTYC_IDLETIME: u32 = 1;
pub const PRTYC_REGULAR: u32 = 2;
pub const PRTYC_TIMECRITICAL: u32 = 3;
pub const PRTYC_FOREGROUNDSERVER: u32 = 4;

/// `DosCreateThread` flag: start suspended instead of ready.
pub const CREATE_SUSPENDED: u32 = 1;

/// `DosQuerySysInfo` indices (SMP extension values included).
pub const QSV_VERSION_MAJOR: u32 = 11;
pub const QSV_VERSION_MINOR: u32 = 12;
pub const QSV_NUMPROCESSORS: u32 = 26;
pub const QSV_PROCESSOR_ID: u32 = 27;

const VERSION_MAJOR: u32 = 20;
const VERSION_MINOR: u32 = 45;

fn api_ret(err: SchedError) -> ApiRet {
    match err {
        SchedError::InvalidParameter => ERROR_INVALID_PARAMETER,
        SchedError::InvalidThreadId => ERROR_INVALID_THREADID,
        SchedError::InvalidPriorityClass => ERROR_INVALID_PCLASS,
        SchedError::InvalidPriorityDelta => ERROR_INVALID_PDELTA,
        SchedError::NotFrozen => ERROR_NOT_FROZEN,
        SchedError::CritSecUnderflow => ERROR_CRITSEC_UNDERFLOW,
        SchedError::OutOfMemory => ERROR_NOT_ENOUGH_MEMORY,
        _ => ERROR_INVALID_PARAMETER,
    }
}

/// 1-based API tid to arena tid; 0 resolves to the caller.
fn resolve_tid(tid: u32) -> Result<Tid, SchedError> {
    if tid == 0 {
        sched::current_tid().ok_or(SchedError::InvalidThreadId)
    } else {
        Ok(tid - 1)
    }
}

const fn api_tid(tid: Tid) -> u32 {
    tid + 1
}

/// Create a thread in the calling process. Regular class, mid level, full
/// affinity; starts on the creating CPU unless the balancer moves it. The
/// requested stack size is honored, rounded up to a page boundary with
/// the kernel's 16 KiB stack as the floor.
pub fn dos_create_thread(
    ptid: &mut u32,
    pfn: fn(usize),
    param: usize,
    flag: u32,
    cb_stack: u32,
) -> ApiRet {
    let flags = if flag & CREATE_SUSPENDED != 0 {
        sched::CreateFlags::empty()
    } else {
        sched::CreateFlags::READY
    };

    match sched::thread_create(
        "os2",
        pfn,
        param,
        SchedClass::Regular,
        (PRIO_LEVELS_PER_CLASS / 2) as u8,
        cb_stack as usize,
        flags,
    ) {
        Ok(tid) => {
            *ptid = api_tid(tid);
            NO_ERROR
        }
        Err(err) => api_ret(err),
    }
}

/// Mark a thread for termination. Killing yourself this way is refused,
/// matching OS/2.
pub fn dos_kill_thread(tid: u32) -> ApiRet {
    let target = match resolve_tid(tid) {
        Ok(t) => t,
        Err(e) => return api_ret(e),
    };
    if Some(target) == sched::current_tid() {
        return ERROR_INVALID_THREADID;
    }
    match sched::kill(target) {
        Ok(()) => NO_ERROR,
        Err(err) => api_ret(err),
    }
}

pub fn dos_suspend_thread(tid: u32) -> ApiRet {
    match resolve_tid(tid).and_then(sched::suspend) {
        Ok(()) => NO_ERROR,
        Err(err) => api_ret(err),
    }
}

pub fn dos_resume_thread(tid: u32) -> ApiRet {
    match resolve_tid(tid).and_then(sched::resume) {
        Ok(()) => NO_ERROR,
        Err(err) => api_ret(err),
    }
}

/// `DosSetPriority`: class 1..=4 selects the scheduling class (0 keeps
/// it), the delta in -31..=31 maps linearly onto the 0..=31 level range.
pub fn dos_set_priority(scope: u32, class: u32, delta: i32, id: u32) -> ApiRet {
    if class > PRTYC_FOREGROUNDSERVER {
        return ERROR_INVALID_PCLASS;
    }
    let new_class = if class == PRTYC_NOCHANGE {
        None
    } else {
        match SchedClass::from_os2(class) {
            Ok(c) => Some(c),
            Err(e) => return api_ret(e),
        }
    };
    let level = match os2_delta_to_level(delta) {
        Ok(l) => l,
        Err(e) => return api_ret(e),
    };

    match scope {
        PRTYS_THREAD => {
            let tid = match resolve_tid(id) {
                Ok(t) => t,
                Err(e) => return api_ret(e),
            };
            match sched::set_priority(tid, new_class, level) {
                Ok(()) => NO_ERROR,
                Err(err) => api_ret(err),
            }
        }
        PRTYS_PROCESS | PRTYS_PROCESSTREE => {
            let pid = id as Pid;
            let mut tids = [0 as Tid; crate::config::MAX_THREADS];
            let count = sched::collect_owned(pid, &mut tids);
            for &tid in tids[..count].iter() {
                if let Err(err) = sched::set_priority(tid, new_class, level) {
                    return api_ret(err);
                }
            }
            NO_ERROR
        }
        _ => ERROR_INVALID_SCOPE,
    }
}

/// `DosSleep(0)` is exactly a yield; anything else sleeps on the thread's
/// own channel until the deadline or an explicit wake.
pub fn dos_sleep(msec: u32) -> ApiRet {
    if msec == 0 {
        sched::yield_now();
    } else {
        sched::sleep_ns(msec as u64 * 1_000_000);
    }
    NO_ERROR
}

use core::sync::atomic::{AtomicU32, Ordering};

/// Per-process critical-section nesting for the kernel process. A real
/// multi-process personality hangs this off its process objects.
static CRITSEC_COUNT: AtomicU32 = AtomicU32::new(0);

/// Disable thread switching for the calling process. On SMP this only
/// pins the current CPU's scheduler; other CPUs keep running.
pub fn dos_enter_critsec() -> ApiRet {
    CRITSEC_COUNT.fetch_add(1, Ordering::AcqRel);
    percpu::preempt_disable();
    NO_ERROR
}

pub fn dos_exit_critsec() -> ApiRet {
    let count = CRITSEC_COUNT.load(Ordering::Acquire);
    if count == 0 {
        return ERROR_CRITSEC_UNDERFLOW;
    }
    CRITSEC_COUNT.fetch_sub(1, Ordering::AcqRel);
    percpu::preempt_enable();
    NO_ERROR
}

/// SMP extension: set a thread's 64-bit CPU affinity mask.
pub fn dos_set_thread_affinity(tid: u32, affinity_mask: CpuMask) -> ApiRet {
    let target = match resolve_tid(tid) {
        Ok(t) => t,
        Err(e) => return api_ret(e),
    };
    if affinity_mask & smp::online_mask() == 0 {
        return ERROR_INVALID_PARAMETER;
    }
    match sched::set_affinity(target, affinity_mask) {
        Ok(()) => NO_ERROR,
        Err(err) => api_ret(err),
    }
}

/// SMP extension: read back a thread's affinity mask.
pub fn dos_get_thread_affinity(tid: u32, paffinity_mask: &mut CpuMask) -> ApiRet {
    let target = match resolve_tid(tid) {
        Ok(t) => t,
        Err(e) => return api_ret(e),
    };
    match sched::get_affinity(target) {
        Ok(mask) => {
            *paffinity_mask = mask;
            NO_ERROR
        }
        Err(err) => api_ret(err),
    }
}

/// Fill `buf` with one value per requested index.
pub fn dos_query_sysinfo(istart: u32, ilast: u32, buf: &mut [u32]) -> ApiRet {
    if istart > ilast || buf.len() < (ilast - istart + 1) as usize {
        return ERROR_INVALID_PARAMETER;
    }

    for (slot, index) in buf.iter_mut().zip(istart..=ilast) {
        *slot = match index {
            QSV_NUMPROCESSORS => smp::cpu_count() as u32,
            QSV_PROCESSOR_ID => percpu::cpu_id(),
            QSV_VERSION_MAJOR => VERSION_MAJOR,
            QSV_VERSION_MINOR => VERSION_MINOR,
            _ => 0,
        };
    }
    NO_ERROR
}
