//! Discriminated failure codes surfaced by the scheduling and SMP core.
//!
//! The core never panics on a recoverable error; every fallible operation
//! returns one of these kinds. The DOSCALLS shim translates them into OS/2
//! numeric return codes at the API boundary.

/// Errors raised by the scheduler, SMP bring-up, and APIC layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// Null/invalid argument, or an affinity mask with no online CPU.
    InvalidParameter,
    /// Thread lookup miss.
    InvalidThreadId,
    /// Priority class outside 0..=4.
    InvalidPriorityClass,
    /// Priority delta outside -31..=31.
    InvalidPriorityDelta,
    /// Resume of a thread whose suspend count is zero.
    NotFrozen,
    /// Exit-critical-section with a zero nesting count.
    CritSecUnderflow,
    /// Per-CPU info or kernel stack allocation failed.
    OutOfMemory,
    /// AP did not signal readiness within the startup timeout.
    ApStartupTimeout,
    /// xAPIC delivery-status bit never cleared.
    ApicTimeout,
    /// Firmware topology failed validation (BSP mismatch, GSI overlap, ...).
    TopologyInconsistent,
}

impl SchedError {
    pub const fn as_str(self) -> &'static str {
        match self {
            SchedError::InvalidParameter => "invalid parameter",
            SchedError::InvalidThreadId => "invalid thread id",
            SchedError::InvalidPriorityClass => "invalid priority class",
            SchedError::InvalidPriorityDelta => "invalid priority delta",
            SchedError::NotFrozen => "thread not frozen",
            SchedError::CritSecUnderflow => "critical section underflow",
            SchedError::OutOfMemory => "out of memory",
            SchedError::ApStartupTimeout => "AP startup timeout",
            SchedError::ApicTimeout => "APIC delivery timeout",
            SchedError::TopologyInconsistent => "inconsistent firmware topology",
        }
    }
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
