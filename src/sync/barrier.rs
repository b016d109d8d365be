//! CPU pause hint and memory barriers for spin loops and lock-free code.

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Pause hint for the body of a spin loop.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Full memory barrier (load and store ordering).
#[inline(always)]
pub fn mb() {
    fence(Ordering::SeqCst);
}

/// Acquire barrier: later loads cannot move before it.
#[inline(always)]
pub fn rmb() {
    fence(Ordering::Acquire);
}

/// Release barrier: earlier stores cannot move after it.
#[inline(always)]
pub fn wmb() {
    fence(Ordering::Release);
}

/// Compiler-only reordering barrier; emits no instruction.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}
