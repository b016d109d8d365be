//! Low-level context switch.
//!
//! Only callee-saved state crosses a switch: the caller-saved half is dead
//! at every switch site because `context_switch` is a normal function call.
//! A new kernel thread is given a context whose `rip` points at its entry
//! trampoline and whose `rflags` has IF set, so the final `popfq`/`jmp`
//! both enters the thread and enables interrupts.

/// Callee-saved register block. Field order is ABI for the assembly below.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

const RFLAGS_IF: u64 = 0x202;

impl Context {
    pub const fn zero() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
        }
    }

    /// Initial context for a kernel thread: enters `entry` on `stack_top`
    /// with interrupts enabled.
    pub fn new_kernel(entry: u64, stack_top: u64) -> Self {
        let mut ctx = Self::zero();
        // The entry "returns" nowhere; keep the stack 16-byte aligned the
        // way a call would have left it.
        ctx.rsp = (stack_top & !0xF) - 8;
        ctx.rip = entry;
        ctx.rflags = RFLAGS_IF;
        ctx
    }
}

/// Save callee-saved state into `old` (skipped when null, for the first
/// hand-off out of the boot context) and resume `new`. Returns on `old`'s
/// stack when some CPU later switches back to it.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    core::arch::naked_asm!(
        "test rdi, rdi",
        "jz 2f",
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        // rsp as it will be after our return address is popped.
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x30], rax",
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x40], rax",
        "2:",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "mov rax, [rsi + 0x40]",
        "push rax",
        "popfq",
        "mov rax, [rsi + 0x38]",
        "jmp rax",
    )
}
