//! AP startup trampoline.
//!
//! A STARTUP IPI drops the AP into real mode at the trampoline page, so the
//! stub below walks it up: 16-bit -> protected mode -> PAE + long mode on
//! the kernel's page tables, then looks up its own APIC id in the patched
//! table to find its logical id and stack, enables the SSE control bits,
//! and calls the 64-bit entry pointer.
//!
//! The stub is position-dependent: it is assembled against its link
//! address but executes from `AP_TRAMPOLINE_ADDR`, so all 16/32-bit
//! references are computed as `base + (symbol - start)` and the 64-bit
//! tail uses RIP-relative addressing (offsets survive the copy).

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::registers::control::Cr3;

use crate::config::{AP_TRAMPOLINE_ADDR, MAX_CPUS};
use crate::error::SchedError;

const TRAMPOLINE_MAX_SIZE: usize = 4096;

core::arch::global_asm!(
    r#"
    .section .text
    .code16
    .global __ap_trampoline_start
    .global __ap_trampoline_end
    .global ap_pml4_value
    .global ap_entry_value
    .global ap_cpu_count_value
    .global ap_cpu_table

__ap_trampoline_start:
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    lgdtl (ap_gdt_desc - __ap_trampoline_start + 0x8000)

    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0

    ljmpl $0x08, $(ap_prot32 - __ap_trampoline_start + 0x8000)

    .code32
ap_prot32:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    /* PAE */
    movl %cr4, %eax
    orl $(1 << 5), %eax
    movl %eax, %cr4

    /* Kernel page-table root patched in by the BSP */
    movl (ap_pml4_value - __ap_trampoline_start + 0x8000), %eax
    movl %eax, %cr3

    /* EFER.LME */
    movl $0xC0000080, %ecx
    rdmsr
    orl $(1 << 8), %eax
    wrmsr

    /* Paging + protection */
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0

    ljmpl $0x18, $(ap_long64 - __ap_trampoline_start + 0x8000)

    .code64
ap_long64:
    /* SSE: clear CR0.EM, set CR0.MP, set CR4.OSFXSR|OSXMMEXCPT */
    movq %cr0, %rax
    andq $~(1 << 2), %rax
    orq $(1 << 1), %rax
    movq %rax, %cr0
    movq %cr4, %rax
    orq $((1 << 9) | (1 << 10)), %rax
    movq %rax, %cr4

    /* Own APIC id from CPUID leaf 1 */
    movl $1, %eax
    cpuid
    shrl $24, %ebx

    /* Look up (logical id, stack top) by APIC id */
    leaq ap_cpu_table(%rip), %rsi
    movl ap_cpu_count_value(%rip), %ecx
1:
    testl %ecx, %ecx
    jz 3f
    cmpl (%rsi), %ebx
    je 2f
    addq $16, %rsi
    decl %ecx
    jmp 1b
2:
    movl 4(%rsi), %edi
    movq 8(%rsi), %rsp
    movq ap_entry_value(%rip), %rax
    callq *%rax
3:
    hlt
    jmp 3b

    .balign 8
ap_gdt:
    .quad 0x0000000000000000    /* null */
    .quad 0x00CF9A000000FFFF    /* 0x08: 32-bit code, flat */
    .quad 0x00CF92000000FFFF    /* 0x10: data, flat */
    .quad 0x00AF9A000000FFFF    /* 0x18: 64-bit code */
ap_gdt_desc:
    .word (ap_gdt_desc - ap_gdt - 1)
    .long (ap_gdt - __ap_trampoline_start + 0x8000)

    .balign 8
ap_pml4_value:
    .quad 0
ap_entry_value:
    .quad 0
ap_cpu_count_value:
    .long 0
    .long 0
    .balign 16
ap_cpu_table:
    .space {table_size}
__ap_trampoline_end:
    "#,
    table_size = const MAX_CPUS * 16,
    options(att_syntax)
);

extern "C" {
    static __ap_trampoline_start: u8;
    static __ap_trampoline_end: u8;
    static ap_pml4_value: u8;
    static ap_entry_value: u8;
    static ap_cpu_count_value: u8;
    static ap_cpu_table: u8;
}

static TRAMPOLINE_READY: AtomicBool = AtomicBool::new(false);

fn symbol_offset(symbol: *const u8) -> usize {
    let start = unsafe { ptr::addr_of!(__ap_trampoline_start) } as usize;
    symbol as usize - start
}

fn patch_addr(symbol: *const u8) -> *mut u8 {
    (AP_TRAMPOLINE_ADDR as usize + symbol_offset(symbol)) as *mut u8
}

/// Copy the stub into low memory and patch the shared fields: page-table
/// root and 64-bit entry pointer. The per-CPU table is filled separately.
pub unsafe fn install(entry: u64) -> Result<(), SchedError> {
    if TRAMPOLINE_READY.load(Ordering::Acquire) {
        return Ok(());
    }

    let start = ptr::addr_of!(__ap_trampoline_start) as usize;
    let end = ptr::addr_of!(__ap_trampoline_end) as usize;
    let size = end - start;
    if size == 0 || size > TRAMPOLINE_MAX_SIZE {
        return Err(SchedError::InvalidParameter);
    }

    ptr::copy_nonoverlapping(start as *const u8, AP_TRAMPOLINE_ADDR as *mut u8, size);

    let (pml4_frame, _) = Cr3::read();
    let pml4 = pml4_frame.start_address().as_u64();
    (patch_addr(ptr::addr_of!(ap_pml4_value)) as *mut u64).write_volatile(pml4);
    (patch_addr(ptr::addr_of!(ap_entry_value)) as *mut u64).write_volatile(entry);

    TRAMPOLINE_READY.store(true, Ordering::Release);
    crate::kinfo!(
        "smp: trampoline installed at {:#x} ({} bytes, pml4 {:#x})",
        AP_TRAMPOLINE_ADDR,
        size,
        pml4
    );
    Ok(())
}

/// Publish one `apic_id -> (logical id, stack top)` entry in the lookup
/// table the stub searches.
pub unsafe fn publish_cpu(slot: usize, apic_id: u32, logical_id: u32, stack_top: u64) {
    debug_assert!(slot < MAX_CPUS);
    let entry = patch_addr(ptr::addr_of!(ap_cpu_table)).add(slot * 16);
    (entry as *mut u32).write_volatile(apic_id);
    (entry.add(4) as *mut u32).write_volatile(logical_id);
    (entry.add(8) as *mut u64).write_volatile(stack_top);
}

/// Publish how many table entries are valid.
pub unsafe fn publish_cpu_count(count: usize) {
    (patch_addr(ptr::addr_of!(ap_cpu_count_value)) as *mut u32).write_volatile(count as u32);
}
