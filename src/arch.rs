//! Thin architecture layer: timestamp counter, legacy PIT delays, interrupt
//! flag control, and the halt loop. Everything here is x86_64-only.

use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

/// Read the timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!(
            "lfence",
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack)
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

/// Enable interrupts and halt atomically (no lost-wakeup window).
#[inline]
pub fn enable_interrupts_and_halt() {
    interrupts::enable_and_hlt();
}

pub fn halt_loop() -> ! {
    loop {
        halt();
    }
}

const PIT_CH2_DATA: u16 = 0x42;
const PIT_COMMAND: u16 = 0x43;
const PIT_GATE: u16 = 0x61;
const PIT_HZ: u64 = 1_193_182;

/// Busy-wait `ms` milliseconds using PIT channel 2 in one-shot gate mode.
///
/// The channel-2 gate (port 0x61 bit 0) starts the countdown and the output
/// bit (bit 5) flips when it expires. This is the reference clock for APIC
/// timer calibration, so it must not depend on the APIC itself.
pub fn pit_wait_ms(ms: u64) {
    for _ in 0..ms {
        pit_wait_one_ms();
    }
}

fn pit_wait_one_ms() {
    let reload = (PIT_HZ / 1000) as u16;
    unsafe {
        let mut gate: Port<u8> = Port::new(PIT_GATE);
        let mut cmd: Port<u8> = Port::new(PIT_COMMAND);
        let mut data: Port<u8> = Port::new(PIT_CH2_DATA);

        // Gate low, speaker off.
        let val = gate.read() & !0x03;
        gate.write(val);

        // Channel 2, lobyte/hibyte, mode 0.
        cmd.write(0xB0);
        data.write((reload & 0xFF) as u8);
        data.write((reload >> 8) as u8);

        // Raise the gate to start counting.
        gate.write(val | 0x01);

        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}

/// Busy-wait roughly `us` microseconds by TSC ticks, for the short delays in
/// the INIT/SIPI sequence where the PIT would be too coarse.
pub fn tsc_delay_us(us: u64, tsc_hz: u64) {
    let ticks = (tsc_hz / 1_000_000).max(1) * us;
    let start = rdtsc();
    while rdtsc().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}
