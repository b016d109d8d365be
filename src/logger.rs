//! Kernel logger.
//!
//! Log lines carry a TSC-derived timestamp and a severity badge, go to the
//! serial port, and are mirrored into a ring buffer that survives until a
//! debugger or the personality layer drains it. The serial sink can be
//! switched off at runtime (the ring buffer always records).

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::arch::rdtsc;
use crate::serial;

const RINGBUF_SIZE: usize = 32768;
const DEFAULT_TSC_FREQUENCY_HZ: u64 = 1_000_000_000;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);
static TSC_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(DEFAULT_TSC_FREQUENCY_HZ);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info.priority());
static SERIAL_ENABLED: AtomicBool = AtomicBool::new(true);

static RINGBUF: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::Fatal => 0,
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        }
    }

    fn serial_color(self) -> &'static str {
        match self {
            LogLevel::Fatal => "\x1b[1;37;41m",
            LogLevel::Error => "\x1b[1;31m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Debug => "\x1b[36m",
            LogLevel::Trace => "\x1b[90m",
        }
    }
}

struct RingBuffer {
    data: [u8; RINGBUF_SIZE],
    head: usize,
    len: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            data: [0; RINGBUF_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.data[self.head] = b;
            self.head = (self.head + 1) % RINGBUF_SIZE;
            if self.len < RINGBUF_SIZE {
                self.len += 1;
            }
        }
    }
}

impl Write for RingBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// Initialize the logger and record the boot TSC value. Returns the TSC
/// frequency in use (the default until calibration updates it).
pub fn init() -> u64 {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return TSC_FREQUENCY_HZ.load(Ordering::Relaxed);
    }

    BOOT_TSC.store(rdtsc(), Ordering::Relaxed);
    serial::init();
    TSC_FREQUENCY_HZ.load(Ordering::Relaxed)
}

/// Update the TSC frequency once timer calibration has produced a real value.
pub fn set_tsc_frequency(hz: u64) {
    if hz > 0 {
        TSC_FREQUENCY_HZ.store(hz, Ordering::Relaxed);
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn set_serial_enabled(enabled: bool) {
    SERIAL_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Microseconds since the logger was initialized.
pub fn boot_time_us() -> u64 {
    let freq = TSC_FREQUENCY_HZ.load(Ordering::Relaxed);
    let delta = rdtsc().wrapping_sub(BOOT_TSC.load(Ordering::Relaxed));
    if freq == 0 {
        return 0;
    }
    delta / (freq / 1_000_000).max(1)
}

/// Drain up to `out.len()` bytes of the ring buffer into `out`.
/// Returns the number of bytes copied.
pub fn drain_ring(out: &mut [u8]) -> usize {
    let mut ring = RINGBUF.lock();
    let take = ring.len.min(out.len());
    let start = (ring.head + RINGBUF_SIZE - ring.len) % RINGBUF_SIZE;
    for (i, slot) in out.iter_mut().enumerate().take(take) {
        *slot = ring.data[(start + i) % RINGBUF_SIZE];
    }
    ring.len -= take;
    take
}

struct SerialSink;

impl Write for SerialSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        serial::write_str(s);
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    let us = boot_time_us();
    let secs = us / 1_000_000;
    let micros = us % 1_000_000;

    {
        let mut ring = RINGBUF.lock();
        let _ = write!(ring, "[{:5}.{:06}] {:5} {}\n", secs, micros, level.as_str(), args);
    }

    if SERIAL_ENABLED.load(Ordering::Relaxed) {
        let mut sink = SerialSink;
        let _ = write!(
            sink,
            "[{:5}.{:06}] {}{:5}\x1b[0m {}\n",
            secs,
            micros,
            level.serial_color(),
            level.as_str(),
            args
        );
    }
}
