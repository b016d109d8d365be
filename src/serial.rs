//! COM1 transport for the kernel logger.
//!
//! The port is brought up lazily on first use so early log lines work
//! before `init` runs; `init` just forces it eagerly during boot.

use spin::{Lazy, Mutex};
use uart_16550::SerialPort;

const COM1_BASE: u16 = 0x3F8;

static COM1: Lazy<Mutex<SerialPort>> = Lazy::new(|| {
    let mut port = unsafe { SerialPort::new(COM1_BASE) };
    port.init();
    Mutex::new(port)
});

pub fn init() {
    Lazy::force(&COM1);
}

pub fn write_str(s: &str) {
    let mut port = COM1.lock();
    for &byte in s.as_bytes() {
        port.send(byte);
    }
}
