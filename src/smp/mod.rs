//! SMP subsystem: CPU discovery, AP bring-up, and cross-CPU signalling.
//!
//! Single-threaded on the BSP until [`init`] returns; each AP comes up
//! through the low-memory trampoline, initializes its own APIC and run
//! queue, reports in through the boot rendezvous cell, and parks in the
//! idle loop.
//!
//! ## Module organization
//!
//! - `state`: global atomics (online mask, counts, boot rendezvous)
//! - `trampoline`: 16->32->64-bit startup stub and its patch table
//! - `boot`: BSP sequence and per-AP `boot_cpu`
//! - `ipi`: vector map, targeted/broadcast sends, cross-calls

pub mod boot;
pub mod ipi;
pub mod state;
pub mod trampoline;

pub use boot::{boot_cpu, init};
pub use state::{bsp_id, cpu_count, cpu_possible, is_ready, online_mask};
