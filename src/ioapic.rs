//! I/O APIC driver.
//!
//! Every redirection entry starts masked with a placeholder vector; drivers
//! route legacy IRQs later through [`route_irq`], which consults the
//! interrupt-source override table from the topology snapshot. Redirection
//! entries are 64-bit but the hardware window is 32 bits wide, so each
//! entry is written as two register selects.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::VECTOR_IRQ_BASE;
use crate::error::SchedError;
use crate::mm;
use crate::percpu;
use crate::topology::{self, MAX_IOAPICS};

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_REDIR_BASE: u32 = 0x10;

const REDIR_MASKED: u64 = 1 << 16;
const REDIR_LEVEL: u64 = 1 << 15;
const REDIR_ACTIVE_LOW: u64 = 1 << 13;

struct IoApic {
    mmio_base: u64,
    gsi_base: u32,
    redirections: u32,
    id: u8,
}

impl IoApic {
    fn read(&mut self, reg: u32) -> u32 {
        unsafe {
            write_volatile((self.mmio_base + IOREGSEL) as *mut u32, reg);
            read_volatile((self.mmio_base + IOWIN) as *const u32)
        }
    }

    fn write(&mut self, reg: u32, value: u32) {
        unsafe {
            write_volatile((self.mmio_base + IOREGSEL) as *mut u32, reg);
            write_volatile((self.mmio_base + IOWIN) as *mut u32, value);
        }
    }

    /// Write one 64-bit redirection entry as two 32-bit stores, high half
    /// first so the entry is never live with a stale destination.
    fn write_redir(&mut self, index: u32, entry: u64) {
        let reg = REG_REDIR_BASE + index * 2;
        self.write(reg + 1, (entry >> 32) as u32);
        self.write(reg, entry as u32);
    }

    fn read_redir(&mut self, index: u32) -> u64 {
        let reg = REG_REDIR_BASE + index * 2;
        let lo = self.read(reg) as u64;
        let hi = self.read(reg + 1) as u64;
        (hi << 32) | lo
    }
}

/// Compose a redirection entry: fixed delivery, physical destination mode.
#[inline]
pub const fn redir_entry(
    vector: u8,
    dest_apic_id: u32,
    active_low: bool,
    level_triggered: bool,
    masked: bool,
) -> u64 {
    let mut entry = vector as u64;
    if active_low {
        entry |= REDIR_ACTIVE_LOW;
    }
    if level_triggered {
        entry |= REDIR_LEVEL;
    }
    if masked {
        entry |= REDIR_MASKED;
    }
    entry | ((dest_apic_id as u64) << 56)
}

static mut IOAPICS: [Option<IoApic>; MAX_IOAPICS] = [const { None }; MAX_IOAPICS];
static NUM_IOAPICS: AtomicUsize = AtomicUsize::new(0);

/// Map and mask every I/O APIC named by the topology. BSP boot only.
pub fn init() -> Result<(), SchedError> {
    let topo = topology::get();
    let mut count = 0usize;

    for desc in topo.ioapics[..topo.num_ioapics].iter() {
        let mmio = mm::map_io(desc.mmio_base, 4096)?;
        let mut io = IoApic {
            mmio_base: mmio,
            gsi_base: desc.gsi_base,
            redirections: desc.redirections,
            id: desc.id,
        };

        let version = io.read(REG_VERSION);
        let max_redir = ((version >> 16) & 0xFF) + 1;
        if max_redir < io.redirections {
            io.redirections = max_redir;
        }

        let hw_id = io.read(REG_ID) >> 24;
        if hw_id != io.id as u32 {
            crate::kwarn!("ioapic: firmware id {} but hardware reports {}", io.id, hw_id);
        }
        crate::kinfo!(
            "ioapic: id {} version {:#x}, GSI base {}, {} redirections",
            io.id,
            version & 0xFF,
            io.gsi_base,
            io.redirections
        );

        for index in 0..io.redirections {
            let vector = VECTOR_IRQ_BASE.wrapping_add((io.gsi_base + index) as u8);
            io.write_redir(index, redir_entry(vector, 0, false, false, true));
        }

        unsafe {
            IOAPICS[count] = Some(io);
        }
        count += 1;
    }

    NUM_IOAPICS.store(count, Ordering::Release);

    for ovr in topo.overrides[..topo.num_overrides].iter() {
        crate::kdebug!(
            "ioapic: override IRQ{} -> GSI{} (low={}, level={})",
            ovr.source_irq,
            ovr.gsi,
            ovr.active_low,
            ovr.level_triggered
        );
    }

    Ok(())
}

fn ioapic_for_gsi(gsi: u32) -> Option<&'static mut IoApic> {
    let count = NUM_IOAPICS.load(Ordering::Acquire);
    for slot in unsafe { &mut *core::ptr::addr_of_mut!(IOAPICS) }[..count].iter_mut() {
        if let Some(io) = slot {
            if gsi >= io.gsi_base && gsi < io.gsi_base + io.redirections {
                return Some(io);
            }
        }
    }
    None
}

/// Route a legacy IRQ to a CPU: translate through the override table, find
/// the owning I/O APIC, compose an unmasked entry.
pub fn route_irq(irq: u8, vector: u8, dest_cpu: u32) -> Result<(), SchedError> {
    let (gsi, active_low, level_triggered) = topology::irq_to_gsi(irq);
    let apic_id = percpu::cpu_by_id(dest_cpu as usize)
        .ok_or(SchedError::InvalidParameter)?
        .apic_id;

    let io = ioapic_for_gsi(gsi).ok_or(SchedError::InvalidParameter)?;
    let index = gsi - io.gsi_base;
    io.write_redir(
        index,
        redir_entry(vector, apic_id, active_low, level_triggered, false),
    );

    crate::kinfo!(
        "ioapic: IRQ{} -> GSI{} vector {:#x} on CPU {}",
        irq,
        gsi,
        vector,
        dest_cpu
    );
    Ok(())
}

pub fn mask_irq(irq: u8) -> Result<(), SchedError> {
    let (gsi, _, _) = topology::irq_to_gsi(irq);
    let io = ioapic_for_gsi(gsi).ok_or(SchedError::InvalidParameter)?;
    let index = gsi - io.gsi_base;
    let entry = io.read_redir(index);
    io.write_redir(index, entry | REDIR_MASKED);
    Ok(())
}

pub fn unmask_irq(irq: u8) -> Result<(), SchedError> {
    let (gsi, _, _) = topology::irq_to_gsi(irq);
    let io = ioapic_for_gsi(gsi).ok_or(SchedError::InvalidParameter)?;
    let index = gsi - io.gsi_base;
    let entry = io.read_redir(index);
    io.write_redir(index, entry & !REDIR_MASKED);
    Ok(())
}
