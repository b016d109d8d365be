//! Firmware topology import.
//!
//! The boot environment parses ACPI (MADT/SRAT/SLIT) and hands the core one
//! [`TopologySnapshot`]. This module validates it, derives the per-node NUMA
//! fallback order, and publishes the result as the immutable online
//! topology consumed by bring-up, the scheduler, and the load balancer.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::MAX_CPUS;
use crate::error::SchedError;

pub const MAX_IOAPICS: usize = 8;
pub const MAX_INT_OVERRIDES: usize = 24;
pub const MAX_NUMA_NODES: usize = 8;

/// One logical processor as reported by firmware.
#[derive(Clone, Copy, Debug)]
pub struct CpuEntry {
    pub logical_id: u32,
    pub apic_id: u32,
    /// ACPI processor UID.
    pub firmware_id: u32,
    pub enabled: bool,
    pub numa_node: u32,
}

impl CpuEntry {
    pub const fn empty() -> Self {
        Self {
            logical_id: 0,
            apic_id: 0,
            firmware_id: 0,
            enabled: false,
            numa_node: 0,
        }
    }
}

/// One I/O APIC and the global-interrupt range it decodes.
#[derive(Clone, Copy, Debug)]
pub struct IoApicEntry {
    pub id: u8,
    pub mmio_base: u64,
    pub gsi_base: u32,
    /// Number of redirection entries (max_redir + 1).
    pub redirections: u32,
}

impl IoApicEntry {
    pub const fn empty() -> Self {
        Self {
            id: 0,
            mmio_base: 0,
            gsi_base: 0,
            redirections: 0,
        }
    }
}

/// Legacy IRQ to global-interrupt override.
#[derive(Clone, Copy, Debug)]
pub struct InterruptOverride {
    pub source_irq: u8,
    pub gsi: u32,
    pub active_low: bool,
    pub level_triggered: bool,
}

impl InterruptOverride {
    pub const fn empty() -> Self {
        Self {
            source_irq: 0,
            gsi: 0,
            active_low: false,
            level_triggered: false,
        }
    }
}

/// Everything the core needs to know about the machine, built once at boot
/// by the firmware parser and immutable afterwards.
#[derive(Clone, Copy)]
pub struct TopologySnapshot {
    pub bsp_apic_id: u32,
    pub num_cpus: usize,
    pub cpus: [CpuEntry; MAX_CPUS],
    pub num_ioapics: usize,
    pub ioapics: [IoApicEntry; MAX_IOAPICS],
    pub num_overrides: usize,
    pub overrides: [InterruptOverride; MAX_INT_OVERRIDES],
    pub numa_nodes: u32,
    /// SLIT distances; `distance[i][i]` is conventionally 10.
    pub numa_distance: [[u8; MAX_NUMA_NODES]; MAX_NUMA_NODES],
}

impl TopologySnapshot {
    pub const fn empty() -> Self {
        Self {
            bsp_apic_id: 0,
            num_cpus: 0,
            cpus: [CpuEntry::empty(); MAX_CPUS],
            num_ioapics: 0,
            ioapics: [IoApicEntry::empty(); MAX_IOAPICS],
            num_overrides: 0,
            overrides: [InterruptOverride::empty(); MAX_INT_OVERRIDES],
            numa_nodes: 1,
            numa_distance: [[10; MAX_NUMA_NODES]; MAX_NUMA_NODES],
        }
    }

    pub fn enabled_cpus(&self) -> impl Iterator<Item = &CpuEntry> {
        self.cpus[..self.num_cpus].iter().filter(|c| c.enabled)
    }
}

/// Per-node migration fallback: other nodes sorted by distance ascending,
/// ties broken by node id ascending.
#[derive(Clone, Copy)]
pub struct NumaFallback {
    pub order: [[u8; MAX_NUMA_NODES]; MAX_NUMA_NODES],
    pub len: usize,
}

/// Validate a snapshot against the identity of the CPU we are running on.
pub fn validate(snapshot: &TopologySnapshot, current_apic_id: u32) -> Result<(), SchedError> {
    if snapshot.num_cpus == 0 || snapshot.num_cpus > MAX_CPUS {
        return Err(SchedError::TopologyInconsistent);
    }

    // At most one enabled entry per APIC id.
    let cpus = &snapshot.cpus[..snapshot.num_cpus];
    for (i, a) in cpus.iter().enumerate() {
        if !a.enabled {
            continue;
        }
        for b in cpus[i + 1..].iter().filter(|c| c.enabled) {
            if a.apic_id == b.apic_id {
                return Err(SchedError::TopologyInconsistent);
            }
        }
        if a.numa_node as usize >= MAX_NUMA_NODES {
            return Err(SchedError::TopologyInconsistent);
        }
    }

    // The advertised BSP must be the CPU executing this code, and enabled.
    if snapshot.bsp_apic_id != current_apic_id {
        return Err(SchedError::TopologyInconsistent);
    }
    if !cpus.iter().any(|c| c.enabled && c.apic_id == snapshot.bsp_apic_id) {
        return Err(SchedError::TopologyInconsistent);
    }

    // I/O APIC global-interrupt ranges must be disjoint.
    let ioapics = &snapshot.ioapics[..snapshot.num_ioapics];
    for (i, a) in ioapics.iter().enumerate() {
        if a.redirections == 0 {
            return Err(SchedError::TopologyInconsistent);
        }
        let a_end = a.gsi_base + a.redirections;
        for b in ioapics[i + 1..].iter() {
            let b_end = b.gsi_base + b.redirections;
            if a.gsi_base < b_end && b.gsi_base < a_end {
                return Err(SchedError::TopologyInconsistent);
            }
        }
    }

    Ok(())
}

/// Build the distance-sorted fallback order for every node.
pub fn build_fallback(snapshot: &TopologySnapshot) -> NumaFallback {
    let nodes = (snapshot.numa_nodes as usize).clamp(1, MAX_NUMA_NODES);
    let mut fallback = NumaFallback {
        order: [[0; MAX_NUMA_NODES]; MAX_NUMA_NODES],
        len: nodes,
    };

    for node in 0..nodes {
        let mut others = [0u8; MAX_NUMA_NODES];
        let mut count = 0;
        for other in 0..nodes {
            if other != node {
                others[count] = other as u8;
                count += 1;
            }
        }
        // Insertion sort by (distance, node id); the node count is tiny.
        for i in 1..count {
            let mut j = i;
            while j > 0 {
                let prev = others[j - 1] as usize;
                let curr = others[j] as usize;
                let d_prev = snapshot.numa_distance[node][prev];
                let d_curr = snapshot.numa_distance[node][curr];
                if (d_curr, curr) < (d_prev, prev) {
                    others.swap(j - 1, j);
                    j -= 1;
                } else {
                    break;
                }
            }
        }
        fallback.order[node][..count].copy_from_slice(&others[..count]);
    }

    fallback
}

static TOPOLOGY_READY: AtomicBool = AtomicBool::new(false);
static mut TOPOLOGY: TopologySnapshot = TopologySnapshot::empty();
static mut FALLBACK: NumaFallback = NumaFallback {
    order: [[0; MAX_NUMA_NODES]; MAX_NUMA_NODES],
    len: 1,
};

/// Validate and publish the online topology. Called once on the BSP before
/// any AP is released; a validation failure aborts boot.
pub fn import(snapshot: &TopologySnapshot, current_apic_id: u32) -> Result<(), SchedError> {
    validate(snapshot, current_apic_id)?;

    unsafe {
        TOPOLOGY = *snapshot;
        FALLBACK = build_fallback(snapshot);
    }
    TOPOLOGY_READY.store(true, Ordering::Release);

    crate::kinfo!(
        "topology: {} CPUs, {} I/O APIC(s), {} NUMA node(s), BSP APIC {:#x}",
        snapshot.enabled_cpus().count(),
        snapshot.num_ioapics,
        snapshot.numa_nodes,
        snapshot.bsp_apic_id
    );
    Ok(())
}

pub fn is_ready() -> bool {
    TOPOLOGY_READY.load(Ordering::Acquire)
}

/// The published topology. Immutable after `import`.
pub fn get() -> &'static TopologySnapshot {
    debug_assert!(is_ready());
    unsafe { &*core::ptr::addr_of!(TOPOLOGY) }
}

/// Fallback node order for `node`, nearest first.
pub fn fallback_nodes(node: u32) -> &'static [u8] {
    let fb = unsafe { &*core::ptr::addr_of!(FALLBACK) };
    let node = (node as usize).min(fb.len.saturating_sub(1));
    &fb.order[node][..fb.len.saturating_sub(1)]
}

/// Translate a legacy IRQ through the override table. Identity when no
/// override exists (ISA default: active high, edge triggered).
pub fn irq_to_gsi(irq: u8) -> (u32, bool, bool) {
    let topo = get();
    for ovr in topo.overrides[..topo.num_overrides].iter() {
        if ovr.source_irq == irq {
            return (ovr.gsi, ovr.active_low, ovr.level_triggered);
        }
    }
    (irq as u32, false, false)
}

/// NUMA node of a logical CPU, 0 when unknown.
pub fn cpu_to_node(logical_id: u32) -> u32 {
    if !is_ready() {
        return 0;
    }
    let topo = get();
    topo.cpus[..topo.num_cpus]
        .iter()
        .find(|c| c.enabled && c.logical_id == logical_id)
        .map(|c| c.numa_node)
        .unwrap_or(0)
}
