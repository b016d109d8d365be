//! Firmware topology validation and the NUMA fallback order.

use crate::error::SchedError;
use crate::topology::{
    build_fallback, validate, CpuEntry, IoApicEntry, TopologySnapshot,
};

fn snapshot_with_cpus(apic_ids: &[u32]) -> TopologySnapshot {
    let mut snapshot = TopologySnapshot::empty();
    snapshot.bsp_apic_id = apic_ids[0];
    snapshot.num_cpus = apic_ids.len();
    for (i, &apic_id) in apic_ids.iter().enumerate() {
        snapshot.cpus[i] = CpuEntry {
            logical_id: i as u32,
            apic_id,
            firmware_id: i as u32,
            enabled: true,
            numa_node: 0,
        };
    }
    snapshot.num_ioapics = 1;
    snapshot.ioapics[0] = IoApicEntry {
        id: 0,
        mmio_base: 0xFEC0_0000,
        gsi_base: 0,
        redirections: 24,
    };
    snapshot
}

#[test]
fn valid_snapshot_passes() {
    let snapshot = snapshot_with_cpus(&[0, 2, 4, 6]);
    assert_eq!(validate(&snapshot, 0), Ok(()));
}

#[test]
fn duplicate_apic_ids_are_rejected() {
    let snapshot = snapshot_with_cpus(&[0, 2, 2, 6]);
    assert_eq!(validate(&snapshot, 0), Err(SchedError::TopologyInconsistent));
}

#[test]
fn duplicate_apic_id_on_disabled_entry_is_tolerated() {
    let mut snapshot = snapshot_with_cpus(&[0, 2, 4]);
    snapshot.num_cpus = 4;
    snapshot.cpus[3] = CpuEntry {
        logical_id: 3,
        apic_id: 2,
        firmware_id: 3,
        enabled: false,
        numa_node: 0,
    };
    assert_eq!(validate(&snapshot, 0), Ok(()));
}

#[test]
fn bsp_apic_id_must_match_executing_cpu() {
    let snapshot = snapshot_with_cpus(&[0, 2, 4]);
    assert_eq!(validate(&snapshot, 2), Err(SchedError::TopologyInconsistent));
}

#[test]
fn bsp_must_be_an_enabled_entry() {
    let mut snapshot = snapshot_with_cpus(&[0, 2]);
    snapshot.bsp_apic_id = 9;
    assert_eq!(validate(&snapshot, 9), Err(SchedError::TopologyInconsistent));
}

#[test]
fn overlapping_gsi_ranges_are_rejected() {
    let mut snapshot = snapshot_with_cpus(&[0, 2]);
    snapshot.num_ioapics = 2;
    snapshot.ioapics[1] = IoApicEntry {
        id: 1,
        mmio_base: 0xFEC1_0000,
        gsi_base: 20,
        redirections: 8,
    };
    assert_eq!(validate(&snapshot, 0), Err(SchedError::TopologyInconsistent));

    // Adjacent ranges are fine.
    snapshot.ioapics[1].gsi_base = 24;
    assert_eq!(validate(&snapshot, 0), Ok(()));
}

#[test]
fn empty_ioapic_range_is_rejected() {
    let mut snapshot = snapshot_with_cpus(&[0]);
    snapshot.ioapics[0].redirections = 0;
    assert_eq!(validate(&snapshot, 0), Err(SchedError::TopologyInconsistent));
}

#[test]
fn zero_cpus_is_rejected() {
    let snapshot = TopologySnapshot::empty();
    assert_eq!(validate(&snapshot, 0), Err(SchedError::TopologyInconsistent));
}

#[test]
fn fallback_order_sorts_by_distance() {
    let mut snapshot = snapshot_with_cpus(&[0, 2]);
    snapshot.numa_nodes = 4;
    // Node 0's neighbours: node 2 closest, then 3, then 1.
    snapshot.numa_distance[0] = [10, 40, 15, 20, 10, 10, 10, 10];

    let fallback = build_fallback(&snapshot);
    assert_eq!(fallback.len, 4);
    assert_eq!(&fallback.order[0][..3], &[2, 3, 1]);
}

#[test]
fn fallback_ties_break_by_node_id() {
    let mut snapshot = snapshot_with_cpus(&[0]);
    snapshot.numa_nodes = 4;
    // All remote distances equal: expect ascending node ids.
    snapshot.numa_distance[1] = [20, 10, 20, 20, 10, 10, 10, 10];

    let fallback = build_fallback(&snapshot);
    assert_eq!(&fallback.order[1][..3], &[0, 2, 3]);
}
