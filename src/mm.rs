//! Memory interface consumed by the SMP and scheduler core.
//!
//! The real kernel supplies a buddy allocator and page tables behind this
//! surface; here it is backed by a static, node-striped page arena so the
//! core stays self-contained. The kernel runs identity-mapped, so the
//! virtual/physical conversions are offset-free.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::SchedError;

pub const PAGE_SIZE: usize = 4096;

const ARENA_PAGES: usize = 512;
const MAX_ARENA_NODES: usize = 8;

#[repr(C, align(4096))]
struct Arena([u8; ARENA_PAGES * PAGE_SIZE]);

static mut ARENA: Arena = Arena([0; ARENA_PAGES * PAGE_SIZE]);

/// Next free page per node stripe. The arena is divided evenly between
/// nodes; exhausting a stripe falls back to a neighbouring one.
static NODE_CURSOR: [AtomicUsize; MAX_ARENA_NODES] = {
    const INIT: AtomicUsize = AtomicUsize::new(0);
    [INIT; MAX_ARENA_NODES]
};

const STRIPE_PAGES: usize = ARENA_PAGES / MAX_ARENA_NODES;

/// Allocate `1 << order` contiguous pages. Returns the virtual address of
/// the first page.
pub fn alloc_pages(order: u32) -> Result<u64, SchedError> {
    alloc_pages_node(order, 0)
}

/// Allocate `1 << order` pages, preferring memory local to `node`. When
/// the local stripe is full, other nodes are tried in the topology's
/// distance-sorted fallback order, nearest first.
pub fn alloc_pages_node(order: u32, node: u32) -> Result<u64, SchedError> {
    if let Some(va) = recycle(order) {
        return Ok(va);
    }

    let count = 1usize << order;
    let local = (node as usize) % MAX_ARENA_NODES;
    if let Some(va) = stripe_alloc(local, count) {
        return Ok(va);
    }

    if crate::topology::is_ready() {
        for &next in crate::topology::fallback_nodes(node) {
            if let Some(va) = stripe_alloc(next as usize % MAX_ARENA_NODES, count) {
                return Ok(va);
            }
        }
    }

    // Last resort: sweep every stripe.
    for stripe in 0..MAX_ARENA_NODES {
        if let Some(va) = stripe_alloc(stripe, count) {
            return Ok(va);
        }
    }

    Err(SchedError::OutOfMemory)
}

fn stripe_alloc(stripe: usize, count: usize) -> Option<u64> {
    let cursor = &NODE_CURSOR[stripe];
    loop {
        let used = cursor.load(Ordering::Relaxed);
        if used + count > STRIPE_PAGES {
            return None;
        }
        if cursor
            .compare_exchange(used, used + count, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        let page = stripe * STRIPE_PAGES + used;
        let base = unsafe { core::ptr::addr_of!(ARENA.0) as usize };
        return Some((base + page * PAGE_SIZE) as u64);
    }
}

const FREE_LIST_SLOTS: usize = 32;

/// Freed blocks, recycled before the stripes are consulted. `(va, order)`;
/// an empty slot holds va 0.
static FREE_LIST: spin::Mutex<[(u64, u32); FREE_LIST_SLOTS]> =
    spin::Mutex::new([(0, 0); FREE_LIST_SLOTS]);

/// Return a block obtained from `alloc_pages{,_node}`. Blocks that do not
/// fit the recycle list are abandoned to the arena.
pub fn free_pages(va: u64, order: u32) {
    if va == 0 {
        return;
    }
    let mut list = FREE_LIST.lock();
    for slot in list.iter_mut() {
        if slot.0 == 0 {
            *slot = (va, order);
            return;
        }
    }
}

fn recycle(order: u32) -> Option<u64> {
    let mut list = FREE_LIST.lock();
    for slot in list.iter_mut() {
        if slot.0 != 0 && slot.1 == order {
            let va = slot.0;
            *slot = (0, 0);
            return Some(va);
        }
    }
    None
}

/// Kernel runs identity-mapped; conversions are the identity.
#[inline]
pub fn virt_to_phys(va: u64) -> u64 {
    va
}

#[inline]
pub fn phys_to_virt(pa: u64) -> u64 {
    pa
}

/// Map device memory uncacheable and return its virtual address. With the
/// identity mapping and MMIO ranges marked UC by the boot environment this
/// is a pass-through; a real kernel remaps here.
pub fn map_io(phys: u64, _len: usize) -> Result<u64, SchedError> {
    if phys == 0 {
        return Err(SchedError::InvalidParameter);
    }
    Ok(phys_to_virt(phys))
}
