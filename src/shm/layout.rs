//! Byte layout of the shared region.
//!
//! All structs use fixed-size fields, explicit alignment, and compile-time
//! size asserts so the layout is identical across compilations and
//! processes. Intra-region references are raw addresses, which is why the
//! region must map at the same base address everywhere.

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize};

/// Cache line size assumed throughout; heap entries and control words are
/// padded to it.
pub const CACHE_LINE: usize = 64;

/// Page size assumed for the two bookkeeping pages at the front of the
/// region.
pub const PAGE_SIZE: usize = 4096;

/// Fixed base address of the mapping. Raw addresses stored inside the
/// region are only meaningful because every process maps here.
#[cfg(target_arch = "aarch64")]
pub const BASE_ADDR: usize = 0x10_0000_0000;
/// Kept below the wilderness of the 48-bit VA space so a multi-GiB region
/// does not collide with the heap or stacks.
#[cfg(not(target_arch = "aarch64"))]
pub const BASE_ADDR: usize = 0x5000_0000_0000;

/// Bytes per dependency-table slot (one packed 64-bit entry).
pub const DEP_SLOT_BYTES: usize = 8;

/// Bytes per value-hashtable slot (hash word + address word).
pub const HASH_SLOT_BYTES: usize = 16;

/// Round `n` up to a whole cache line.
pub const fn cache_align(n: usize) -> usize {
    (n + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

/// Puts `T` alone on its cache line. Every control word gets one so that
/// atomic traffic on one counter never invalidates another.
#[repr(C, align(64))]
pub struct Padded<T>(pub T);

const _: () = assert!(std::mem::size_of::<Padded<AtomicU64>>() == CACHE_LINE);
const _: () = assert!(std::mem::size_of::<Padded<AtomicUsize>>() == CACHE_LINE);

/// The control page at offset 0 of the region.
///
/// Shared counters and phase gates, one per cache line. Mutated with
/// atomics from every process; plain-looking fields like `master_pid` are
/// still atomics because they are written after workers may have mapped
/// the region.
#[repr(C)]
pub struct ControlPage {
    /// Address of the next free heap byte; bump-allocated via fetch-add.
    pub heap_top: Padded<AtomicUsize>,
    /// Nonzero-hash slots in the value hashtable.
    pub hashtbl_count: Padded<AtomicU64>,
    /// Occupied slots in the dependency adjacency table (= edge count).
    pub deptbl_count: Padded<AtomicU64>,
    /// Monotonically increasing tag source, shared by all forks. Wraps at
    /// the platform word modulus.
    pub counter: Padded<AtomicUsize>,
    /// Pid of the sole process allowed to run master-only operations.
    pub master_pid: Padded<AtomicI32>,
    /// Telemetry verbosity knob.
    pub log_level: Padded<AtomicUsize>,
    /// Telemetry sampling rate, stored as `f64` bits.
    pub sample_rate: Padded<AtomicU64>,
    /// Cooperative-cancellation gate, set by the master.
    pub workers_should_exit: Padded<AtomicUsize>,
    /// Bytes held by removed heap entries, reclaimable by collection.
    pub wasted_heap: Padded<AtomicUsize>,
    /// Phase gate: removals (and collection) are legal right now.
    pub allow_removes: Padded<AtomicUsize>,
    /// Phase gate: dependency-table reads are legal right now.
    pub allow_dep_reads: Padded<AtomicUsize>,
}

// The control page must fit in the first page of the region.
const _: () = assert!(std::mem::size_of::<ControlPage>() <= PAGE_SIZE);

/// Region offsets derived from the size parameters. Order, leaves first:
/// control page, filename page, global storage, dependency adjacency
/// table, bindings filter, value hashtable, heap.
#[derive(Clone, Copy, Debug)]
pub struct RegionLayout {
    pub global_bytes: usize,
    pub heap_bytes: usize,
    /// Slot count of the adjacency table and of the bindings filter.
    pub dep_slots: usize,
    /// Slot count of the value hashtable.
    pub hash_slots: usize,
}

impl RegionLayout {
    pub fn new(global_bytes: usize, heap_bytes: usize, dep_log2: u8, hash_log2: u8) -> Self {
        assert!(dep_log2 < 31, "dependency table wants at most 2^30 slots");
        assert!(hash_log2 < 40, "value hashtable size out of range");
        RegionLayout {
            global_bytes,
            heap_bytes,
            dep_slots: 1usize << dep_log2,
            hash_slots: 1usize << hash_log2,
        }
    }

    /// Page holding the path of the attached dependency database.
    pub fn filename_offset(&self) -> usize {
        PAGE_SIZE
    }

    pub fn global_offset(&self) -> usize {
        2 * PAGE_SIZE
    }

    pub fn deptbl_offset(&self) -> usize {
        self.global_offset() + self.global_bytes
    }

    pub fn bindings_offset(&self) -> usize {
        self.deptbl_offset() + self.dep_slots * DEP_SLOT_BYTES
    }

    pub fn hashtbl_offset(&self) -> usize {
        self.bindings_offset() + self.dep_slots * DEP_SLOT_BYTES
    }

    pub fn heap_offset(&self) -> usize {
        self.hashtbl_offset() + self.hash_slots * HASH_SLOT_BYTES
    }

    pub fn total_size(&self) -> usize {
        self.heap_offset() + self.heap_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_do_not_overlap() {
        let l = RegionLayout::new(1 << 20, 1 << 24, 10, 12);
        assert_eq!(l.dep_slots, 1024);
        assert_eq!(l.hash_slots, 4096);
        assert!(l.filename_offset() >= std::mem::size_of::<ControlPage>());
        assert_eq!(l.deptbl_offset(), 2 * PAGE_SIZE + (1 << 20));
        assert_eq!(l.bindings_offset() - l.deptbl_offset(), 1024 * 8);
        assert_eq!(l.hashtbl_offset() - l.bindings_offset(), 1024 * 8);
        assert_eq!(l.heap_offset() - l.hashtbl_offset(), 4096 * 16);
        assert_eq!(l.total_size(), l.heap_offset() + (1 << 24));
    }

    #[test]
    fn cache_align_rounds_up() {
        assert_eq!(cache_align(0), 0);
        assert_eq!(cache_align(1), 64);
        assert_eq!(cache_align(64), 64);
        assert_eq!(cache_align(65), 128);
    }
}
