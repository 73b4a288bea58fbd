//! The lock-free dependency table: a multigraph on 31-bit integer nodes,
//! edges only ever added, filled concurrently by every worker.
//!
//! Stored twice. A *bindings filter* — an open-addressed set of combined
//! `(u << 31) | v` words — answers "was this edge inserted already?". The
//! *adjacency store* holds the edges themselves in a single open-addressed
//! array whose slots double as hash entries and linked-list cells,
//! discriminated by a tag bit:
//!
//! * empty slot: all zero.
//! * head: `key = (u, KEY)`, `next` either points at the next cell
//!   (`NEXT` + slot index) or holds the final value (`VAL` + v).
//! * cell: `key = (v, VAL)`, `next` as above.
//!
//! Packing the last value into the tail's `next` field means every edge
//! costs exactly one slot. `VAL` is the zero tag, so an all-zero slot
//! could masquerade as an empty one — except that would encode the same
//! value twice in one list, which the filter rules out. Any legal
//! occupied slot therefore has a nonzero bit somewhere.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::shm::SharedMem;

const TAG_VAL: u32 = 0;
/// Only legal in the `key` half.
const TAG_KEY: u32 = 1;
/// Only legal in the `next` half.
const TAG_NEXT: u32 = 1;

/// A 31-bit number and a tag bit: one half of an adjacency slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Tagged(u32);

impl Tagged {
    fn new(num: u32, tag: u32) -> Tagged {
        debug_assert!(num < 1 << 31);
        debug_assert!(tag <= 1);
        Tagged(num | tag << 31)
    }

    fn num(self) -> u32 {
        self.0 & 0x7FFF_FFFF
    }

    fn tag(self) -> u32 {
        self.0 >> 31
    }
}

/// One adjacency slot, packed into the 64-bit word used for CAS.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct DepEntry {
    key: Tagged,
    next: Tagged,
}

impl DepEntry {
    fn from_raw(raw: u64) -> DepEntry {
        DepEntry {
            key: Tagged(raw as u32),
            next: Tagged((raw >> 32) as u32),
        }
    }

    fn raw(self) -> u64 {
        self.key.0 as u64 | (self.next.0 as u64) << 32
    }

    /// Head whose single edge is `u -> v`.
    fn head_terminal(u: u32, v: u32) -> DepEntry {
        DepEntry {
            key: Tagged::new(u, TAG_KEY),
            next: Tagged::new(v, TAG_VAL),
        }
    }

    /// Head whose list continues at `slot`.
    fn head_chained(u: u32, slot: u32) -> DepEntry {
        DepEntry {
            key: Tagged::new(u, TAG_KEY),
            next: Tagged::new(slot, TAG_NEXT),
        }
    }

    /// A fresh list cell holding `v`. Its `next` half starts out invalid;
    /// the prepender rewrites it before the cell becomes reachable.
    fn cell(v: u32) -> DepEntry {
        DepEntry {
            key: Tagged::new(v, TAG_VAL),
            next: Tagged::new(!0 >> 1, TAG_NEXT),
        }
    }

    fn is_head_for(self, u: u32) -> bool {
        self.key.num() == u && self.key.tag() == TAG_KEY
    }
}

/// Multiplying spreads the entropy into the high bits; the byte swap then
/// moves those well-mixed bits down to where the slot mask looks.
fn hash64(n: u64) -> u64 {
    n.wrapping_mul(0x9e37_79b9_7f4a_7c15).swap_bytes()
}

/// View over the dependency table.
pub struct DepTable<'a> {
    mem: &'a SharedMem,
}

impl<'a> DepTable<'a> {
    pub(crate) fn new(mem: &'a SharedMem) -> Self {
        DepTable { mem }
    }

    fn slots(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.mem.deptbl_base(), self.mem.dep_slots()) }
    }

    fn bindings(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.mem.bindings_base(), self.mem.dep_slots()) }
    }

    fn mask(&self) -> u64 {
        (self.mem.dep_slots() - 1) as u64
    }

    /// Record the edge `u -> v`. Does nothing if it exists already.
    pub fn add_edge(&self, u: u32, v: u32) -> Result<()> {
        self.mem.check_should_exit()?;
        assert!(
            u < 1 << 31 && v < 1 << 31,
            "dependency nodes must be 31-bit integers"
        );

        if self.add_binding((u as u64) << 31 | v as u64)? {
            self.prepend(u, v);
        }
        Ok(())
    }

    /// Insert the combined edge word into the bindings filter. True when
    /// the edge is new. This is the only place edge uniqueness is decided,
    /// which is what lets the adjacency store skip duplicate checks.
    fn add_binding(&self, value: u64) -> Result<bool> {
        let bindings = self.bindings();
        let mask = self.mask();
        let mut slot = (hash64(value) & mask) as usize;

        loop {
            // A plain load first: the common hit path needs no atomic RMW.
            let slot_val = bindings[slot].load(Ordering::Acquire);

            if slot_val == value {
                return Ok(false);
            }

            if self.mem.ctl().deptbl_count.0.load(Ordering::SeqCst)
                >= self.mem.dep_slots() as u64
            {
                return Err(Error::DepTableFull);
            }

            if slot_val == 0 {
                if bindings[slot]
                    .compare_exchange(0, value, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let size = self.mem.ctl().deptbl_count.0.fetch_add(1, Ordering::SeqCst);
                    debug_assert!(size <= self.mem.dep_slots() as u64);
                    return Ok(true);
                }

                if bindings[slot].load(Ordering::Acquire) == value {
                    return Ok(false);
                }
            }

            slot = (slot + 1) & mask as usize;
        }
    }

    /// Claim a free adjacency slot for a list cell holding `v`, returning
    /// its index. Any free slot would do, since cells are only reachable
    /// through an explicit `next` index, but hashing the unique pair
    /// gives a well-spread starting point.
    fn alloc_cell(&self, u: u32, v: u32) -> u32 {
        let slots = self.slots();
        let mask = self.mask();
        let cell = DepEntry::cell(v).raw();

        let mut slot = (hash64((u as u64) << 31 | v as u64) & mask) as usize;
        loop {
            if slots[slot].load(Ordering::Acquire) == 0
                && slots[slot]
                    .compare_exchange(0, cell, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return slot as u32;
            }
            slot = (slot + 1) & mask as usize;
        }
    }

    /// Prepend `v` to the list of values for `u`. The filter has already
    /// proven `v` is not in that list.
    fn prepend(&self, u: u32, v: u32) {
        let slots = self.slots();
        let mask = self.mask();

        let mut slot = (hash64(u as u64) & mask) as usize;
        loop {
            let mut slot_val = DepEntry::from_raw(slots[slot].load(Ordering::Acquire));

            if slot_val.raw() == 0 {
                // Free slot: try to seed the list with a head holding the
                // one edge.
                match slots[slot].compare_exchange(
                    0,
                    DepEntry::head_terminal(u, v).raw(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return,
                    // Some racing writer took the slot; re-examine it.
                    Err(raw) => slot_val = DepEntry::from_raw(raw),
                }
            }

            if slot_val.is_head_for(u) {
                // A list for `u` exists. Chain a fresh cell to whatever
                // the head points at, then swing the head to the cell:
                // the usual atomic stack push, retried when another
                // prepender wins the head.
                let cell_slot = self.alloc_cell(u, v);
                let new_head = DepEntry::head_chained(u, cell_slot).raw();

                loop {
                    // The cell is still invisible; point it at the current
                    // rest of the list.
                    let cell = DepEntry {
                        key: Tagged::new(v, TAG_VAL),
                        next: slot_val.next,
                    };
                    slots[cell_slot as usize].store(cell.raw(), Ordering::Relaxed);

                    match slots[slot].compare_exchange(
                        slot_val.raw(),
                        new_head,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return,
                        Err(raw) => slot_val = DepEntry::from_raw(raw),
                    }
                }
            }

            // A head for some other key, or a list cell: keep probing.
            slot = (slot + 1) & mask as usize;
        }
    }

    /// All successors of `u`, in reverse insertion order of the writes
    /// that happened before this read. Requires the dep-read phase.
    pub fn get_edges(&self, u: u32) -> Result<Vec<u32>> {
        self.mem.check_should_exit()?;
        self.mem.assert_allow_dep_reads();
        assert!(u < 1 << 31, "dependency nodes must be 31-bit integers");

        let slots = self.slots();
        let mask = self.mask();
        let mut result = Vec::new();

        let mut slot = (hash64(u as u64) & mask) as usize;
        loop {
            let slot_val = DepEntry::from_raw(slots[slot].load(Ordering::Acquire));

            if slot_val.raw() == 0 {
                // No list for this key.
                return Ok(result);
            }

            if slot_val.is_head_for(u) {
                let mut entry = slot_val;
                while entry.next.tag() == TAG_NEXT {
                    debug_assert!((entry.next.num() as usize) < self.mem.dep_slots());
                    entry =
                        DepEntry::from_raw(slots[entry.next.num() as usize].load(Ordering::Acquire));
                    result.push(entry.key.num());
                }
                // The tail's next half is the final value.
                result.push(entry.next.num());
                return Ok(result);
            }

            slot = (slot + 1) & mask as usize;
        }
    }

    /// Number of edges recorded so far.
    pub fn edge_count(&self) -> u64 {
        self.mem.ctl().deptbl_count.0.load(Ordering::SeqCst)
    }

    /// Occupied adjacency slots; equals [`edge_count`](DepTable::edge_count)
    /// because every edge costs exactly one slot.
    pub fn used_slots(&self) -> u64 {
        self.slots()
            .iter()
            .filter(|s| s.load(Ordering::Acquire) != 0)
            .count() as u64
    }

    pub fn capacity(&self) -> usize {
        self.mem.dep_slots()
    }

    /// Zero both tables. Master-only; meant for when the in-memory edges
    /// have been handed off to a persistent store.
    pub fn clear(&self) {
        self.mem.assert_master();
        for slot in self.slots() {
            slot.store(0, Ordering::Relaxed);
        }
        for slot in self.bindings() {
            slot.store(0, Ordering::Relaxed);
        }
        self.mem.ctl().deptbl_count.0.store(0, Ordering::SeqCst);
    }

    /// Walk every head and hand its adjacency list to `f`.
    #[cfg(feature = "sqlite")]
    pub(crate) fn for_each_head(&self, mut f: impl FnMut(u32, &[u32]) -> Result<()>) -> Result<()> {
        let slots = self.slots();
        let mut values = Vec::new();

        for slot in slots {
            let entry = DepEntry::from_raw(slot.load(Ordering::Acquire));
            if entry.raw() == 0 || entry.key.tag() != TAG_KEY {
                continue;
            }

            values.clear();
            let mut cursor = entry;
            while cursor.next.tag() == TAG_NEXT {
                cursor = DepEntry::from_raw(
                    slots[cursor.next.num() as usize].load(Ordering::Acquire),
                );
                values.push(cursor.key.num());
            }
            values.push(cursor.next.num());

            f(entry.key.num(), &values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn tagged_halves_pack_and_unpack() {
        let e = DepEntry::head_chained(0x7FFF_FFFF, 12);
        let back = DepEntry::from_raw(e.raw());
        assert_eq!(back.key.num(), 0x7FFF_FFFF);
        assert_eq!(back.key.tag(), TAG_KEY);
        assert_eq!(back.next.num(), 12);
        assert_eq!(back.next.tag(), TAG_NEXT);

        let cell = DepEntry::cell(9);
        assert_eq!(cell.key.tag(), TAG_VAL);
        assert_ne!(cell.raw(), 0);
    }

    #[test]
    fn single_edge() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(7, 42).unwrap();
        assert_eq!(deps.get_edges(7).unwrap(), vec![42]);
        assert_eq!(deps.get_edges(42).unwrap(), Vec::<u32>::new());
        assert_eq!(deps.edge_count(), 1);
    }

    #[test]
    fn chain_of_three() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(1, 2).unwrap();
        deps.add_edge(1, 3).unwrap();
        deps.add_edge(1, 4).unwrap();

        let mut edges = deps.get_edges(1).unwrap();
        edges.sort_unstable();
        assert_eq!(edges, vec![2, 3, 4]);
        assert_eq!(deps.edge_count(), 3);
        assert_eq!(deps.used_slots(), 3);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(9, 9).unwrap();
        deps.add_edge(9, 9).unwrap();
        assert_eq!(deps.get_edges(9).unwrap(), vec![9]);
        assert_eq!(deps.edge_count(), 1);
        assert_eq!(deps.used_slots(), 1);
    }

    #[test]
    fn reads_come_back_newest_first() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(5, 10).unwrap();
        deps.add_edge(5, 11).unwrap();
        deps.add_edge(5, 12).unwrap();
        assert_eq!(deps.get_edges(5).unwrap(), vec![12, 11, 10]);
    }

    #[test]
    fn many_keys_share_the_table() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        for u in 0..64u32 {
            for v in 0..8u32 {
                deps.add_edge(u, v * 101).unwrap();
            }
        }
        assert_eq!(deps.edge_count(), 64 * 8);
        for u in 0..64u32 {
            let mut edges = deps.get_edges(u).unwrap();
            edges.sort_unstable();
            assert_eq!(edges, (0..8u32).map(|v| v * 101).collect::<Vec<_>>());
        }
    }

    #[test]
    fn every_occupied_slot_has_a_coherent_tag() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        for i in 0..100u32 {
            deps.add_edge(i % 10, i).unwrap();
        }
        for slot in deps.slots() {
            let raw = slot.load(Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            let entry = DepEntry::from_raw(raw);
            // Tag space is one bit; what matters is that occupied slots
            // are never all-zero and their halves decode consistently.
            assert!(entry.key.tag() == TAG_KEY || entry.key.tag() == TAG_VAL);
            if entry.next.tag() == TAG_NEXT {
                assert!((entry.next.num() as usize) < deps.capacity());
            }
        }
    }

    #[test]
    fn overflow_reports_dep_table_full() {
        let mut config = test_util::small_config();
        config.dep_log2 = 4; // 16 slots
        let r = test_util::region_with(&config);
        let deps = r.mem.deps();

        let mut result = Ok(());
        for v in 0..32u32 {
            result = deps.add_edge(1, v);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(crate::Error::DepTableFull)));
    }

    #[test]
    #[should_panic(expected = "31-bit")]
    fn wide_nodes_are_rejected() {
        let r = test_util::small_region();
        let _ = r.mem.deps().add_edge(1 << 31, 0);
    }

    #[test]
    #[should_panic(expected = "dependency read outside the read phase")]
    fn reads_respect_the_phase_gate() {
        let r = test_util::small_region();
        r.mem.deps().add_edge(1, 2).unwrap();
        r.mem.set_allow_dep_reads(false);
        let _ = r.mem.deps().get_edges(1);
    }
}
