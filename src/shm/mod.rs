//! The shared-memory handle.
//!
//! One region, one `SharedMem` per process. The master creates the region
//! with [`SharedMem::init`] before forking; every descendant maps the same
//! object at the same address with [`SharedMem::attach`]. The handle hands
//! out typed views over the three data structures living in the region and
//! owns the per-process state (pid, cancellability, lazy DB connection).
//!
//! None of the structures take locks. Their correctness depends on the
//! phase discipline run by the orchestrator: writers never overlap the
//! collector, removers never overlap writers, and readers tolerate seeing
//! "absent" for an entry whose write is still in flight.

pub mod layout;
pub mod region;

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{Config, Connector};
use crate::deptbl::DepTable;
use crate::error::{Error, Result};
use crate::global::GlobalSlot;
use crate::hashtbl::ValueStore;

use layout::{ControlPage, RegionLayout};
use region::ShmRegion;

/// Handle to the shared region, from the viewpoint of one process.
pub struct SharedMem {
    region: ShmRegion,
    my_pid: libc::pid_t,
    /// Whether this process honors `workers_should_exit`. Workers flip it
    /// off around critical sections they must finish.
    cancellable: Cell<bool>,
    /// Entries removed by this process since attach (diagnostics).
    removed: Cell<u64>,
    /// Lazily opened read connection to the attached dependency database.
    #[cfg(feature = "sqlite")]
    pub(crate) dep_db: parking_lot::Mutex<Option<rusqlite::Connection>>,
}

impl SharedMem {
    /// Create and map a fresh region. Master-only; must run before the
    /// workers fork.
    ///
    /// With `shm_dir = None` the region is backed by an anonymous memory
    /// object ([`Error::FailedAnonymousInit`] when none can be made).
    /// Otherwise it is backed by an unlinked temp file under `shm_dir`,
    /// after checking the directory holds at least
    /// `config.minimum_avail_bytes` of free space.
    pub fn init(config: &Config, shm_dir: Option<&Path>) -> Result<SharedMem> {
        let layout = RegionLayout::new(
            config.global_bytes,
            config.heap_bytes,
            config.dep_log2,
            config.hash_log2,
        );
        let region = ShmRegion::create(layout, shm_dir, config.minimum_avail_bytes)?;
        let mem = SharedMem::from_region(region);
        mem.init_control(config);
        Ok(mem)
    }

    /// Map the region the master created. Must run in every worker before
    /// any other operation. `is_master` re-claims masterhood after an exec
    /// that lost the original handle.
    pub fn attach(connector: Connector, is_master: bool) -> Result<SharedMem> {
        let layout = RegionLayout::new(
            connector.global_bytes,
            connector.heap_bytes,
            connector.dep_log2,
            connector.hash_log2,
        );
        let region = ShmRegion::attach(connector.fd, layout)?;
        let mem = SharedMem::from_region(region);
        if is_master {
            mem.ctl().master_pid.0.store(mem.my_pid, Ordering::SeqCst);
        }
        Ok(mem)
    }

    fn from_region(region: ShmRegion) -> SharedMem {
        SharedMem {
            region,
            my_pid: unsafe { libc::getpid() },
            cancellable: Cell::new(true),
            removed: Cell::new(0),
            #[cfg(feature = "sqlite")]
            dep_db: parking_lot::Mutex::new(None),
        }
    }

    /// The handle a forked worker needs to [`attach`](SharedMem::attach).
    pub fn connector(&self) -> Connector {
        let layout = self.region.layout();
        Connector {
            fd: self.region.backing_fd(),
            global_bytes: layout.global_bytes,
            heap_bytes: layout.heap_bytes,
            dep_log2: layout.dep_slots.trailing_zeros() as u8,
            hash_log2: layout.hash_slots.trailing_zeros() as u8,
        }
    }

    /// Zero the control words and record ourselves as master. A fresh
    /// mapping reads as zeros already; the stores make the initial state
    /// explicit rather than implied.
    fn init_control(&self, config: &Config) {
        let ctl = self.ctl();
        ctl.heap_top.0.store(self.heap_base() as usize, Ordering::SeqCst);
        ctl.hashtbl_count.0.store(0, Ordering::SeqCst);
        ctl.deptbl_count.0.store(0, Ordering::SeqCst);
        ctl.counter.0.store(1, Ordering::SeqCst);
        ctl.master_pid.0.store(self.my_pid, Ordering::SeqCst);
        ctl.log_level.0.store(config.log_level, Ordering::SeqCst);
        ctl.sample_rate
            .0
            .store(config.sample_rate.to_bits(), Ordering::SeqCst);
        ctl.workers_should_exit.0.store(0, Ordering::SeqCst);
        ctl.wasted_heap.0.store(0, Ordering::SeqCst);
        ctl.allow_removes.0.store(1, Ordering::SeqCst);
        ctl.allow_dep_reads.0.store(1, Ordering::SeqCst);

        unsafe {
            // Empty broadcast slot and no attached database path.
            *(self.global_base() as *mut usize) = 0;
            *self.filename_page() = 0;
        }
    }

    pub(crate) fn ctl(&self) -> &ControlPage {
        unsafe { &*(self.region.base() as *const ControlPage) }
    }

    pub(crate) fn region(&self) -> &ShmRegion {
        &self.region
    }

    // Derived pointers. All offsets are within the mapping by construction.

    pub(crate) fn filename_page(&self) -> *mut u8 {
        unsafe { self.region.ptr_at(self.region.layout().filename_offset()) }
    }

    pub(crate) fn global_base(&self) -> *mut u8 {
        unsafe { self.region.ptr_at(self.region.layout().global_offset()) }
    }

    pub(crate) fn global_bytes(&self) -> usize {
        self.region.layout().global_bytes
    }

    pub(crate) fn deptbl_base(&self) -> *const AtomicU64 {
        unsafe { self.region.ptr_at(self.region.layout().deptbl_offset()) as *const AtomicU64 }
    }

    pub(crate) fn bindings_base(&self) -> *const AtomicU64 {
        unsafe { self.region.ptr_at(self.region.layout().bindings_offset()) as *const AtomicU64 }
    }

    pub(crate) fn dep_slots(&self) -> usize {
        self.region.layout().dep_slots
    }

    pub(crate) fn hashtbl_base(&self) -> *const u8 {
        unsafe { self.region.ptr_at(self.region.layout().hashtbl_offset()) }
    }

    pub(crate) fn hash_slots(&self) -> usize {
        self.region.layout().hash_slots
    }

    pub(crate) fn heap_base(&self) -> *mut u8 {
        unsafe { self.region.ptr_at(self.region.layout().heap_offset()) }
    }

    pub(crate) fn heap_end(&self) -> usize {
        self.heap_base() as usize + self.region.layout().heap_bytes
    }

    // Components.

    /// The master→workers broadcast slot.
    pub fn global(&self) -> GlobalSlot<'_> {
        GlobalSlot::new(self)
    }

    /// The lock-free dependency table.
    pub fn deps(&self) -> DepTable<'_> {
        DepTable::new(self)
    }

    /// The lock-free value store.
    pub fn store(&self) -> ValueStore<'_> {
        ValueStore::new(self)
    }

    // Counter and telemetry knobs.

    /// Next value of the shared counter. Increases across every process of
    /// the fork tree and wraps at the platform word modulus; callers must
    /// tolerate wraparound.
    pub fn counter_next(&self) -> usize {
        self.ctl().counter.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn log_level(&self) -> usize {
        self.ctl().log_level.0.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.ctl().sample_rate.0.load(Ordering::SeqCst))
    }

    // Master identity and phase gates.

    pub fn is_master(&self) -> bool {
        self.my_pid == self.ctl().master_pid.0.load(Ordering::SeqCst)
    }

    pub(crate) fn assert_master(&self) {
        assert!(self.is_master(), "master-only operation called by a worker");
    }

    #[cfg(feature = "sqlite")]
    pub(crate) fn assert_not_master(&self) {
        assert!(!self.is_master(), "worker-only operation called by the master");
    }

    /// Ask workers to abandon long-running operations. Master-only.
    pub fn stop_workers(&self) {
        self.assert_master();
        self.ctl().workers_should_exit.0.store(1, Ordering::SeqCst);
    }

    /// Let workers run again. Master-only.
    pub fn resume_workers(&self) {
        self.assert_master();
        self.ctl().workers_should_exit.0.store(0, Ordering::SeqCst);
    }

    /// Whether this process honors a pending stop request. Defaults to
    /// true; a worker flips it off around work it must finish.
    pub fn set_cancellable(&self, cancellable: bool) {
        self.cancellable.set(cancellable);
    }

    /// Polled at the entry of every long-running operation.
    pub(crate) fn check_should_exit(&self) -> Result<()> {
        if self.cancellable.get() && self.ctl().workers_should_exit.0.load(Ordering::SeqCst) != 0 {
            return Err(Error::WorkerShouldExit);
        }
        Ok(())
    }

    /// Open or close the removal phase. Advisory: violations are caught by
    /// asserts in `remove`/`move`/`collect`, not by this flag alone.
    pub fn set_allow_removes(&self, allow: bool) {
        self.ctl()
            .allow_removes
            .0
            .store(allow as usize, Ordering::SeqCst);
    }

    /// Open or close dependency-table reads. Returns the previous setting.
    pub fn set_allow_dep_reads(&self, allow: bool) -> bool {
        self.ctl()
            .allow_dep_reads
            .0
            .swap(allow as usize, Ordering::SeqCst)
            != 0
    }

    pub(crate) fn assert_allow_removes(&self) {
        assert!(
            self.ctl().allow_removes.0.load(Ordering::SeqCst) != 0,
            "removal outside the remove phase"
        );
    }

    pub(crate) fn assert_allow_dep_reads(&self) {
        assert!(
            self.ctl().allow_dep_reads.0.load(Ordering::SeqCst) != 0,
            "dependency read outside the read phase"
        );
    }

    // Diagnostics.

    /// Bytes allocated on the heap, live or wasted.
    pub fn used_heap_bytes(&self) -> usize {
        self.ctl().heap_top.0.load(Ordering::SeqCst) - self.heap_base() as usize
    }

    /// Bytes held by removed entries, reclaimable by collection.
    pub fn wasted_heap_bytes(&self) -> usize {
        self.ctl().wasted_heap.0.load(Ordering::SeqCst)
    }

    pub fn heap_capacity(&self) -> usize {
        self.region.layout().heap_bytes
    }

    /// True once an allocation has run past the end of the heap (the
    /// allocation itself failed with [`Error::HeapFull`]).
    pub fn heap_overflowed(&self) -> bool {
        self.ctl().heap_top.0.load(Ordering::SeqCst) >= self.heap_end()
    }

    /// Call once after seeding the store: a heap already past half of
    /// capacity can never satisfy the collection predicate again.
    pub fn check_init_size(&self) {
        assert!(
            2 * self.used_heap_bytes() < self.heap_capacity(),
            "initial heap size is too close to the maximum; collection would never trigger"
        );
    }

    pub fn hash_capacity(&self) -> usize {
        self.hash_slots()
    }

    pub fn dep_capacity(&self) -> usize {
        self.dep_slots()
    }

    /// Entries removed by this process since attach.
    pub fn removed_count(&self) -> u64 {
        self.removed.get()
    }

    pub(crate) fn note_removed(&self) {
        self.removed.set(self.removed.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::test_util;

    #[test]
    fn counter_increases_and_starts_past_zero() {
        let r = test_util::small_region();
        let a = r.mem.counter_next();
        let b = r.mem.counter_next();
        assert!(a >= 1);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn connector_round_trips_the_layout() {
        let r = test_util::small_region();
        let c = r.mem.connector();
        assert_eq!(c.global_bytes, r.mem.global_bytes());
        assert_eq!(1usize << c.dep_log2, r.mem.dep_capacity());
        assert_eq!(1usize << c.hash_log2, r.mem.hash_capacity());
        assert!(c.fd >= 0);
    }

    #[test]
    fn stop_request_is_cooperative() {
        let r = test_util::small_region();
        assert!(r.mem.check_should_exit().is_ok());

        r.mem.stop_workers();
        assert!(matches!(
            r.mem.check_should_exit(),
            Err(Error::WorkerShouldExit)
        ));

        // A worker that declared itself uncancellable keeps running.
        r.mem.set_cancellable(false);
        assert!(r.mem.check_should_exit().is_ok());
        r.mem.set_cancellable(true);

        r.mem.resume_workers();
        assert!(r.mem.check_should_exit().is_ok());
    }

    #[test]
    fn dep_read_gate_reports_previous_state() {
        let r = test_util::small_region();
        assert!(r.mem.set_allow_dep_reads(false));
        assert!(!r.mem.set_allow_dep_reads(true));
    }

    #[test]
    fn fresh_region_is_idle() {
        let r = test_util::small_region();
        assert!(r.mem.is_master());
        assert_eq!(r.mem.used_heap_bytes(), 0);
        assert_eq!(r.mem.wasted_heap_bytes(), 0);
        assert!(!r.mem.heap_overflowed());
        r.mem.check_init_size();
        assert_eq!(r.mem.removed_count(), 0);
    }

    #[test]
    fn telemetry_knobs_survive_init() {
        let mut config = test_util::small_config();
        config.log_level = 1;
        config.sample_rate = 0.25;
        let r = test_util::region_with(&config);
        assert_eq!(r.mem.log_level(), 1);
        assert_eq!(r.mem.sample_rate(), 0.25);
    }
}
