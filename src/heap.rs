//! Heap entry encoding, the bump allocator, and the compacting collector.
//!
//! Every entry starts with a 64-bit header:
//!
//! ```text
//!  63                33 32 31                 1  0
//! +--------------------+--+--------------------+--+
//! | stored size        |k | uncompressed size  |1 |
//! +--------------------+--+--------------------+--+
//! ```
//!
//! `k` distinguishes raw byte strings from serialized values, and the
//! uncompressed size is zero when the payload is stored as-is. The low bit
//! is always 1, which is what lets the collector tell a header apart from
//! a (word-aligned) pointer when it walks the heap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use log::debug;

use crate::error::{Error, Result};
use crate::hashtbl::{Slot, SENTINEL};
use crate::shm::layout::cache_align;
use crate::shm::SharedMem;

/// Bytes of the header word preceding every payload.
pub(crate) const HEADER_BYTES: usize = 8;

/// What the payload bytes are.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Kind {
    /// Host-serialized value; reads go through the codec.
    Serialized = 0,
    /// Raw byte string, returned verbatim.
    String = 1,
}

/// The packed header word of a heap entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct EntryHeader(u64);

impl EntryHeader {
    pub fn new(stored: usize, kind: Kind, uncompressed: usize) -> EntryHeader {
        debug_assert!(stored < 1 << 31);
        debug_assert!(uncompressed < 1 << 31);
        EntryHeader(
            (stored as u64) << 33 | (kind as u64) << 32 | (uncompressed as u64) << 1 | 1,
        )
    }

    pub fn from_raw(raw: u64) -> EntryHeader {
        debug_assert!(raw & 1 == 1, "heap word is not a header");
        EntryHeader(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Size of the payload as stored, possibly compressed.
    pub fn stored_size(self) -> usize {
        (self.0 >> 33) as usize
    }

    pub fn kind(self) -> Kind {
        if self.0 >> 32 & 1 == 1 {
            Kind::String
        } else {
            Kind::Serialized
        }
    }

    /// Original payload size, or zero when stored uncompressed.
    pub fn uncompressed_size(self) -> usize {
        (self.0 >> 1 & 0x7FFF_FFFF) as usize
    }

    pub fn total_size(self) -> usize {
        HEADER_BYTES + self.stored_size()
    }

    pub fn aligned_size(self) -> usize {
        cache_align(self.total_size())
    }
}

impl SharedMem {
    /// Claim a cache-line-aligned chunk for `header` and write the header
    /// word. The payload bytes are the caller's to fill before the entry
    /// is published into a hashtable slot.
    pub(crate) fn alloc(&self, header: EntryHeader) -> Result<*mut u8> {
        let size = header.aligned_size();
        let chunk = self.ctl().heap_top.0.fetch_add(size, Ordering::SeqCst);
        if chunk + size > self.heap_end() {
            return Err(Error::HeapFull);
        }
        let chunk = chunk as *mut u8;
        self.region().reserve(chunk, size)?;
        unsafe {
            (chunk as *mut u64).write(header.raw());
        }
        Ok(chunk)
    }

    /// Whether enough of the heap is wasted to make compaction worth its
    /// pause. The orchestrator decides when to ask.
    pub fn should_collect(&self, aggressive: bool) -> bool {
        let space_overhead = if aggressive { 1.2 } else { 2.0 };
        let used = self.used_heap_bytes();
        let reachable = used - self.wasted_heap_bytes();
        used as f64 >= space_overhead * reachable as f64
    }

    /// Compact the heap, dropping entries no hashtable slot points at.
    ///
    /// Master-only, and only while removes are allowed: no worker may be
    /// reading or writing any shared structure while this runs. A no-op
    /// unless [`should_collect`](SharedMem::should_collect) holds.
    pub fn collect(&self, aggressive: bool) {
        self.assert_master();
        self.assert_allow_removes();
        if !self.should_collect(aggressive) {
            return;
        }
        let start = Instant::now();

        let slots = unsafe {
            std::slice::from_raw_parts(self.hashtbl_base() as *const Slot, self.hash_slots())
        };

        // Pass 1: for every live slot, park the entry's header in the
        // slot's addr field and leave the address of that field where the
        // header was. Heap words become self-describing: low bit set is
        // the header of a dead entry, low bit clear is the back-pointer
        // of a live one.
        for slot in slots {
            let addr = slot.addr.load(Ordering::Relaxed);
            if addr == 0 {
                continue;
            }
            assert!(
                addr != SENTINEL,
                "collection started while a write was in flight"
            );
            let heap_word = addr as *mut u64;
            let header = unsafe { *heap_word };
            slot.addr.store(header as usize, Ordering::Relaxed);
            unsafe {
                *heap_word = &slot.addr as *const AtomicUsize as u64;
            }
        }

        // Pass 2: walk the heap bottom-up, sliding live entries down over
        // the dead ones and pointing their slots at the new location.
        let heap_base = self.heap_base() as usize;
        let top = self.ctl().heap_top.0.load(Ordering::Relaxed);
        let mut src = heap_base;
        let mut dst = heap_base;
        while src < top {
            let word = unsafe { *(src as *const u64) };
            let aligned;
            if word & 1 == 1 {
                // Dead entry: skip it.
                aligned = EntryHeader::from_raw(word).aligned_size();
            } else {
                let addr_field = unsafe { &*(word as *const AtomicUsize) };
                let header = EntryHeader::from_raw(addr_field.load(Ordering::Relaxed) as u64);
                aligned = header.aligned_size();

                addr_field.store(dst, Ordering::Relaxed);
                unsafe {
                    *(src as *mut u64) = header.raw();
                    std::ptr::copy(src as *const u8, dst as *mut u8, aligned);
                }
                dst += aligned;
            }
            src += aligned;
        }

        self.ctl().heap_top.0.store(dst, Ordering::SeqCst);
        self.ctl().wasted_heap.0.store(0, Ordering::SeqCst);

        debug!(
            "compacted the shared heap to {} bytes in {:?}",
            dst - heap_base,
            start.elapsed()
        );
    }
}
