//! The lock-free value store: a fixed-size open-addressed table mapping
//! 64-bit digests to heap entries.
//!
//! Concurrent writes are supported; the first writer wins and later ones
//! learn they lost. Concurrent reads are supported and may observe
//! "absent" while a write is in flight. Removes are master-only and never
//! concurrent with anything. Linear probing, no deletion of hashes: a
//! removed key keeps its hash word so probe chains stay intact.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::heap::{EntryHeader, Kind, HEADER_BYTES};
use crate::shm::SharedMem;
use crate::value::ValueCodec;

/// Placed in a slot's addr field by a writer that claimed the slot but has
/// not finished writing the heap entry. Distinguishable from a real entry
/// address because entries are cache-line aligned.
pub(crate) const SENTINEL: usize = 1;

/// Waiting on a claimed slot longer than this means the writer died
/// mid-publish; there is no recovering the slot.
const STUCK_WRITER_TIMEOUT: Duration = Duration::from_secs(60);

/// One slot of the table.
///
/// `hash == 0` with a null addr is an empty slot; `hash != 0` with a null
/// addr is a removed entry; [`SENTINEL`] marks a write in flight.
#[repr(C)]
pub(crate) struct Slot {
    pub hash: AtomicU64,
    pub addr: AtomicUsize,
}

const _: () = assert!(std::mem::size_of::<Slot>() == crate::shm::layout::HASH_SLOT_BYTES);

/// Answer of [`ValueStore::has`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Presence {
    Present,
    /// No writer ever claimed this key.
    AbsentNeverWritten,
    /// The key was written and later removed by the master.
    AbsentRemoved,
}

/// Heap accounting for a completed write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PutSize {
    /// Bytes allocated on the heap for the payload (after compression).
    pub stored: usize,
    /// Uncompressed payload size.
    pub original: usize,
}

/// View over the value store.
pub struct ValueStore<'a> {
    mem: &'a SharedMem,
}

impl<'a> ValueStore<'a> {
    pub(crate) fn new(mem: &'a SharedMem) -> Self {
        ValueStore { mem }
    }

    fn slots(&self) -> &[Slot] {
        unsafe {
            std::slice::from_raw_parts(self.mem.hashtbl_base() as *const Slot, self.mem.hash_slots())
        }
    }

    /// The slot hash: the first 8 key bytes as a little-endian word. The
    /// caller is responsible for the key being a proper digest of the
    /// logical key; the table never sees the rest of it.
    fn hash_of(key: &[u8]) -> u64 {
        assert!(key.len() >= 8, "keys must carry at least an 8-byte digest");
        u64::from_le_bytes(key[..8].try_into().unwrap())
    }

    /// Store a value under `key` unless some writer got there first.
    ///
    /// Returns the heap accounting of the write, or `None` when the key
    /// was already claimed (no allocation happens then). After an `Ok`
    /// with either payload, `has` on this key will reach `Present` —
    /// possibly after waiting out the winning writer.
    pub fn put<C: ValueCodec>(
        &self,
        codec: &C,
        key: &[u8],
        value: &C::Value,
    ) -> Result<Option<PutSize>> {
        self.mem.check_should_exit()?;
        let slots = self.slots();
        let mask = (self.mem.hash_slots() - 1) as u64;
        let hash = Self::hash_of(key);

        let init_slot = (hash & mask) as usize;
        let mut slot = init_slot;
        loop {
            let slot_hash = slots[slot].hash.load(Ordering::Acquire);

            if slot_hash == hash {
                return self.write_at(&slots[slot], codec, value);
            }

            if self.mem.ctl().hashtbl_count.0.load(Ordering::SeqCst)
                >= self.mem.hash_slots() as u64
            {
                // Every slot is claimed; probing cannot succeed.
                return Err(Error::HashTableFull);
            }

            if slot_hash == 0 {
                if slots[slot]
                    .hash
                    .compare_exchange(0, hash, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.mem.ctl().hashtbl_count.0.fetch_add(1, Ordering::SeqCst);
                    return self.write_at(&slots[slot], codec, value);
                }

                // Lost the claim. If the winner claimed it for our key we
                // must still attempt the write: we may not return before
                // the slot is guaranteed to become visible.
                if slots[slot].hash.load(Ordering::Acquire) == hash {
                    return self.write_at(&slots[slot], codec, value);
                }
            }

            slot = (slot + 1) & mask as usize;
            if slot == init_slot {
                return Err(Error::HashTableFull);
            }
        }
    }

    /// Publish into a slot whose hash already matches.
    fn write_at<C: ValueCodec>(
        &self,
        slot: &Slot,
        codec: &C,
        value: &C::Value,
    ) -> Result<Option<PutSize>> {
        if slot
            .addr
            .compare_exchange(0, SENTINEL, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Somebody else is writing (or wrote) this key.
            return Ok(None);
        }

        let (entry, size) = self.store_value(codec, value)?;
        slot.addr.store(entry as usize, Ordering::Release);
        Ok(Some(size))
    }

    /// Serialize, compress, and copy a value into a fresh heap entry.
    fn store_value<C: ValueCodec>(&self, codec: &C, value: &C::Value) -> Result<(*mut u8, PutSize)> {
        let owned;
        let (bytes, kind): (&[u8], Kind) = match codec.as_bytes(value) {
            // A value that already is a byte string goes to the heap
            // verbatim; serializing it would only copy it once more.
            Some(raw) => (raw, Kind::String),
            None => {
                owned = codec.serialize(value)?;
                (&owned, Kind::Serialized)
            }
        };
        assert!(
            bytes.len() < 0x8000_0000,
            "values must stay under 2 GiB"
        );

        let compressed = lz4_flex::compress(bytes);
        let (payload, uncompressed) = if !compressed.is_empty() && compressed.len() < bytes.len() {
            (compressed.as_slice(), bytes.len())
        } else {
            (bytes, 0)
        };

        let header = EntryHeader::new(payload.len(), kind, uncompressed);
        let entry = self.mem.alloc(header)?;
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), entry.add(HEADER_BYTES), payload.len());
        }

        Ok((
            entry,
            PutSize {
                stored: payload.len(),
                original: bytes.len(),
            },
        ))
    }

    /// The slot whose hash matches `hash`, or the empty slot where the key
    /// would go. Errors only when the table is completely full.
    fn find_slot(&self, hash: u64) -> Result<usize> {
        let slots = self.slots();
        let mask = (self.mem.hash_slots() - 1) as u64;
        let init_slot = (hash & mask) as usize;
        let mut slot = init_slot;
        loop {
            let slot_hash = slots[slot].hash.load(Ordering::Acquire);
            if slot_hash == hash || slot_hash == 0 {
                return Ok(slot);
            }
            slot = (slot + 1) & mask as usize;
            if slot == init_slot {
                return Err(Error::HashTableFull);
            }
        }
    }

    /// Whether `key` is present, never written, or removed.
    ///
    /// When the slot is claimed but the payload is still being written,
    /// spins until the writer publishes. A writer that died mid-publish
    /// leaves the slot unrecoverable; after 60 seconds this is fatal.
    pub fn has(&self, key: &[u8]) -> Result<Presence> {
        self.mem.check_should_exit()?;
        let hash = Self::hash_of(key);
        let slot = &self.slots()[self.find_slot(hash)?];

        if slot.hash.load(Ordering::Acquire) != hash {
            return Ok(Presence::AbsentNeverWritten);
        }

        let mut addr = slot.addr.load(Ordering::Acquire);
        if addr == 0 {
            return Ok(Presence::AbsentRemoved);
        }
        if addr == SENTINEL {
            let start = Instant::now();
            while addr == SENTINEL {
                std::hint::spin_loop();
                if start.elapsed() > STUCK_WRITER_TIMEOUT {
                    panic!("a writer left a value claimed but unwritten for 60s");
                }
                addr = slot.addr.load(Ordering::Acquire);
            }
        }
        Ok(Presence::Present)
    }

    /// Read the value stored under `key`, which must be present.
    pub fn get<C: ValueCodec>(&self, codec: &C, key: &[u8]) -> Result<C::Value> {
        self.mem.check_should_exit()?;
        let hash = Self::hash_of(key);
        let slot = &self.slots()[self.find_slot(hash)?];
        assert!(
            slot.hash.load(Ordering::Acquire) == hash,
            "get on an absent key"
        );
        let addr = slot.addr.load(Ordering::Acquire);
        assert!(addr != 0 && addr != SENTINEL, "get on an absent key");

        let header = EntryHeader::from_raw(unsafe { *(addr as *const u64) });
        let payload = unsafe {
            std::slice::from_raw_parts((addr + HEADER_BYTES) as *const u8, header.stored_size())
        };

        let bytes = if header.uncompressed_size() != 0 {
            lz4_flex::decompress(payload, header.uncompressed_size())
                .expect("corrupt compressed heap entry")
        } else {
            payload.to_vec()
        };

        match header.kind() {
            Kind::String => Ok(codec.from_bytes(bytes)),
            Kind::Serialized => codec.deserialize(&bytes),
        }
    }

    /// Stored (possibly compressed) payload size of a present key.
    pub fn size_of(&self, key: &[u8]) -> Result<usize> {
        let hash = Self::hash_of(key);
        let slot = &self.slots()[self.find_slot(hash)?];
        assert!(
            slot.hash.load(Ordering::Acquire) == hash,
            "size_of on an absent key"
        );
        let addr = slot.addr.load(Ordering::Acquire);
        assert!(addr != 0 && addr != SENTINEL, "size_of on an absent key");
        Ok(EntryHeader::from_raw(unsafe { *(addr as *const u64) }).stored_size())
    }

    /// Rebind the entry stored under `src_key` to `dst_key`. Master-only,
    /// remove phase; `src_key` must be present and `dst_key` absent.
    pub fn move_value(&self, src_key: &[u8], dst_key: &[u8]) -> Result<()> {
        self.mem.assert_master();
        self.mem.assert_allow_removes();
        let slots = self.slots();

        let src_hash = Self::hash_of(src_key);
        let src = &slots[self.find_slot(src_hash)?];
        assert!(
            src.hash.load(Ordering::Acquire) == src_hash,
            "move source must be present"
        );
        let addr = src.addr.load(Ordering::Acquire);
        assert!(addr != 0 && addr != SENTINEL, "move source must be present");

        let dst_hash = Self::hash_of(dst_key);
        let dst = &slots[self.find_slot(dst_hash)?];
        assert!(
            dst.addr.load(Ordering::Acquire) == 0,
            "move destination must be absent"
        );

        // Taking over a never-used slot, not a tombstone: count it.
        if dst.hash.load(Ordering::Acquire) == 0 {
            self.mem.ctl().hashtbl_count.0.fetch_add(1, Ordering::SeqCst);
        }
        dst.hash.store(dst_hash, Ordering::SeqCst);
        dst.addr.store(addr, Ordering::SeqCst);
        src.addr.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Remove a present key. Master-only, remove phase. The hash word
    /// stays behind as a tombstone; the heap bytes are accounted as
    /// wasted until the next collection.
    pub fn remove(&self, key: &[u8]) {
        self.mem.assert_master();
        self.mem.assert_allow_removes();
        let hash = Self::hash_of(key);
        let slot = &self.slots()[self
            .find_slot(hash)
            .expect("remove probed a full table without finding its key")];
        assert!(
            slot.hash.load(Ordering::Acquire) == hash,
            "remove on an absent key"
        );
        let addr = slot.addr.load(Ordering::Acquire);
        assert!(addr != 0 && addr != SENTINEL, "remove on an absent key");

        let header = EntryHeader::from_raw(unsafe { *(addr as *const u64) });
        self.mem
            .ctl()
            .wasted_heap
            .0
            .fetch_add(header.aligned_size(), Ordering::SeqCst);
        slot.addr.store(0, Ordering::SeqCst);
        self.mem.note_removed();
    }

    /// `(slots with a live entry, slots with a nonzero hash)`.
    pub fn slot_stats(&self) -> (usize, usize) {
        let mut filled = 0;
        let mut nonempty = 0;
        for slot in self.slots() {
            if slot.hash.load(Ordering::Acquire) != 0 {
                nonempty += 1;
            }
            if slot.addr.load(Ordering::Acquire) != 0 {
                filled += 1;
            }
        }
        debug_assert_eq!(
            nonempty as u64,
            self.mem.ctl().hashtbl_count.0.load(Ordering::SeqCst)
        );
        (filled, nonempty)
    }
}
