//! The master→workers broadcast slot.
//!
//! One length word followed by the payload; length zero means empty. Only
//! the master writes, and only while no worker is in a phase that reads,
//! so the accesses need no synchronization beyond the phase discipline.

use crate::error::Result;
use crate::shm::SharedMem;

/// View over the broadcast slot.
pub struct GlobalSlot<'a> {
    mem: &'a SharedMem,
}

impl<'a> GlobalSlot<'a> {
    pub(crate) fn new(mem: &'a SharedMem) -> Self {
        GlobalSlot { mem }
    }

    fn len_word(&self) -> *mut usize {
        self.mem.global_base() as *mut usize
    }

    fn payload(&self) -> *mut u8 {
        unsafe { self.mem.global_base().add(std::mem::size_of::<usize>()) }
    }

    pub fn is_empty(&self) -> bool {
        unsafe { *self.len_word() == 0 }
    }

    /// Publish a blob for the workers. Master-only; the slot must be
    /// empty and the payload must leave room for the length word.
    pub fn store(&self, data: &[u8]) -> Result<()> {
        self.mem.assert_master();
        assert!(self.is_empty(), "broadcast slot is already occupied");
        assert!(
            data.len() < self.mem.global_bytes() - std::mem::size_of::<usize>(),
            "broadcast payload exceeds the global storage capacity"
        );

        self.mem.region().reserve(self.payload(), data.len())?;
        unsafe {
            *self.len_word() = data.len();
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.payload(), data.len());
        }
        Ok(())
    }

    /// Read the published blob. The slot must be non-empty.
    pub fn load(&self) -> Vec<u8> {
        let len = unsafe { *self.len_word() };
        assert!(len != 0, "broadcast slot is empty");
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload(), out.as_mut_ptr(), len);
        }
        out
    }

    /// Release the slot for the next broadcast. Master-only.
    pub fn clear(&self) {
        self.mem.assert_master();
        unsafe {
            *self.len_word() = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util;

    #[test]
    fn store_load_clear_cycle() {
        let r = test_util::small_region();
        let global = r.mem.global();
        assert!(global.is_empty());

        global.store(b"analysis environment").unwrap();
        assert!(!global.is_empty());
        assert_eq!(global.load(), b"analysis environment");
        // Readable more than once until cleared.
        assert_eq!(global.load(), b"analysis environment");

        global.clear();
        assert!(global.is_empty());

        global.store(b"second broadcast").unwrap();
        assert_eq!(global.load(), b"second broadcast");
        global.clear();
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn double_store_is_a_contract_violation() {
        let r = test_util::small_region();
        let global = r.mem.global();
        global.store(b"one").unwrap();
        let _ = global.store(b"two");
    }

    #[test]
    #[should_panic(expected = "exceeds the global storage capacity")]
    fn oversized_store_is_a_contract_violation() {
        let r = test_util::small_region();
        let too_big = vec![0u8; r.mem.global_bytes()];
        let _ = r.mem.global().store(&too_big);
    }
}
