//! Shared fixtures for the unit tests.
//!
//! The region maps at a fixed address, so a process can hold only one at
//! a time; tests that need one serialize on a static mutex and rely on
//! `SharedMem` unmapping on drop.

use parking_lot::{Mutex, MutexGuard};

use crate::config::Config;
use crate::shm::SharedMem;

static REGION_LOCK: Mutex<()> = Mutex::new(());

/// A region plus the guard keeping other tests out. Field order matters:
/// the region must unmap before the lock is released.
pub struct TestRegion {
    pub mem: SharedMem,
    _guard: MutexGuard<'static, ()>,
}

pub fn small_config() -> Config {
    Config {
        global_bytes: 1 << 16,
        heap_bytes: 1 << 22,
        dep_log2: 12,
        hash_log2: 12,
        minimum_avail_bytes: 0,
        log_level: 0,
        sample_rate: 0.0,
    }
}

/// Sized for the bigger store tests: tens of thousands of KiB entries.
pub fn store_config() -> Config {
    Config {
        heap_bytes: 1 << 25,
        hash_log2: 15,
        ..small_config()
    }
}

pub fn region_with(config: &Config) -> TestRegion {
    let guard = REGION_LOCK.lock();
    let mem = SharedMem::init(config, None).expect("failed to initialize a test region");
    TestRegion { mem, _guard: guard }
}

pub fn small_region() -> TestRegion {
    region_with(&small_config())
}

pub fn store_region() -> TestRegion {
    region_with(&store_config())
}

/// A deterministic stand-in for the digest keys the analyzer would use.
/// splitmix64: bijective, so distinct seeds give distinct (and, for any
/// seed we use, nonzero) hashes.
pub fn digest(seed: u64) -> [u8; 8] {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    (z ^ (z >> 31)).to_le_bytes()
}

/// Pseudo-random bytes: effectively incompressible, so stored size equals
/// original size unless a test wants compression (use zeros for that).
pub fn noisy_value(seed: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut state = seed.wrapping_mul(0x2545_F491_4F6C_DD1D).wrapping_add(1);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}
