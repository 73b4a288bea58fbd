//! Region sizing and the connector handed to forked workers.

use std::os::unix::io::RawFd;

/// Sizing and telemetry knobs for a fresh region. Table sizes are
/// `2^log2` slots and cannot change after init; overflow is a hard error.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the master broadcast slot, including its length word.
    pub global_bytes: usize,
    /// Capacity of the bump-allocated value heap.
    pub heap_bytes: usize,
    /// log2 of the dependency-table slot count.
    pub dep_log2: u8,
    /// log2 of the value-hashtable slot count.
    pub hash_log2: u8,
    /// Minimum free space required of a backing directory, when one is used.
    pub minimum_avail_bytes: u64,
    /// Shared-memory telemetry verbosity (0 = quiet).
    pub log_level: usize,
    /// Telemetry sampling rate.
    pub sample_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            global_bytes: 16 * 1024 * 1024,
            heap_bytes: 1024 * 1024 * 1024,
            dep_log2: 17,
            hash_log2: 18,
            minimum_avail_bytes: 0,
            log_level: 0,
            sample_rate: 0.0,
        }
    }
}

/// Everything a forked worker needs to map the region its parent created:
/// the inheritable descriptor of the backing object plus the size
/// parameters the layout is derived from.
#[derive(Clone, Copy, Debug)]
pub struct Connector {
    pub fd: RawFd,
    pub global_bytes: usize,
    pub heap_bytes: usize,
    pub dep_log2: u8,
    pub hash_log2: u8,
}
