//! Shared-memory coordination substrate for a multi-process static
//! analyzer.
//!
//! A master process and the workers forked from it share one fixed-address
//! memory region holding three independent structures: a broadcast slot
//! the master fills and workers read, a lock-free dependency table the
//! workers fill concurrently, and a lock-free value store backed by a
//! bump-allocated, compacting heap.
//!
//! This is not a general-purpose concurrent hash table. Nothing here
//! takes a lock; the structures are correct only under the phase
//! discipline of the surrounding scheduler — writers never race the
//! collector, removers never race writers, and readers tolerate seeing
//! "absent" for a value whose write is mid-flight.

mod config;
mod deptbl;
mod error;
mod global;
mod hashtbl;
mod heap;
mod shm;
#[cfg(feature = "sqlite")]
mod sqldeps;
mod value;

#[cfg(test)]
mod test_util;

pub use config::{Config, Connector};
pub use deptbl::DepTable;
pub use error::{Error, Result};
pub use global::GlobalSlot;
pub use hashtbl::{Presence, PutSize, ValueStore};
pub use shm::SharedMem;
#[cfg(feature = "sqlite")]
pub use sqldeps::{file_info_path, set_file_info_path, FILE_INFO_ON_DISK_PATH};
pub use value::{RawBytes, ValueCodec};
