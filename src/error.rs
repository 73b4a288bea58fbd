//! Error taxonomy surfaced to the host process.
//!
//! Capacity and resource failures come back as `Err`; contract violations
//! (master-only calls from a worker, phase-gate abuse) are asserts, because
//! they indicate a scheduler bug rather than a recoverable condition.

/// Errors surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No anonymous-memory mechanism was available and no backing directory
    /// was supplied.
    #[error("failed to create an anonymous memory object")]
    FailedAnonymousInit,

    /// The backing directory holds fewer free bytes than the configured
    /// minimum. Carries the observed available bytes.
    #[error("backing directory has only {0} bytes available")]
    LessThanMinimumAvailable(u64),

    /// Committing pages of the shared region failed.
    #[error("out of shared memory")]
    OutOfSharedMemory,

    /// The shared heap has no room for another entry.
    #[error("shared heap is full")]
    HeapFull,

    /// Every slot of the value hashtable is taken.
    #[error("value hashtable is full")]
    HashTableFull,

    /// Every slot of the dependency table is taken.
    #[error("dependency table is full")]
    DepTableFull,

    /// Cooperative cancellation: the master asked workers to wind down.
    /// Not a crash; the host should unwind quietly.
    #[error("worker should exit")]
    WorkerShouldExit,

    /// The host codec failed to serialize or deserialize a value.
    #[error("value codec error: {0}")]
    Codec(String),

    #[cfg(feature = "sqlite")]
    #[error("dependency database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
