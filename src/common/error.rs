//! Error types for the buffer layer.

use thiserror::Error;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in the buffer layer.
///
/// Every failure is surfaced synchronously to the immediate caller; nothing
/// in this crate retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    /// A memory or swap reservation could not be satisfied, even after
    /// exhausting the eviction queue.
    #[error("out of memory: {reason} ({used} of {limit} bytes in use)")]
    OutOfMemory {
        reason: String,
        used: usize,
        limit: usize,
    },

    /// I/O error from the temporary file store.
    ///
    /// This wraps `std::io::Error` from swap-file read/write/delete
    /// operations, including checksum mismatches on read-back.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was attempted on a handle outside its required
    /// precondition. This indicates a bug in the caller, not a resource
    /// condition, and is never retried.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The buffer manager is not configured for the requested operation,
    /// e.g. a spill was attempted with no temporary directory set.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// True if this error is the out-of-memory condition.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
