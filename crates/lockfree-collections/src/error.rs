use thiserror::Error;

/// Errors surfaced by strict and size-checked entry points.
///
/// Contention is never user-visible; it is retried internally. Only argument
/// validation, lookup-key-missing on strict APIs, and destination-too-small
/// checks reach the caller as a `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Requested capacity exceeds [`crate::config::MAX_CAPACITY`].
    #[error("capacity {0} exceeds the maximum supported capacity (2^30)")]
    CapacityTooLarge(usize),

    /// A destination slice passed to a copy-out API was too small.
    #[error("destination slice of length {actual} is too small to hold {required} elements")]
    CopyTargetTooSmall { required: usize, actual: usize },

    /// Strict lookup found no entry for the given key.
    #[error("key not found")]
    KeyNotFound,

    /// Strict insert found the key already present as a live entry.
    #[error("key already present")]
    DuplicateKey,

    /// Attempted to obtain a "sync root" or otherwise use a read-only
    /// snapshot view (e.g. [`crate::Dictionary::to_snapshot`]) as mutable.
    /// Reserved for API-contract completeness; current read-only views are
    /// owned copies, so nothing in this crate returns it yet.
    #[error("operation not supported on this view")]
    UnsupportedOperation,
}
