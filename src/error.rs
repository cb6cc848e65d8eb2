//! Errors surfaced by the `BPlusTree` public operations.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The branching parameter is too small for the occupancy predicates to
    /// be meaningful.
    #[error("invalid order {order}, must be at least 3")]
    InvalidOrder { order: usize },

    /// Snapshot file could not be opened, read, or written.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot header carries a key-type tag this build does not know.
    #[error("unsupported key type tag {0} in snapshot header")]
    UnsupportedKeyType(i32),

    /// The snapshot was produced for a different key instantiation.
    #[error("snapshot key type mismatch: expected tag {expected}, found {found}")]
    KeyTypeMismatch { expected: i32, found: i32 },

    /// The data stream ended in the middle of a record.
    #[error("snapshot data stream is truncated")]
    Truncated,

    /// The snapshot refers to nodes that were never materialized, or is
    /// otherwise structurally unusable.
    #[error("snapshot is corrupted: {0}")]
    Corrupted(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
