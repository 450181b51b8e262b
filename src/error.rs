//! Error types and Result alias for cheesebase.

use thiserror::Error;

/// Errors surfaced by the storage engine and the path API.
///
/// `Corrupt` and `Io` are fatal to the operation that raised them; the
/// transaction they abort leaves no partial effects because nothing reaches
/// the page cache before commit. Missing paths and keys are reported as
/// ordinary return values, not errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation request exceeds the largest block payload (4088 bytes).
    #[error("allocation of {0} bytes exceeds the largest block")]
    AllocTooLarge(usize),

    /// An on-disk structure failed a magic, tag or alignment check.
    #[error("corrupt database: {0}")]
    Corrupt(&'static str),

    /// An interned key was not found in the key cache.
    #[error("unknown interned key")]
    UnknownKey,

    /// Array index past the largest representable key.
    #[error("array index out of range")]
    IndexOutOfRange,

    /// Key string too long or bucket index space exhausted.
    #[error("key cache: {0}")]
    KeyCache(&'static str),

    /// Underlying file open/read/write/extend failed.
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON text did not parse.
    #[error("parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
