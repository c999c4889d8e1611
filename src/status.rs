//! Crate-wide status and result types.
//!
//! Every fallible operation in the storage engine reports one of a
//! small, closed set of error kinds. Local recovery is deliberately
//! narrow: a checksum failure in the tail of a write-ahead log is
//! truncated and logged, while a missing file during recovery is
//! fatal. Background (flush/compaction) failures are latched by the
//! database facade and surfaced on subsequent writes.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Status>;

/// The error taxonomy of the storage engine.
///
/// `NotFound` is mostly an internal signal (e.g. a missing `CURRENT`
/// file during open); the public read path reports missing keys as
/// `Ok(None)`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Status {
    /// A requested entity (key, file) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// On-disk data failed validation (checksum, magic, framing).
    #[error("corruption: {0}")]
    Corruption(String),

    /// The operation or encoding is recognized but not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The caller supplied an invalid argument or configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Status {
    /// Shorthand constructor for [`Status::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Status {
        Status::Corruption(msg.into())
    }

    /// Shorthand constructor for [`Status::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Status {
        Status::NotFound(msg.into())
    }

    /// True when this status is the `NotFound` kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound(_))
    }

    /// True when this status is the `Corruption` kind.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Status::Corruption(_))
    }
}

impl Clone for Status {
    fn clone(&self) -> Status {
        match self {
            Status::NotFound(m) => Status::NotFound(m.clone()),
            Status::Corruption(m) => Status::Corruption(m.clone()),
            Status::NotSupported(m) => Status::NotSupported(m.clone()),
            Status::InvalidArgument(m) => Status::InvalidArgument(m.clone()),
            // io::Error is not Clone; preserve the kind and rendered
            // message.
            Status::Io(e) => Status::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
