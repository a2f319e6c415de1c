//! Error kinds surfaced across the public API (see design doc section 7).
//!
//! `ContentionRetry` never escapes the crate: it models the internal spin a
//! writer performs while the compactor holds a `moving` lock on a meta word.
//! `CompactorMoveAborted` likewise never escapes: the compactor swallows it
//! and moves on to the next object. Both variants exist so the internal
//! helpers that model the meta-word state machine can return a `Result`
//! instead of threading ad-hoc booleans through the call stack.

use crate::meta::ObjectId;

/// Errors that can surface from [`crate::Database`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The segment file could not grow and the free-segment queue is empty.
    #[error("out of space: could not allocate a new segment (dir={dir})")]
    OutOfSpace {
        /// Directory of the database that ran out of space.
        dir: String,
    },

    /// The 15-bit saturating refcount on an id overflowed.
    #[error("refcount overflow on id {id}")]
    RefcountOverflow {
        /// The id whose refcount saturated.
        id: ObjectId,
    },

    /// A checksum did not validate, or an id pointed at memory that does not
    /// belong to it.
    #[error("integrity error on id {id:?}: {reason}")]
    IntegrityError {
        /// The id involved, if known.
        id: Option<ObjectId>,
        /// Human-readable description of what failed to validate.
        reason: String,
    },

    /// Internal: a writer observed `moving` and should retry. Never returned
    /// from a public API call.
    #[error("internal: contended meta word, retry")]
    ContentionRetry,

    /// Internal: the compactor's CAS to move an object failed because the
    /// object was concurrently freed, moved, or modified. The compactor
    /// swallows this and continues; it is not a fatal condition.
    #[error("internal: compactor move aborted for id {id}")]
    CompactorMoveAborted {
        /// The id the compactor was attempting to relocate.
        id: ObjectId,
    },

    /// A key or value exceeded the engine's size limits.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The database was poisoned by an earlier invariant violation and is
    /// refusing further mutation.
    #[error("database is poisoned and running read-only: {0}")]
    Poisoned(String),

    /// Wraps lower-level I/O failures (opening/growing/mmapping files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn integrity(id: Option<ObjectId>, reason: impl Into<String>) -> Self {
        Error::IntegrityError {
            id,
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the public API.
pub type Result<T> = std::result::Result<T, Error>;
