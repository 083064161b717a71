//! Error types shared across the reconciliation engine.
//!
//! Algebraic failures ([`ReconError`]) are decided by the caller that asked
//! for the computation: `Interpolate` and `LowMBar` mean "descend to a
//! smaller node".  Structural failures ([`TreeError`]) come from the prefix
//! tree and its store.  [`WireError`] covers framing and codec faults on a
//! recon session.

use std::io;

use thiserror::Error;

/// Errors raised by the field, polynomial and interpolation kernels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconError {
    #[error("division by zero")]
    /// Inversion of the zero element or division by the zero polynomial.
    DivisionByZero,
    #[error("interpolation failed: degree difference {deg_diff} exceeds {samples} samples")]
    /// The declared degree difference cannot be resolved with this many samples.
    Interpolate {
        /// Declared degree difference.
        deg_diff: i64,
        /// Number of sample values supplied.
        samples: usize,
    },
    #[error("low mbar")]
    /// The recovered rational function failed validation.
    LowMBar,
    #[error("pow mod exponent too small")]
    /// Exponent with fewer than three bits passed to `pow_mod`.
    PowModSmallN,
    #[error("matrix too narrow: {columns} columns for {rows} rows")]
    /// Gaussian elimination on an under-determined system.
    MatrixTooNarrow {
        /// Column count.
        columns: usize,
        /// Row count.
        rows: usize,
    },
    #[error("invalid factor: degree {0}")]
    /// A polynomial did not split into linear factors.
    InvalidFactor(usize),
    #[error("sample length mismatch: {values} values for {points} points")]
    /// Values and points slices disagree in length.
    SampleMismatch {
        /// Number of values.
        values: usize,
        /// Number of points.
        points: usize,
    },
}

/// Errors raised by the prefix tree and its node stores.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node not found: {0}")]
    /// No node (and no ancestor) exists for the key.
    NodeNotFound(String),
    #[error("duplicate element: {0}")]
    /// Insert of an element that is already a member.
    DuplicateElement(String),
    #[error("element not found: {0}")]
    /// Remove of an element that is not a member.
    ElementNotFound(String),
    #[error("element {0} collides with a sample point")]
    /// Inserting a sample point would zero an aggregate.
    SamplePointElement(String),
    #[error("store error: {0}")]
    /// Backing key-value store failure.
    Store(String),
    #[error("node codec error: {0}")]
    /// A stored node record could not be decoded.
    Codec(#[from] WireError),
    #[error(transparent)]
    /// Arithmetic failure while updating aggregates.
    Recon(#[from] ReconError),
}

/// Errors raised while encoding or decoding recon wire data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    /// Underlying reader or writer failure.
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    /// A length prefix above the configured maximum.
    TooLarge(usize),
    #[error("unknown message type {0}")]
    /// Message type byte with no known decoding.
    UnknownMessage(u8),
    #[error("unsupported message: {0}")]
    /// Message type recognized but not implemented.
    Unsupported(&'static str),
    #[error("invalid utf-8 string")]
    /// String payload was not UTF-8.
    Utf8,
    #[error("malformed payload: {0}")]
    /// Structurally invalid payload.
    Malformed(String),
}

impl From<redb::Error> for TreeError {
    fn from(err: redb::Error) -> Self {
        TreeError::Store(err.to_string())
    }
}

macro_rules! store_error_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for TreeError {
            fn from(err: $ty) -> Self {
                TreeError::Store(err.to_string())
            }
        })*
    };
}

store_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);
