//! Error types shared across every keyspace crate.
//!
//! `Error` is the single error type returned by the tuple/record codecs,
//! the directory resolver, the transaction driver, the index maintainers,
//! the vector indexes, and the session/query layer. Each variant is
//! classified into one of five mutually exclusive categories:
//!
//! 1. **Validation** — caught before any store interaction, never retried.
//! 2. **Conflict** — transient, retried by the transaction driver.
//! 3. **Fatal** — a transaction-level failure surfaced to the caller.
//! 4. **Structural** — an invariant violation that should not occur in
//!    correct code.
//! 5. **Security** — an access-control denial; never retried or cached.
//!
//! ```
//! use keyspace_core::{Error, ErrorCategory};
//!
//! fn handle(e: Error) {
//!     match e.category() {
//!         ErrorCategory::Conflict => { /* let the driver retry */ }
//!         ErrorCategory::Validation => { /* report to caller, no retry */ }
//!         _ => { /* surface */ }
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout keyspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The error classification from the error-handling design (validation,
/// conflict/transient, fatal transaction, structural/invariant, security).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Conflict,
    Fatal,
    Structural,
    Security,
}

/// The unified error type for all keyspace operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Validation: pre-commit, never retried ---
    #[error("dynamic fields required for directory of {type_name}: {fields:?}")]
    DynamicFieldsRequired {
        type_name: String,
        fields: Vec<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tuple encoding error: {0}")]
    TupleEncodingError(String),

    #[error("tuple decoding error: {0}")]
    TupleDecodingError(String),

    #[error("nil value cannot be indexed")]
    NilNotIndexable,

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("key path type mismatch: {0}")]
    KeyPathTypeMismatch(String),

    // --- Conflict/transient: retried by the transaction driver ---
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("commit result unknown")]
    CommitUnknown,

    #[error("transport error: {0}")]
    Transport(String),

    // --- Fatal transaction: surfaced to the caller ---
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error("transaction exceeded size limit: {size} bytes (limit {limit})")]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("uniqueness violation on index {index_name} for key {key}")]
    UniquenessViolation { index_name: String, key: String },

    #[error("a commit is already in flight for this session")]
    ConcurrentSaveNotAllowed,

    #[error("no record of type {type_name} found for id {id}")]
    ModelNotFound { type_name: String, id: String },

    #[error("hnsw graph has reached max_inline_nodes ({max}); use a batched builder")]
    GraphTooLarge { max: usize },

    #[error("quorum lost")]
    QuorumLost,

    // --- Structural/invariant: should not occur in correct code ---
    #[error("structural invariant violated: {0}")]
    Invariant(String),

    #[error("reconstruction not supported: {0}")]
    ReconstructionNotSupported(String),

    // --- Security: never retried, never cached ---
    #[error("access denied: {0}")]
    AccessDenied(String),

    // --- Ambient (io/serialization) ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Classify this error per the taxonomy in the error-handling design.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::DynamicFieldsRequired { .. }
            | Error::InvalidArgument(_)
            | Error::TupleEncodingError(_)
            | Error::TupleDecodingError(_)
            | Error::NilNotIndexable
            | Error::DimensionMismatch { .. }
            | Error::KeyPathTypeMismatch(_) => ErrorCategory::Validation,

            Error::Conflict(_) | Error::CommitUnknown | Error::Transport(_) => {
                ErrorCategory::Conflict
            }

            Error::Timeout(_)
            | Error::TransactionTooLarge { .. }
            | Error::UniquenessViolation { .. }
            | Error::ConcurrentSaveNotAllowed
            | Error::ModelNotFound { .. }
            | Error::GraphTooLarge { .. }
            | Error::QuorumLost
            | Error::Io(_)
            | Error::Serialization(_) => ErrorCategory::Fatal,

            Error::Invariant(_) | Error::ReconstructionNotSupported(_) => {
                ErrorCategory::Structural
            }

            Error::AccessDenied(_) => ErrorCategory::Security,
        }
    }

    /// Only conflict/transient errors are retried by the transaction driver.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }

    /// Non-retryable errors per §4.E: encoding errors, security violations,
    /// argument validation, `TransactionTooLarge`, `UniquenessViolation`.
    pub fn is_non_retryable(&self) -> bool {
        !self.is_retryable()
    }
}
