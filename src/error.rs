use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ArrayError>;

/// All failures surfaced by the engine.
///
/// Every error is reported synchronously to the caller of the failing
/// operation; nothing is retried internally. An incomplete read is a query
/// status, not an error.
#[derive(Debug, Error)]
pub enum ArrayError {
    /// Collaborator I/O failure, propagated untouched.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Malformed schema or unsupported domain datatype.
    #[error("schema error: {0}")]
    Schema(String),
    /// Subarray bounds violated: inverted, out of domain, or malformed.
    #[error("subarray error: {0}")]
    Subarray(String),
    /// Missing or undersized buffer, or invalid variable-length offsets.
    #[error("buffer error: {0}")]
    Buffer(String),
    /// Operation invalid for the query's current status.
    #[error("invalid state: {0}")]
    State(String),
    /// Persisted data failed an integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The query was cancelled while an operation was in flight.
    #[error("query cancelled")]
    Cancelled,
}
