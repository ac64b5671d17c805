//! Streaming errors.

use thiserror::Error;

/// Errors that can occur while stitching or fanning out streams.
///
/// Errors travel in-band as `Err` items so they can be broadcast to every
/// consumer of a shared source, which is why this type is `Clone` and only
/// carries rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream no longer accepts inputs.
    #[error("Cannot add inputs to a closed stream")]
    Closed,

    /// A shared source failed while being read.
    #[error("Source error: {0}")]
    Source(String),

    /// A producer failed while generating chunks.
    #[error("Producer error: {0}")]
    Producer(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Check if the error is caller misuse surfaced synchronously, rather
    /// than a failure of the data flowing through the stream.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Create a producer error from any displayable error.
    pub fn producer<E: std::fmt::Display>(err: E) -> Self {
        Self::Producer(err.to_string())
    }

    /// Create from any error.
    pub fn from_err<E: std::fmt::Display>(err: E) -> Self {
        Self::Other(err.to_string())
    }
}

/// Result type for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;
