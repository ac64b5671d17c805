//! Run layer errors.

use crate::broker::BrokerError;
use crate::run::{RunId, RunStatus};
use crate::storage::StorageError;
use braid_streaming::StreamError;
use thiserror::Error;

/// Errors from the stream registry.
///
/// All of these are surfaced synchronously to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No streams exist for the run.
    #[error("No streams registered for run: {0}")]
    NotFound(RunId),

    /// Streams already exist for the run.
    #[error("Streams already registered for run: {0}")]
    AlreadyExists(RunId),

    /// The underlying stream rejected the operation.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl RegistryError {
    /// Create a not found error.
    pub fn not_found(run_id: impl Into<RunId>) -> Self {
        Self::NotFound(run_id.into())
    }
}

/// Errors that can occur while running a job.
#[derive(Debug, Error)]
pub enum RunError {
    /// Registry error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Stream error.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Invalid status change.
    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: RunStatus,
        /// Requested status.
        to: RunStatus,
    },

    /// The task reported a failure.
    #[error("Task failed: {0}")]
    Task(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Other error.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RunError {
    /// Create a task failure.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }
}
