//! Run records.
//!
//! A run is one execution of a multi-stage job whose chunks flow through a
//! stitched, multi-consumer output stream.

use crate::error::RunError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a run.
pub type RunId = String;

/// Generate a fresh run id.
pub fn generate_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}

/// A persisted run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run.
    pub id: RunId,
    /// Name of the task executing the run.
    pub task: String,
    /// Current status of the run.
    pub status: RunStatus,
    /// Number of chunks written to storage.
    #[serde(default)]
    pub chunk_count: u64,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was last updated.
    pub updated_at: DateTime<Utc>,
    /// Error message if the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optional metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Run {
    /// Create a new pending run.
    pub fn new(task: impl Into<String>) -> Self {
        Self::with_id(generate_run_id(), task)
    }

    /// Create a new pending run with a specific id.
    pub fn with_id(id: impl Into<RunId>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task: task.into(),
            status: RunStatus::Pending,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
            error: None,
            metadata: None,
        }
    }

    /// Check if the run is pending.
    pub fn is_pending(&self) -> bool {
        self.status == RunStatus::Pending
    }

    /// Check if the run is running.
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Check if the run reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the run as running.
    pub fn start(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Running)
    }

    /// Mark the run as completed.
    pub fn complete(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Completed)
    }

    /// Mark the run as failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), RunError> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Mark the run as cancelled.
    pub fn cancel(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Cancelled)
    }

    /// Set metadata on the run.
    pub fn set_metadata(&mut self, metadata: serde_json::Value) {
        self.metadata = Some(metadata);
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), RunError> {
        if !self.status.can_transition_to(to) {
            return Err(RunError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for a worker.
    #[default]
    Pending,
    /// Producing chunks.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before finishing.
    Cancelled,
}

impl RunStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if moving to `to` is allowed. Terminal statuses never change.
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        match (self, to) {
            (Self::Pending, Self::Running | Self::Failed | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of processing one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// The run id.
    pub run_id: RunId,
    /// Final status.
    pub status: RunStatus,
    /// Number of chunks persisted.
    pub chunks: u64,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl RunResult {
    /// Build a result from a finished run record.
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            chunks: run.chunk_count,
            error: run.error.clone(),
            duration_ms: None,
        }
    }

    /// Create a failed result.
    pub fn failure(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Failed,
            chunks: 0,
            error: Some(error.into()),
            duration_ms: None,
        }
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Check if the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
