//! # braid-runs
//!
//! Run orchestration on top of `braid-streaming`.
//!
//! A run is one execution of a multi-stage [`RunTask`]. Every stage merges an
//! input stream into the run's stitched output; the output is fanned out so
//! one branch is persisted to a [`ChunkStore`] while the submitter (and any
//! later subscriber) reads it live.
//!
//! ## Features
//!
//! - Explicit [`StreamRegistry`] of live run streams
//! - [`RunContext`] exposing only the merge capability to tasks
//! - Broker and storage abstractions with in-memory and file backends
//! - Per-run cancellation
//!
//! ## Example
//!
//! ```rust,ignore
//! use braid_runs::prelude::*;
//!
//! let worker = RunWorker::<String>::from_config(RunnerConfig::from_env()?);
//! let handle = worker.spawn();
//!
//! let task = task_fn("answer", |ctx: RunContext<String>| async move {
//!     ctx.merge_chunks(vec!["Hello".to_string()])?;
//!     ctx.merge_chunks(vec![", world".to_string()])?;
//!     Ok(())
//! });
//!
//! let submission = worker.submit(task).await?;
//! let chunks: Vec<_> = submission.stream.collect().await;
//! handle.shutdown().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod error;
pub mod registry;
pub mod run;
pub mod storage;
pub mod task;
pub mod worker;

pub use broker::{Broker, BrokerError, InMemoryBroker, Job};
pub use config::RunnerConfig;
pub use error::{RegistryError, RunError};
pub use registry::{RunStreams, StreamRegistry};
pub use run::{generate_run_id, Run, RunId, RunResult, RunStatus};
pub use storage::{Chunk, ChunkStore, FileChunkStore, InMemoryChunkStore, StorageError};
pub use task::{task_fn, FnTask, RunContext, RunTask};
pub use worker::{RunSubmission, RunWorker, WorkerHandle};

// Re-export for convenience
pub use braid_streaming::{ConsumerStream, StreamError, StreamMerger, StreamResult};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        task_fn, Broker, ChunkStore, ConsumerStream, InMemoryBroker, InMemoryChunkStore, Run,
        RunContext, RunError, RunResult, RunStatus, RunSubmission, RunTask, RunWorker,
        RunnerConfig, StreamError, StreamRegistry, StreamResult, WorkerHandle,
    };
}
