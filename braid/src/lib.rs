//! # braid - Stitched, Multi-Consumer Streams for Long-Running Runs
//!
//! braid assembles the output of a multi-stage run into one logical stream
//! and hands that stream to any number of readers without reading the
//! underlying source more than once.
//!
//! ## Quick Start
//!
//! ```ignore
//! use braid::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let worker = RunWorker::<String>::from_config(RunnerConfig::from_env()?);
//!     let handle = worker.spawn();
//!
//!     let task = task_fn("answer", |ctx: RunContext<String>| async move {
//!         ctx.merge_chunks(vec!["thinking...".to_string()])?;
//!         ctx.merge_chunks(vec!["done".to_string()])?;
//!         Ok(())
//!     });
//!
//!     let submission = worker.submit(task).await?;
//!     let chunks: Vec<_> = submission.stream.collect().await;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Key Features
//!
//! - **Stitching**: inputs added at any time are drained strictly in order
//! - **Fan-out**: every consumer sees every item, each item is read once
//! - **Isolation**: dropping one consumer never affects the others
//! - **Runs**: registry, broker, chunk storage and worker (`runs` feature)
//!
//! ## Feature Flags
//!
//! | Feature | Description | Default |
//! |---------|-------------|--------|
//! | `runs` | Run registry, broker, storage and worker | ✅ |
//!
//! ## Architecture
//!
//! - [`braid_streaming`] - Stitching, multi-consumer fan-out, tee, recovery
//! - `braid_runs` - Stream registry, run records, broker, storage, worker

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// Crate Re-exports
// ============================================================================

/// Stream stitching and fan-out primitives.
pub use braid_streaming as streaming;

/// Run orchestration.
#[cfg(feature = "runs")]
#[cfg_attr(docsrs, doc(cfg(feature = "runs")))]
pub use braid_runs as runs;

// ============================================================================
// Type Re-exports
// ============================================================================

pub use braid_streaming::{
    tee, ConsumerStream, MultiConsumerStream, Recovery, StitchHandle, StitchableStream,
    StreamError, StreamFanOutExt, StreamMerger, StreamPhase, StreamRecoverExt, StreamResult,
};

#[cfg(feature = "runs")]
#[cfg_attr(docsrs, doc(cfg(feature = "runs")))]
pub use braid_runs::{
    task_fn, ChunkStore, FileChunkStore, InMemoryBroker, InMemoryChunkStore, RegistryError, Run,
    RunContext, RunError, RunResult, RunStatus, RunSubmission, RunTask, RunWorker, RunnerConfig,
    StreamRegistry, WorkerHandle,
};

// ============================================================================
// Prelude Module
// ============================================================================

/// Convenient prelude for common imports.
///
/// ```ignore
/// use braid::prelude::*;
/// ```
pub mod prelude {
    pub use braid_streaming::prelude::*;

    #[cfg(feature = "runs")]
    pub use braid_runs::prelude::*;
}

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
