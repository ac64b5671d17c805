//! Runner configuration.

use crate::broker::{Broker, InMemoryBroker};
use crate::error::RunError;
use crate::storage::{Chunk, ChunkStore, FileChunkStore, InMemoryChunkStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Directory for [`FileChunkStore`]; in-memory storage when unset.
pub const STORAGE_DIR_ENV: &str = "BRAID_STORAGE_DIR";
/// Maximum number of queued runs.
pub const QUEUE_CAPACITY_ENV: &str = "BRAID_QUEUE_CAPACITY";
/// Whether chunks are written to storage (`true`/`false`, `1`/`0`).
pub const PERSIST_CHUNKS_ENV: &str = "BRAID_PERSIST_CHUNKS";

/// Configuration for a [`RunWorker`](crate::RunWorker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Directory for file storage. In-memory storage is used when unset.
    pub storage_dir: Option<PathBuf>,
    /// Maximum number of queued runs.
    pub queue_capacity: Option<usize>,
    /// Persist every chunk of every run. The output is read to completion
    /// either way, so a failed stage still fails the run.
    pub persist_chunks: bool,
    /// Drop a run's live streams from the registry once it finishes.
    pub remove_finished: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            queue_capacity: None,
            persist_chunks: true,
            remove_finished: true,
        }
    }
}

impl RunnerConfig {
    /// Create a default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the config from `BRAID_*` environment variables.
    pub fn from_env() -> Result<Self, RunError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Read the config through a variable lookup.
    ///
    /// Unset variables keep their default.
    pub fn from_vars<F>(lookup: F) -> Result<Self, RunError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(STORAGE_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            config.storage_dir = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup(QUEUE_CAPACITY_ENV) {
            let capacity = raw.trim().parse::<usize>().map_err(|e| {
                RunError::Config(format!("{QUEUE_CAPACITY_ENV}={raw:?}: {e}"))
            })?;
            if capacity == 0 {
                return Err(RunError::Config(format!(
                    "{QUEUE_CAPACITY_ENV} must be greater than zero"
                )));
            }
            config.queue_capacity = Some(capacity);
        }

        if let Some(raw) = lookup(PERSIST_CHUNKS_ENV) {
            config.persist_chunks = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(RunError::Config(format!(
                        "{PERSIST_CHUNKS_ENV}={raw:?} is not a boolean"
                    )))
                }
            };
        }

        Ok(config)
    }

    /// Set the storage directory.
    #[must_use]
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Enable or disable chunk persistence.
    ///
    /// Disabled runs record a `chunk_count` of zero.
    #[must_use]
    pub fn persist_chunks(mut self, persist: bool) -> Self {
        self.persist_chunks = persist;
        self
    }

    /// Keep or drop live streams of finished runs.
    #[must_use]
    pub fn remove_finished(mut self, remove: bool) -> Self {
        self.remove_finished = remove;
        self
    }

    /// Build the configured chunk store.
    pub fn build_store<T: Chunk>(&self) -> Arc<dyn ChunkStore<T>> {
        match &self.storage_dir {
            Some(dir) => Arc::new(FileChunkStore::<T>::new(dir.clone())),
            None => Arc::new(InMemoryChunkStore::<T>::new()),
        }
    }

    /// Build the configured broker.
    pub fn build_broker<T: 'static>(&self) -> Arc<dyn Broker<T>> {
        match self.queue_capacity {
            Some(capacity) => Arc::new(InMemoryBroker::<T>::with_max_size(capacity)),
            None => Arc::new(InMemoryBroker::<T>::new()),
        }
    }
}
