//! Durable storage for runs and their chunks.
//!
//! A [`ChunkStore`] keeps the [`Run`] record of every submitted run together
//! with the chunks its output produced, in production order.

use crate::run::{Run, RunId};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Run was not found.
    #[error("Run not found: {0}")]
    NotFound(RunId),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Values that can flow through a run and be persisted.
pub trait Chunk: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Chunk for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Storage trait for run records and chunks.
#[async_trait]
pub trait ChunkStore<T: Chunk>: Send + Sync {
    /// Insert or replace a run record.
    async fn save_run(&self, run: &Run) -> Result<(), StorageError>;

    /// Get a run record by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StorageError>;

    /// List run records, newest first (with optional limit).
    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>, StorageError>;

    /// Append a chunk to a saved run.
    async fn append_chunk(&self, run_id: &str, chunk: &T) -> Result<(), StorageError>;

    /// Load every chunk of a saved run in append order.
    async fn load_chunks(&self, run_id: &str) -> Result<Vec<T>, StorageError>;

    /// Delete a run and its chunks.
    async fn delete_run(&self, run_id: &str) -> Result<(), StorageError>;
}

fn newest_first(runs: &mut Vec<Run>, limit: Option<usize>) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = limit {
        runs.truncate(limit);
    }
}

#[derive(Debug)]
struct StoredRun<T> {
    run: Run,
    chunks: Vec<T>,
}

/// In-memory chunk store.
///
/// Suitable for development and testing. Data is lost when the process
/// terminates.
#[derive(Debug)]
pub struct InMemoryChunkStore<T> {
    runs: Arc<RwLock<HashMap<RunId, StoredRun<T>>>>,
}

impl<T> Default for InMemoryChunkStore<T> {
    fn default() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T> InMemoryChunkStore<T> {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored runs.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    /// Clear all runs.
    pub async fn clear(&self) {
        self.runs.write().await.clear();
    }
}

#[async_trait]
impl<T: Chunk> ChunkStore<T> for InMemoryChunkStore<T> {
    async fn save_run(&self, run: &Run) -> Result<(), StorageError> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.id) {
            Some(stored) => stored.run = run.clone(),
            None => {
                runs.insert(
                    run.id.clone(),
                    StoredRun {
                        run: run.clone(),
                        chunks: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StorageError> {
        let runs = self.runs.read().await;
        Ok(runs.get(run_id).map(|stored| stored.run.clone()))
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>, StorageError> {
        let runs = self.runs.read().await;
        let mut all: Vec<Run> = runs.values().map(|stored| stored.run.clone()).collect();
        newest_first(&mut all, limit);
        Ok(all)
    }

    async fn append_chunk(&self, run_id: &str, chunk: &T) -> Result<(), StorageError> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::NotFound(run_id.to_string()))?;
        stored.chunks.push(chunk.clone());
        Ok(())
    }

    async fn load_chunks(&self, run_id: &str) -> Result<Vec<T>, StorageError> {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .map(|stored| stored.chunks.clone())
            .ok_or_else(|| StorageError::NotFound(run_id.to_string()))
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StorageError> {
        let mut runs = self.runs.write().await;
        if runs.remove(run_id).is_none() {
            return Err(StorageError::NotFound(run_id.to_string()));
        }
        Ok(())
    }
}

const RUN_SUFFIX: &str = ".run.json";
const CHUNKS_SUFFIX: &str = ".chunks.jsonl";

/// File-based chunk store.
///
/// Each run is kept as `<run_id>.run.json` next to a newline-delimited
/// `<run_id>.chunks.jsonl` holding one JSON chunk per line.
#[derive(Debug)]
pub struct FileChunkStore<T> {
    directory: PathBuf,
    _chunk: PhantomData<fn() -> T>,
}

impl<T> Clone for FileChunkStore<T> {
    fn clone(&self) -> Self {
        Self::new(self.directory.clone())
    }
}

impl<T> FileChunkStore<T> {
    /// Create a new file-based store.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            _chunk: PhantomData,
        }
    }

    /// Get the storage directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Ensure the directory exists.
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{}{}", run_id, RUN_SUFFIX))
    }

    fn chunks_path(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{}{}", run_id, CHUNKS_SUFFIX))
    }

    async fn read_run(path: &Path) -> Result<Run, StorageError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl<T: Chunk> ChunkStore<T> for FileChunkStore<T> {
    async fn save_run(&self, run: &Run) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let content = serde_json::to_string_pretty(run)?;
        tokio::fs::write(self.run_path(&run.id), content).await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StorageError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_run(&path).await?))
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>, StorageError> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_run = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(RUN_SUFFIX));
            if is_run {
                runs.push(Self::read_run(&entry.path()).await?);
            }
        }

        newest_first(&mut runs, limit);
        Ok(runs)
    }

    async fn append_chunk(&self, run_id: &str, chunk: &T) -> Result<(), StorageError> {
        if !self.run_path(run_id).exists() {
            return Err(StorageError::NotFound(run_id.to_string()));
        }

        let mut line = serde_json::to_string(chunk)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.chunks_path(run_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_chunks(&self, run_id: &str) -> Result<Vec<T>, StorageError> {
        if !self.run_path(run_id).exists() {
            return Err(StorageError::NotFound(run_id.to_string()));
        }

        let path = self.chunks_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StorageError::from))
            .collect()
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StorageError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(StorageError::NotFound(run_id.to_string()));
        }
        tokio::fs::remove_file(&path).await?;

        match tokio::fs::remove_file(self.chunks_path(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Delta {
        stage: u32,
        text: String,
    }

    fn delta(stage: u32, text: &str) -> Delta {
        Delta {
            stage,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_save_and_get() {
        let store = InMemoryChunkStore::<Delta>::new();
        let run = Run::with_id("run-1", "summarize");

        store.save_run(&run).await.unwrap();

        let loaded = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert!(store.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_save_is_upsert() {
        let store = InMemoryChunkStore::new();
        let mut run = Run::with_id("run-1", "summarize");
        store.save_run(&run).await.unwrap();
        store.append_chunk("run-1", &delta(0, "kept")).await.unwrap();

        run.start().unwrap();
        store.save_run(&run).await.unwrap();

        assert!(store.get_run("run-1").await.unwrap().unwrap().is_running());
        assert_eq!(
            store.load_chunks("run-1").await.unwrap(),
            vec![delta(0, "kept")]
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_in_memory_chunks_in_order() {
        let store = InMemoryChunkStore::new();
        store.save_run(&Run::with_id("run-1", "t")).await.unwrap();

        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            store
                .append_chunk("run-1", &delta(i as u32, text))
                .await
                .unwrap();
        }

        let chunks = store.load_chunks("run-1").await.unwrap();
        assert_eq!(chunks, vec![delta(0, "a"), delta(1, "b"), delta(2, "c")]);
    }

    #[tokio::test]
    async fn test_in_memory_unknown_run() {
        let store = InMemoryChunkStore::<Delta>::new();

        let result = store.append_chunk("missing", &delta(0, "x")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(matches!(
            store.load_chunks("missing").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_run("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_list_newest_first() {
        let store = InMemoryChunkStore::<Delta>::new();
        let mut older = Run::with_id("older", "t");
        older.created_at = older.created_at - Duration::seconds(60);
        let newer = Run::with_id("newer", "t");

        store.save_run(&older).await.unwrap();
        store.save_run(&newer).await.unwrap();

        let ids: Vec<_> = store
            .list_runs(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(store.list_runs(Some(1)).await.unwrap().len(), 1);

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::<Delta>::new(dir.path().join("runs"));
        let mut run = Run::with_id("run-1", "summarize");
        run.start().unwrap();

        store.save_run(&run).await.unwrap();
        store.append_chunk("run-1", &delta(0, "hello")).await.unwrap();
        store.append_chunk("run-1", &delta(1, "world")).await.unwrap();

        assert_eq!(store.get_run("run-1").await.unwrap(), Some(run));
        assert_eq!(
            store.load_chunks("run-1").await.unwrap(),
            vec![delta(0, "hello"), delta(1, "world")]
        );
        assert!(dir.path().join("runs/run-1.run.json").exists());
        assert!(dir.path().join("runs/run-1.chunks.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_run_without_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::<Delta>::new(dir.path());
        store.save_run(&Run::with_id("quiet", "t")).await.unwrap();

        assert_eq!(store.load_chunks("quiet").await.unwrap(), Vec::new());
        assert!(matches!(
            store.append_chunk("missing", &delta(0, "x")).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::<Delta>::new(dir.path());

        let mut older = Run::with_id("older", "t");
        older.created_at = older.created_at - Duration::seconds(60);
        store.save_run(&older).await.unwrap();
        store.save_run(&Run::with_id("newer", "t")).await.unwrap();
        store.append_chunk("newer", &delta(0, "x")).await.unwrap();

        let runs = store.list_runs(None).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "newer");

        store.delete_run("newer").await.unwrap();
        store.delete_run("older").await.unwrap();
        assert!(store.list_runs(None).await.unwrap().is_empty());
        assert!(!dir.path().join("newer.chunks.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::<Delta>::new(dir.path().join("never-created"));

        assert!(store.list_runs(Some(10)).await.unwrap().is_empty());
        assert!(store.get_run("run-1").await.unwrap().is_none());
    }
}
