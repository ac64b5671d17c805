//! Broker abstraction for job distribution.
//!
//! The broker holds the queue of submitted runs waiting for a worker.

use crate::run::Run;
use crate::task::RunTask;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Queue is full.
    #[error("Queue is full (max: {0})")]
    QueueFull(usize),

    /// Broker is shut down.
    #[error("Broker is shut down")]
    ShutDown,
}

/// A queued run together with the task that produces it.
pub struct Job<T> {
    /// The run record, as saved at submission.
    pub run: Run,
    /// The task to execute.
    pub task: Arc<dyn RunTask<T>>,
}

impl<T> Job<T> {
    /// Create a new job.
    pub fn new(run: Run, task: Arc<dyn RunTask<T>>) -> Self {
        Self { run, task }
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("run_id", &self.run.id)
            .field("task", &self.task.name())
            .finish()
    }
}

/// Broker trait for job distribution.
#[async_trait]
pub trait Broker<T>: Send + Sync {
    /// Submit a job to the queue.
    async fn submit(&self, job: Job<T>) -> Result<(), BrokerError>;

    /// Poll for the next job.
    ///
    /// Returns `None` if no job is available.
    async fn poll(&self) -> Option<Job<T>>;

    /// Wait for a job to become available.
    ///
    /// Returns `None` once the broker is shut down.
    async fn wait_for_job(&self) -> Option<Job<T>>;

    /// Get the number of pending jobs.
    async fn pending_count(&self) -> usize;

    /// Check if the broker is empty.
    async fn is_empty(&self) -> bool;

    /// Stop accepting jobs and release every waiting worker.
    async fn shutdown(&self);
}

/// In-memory FIFO broker.
pub struct InMemoryBroker<T> {
    queue: Mutex<VecDeque<Job<T>>>,
    notify: Notify,
    max_size: Option<usize>,
    shutdown: AtomicBool,
}

impl<T> Default for InMemoryBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryBroker<T> {
    /// Create a new unbounded broker.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_size: None,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Create a broker with a maximum queue size.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size: Some(max_size),
            ..Self::new()
        }
    }

    /// Get the maximum queue size.
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Check if the broker is shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Clear all pending jobs.
    pub async fn clear(&self) {
        self.queue.lock().await.clear();
    }
}

impl<T> std::fmt::Debug for InMemoryBroker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("max_size", &self.max_size)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: 'static> Broker<T> for InMemoryBroker<T> {
    async fn submit(&self, job: Job<T>) -> Result<(), BrokerError> {
        if self.is_shutdown() {
            return Err(BrokerError::ShutDown);
        }

        let mut queue = self.queue.lock().await;
        if let Some(max) = self.max_size {
            if queue.len() >= max {
                return Err(BrokerError::QueueFull(max));
            }
        }

        queue.push_back(job);
        drop(queue); // Release lock before notifying

        self.notify.notify_one();
        Ok(())
    }

    async fn poll(&self) -> Option<Job<T>> {
        self.queue.lock().await.pop_front()
    }

    async fn wait_for_job(&self) -> Option<Job<T>> {
        loop {
            // Register interest before checking so a submit in between is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutdown() {
                return None;
            }
            if let Some(job) = self.poll().await {
                return Some(job);
            }

            notified.await;
        }
    }

    async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
