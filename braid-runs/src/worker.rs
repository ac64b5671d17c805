//! Worker for processing runs.
//!
//! The worker registers each submitted run's streams, reads one branch of the
//! output to completion (persisting it when configured), hands another branch
//! back to the submitter, and executes queued jobs with a [`RunContext`]
//! bound to the run. A run stays cancellable until its output has drained.

use crate::broker::{Broker, Job};
use crate::config::RunnerConfig;
use crate::error::{RegistryError, RunError};
use crate::registry::StreamRegistry;
use crate::run::{Run, RunId, RunResult};
use crate::storage::{Chunk, ChunkStore};
use crate::task::{RunContext, RunTask};
use braid_streaming::{ConsumerStream, StreamError};
use futures::{future, stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle for controlling a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Handle to the worker task.
    handle: JoinHandle<()>,
    /// Channel to signal shutdown.
    shutdown_tx: mpsc::Sender<()>,
    /// Flag indicating if worker is running.
    running: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Check if the worker is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Signal the worker to stop after its current job.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Wait for the worker to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Stop the worker and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop().await;
        self.wait().await;
    }
}

/// A submitted run and the caller's live view of its output.
#[derive(Debug)]
pub struct RunSubmission<T> {
    /// Id of the new run.
    pub run_id: RunId,
    /// Live output, starting with the run's first chunk.
    pub stream: ConsumerStream<T>,
}

/// What the output reader saw of a run's output.
#[derive(Debug, Default)]
struct OutputSummary {
    chunks: u64,
    error: Option<String>,
}

enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Worker that executes runs queued on a broker.
pub struct RunWorker<T> {
    registry: Arc<StreamRegistry<T>>,
    store: Arc<dyn ChunkStore<T>>,
    broker: Arc<dyn Broker<T>>,
    config: RunnerConfig,
    tokens: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
    readers: Arc<Mutex<HashMap<RunId, JoinHandle<OutputSummary>>>>,
}

impl<T> Clone for RunWorker<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            config: self.config.clone(),
            tokens: Arc::clone(&self.tokens),
            readers: Arc::clone(&self.readers),
        }
    }
}

impl<T: Chunk> RunWorker<T> {
    /// Create a new worker.
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry holding the live streams of every run.
    /// * `store` - Storage for run records and chunks.
    /// * `broker` - Queue of runs waiting to execute.
    /// * `config` - Runner configuration.
    pub fn new(
        registry: Arc<StreamRegistry<T>>,
        store: Arc<dyn ChunkStore<T>>,
        broker: Arc<dyn Broker<T>>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            broker,
            config,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            readers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a worker with the store and broker described by `config`.
    pub fn from_config(config: RunnerConfig) -> Self {
        let store = config.build_store();
        let broker = config.build_broker();
        Self::new(Arc::new(StreamRegistry::new()), store, broker, config)
    }

    /// Get the stream registry.
    pub fn registry(&self) -> &Arc<StreamRegistry<T>> {
        &self.registry
    }

    /// Get the chunk store.
    pub fn store(&self) -> &Arc<dyn ChunkStore<T>> {
        &self.store
    }

    /// Get the broker.
    pub fn broker(&self) -> &Arc<dyn Broker<T>> {
        &self.broker
    }

    /// Get the configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Queue a run of `task` and return a live view of its output.
    ///
    /// The run's streams are registered before this returns, so the live
    /// view sees every chunk the task produces.
    pub async fn submit(&self, task: Arc<dyn RunTask<T>>) -> Result<RunSubmission<T>, RunError> {
        let run = Run::new(task.name());
        let run_id = run.id.clone();

        self.store.save_run(&run).await?;
        self.registry.create(run_id.clone())?;
        let stream = self.registry.split(&run_id)?;

        let store = self
            .config
            .persist_chunks
            .then(|| Arc::clone(&self.store));
        let reader = self.registry.split(&run_id)?;
        let handle = tokio::spawn(read_output(store, run_id.clone(), reader));
        self.readers.lock().insert(run_id.clone(), handle);
        self.tokens
            .lock()
            .insert(run_id.clone(), CancellationToken::new());

        if let Err(e) = self.broker.submit(Job::new(run.clone(), task)).await {
            warn!(run_id = %run_id, error = %e, "worker: submit rejected");
            self.abandon(run, e.to_string()).await;
            return Err(e.into());
        }

        info!(run_id = %run_id, "worker: run submitted");
        Ok(RunSubmission { run_id, stream })
    }

    /// Attach another live reader to a run that is still registered.
    ///
    /// The reader starts at the next chunk read from the run's output.
    pub fn subscribe(&self, run_id: &str) -> Result<ConsumerStream<T>, RunError> {
        Ok(self.registry.split(run_id)?)
    }

    /// Get the stored record of a run.
    pub async fn status(&self, run_id: &str) -> Result<Option<Run>, RunError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Request cancellation of a queued or running run.
    pub fn cancel(&self, run_id: &str) -> Result<(), RunError> {
        let token = self.tokens.lock().get(run_id).cloned();
        match token {
            Some(token) => {
                info!(run_id = %run_id, "worker: cancellation requested");
                token.cancel();
                Ok(())
            }
            None => Err(RegistryError::not_found(run_id).into()),
        }
    }

    /// Process the next queued job, if any.
    pub async fn process_next(&self) -> Option<RunResult> {
        let job = self.broker.poll().await?;
        Some(self.process_job(job).await)
    }

    /// Start the worker in a background task.
    ///
    /// Returns a handle that can be used to control the worker.
    pub fn spawn(&self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let worker = self.clone();

        let handle = tokio::spawn(async move {
            debug!("worker: started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    job = worker.broker.wait_for_job() => {
                        match job {
                            Some(job) => {
                                worker.process_job(job).await;
                            }
                            None => {
                                // Broker shut down
                                break;
                            }
                        }
                    }
                }
            }
            running_clone.store(false, Ordering::Relaxed);
            debug!("worker: stopped");
        });

        WorkerHandle {
            handle,
            shutdown_tx,
            running,
        }
    }

    /// Execute a single job to completion.
    pub async fn process_job(&self, job: Job<T>) -> RunResult {
        let run_id = job.run.id.clone();
        match self.execute(job).await {
            Ok(result) => result,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "worker: run processing failed");
                self.release(&run_id).await;
                RunResult::failure(run_id, e.to_string())
            }
        }
    }

    async fn execute(&self, job: Job<T>) -> Result<RunResult, RunError> {
        let start = Instant::now();
        let Job { mut run, task } = job;
        let token = self
            .tokens
            .lock()
            .get(&run.id)
            .cloned()
            .unwrap_or_else(CancellationToken::new);

        let outcome = if token.is_cancelled() {
            Outcome::Cancelled
        } else {
            run.start()?;
            self.store.save_run(&run).await?;

            let ctx = RunContext::new(run.id.clone(), self.registry.merger(&run.id)?, token.clone());
            debug!(run_id = %run.id, task = task.name(), "worker: executing run");

            tokio::select! {
                result = task.execute(ctx) => match result {
                    Ok(()) => Outcome::Completed,
                    Err(e) => Outcome::Failed(e.to_string()),
                },
                _ = token.cancelled() => Outcome::Cancelled,
            }
        };

        match &outcome {
            Outcome::Completed => self.registry.close(&run.id)?,
            Outcome::Failed(message) => {
                let failure = stream::once(future::ready(Err(StreamError::producer(message))));
                if let Err(e) = self.registry.add_stream(&run.id, failure) {
                    // The output already ended with an error of its own.
                    debug!(run_id = %run.id, error = %e, "worker: failure not merged");
                }
                self.registry.close(&run.id)?;
            }
            Outcome::Cancelled => self.registry.terminate(&run.id)?,
        }

        let (summary, outcome) = match outcome {
            Outcome::Cancelled => (self.join_reader(&run.id).await, Outcome::Cancelled),
            outcome => match self.drain(&run.id, &token).await? {
                (summary, false) => (summary, outcome),
                (summary, true) => (summary, Outcome::Cancelled),
            },
        };
        run.chunk_count = summary.chunks;

        match outcome {
            Outcome::Completed => match summary.error {
                Some(message) => run.fail(message)?,
                None => run.complete()?,
            },
            Outcome::Failed(message) => run.fail(message)?,
            Outcome::Cancelled => run.cancel()?,
        }
        self.store.save_run(&run).await?;

        if self.config.remove_finished {
            self.registry.remove(&run.id)?;
        }
        self.tokens.lock().remove(&run.id);

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run.id,
            status = %run.status,
            chunks = run.chunk_count,
            duration_ms,
            "worker: run finished"
        );
        Ok(RunResult::from_run(&run).with_duration(duration_ms))
    }

    async fn join_reader(&self, run_id: &str) -> OutputSummary {
        let handle = self.readers.lock().remove(run_id);
        match handle {
            Some(handle) => summarize(run_id, handle.await),
            None => OutputSummary::default(),
        }
    }

    /// Wait for the run's output to drain, terminating it if the run is
    /// cancelled first.
    ///
    /// The flag is `true` when cancellation ended the output.
    async fn drain(
        &self,
        run_id: &str,
        token: &CancellationToken,
    ) -> Result<(OutputSummary, bool), RunError> {
        let handle = self.readers.lock().remove(run_id);
        let Some(mut handle) = handle else {
            return Ok((OutputSummary::default(), false));
        };

        tokio::select! {
            biased;
            joined = &mut handle => Ok((summarize(run_id, joined), false)),
            _ = token.cancelled() => {
                info!(run_id = %run_id, "worker: cancelled while draining");
                self.registry.terminate(run_id)?;
                Ok((summarize(run_id, handle.await), true))
            }
        }
    }

    /// Drop every live resource of a run.
    async fn release(&self, run_id: &str) {
        let _ = self.registry.terminate(run_id);
        let _ = self.registry.remove(run_id);
        self.tokens.lock().remove(run_id);
        self.join_reader(run_id).await;
    }

    async fn abandon(&self, mut run: Run, reason: String) {
        self.release(&run.id).await;
        if run.fail(reason).is_ok() {
            if let Err(e) = self.store.save_run(&run).await {
                warn!(run_id = %run.id, error = %e, "worker: failed to record rejected run");
            }
        }
    }
}

fn summarize(run_id: &str, joined: Result<OutputSummary, JoinError>) -> OutputSummary {
    joined.unwrap_or_else(|e| {
        warn!(run_id = %run_id, error = %e, "worker: output reader panicked");
        OutputSummary::default()
    })
}

/// Read a run's output until it ends, persisting chunks when a store is given.
async fn read_output<T: Chunk>(
    store: Option<Arc<dyn ChunkStore<T>>>,
    run_id: RunId,
    mut output: ConsumerStream<T>,
) -> OutputSummary {
    let mut summary = OutputSummary::default();
    while let Some(item) = output.next().await {
        match item {
            Ok(chunk) => {
                let Some(store) = &store else { continue };
                match store.append_chunk(&run_id, &chunk).await {
                    Ok(()) => summary.chunks += 1,
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "worker: failed to persist chunk")
                    }
                }
            }
            Err(e) => {
                debug!(run_id = %run_id, error = %e, "worker: run output ended with error");
                summary.error = Some(e.to_string());
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;
    use crate::task::task_fn;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn worker(config: RunnerConfig) -> RunWorker<String> {
        RunWorker::from_config(config)
    }

    fn chunks(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn two_stage() -> Arc<dyn RunTask<String>> {
        task_fn("two-stage", |ctx: RunContext<String>| async move {
            ctx.merge_chunks(chunks(&["plan", "draft"]))?;
            ctx.merge(stream::iter(vec![
                Ok::<_, StreamError>("review".to_string()),
                Ok("final".to_string()),
            ]))?;
            Ok(())
        })
    }

    async fn wait_for_status(worker: &RunWorker<String>, run_id: &str) -> Run {
        for _ in 0..200 {
            if let Some(run) = worker.status(run_id).await.unwrap() {
                if run.is_finished() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_submit_and_process() {
        let worker = worker(RunnerConfig::default());
        let submission = worker.submit(two_stage()).await.unwrap();

        let queued = worker.status(&submission.run_id).await.unwrap().unwrap();
        assert!(queued.is_pending());

        let result = worker.process_next().await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.chunks, 4);

        let live: Vec<String> = submission.stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(live, chunks(&["plan", "draft", "review", "final"]));

        let stored = worker.store().load_chunks(&submission.run_id).await.unwrap();
        assert_eq!(stored, live);

        let run = worker.status(&submission.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.chunk_count, 4);
        assert!(!worker.registry().contains(&submission.run_id));
    }

    #[tokio::test]
    async fn test_task_failure_reaches_readers() {
        let worker = worker(RunnerConfig::default());
        let task = task_fn("flaky", |ctx: RunContext<String>| async move {
            ctx.merge_chunks(chunks(&["partial"]))?;
            Err(RunError::task("boom"))
        });
        let submission = worker.submit(task).await.unwrap();

        let result = worker.process_next().await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Task failed: boom"));
        assert_eq!(result.chunks, 1);

        let live: Vec<_> = submission.stream.collect().await;
        assert_eq!(
            live,
            vec![
                Ok("partial".to_string()),
                Err(StreamError::Producer("Task failed: boom".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_error_fails_run() {
        let worker = worker(RunnerConfig::default());
        let task = task_fn("bad-stage", |ctx: RunContext<String>| async move {
            ctx.merge(stream::iter(vec![
                Ok("ok".to_string()),
                Err(StreamError::Source("upstream reset".into())),
            ]))?;
            ctx.merge_chunks(chunks(&["never"]))?;
            Ok(())
        });
        let submission = worker.submit(task).await.unwrap();

        let result = worker.process_next().await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Source error: upstream reset"));

        let live: Vec<_> = submission.stream.collect().await;
        assert_eq!(live.len(), 2);
        assert!(live[1].is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let worker = worker(RunnerConfig::default());
        let submission = worker.submit(two_stage()).await.unwrap();

        worker.cancel(&submission.run_id).unwrap();
        let result = worker.process_next().await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.chunks, 0);
        let live: Vec<_> = submission.stream.collect().await;
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running() {
        let worker = worker(RunnerConfig::default());
        let task = task_fn("endless", |ctx: RunContext<String>| async move {
            ctx.merge_chunks(chunks(&["first"]))?;
            future::pending::<()>().await;
            Ok(())
        });
        let mut submission = worker.submit(task).await.unwrap();
        let handle = worker.spawn();

        assert_eq!(submission.stream.next().await, Some(Ok("first".to_string())));
        worker.cancel(&submission.run_id).unwrap();
        assert_eq!(submission.stream.next().await, None);

        let run = wait_for_status(&worker, &submission.run_id).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.chunk_count, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_while_stage_still_live() {
        let worker = worker(RunnerConfig::default());
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String, StreamError>>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let task = task_fn("handoff", move |ctx: RunContext<String>| {
            let rx = rx.lock().take();
            async move {
                if let Some(rx) = rx {
                    ctx.merge(rx)?;
                }
                Ok(())
            }
        });

        let mut submission = worker.submit(task).await.unwrap();
        let handle = worker.spawn();

        tx.unbounded_send(Ok("one".into())).unwrap();
        assert_eq!(submission.stream.next().await, Some(Ok("one".to_string())));

        // The task has returned; only the merged stage keeps the run alive.
        worker.cancel(&submission.run_id).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), submission.stream.next())
            .await
            .unwrap();
        assert_eq!(next, None);

        let run = wait_for_status(&worker, &submission.run_id).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.chunk_count, 1);

        // The worker loop is free for the next run.
        let next_run = worker.submit(two_stage()).await.unwrap();
        let run = wait_for_status(&worker, &next_run.run_id).await;
        assert_eq!(run.status, RunStatus::Completed);

        drop(tx);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let worker = worker(RunnerConfig::default());
        let err = worker.cancel("missing").unwrap_err();
        assert!(matches!(err, RunError::Registry(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_spawned_worker_with_late_subscriber() {
        let worker = worker(RunnerConfig::default());
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String, StreamError>>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let task = task_fn("live", move |ctx: RunContext<String>| {
            let rx = rx.lock().take();
            async move {
                if let Some(rx) = rx {
                    ctx.merge(rx)?;
                }
                Ok(())
            }
        });

        let mut submission = worker.submit(task).await.unwrap();
        let handle = worker.spawn();
        assert!(handle.is_running());

        tx.unbounded_send(Ok("one".into())).unwrap();
        assert_eq!(submission.stream.next().await, Some(Ok("one".to_string())));

        let late = worker.subscribe(&submission.run_id).unwrap();
        tx.unbounded_send(Ok("two".into())).unwrap();
        drop(tx);

        let rest: Vec<_> = submission.stream.collect().await;
        let late: Vec<_> = late.collect().await;
        assert_eq!(rest, vec![Ok("two".to_string())]);
        assert_eq!(late, vec![Ok("two".to_string())]);

        let run = wait_for_status(&worker, &submission.run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.chunk_count, 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_without_persistence() {
        let worker = worker(RunnerConfig::new().persist_chunks(false));
        let submission = worker.submit(two_stage()).await.unwrap();

        let result = worker.process_next().await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.chunks, 0);

        let live: Vec<_> = submission.stream.collect().await;
        assert_eq!(live.len(), 4);
        assert!(worker
            .store()
            .load_chunks(&submission.run_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stage_error_fails_run_without_persistence() {
        let worker = worker(RunnerConfig::new().persist_chunks(false));
        let task = task_fn("bad-stage", |ctx: RunContext<String>| async move {
            ctx.merge(stream::iter(vec![
                Ok("ok".to_string()),
                Err(StreamError::Source("upstream reset".into())),
            ]))?;
            Ok(())
        });
        let submission = worker.submit(task).await.unwrap();

        let result = worker.process_next().await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Source error: upstream reset"));
        assert_eq!(result.chunks, 0);

        let live: Vec<_> = submission.stream.collect().await;
        assert_eq!(
            live,
            vec![
                Ok("ok".to_string()),
                Err(StreamError::Source("upstream reset".into())),
            ]
        );
        let run = worker.status(&submission.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_queue_full_marks_run_failed() {
        let worker = worker(RunnerConfig::new().queue_capacity(1));
        worker.submit(two_stage()).await.unwrap();

        let err = worker.submit(two_stage()).await.unwrap_err();
        assert!(matches!(err, RunError::Broker(_)));

        let runs = worker.store().list_runs(None).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(
            runs.iter().filter(|r| r.status == RunStatus::Failed).count(),
            1
        );
        assert_eq!(worker.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_keep_finished_streams() {
        let worker = worker(RunnerConfig::new().remove_finished(false));
        let submission = worker.submit(two_stage()).await.unwrap();
        worker.process_next().await.unwrap();

        assert!(worker.registry().contains(&submission.run_id));
        let late: Vec<_> = worker.subscribe(&submission.run_id).unwrap().collect().await;
        assert!(late.is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(RunnerConfig::new().storage_dir(dir.path()));
        let submission = worker.submit(two_stage()).await.unwrap();
        worker.process_next().await.unwrap();

        let stored = worker.store().load_chunks(&submission.run_id).await.unwrap();
        assert_eq!(stored, chunks(&["plan", "draft", "review", "final"]));
        assert!(dir
            .path()
            .join(format!("{}.chunks.jsonl", submission.run_id))
            .exists());
    }

    #[tokio::test]
    async fn test_worker_handle_stop() {
        let worker = worker(RunnerConfig::default());
        let handle = worker.spawn();
        assert!(handle.is_running());

        handle.shutdown().await;
        assert!(worker.process_next().await.is_none());
    }
}
