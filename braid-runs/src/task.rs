//! Run tasks and their execution context.
//!
//! A [`RunTask`] produces a run's output in stages. Each stage hands one
//! input stream to [`RunContext::merge`]; the stages are drained in the order
//! they were merged, so readers see one continuous stream.

use crate::error::RunError;
use crate::run::RunId;
use async_trait::async_trait;
use braid_streaming::{StreamMerger, StreamResult};
use futures::Stream;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A multi-stage producer of run output.
#[async_trait]
pub trait RunTask<T>: Send + Sync {
    /// Name recorded on the run.
    fn name(&self) -> &str;

    /// Produce the run's output through `ctx`.
    ///
    /// Returning `Ok` closes the output once every merged stage has drained.
    /// Returning `Err` appends the error as the output's final item.
    async fn execute(&self, ctx: RunContext<T>) -> Result<(), RunError>;
}

/// Context handed to [`RunTask::execute`].
pub struct RunContext<T> {
    run_id: RunId,
    merger: StreamMerger<T>,
    cancellation: CancellationToken,
    stages: Arc<AtomicU32>,
}

impl<T> Clone for RunContext<T> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            merger: self.merger.clone(),
            cancellation: self.cancellation.clone(),
            stages: Arc::clone(&self.stages),
        }
    }
}

impl<T> RunContext<T>
where
    T: Send + 'static,
{
    /// Create a new context.
    pub fn new(
        run_id: impl Into<RunId>,
        merger: StreamMerger<T>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            merger,
            cancellation,
            stages: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Get the run id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append a stage to the run's output.
    pub fn merge<S>(&self, stage: S) -> Result<u32, RunError>
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        self.merger.merge(stage)?;
        Ok(self.stages.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a stage made of already-available chunks.
    pub fn merge_chunks<I>(&self, chunks: I) -> Result<u32, RunError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.merger.merge_chunks(chunks)?;
        Ok(self.stages.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of stages merged so far.
    pub fn stage_count(&self) -> u32 {
        self.stages.load(Ordering::Relaxed)
    }

    /// Get the run's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check if the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl<T> std::fmt::Debug for RunContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("stages", &self.stages.load(Ordering::Relaxed))
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// A [`RunTask`] backed by an async closure.
pub struct FnTask<F> {
    name: String,
    func: F,
}

impl<F> FnTask<F> {
    /// Create a task from a name and a closure.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<T, F, Fut> RunTask<T> for FnTask<F>
where
    T: Send + 'static,
    F: Fn(RunContext<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), RunError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: RunContext<T>) -> Result<(), RunError> {
        (self.func)(ctx).await
    }
}

/// Create a shareable task from an async closure.
pub fn task_fn<T, F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn RunTask<T>>
where
    T: Send + 'static,
    F: Fn(RunContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RunError>> + Send + 'static,
{
    Arc::new(FnTask::new(name, func))
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_streaming::{StitchableStream, StreamError};
    use futures::{stream, StreamExt};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_context_merges_stages_in_order() {
        let (handle, output) = StitchableStream::create();
        let ctx = RunContext::new("run-1", handle.merger(), CancellationToken::new());

        assert_eq!(ctx.merge_chunks(vec![1, 2]).unwrap(), 0);
        assert_eq!(
            ctx.merge(stream::iter(vec![Ok::<_, StreamError>(3)])).unwrap(),
            1
        );
        assert_eq!(ctx.stage_count(), 2);
        handle.close();

        let items: Vec<i32> = output.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_context_merge_after_close() {
        let (handle, _output) = StitchableStream::<i32>::create();
        let ctx = RunContext::new("run-1", handle.merger(), CancellationToken::new());
        handle.close();

        let err = ctx.merge_chunks(vec![1]).unwrap_err();
        assert!(matches!(err, RunError::Stream(StreamError::Closed)));
        assert_eq!(ctx.stage_count(), 0);
    }

    #[test]
    fn test_context_cancellation() {
        let (handle, _output) = StitchableStream::<i32>::create();
        let token = CancellationToken::new();
        let ctx = RunContext::new("run-1", handle.merger(), token.clone());

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.clone().is_cancelled());
        assert_eq!(ctx.run_id(), "run-1");
    }

    #[tokio::test]
    async fn test_fn_task() {
        let task = task_fn("two-stage", |ctx: RunContext<i32>| async move {
            ctx.merge_chunks(vec![1])?;
            ctx.merge_chunks(vec![2])?;
            Ok(())
        });
        assert_eq!(task.name(), "two-stage");

        let (handle, output) = StitchableStream::create();
        task.execute(RunContext::new("run-1", handle.merger(), CancellationToken::new()))
            .await
            .unwrap();
        handle.close();

        let items: Vec<i32> = output.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2]);
    }
}
