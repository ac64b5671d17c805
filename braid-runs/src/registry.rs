//! Registry of live run streams.
//!
//! Each registered run owns a stitched output (fed through its
//! [`StitchHandle`]) wrapped in a [`MultiConsumerStream`], so any number of
//! readers can follow the run while producers keep appending inputs. The
//! registry is an ordinary value: construct one per server or test and share
//! it by reference.

use crate::error::RegistryError;
use crate::run::RunId;
use braid_streaming::{
    ConsumerStream, MultiConsumerStream, StitchHandle, StitchableStream, StreamMerger,
    StreamPhase, StreamResult,
};
use futures::Stream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// The stream pair registered for one run.
pub struct RunStreams<T> {
    handle: StitchHandle<T>,
    output: MultiConsumerStream<T>,
}

impl<T> Clone for RunStreams<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            output: self.output.clone(),
        }
    }
}

impl<T> RunStreams<T>
where
    T: Clone + Send + 'static,
{
    /// Create a fresh stitched output and its multiplexer.
    pub fn new() -> Self {
        let (handle, output) = StitchableStream::create();
        Self {
            handle,
            output: MultiConsumerStream::new(output),
        }
    }

    /// Get the producer handle.
    pub fn handle(&self) -> &StitchHandle<T> {
        &self.handle
    }

    /// Get the multiplexed output.
    pub fn output(&self) -> &MultiConsumerStream<T> {
        &self.output
    }
}

impl<T> Default for RunStreams<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Maps run ids to their live streams.
pub struct StreamRegistry<T> {
    runs: RwLock<HashMap<RunId, RunStreams<T>>>,
}

impl<T> Default for StreamRegistry<T> {
    fn default() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> StreamRegistry<T>
where
    T: Clone + Send + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register streams for a new run and return its merge capability.
    pub fn create(&self, run_id: impl Into<RunId>) -> Result<StreamMerger<T>, RegistryError> {
        let run_id = run_id.into();
        let mut runs = self.runs.write();
        if runs.contains_key(&run_id) {
            return Err(RegistryError::AlreadyExists(run_id));
        }
        let streams = RunStreams::new();
        let merger = streams.handle.merger();
        debug!(run_id = %run_id, "registry: streams created");
        runs.insert(run_id, streams);
        Ok(merger)
    }

    fn get(&self, run_id: &str) -> Result<RunStreams<T>, RegistryError> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(run_id))
    }

    /// Get a merge capability for an existing run.
    pub fn merger(&self, run_id: &str) -> Result<StreamMerger<T>, RegistryError> {
        Ok(self.get(run_id)?.handle.merger())
    }

    /// Append an input stream to a run's output.
    pub fn add_stream<S>(&self, run_id: &str, input: S) -> Result<(), RegistryError>
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        self.get(run_id)?.handle.add_stream(input)?;
        Ok(())
    }

    /// Declare that a run will receive no more inputs.
    pub fn close(&self, run_id: &str) -> Result<(), RegistryError> {
        self.get(run_id)?.handle.close();
        Ok(())
    }

    /// Stop a run's output immediately.
    pub fn terminate(&self, run_id: &str) -> Result<(), RegistryError> {
        self.get(run_id)?.handle.terminate();
        Ok(())
    }

    /// Attach a new reader to a run's output.
    pub fn split(&self, run_id: &str) -> Result<ConsumerStream<T>, RegistryError> {
        Ok(self.get(run_id)?.output.split())
    }

    /// Get the lifecycle phase of a run's stitched output.
    pub fn phase(&self, run_id: &str) -> Result<StreamPhase, RegistryError> {
        Ok(self.get(run_id)?.handle.phase())
    }

    /// Forget a run.
    ///
    /// Readers already attached keep receiving the run's output; new
    /// operations on the id fail with [`RegistryError::NotFound`].
    pub fn remove(&self, run_id: &str) -> Result<(), RegistryError> {
        let removed = self.runs.write().remove(run_id);
        match removed {
            Some(_) => {
                debug!(run_id = %run_id, "registry: streams removed");
                Ok(())
            }
            None => Err(RegistryError::not_found(run_id)),
        }
    }

    /// Check if a run is registered.
    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.read().contains_key(run_id)
    }

    /// Number of registered runs.
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    /// Ids of all registered runs.
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.read().keys().cloned().collect()
    }
}

impl<T> fmt::Debug for StreamRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("runs", &self.runs.read().len())
            .finish()
    }
}
