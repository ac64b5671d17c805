//! Sequential stitching of many input streams into one output.
//!
//! A [`StitchableStream`] drains input streams one at a time, in the order
//! they were added through its [`StitchHandle`]. Inputs may be added at any
//! point until the handle is closed, including while the output is already
//! being consumed.

use crate::error::{StreamError, StreamResult};
use crate::phase::StreamPhase;
use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace};

type Input<T> = BoxStream<'static, StreamResult<T>>;

struct Shared<T> {
    queue: VecDeque<Input<T>>,
    closed: bool,
    terminated: bool,
    phase: StreamPhase,
    waker: Option<Waker>,
    added: usize,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            closed: false,
            terminated: false,
            phase: StreamPhase::Open,
            waker: None,
            added: 0,
        }
    }

    fn register(&mut self, waker: &Waker) {
        match &self.waker {
            Some(current) if current.will_wake(waker) => {}
            _ => self.waker = Some(waker.clone()),
        }
    }

    /// Stop accepting inputs and hand back whatever was still queued so the
    /// caller can drop it outside the lock.
    fn shut(&mut self, phase: StreamPhase) -> VecDeque<Input<T>> {
        self.closed = true;
        self.phase.advance(phase);
        std::mem::take(&mut self.queue)
    }
}

/// Producer half of a stitched stream.
///
/// Cloning the handle is cheap; every clone feeds the same output.
pub struct StitchHandle<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for StitchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> StitchHandle<T>
where
    T: Send + 'static,
{
    /// Append an input stream.
    ///
    /// Inputs are drained in the order they are added. Fails with
    /// [`StreamError::Closed`] once the handle was closed, terminated, or
    /// the output was dropped.
    pub fn add_stream<S>(&self, input: S) -> StreamResult<()>
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        let waker = {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(StreamError::Closed);
            }
            shared.queue.push_back(input.boxed());
            shared.added += 1;
            trace!(
                input = shared.added,
                pending = shared.queue.len(),
                "stitch: input added"
            );
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Declare that no further inputs will be added.
    ///
    /// The output ends once the inputs already queued are drained. Calling
    /// this more than once has no further effect.
    pub fn close(&self) {
        let waker = {
            let mut shared = self.shared.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.phase.advance(StreamPhase::Draining);
            debug!(pending = shared.queue.len(), "stitch: closed");
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Stop the output immediately.
    ///
    /// Queued inputs are discarded, the active input is released at the
    /// output's next poll, and the output ends without yielding anything
    /// further.
    pub fn terminate(&self) {
        let (discarded, waker) = {
            let mut shared = self.shared.lock();
            if shared.terminated {
                return;
            }
            shared.terminated = true;
            let discarded = shared.shut(StreamPhase::Draining);
            debug!(discarded = discarded.len(), "stitch: terminated");
            (discarded, shared.waker.take())
        };
        drop(discarded);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Get a capability that can only merge additional inputs.
    pub fn merger(&self) -> StreamMerger<T> {
        StreamMerger {
            handle: self.clone(),
        }
    }

    /// Check if the handle no longer accepts inputs.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of inputs queued but not yet started.
    pub fn pending_inputs(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Get the current lifecycle phase.
    pub fn phase(&self) -> StreamPhase {
        self.shared.lock().phase
    }
}

impl<T> fmt::Debug for StitchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("StitchHandle")
            .field("pending", &shared.queue.len())
            .field("closed", &shared.closed)
            .field("phase", &shared.phase)
            .finish()
    }
}

/// Narrow capability over a [`StitchHandle`]: it can add inputs to the
/// logical output and nothing else.
///
/// Hand this to code that produces chunks for a run instead of the full
/// handle, so it cannot close or terminate the output.
pub struct StreamMerger<T> {
    handle: StitchHandle<T>,
}

impl<T> Clone for StreamMerger<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<T> StreamMerger<T>
where
    T: Send + 'static,
{
    /// Merge an additional input stream into the output.
    pub fn merge<S>(&self, input: S) -> StreamResult<()>
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        self.handle.add_stream(input)
    }

    /// Merge a fixed batch of chunks into the output.
    pub fn merge_chunks<I>(&self, chunks: I) -> StreamResult<()>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.handle
            .add_stream(futures::stream::iter(chunks.into_iter().map(Ok)))
    }
}

impl<T> fmt::Debug for StreamMerger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMerger").finish_non_exhaustive()
    }
}

/// Output half of a stitched stream.
///
/// Yields every item of every input in input order and ends once the handle
/// is closed and all inputs are drained. An `Err` item from an input is
/// forwarded and ends the output; inputs still queued are discarded.
///
/// Dropping the output releases the active input, discards the queue, and
/// closes the handle.
pub struct StitchableStream<T> {
    shared: Arc<Mutex<Shared<T>>>,
    active: Option<Input<T>>,
    done: bool,
}

impl<T> StitchableStream<T>
where
    T: Send + 'static,
{
    /// Create an empty, open stitched stream.
    pub fn create() -> (StitchHandle<T>, Self) {
        let shared = Arc::new(Mutex::new(Shared::new()));
        let handle = StitchHandle {
            shared: Arc::clone(&shared),
        };
        let output = Self {
            shared,
            active: None,
            done: false,
        };
        (handle, output)
    }

    /// Get the current lifecycle phase.
    pub fn phase(&self) -> StreamPhase {
        self.shared.lock().phase
    }

    fn finish(&mut self, phase: StreamPhase) {
        self.done = true;
        self.active = None;
        let discarded = self.shared.lock().shut(phase);
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "stitch: dropping queued inputs");
        }
    }
}

impl<T> Stream for StitchableStream<T>
where
    T: Send + 'static,
{
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            let next = {
                let mut shared = this.shared.lock();
                if shared.terminated {
                    None
                } else {
                    shared.register(cx.waker());
                    if this.active.is_none() {
                        match shared.queue.pop_front() {
                            Some(input) => Some(Some(input)),
                            None if shared.closed => None,
                            None => return Poll::Pending,
                        }
                    } else {
                        Some(None)
                    }
                }
            };

            match next {
                // terminated, or closed with nothing left to drain
                None => {
                    this.finish(StreamPhase::Completed);
                    trace!("stitch: output complete");
                    return Poll::Ready(None);
                }
                Some(Some(input)) => {
                    trace!("stitch: starting next input");
                    this.active = Some(input);
                }
                Some(None) => {}
            }

            let Some(active) = this.active.as_mut() else {
                continue;
            };
            match active.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(Ok(item))),
                Poll::Ready(Some(Err(err))) => {
                    debug!(error = %err, "stitch: input failed");
                    this.finish(StreamPhase::Errored);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.active = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> FusedStream for StitchableStream<T>
where
    T: Send + 'static,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for StitchableStream<T> {
    fn drop(&mut self) {
        let discarded = {
            let mut shared = self.shared.lock();
            shared.closed = true;
            shared.phase.advance(StreamPhase::Completed);
            std::mem::take(&mut shared.queue)
        };
        if !self.done {
            debug!(
                discarded = discarded.len(),
                active = self.active.is_some(),
                "stitch: output dropped"
            );
        }
    }
}

impl<T> fmt::Debug for StitchableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StitchableStream")
            .field("active", &self.active.is_some())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
