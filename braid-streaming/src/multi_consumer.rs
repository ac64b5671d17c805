//! Fan-out of one source stream to many independent consumers.
//!
//! A [`MultiConsumerStream`] owns the read cursor of its source. Every
//! [`ConsumerStream`] obtained through [`MultiConsumerStream::split`] receives
//! each item read after it was created, in source order, through its own
//! unbounded queue. The source is only read when some consumer has run out
//! of queued items and asks for more, and each item is read exactly once no
//! matter how many consumers are attached.
//!
//! Consumers that join late miss whatever was broadcast before they joined;
//! there is no replay. Dropping a consumer removes it from the broadcast set
//! without touching the source.

use crate::error::StreamResult;
use crate::phase::StreamPhase;
use futures::channel::mpsc;
use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace};

type Source<T> = BoxStream<'static, StreamResult<T>>;

/// Identifier of a consumer within one multiplexer.
pub type ConsumerId = u64;

/// Wakes every consumer waiting on a source read.
///
/// The source is polled with this as its waker, so whichever consumer
/// happened to issue the read, all of them are woken when it can progress.
#[derive(Default)]
struct PullWaiters {
    wakers: Mutex<HashMap<ConsumerId, Waker>>,
}

impl PullWaiters {
    fn register(&self, id: ConsumerId, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        match wakers.get(&id) {
            Some(current) if current.will_wake(waker) => {}
            _ => {
                wakers.insert(id, waker.clone());
            }
        }
    }

    fn remove(&self, id: ConsumerId) {
        self.wakers.lock().remove(&id);
    }
}

impl ArcWake for PullWaiters {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let wakers: Vec<Waker> = arc_self.wakers.lock().drain().map(|(_, w)| w).collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

struct Registry<T> {
    consumers: BTreeMap<ConsumerId, mpsc::UnboundedSender<StreamResult<T>>>,
    next_id: ConsumerId,
    phase: StreamPhase,
    reads: u64,
    finished: bool,
}

impl<T: Clone> Registry<T> {
    fn broadcast(&mut self, item: StreamResult<T>) {
        self.consumers.retain(|id, sink| {
            if sink.unbounded_send(item.clone()).is_ok() {
                true
            } else {
                trace!(consumer_id = *id, "multi-consumer: pruning closed consumer");
                false
            }
        });
    }

    /// End every consumer. Items already queued for them stay readable.
    fn finish(&mut self, phase: StreamPhase) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.phase.advance(phase);
        self.consumers.clear();
        debug!(reads = self.reads, phase = %self.phase, "multi-consumer: source finished");
    }
}

struct Shared<T> {
    /// Held for the duration of a read, so at most one read is in flight.
    source: Mutex<Option<Source<T>>>,
    registry: Mutex<Registry<T>>,
    waiters: Arc<PullWaiters>,
}

impl<T: Clone> Shared<T> {
    /// Read one item from the source on behalf of consumer `id` and
    /// broadcast it.
    ///
    /// Returns `Ready` once something was delivered to the consumers (or the
    /// source is gone), `Pending` if the read has to wait. A consumer that
    /// finds another one mid-read does not read again; it is woken either by
    /// that read's broadcast or, if the read stalls, by the source itself.
    fn pull(&self, id: ConsumerId, cx: &mut Context<'_>) -> Poll<()> {
        self.waiters.register(id, cx.waker());

        let Some(mut source) = self.source.try_lock() else {
            trace!(consumer_id = id, "multi-consumer: pull already in flight");
            return Poll::Pending;
        };
        let Some(stream) = source.as_mut() else {
            return Poll::Ready(());
        };

        let waker = waker_ref(&self.waiters);
        let mut source_cx = Context::from_waker(&waker);
        let item = match stream.poll_next_unpin(&mut source_cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };

        let terminal = match &item {
            Some(Ok(_)) => None,
            Some(Err(_)) => Some(StreamPhase::Errored),
            None => Some(StreamPhase::Completed),
        };
        let released = if terminal.is_some() {
            source.take()
        } else {
            None
        };

        {
            let mut registry = self.registry.lock();
            registry.reads += 1;
            if let Some(item) = item {
                registry.phase.advance(StreamPhase::Draining);
                registry.broadcast(item);
            }
            if let Some(phase) = terminal {
                registry.finish(phase);
            }
        }

        drop(source);
        drop(released);
        Poll::Ready(())
    }
}

/// Shares one source stream between any number of consumers.
///
/// Cloning the multiplexer is cheap and every clone splits the same source.
pub struct MultiConsumerStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MultiConsumerStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> MultiConsumerStream<T>
where
    T: Clone + Send + 'static,
{
    /// Wrap a source stream.
    ///
    /// Nothing is read until a consumer asks for an item.
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                source: Mutex::new(Some(source.boxed())),
                registry: Mutex::new(Registry {
                    consumers: BTreeMap::new(),
                    next_id: 0,
                    phase: StreamPhase::Open,
                    reads: 0,
                    finished: false,
                }),
                waiters: Arc::new(PullWaiters::default()),
            }),
        }
    }

    /// Create a new independent consumer.
    ///
    /// The consumer receives every item read from the source from now on. A
    /// consumer created after the source finished ends immediately.
    pub fn split(&self) -> ConsumerStream<T> {
        let (sink, rx) = mpsc::unbounded();
        let mut registry = self.shared.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        if !registry.finished {
            registry.consumers.insert(id, sink);
        }
        debug!(
            consumer_id = id,
            consumers = registry.consumers.len(),
            "multi-consumer: split"
        );
        drop(registry);

        ConsumerStream {
            id,
            rx,
            shared: Arc::clone(&self.shared),
            done: false,
        }
    }

    /// Number of consumers currently attached.
    pub fn consumer_count(&self) -> usize {
        self.shared.registry.lock().consumers.len()
    }

    /// Get the current lifecycle phase.
    pub fn phase(&self) -> StreamPhase {
        self.shared.registry.lock().phase
    }

    /// Release the source and end every consumer.
    ///
    /// Items already queued for a consumer are still delivered to it.
    pub fn shutdown(&self) {
        let released = self.shared.source.lock().take();
        self.shared.registry.lock().finish(StreamPhase::Completed);
        drop(released);
    }
}

impl<T> fmt::Debug for MultiConsumerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("MultiConsumerStream")
            .field("consumers", &registry.consumers.len())
            .field("phase", &registry.phase)
            .field("reads", &registry.reads)
            .finish()
    }
}

/// One consumer's view of a [`MultiConsumerStream`].
pub struct ConsumerStream<T> {
    id: ConsumerId,
    rx: mpsc::UnboundedReceiver<StreamResult<T>>,
    shared: Arc<Shared<T>>,
    done: bool,
}

impl<T> ConsumerStream<T> {
    /// Get this consumer's id.
    pub fn id(&self) -> ConsumerId {
        self.id
    }
}

impl<T> Stream for ConsumerStream<T>
where
    T: Clone + Send + 'static,
{
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            if let Poll::Ready(item) = this.rx.poll_next_unpin(cx) {
                if item.is_none() {
                    this.done = true;
                    this.shared.waiters.remove(this.id);
                }
                return Poll::Ready(item);
            }

            if this.shared.pull(this.id, cx).is_pending() {
                return Poll::Pending;
            }
        }
    }
}

impl<T> FusedStream for ConsumerStream<T>
where
    T: Clone + Send + 'static,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for ConsumerStream<T> {
    fn drop(&mut self) {
        let remaining = {
            let mut registry = self.shared.registry.lock();
            registry.consumers.remove(&self.id);
            registry.consumers.len()
        };
        self.shared.waiters.remove(self.id);
        if !self.done {
            debug!(
                consumer_id = self.id,
                remaining, "multi-consumer: consumer cancelled"
            );
        }
    }
}

impl<T> fmt::Debug for ConsumerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
