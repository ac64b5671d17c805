//! Duplicating a stream into independent branches.
//!
//! Teeing is just a [`MultiConsumerStream`] with consumers split off before
//! anything is read, so every branch sees the full stream.

use crate::error::StreamResult;
use crate::multi_consumer::{ConsumerStream, MultiConsumerStream};
use futures::Stream;

/// Split a stream into two branches that each receive every item.
///
/// The typical use is storing one branch while forwarding the other live.
pub fn tee<S, T>(stream: S) -> (ConsumerStream<T>, ConsumerStream<T>)
where
    S: Stream<Item = StreamResult<T>> + Send + 'static,
    T: Clone + Send + 'static,
{
    let shared = MultiConsumerStream::new(stream);
    (shared.split(), shared.split())
}

/// Extension trait for sharing fallible streams between consumers.
pub trait StreamFanOutExt<T>: Stream<Item = StreamResult<T>> + Sized + Send + 'static
where
    T: Clone + Send + 'static,
{
    /// Wrap this stream so it can be split into any number of consumers.
    fn multi_consumer(self) -> MultiConsumerStream<T> {
        MultiConsumerStream::new(self)
    }

    /// Split this stream into two full branches.
    fn tee(self) -> (ConsumerStream<T>, ConsumerStream<T>) {
        tee(self)
    }
}

impl<S, T> StreamFanOutExt<T> for S
where
    S: Stream<Item = StreamResult<T>> + Sized + Send + 'static,
    T: Clone + Send + 'static,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use futures::{stream, StreamExt};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_tee_branches_are_complete() {
        let (stored, live) = tee(stream::iter(vec![Ok(1), Ok(2), Ok(3)]));

        let live: Vec<_> = live.collect().await;
        let stored: Vec<_> = stored.collect().await;
        assert_eq!(live, vec![Ok(1), Ok(2), Ok(3)]);
        assert_eq!(stored, live);
    }

    #[tokio::test]
    async fn test_dropped_branch_does_not_block_other() {
        let (stored, live) = stream::iter(vec![Ok::<_, StreamError>("a"), Ok("b")]).tee();
        drop(stored);

        let live: Vec<_> = live.collect().await;
        assert_eq!(live, vec![Ok("a"), Ok("b")]);
    }

    #[tokio::test]
    async fn test_multi_consumer_ext() {
        let shared = stream::iter(vec![Ok::<_, StreamError>('x')]).multi_consumer();
        let branches: Vec<_> = (0..3).map(|_| shared.split()).collect();
        for branch in branches {
            assert_eq!(branch.collect::<Vec<_>>().await, vec![Ok('x')]);
        }
    }
}
