//! Turning stream errors into a final item.
//!
//! Consumers that want to present a failure as part of the data (for example
//! an abort marker once a run was cancelled) can intercept the first error
//! of a stream and decide what to emit instead.

use crate::error::{StreamError, StreamResult};
use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

/// What to do with an intercepted error.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery<T> {
    /// Emit this item in place of the error, then end.
    Replace(T),
    /// Forward this error, then end.
    Propagate(StreamError),
    /// End quietly.
    End,
}

pin_project! {
    /// Stream that hands its first error to a handler and ends afterwards.
    pub struct RecoverStream<S, F> {
        #[pin]
        inner: S,
        handler: F,
        finished: bool,
    }
}

impl<S, F> RecoverStream<S, F> {
    /// Create a new recovering stream.
    pub fn new(inner: S, handler: F) -> Self {
        Self {
            inner,
            handler,
            finished: false,
        }
    }
}

impl<S, F, T> Stream for RecoverStream<S, F>
where
    S: Stream<Item = StreamResult<T>>,
    F: FnMut(StreamError) -> Recovery<T>,
{
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.finished {
            return Poll::Ready(None);
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(err))) => {
                *this.finished = true;
                match (this.handler)(err) {
                    Recovery::Replace(item) => Poll::Ready(Some(Ok(item))),
                    Recovery::Propagate(err) => Poll::Ready(Some(Err(err))),
                    Recovery::End => Poll::Ready(None),
                }
            }
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extension trait for error recovery on fallible streams.
pub trait StreamRecoverExt<T>: Stream<Item = StreamResult<T>> + Sized {
    /// Intercept the first error with `handler`.
    fn recover_with<F>(self, handler: F) -> RecoverStream<Self, F>
    where
        F: FnMut(StreamError) -> Recovery<T>,
    {
        RecoverStream::new(self, handler)
    }
}

impl<S, T> StreamRecoverExt<T> for S where S: Stream<Item = StreamResult<T>> + Sized {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use pretty_assertions::assert_eq;

    fn failing() -> impl Stream<Item = StreamResult<&'static str>> {
        stream::iter(vec![
            Ok("text"),
            Err(StreamError::Source("aborted".into())),
            Ok("unreachable"),
        ])
    }

    #[tokio::test]
    async fn test_replace_error() {
        let items: Vec<_> = failing()
            .recover_with(|err| match err {
                StreamError::Source(_) => Recovery::Replace("abort"),
                other => Recovery::Propagate(other),
            })
            .collect()
            .await;

        assert_eq!(items, vec![Ok("text"), Ok("abort")]);
    }

    #[tokio::test]
    async fn test_propagate_error() {
        let items: Vec<_> = failing().recover_with(Recovery::Propagate).collect().await;
        assert_eq!(
            items,
            vec![Ok("text"), Err(StreamError::Source("aborted".into()))]
        );
    }

    #[tokio::test]
    async fn test_end_quietly() {
        let items: Vec<_> = failing().recover_with(|_| Recovery::End).collect().await;
        assert_eq!(items, vec![Ok("text")]);
    }

    #[tokio::test]
    async fn test_clean_stream_passes_through() {
        let clean = stream::iter(vec![Ok::<_, StreamError>(1), Ok(2)]);
        let items: Vec<_> = clean.recover_with(|_| Recovery::End).collect().await;
        assert_eq!(items, vec![Ok(1), Ok(2)]);
    }
}
