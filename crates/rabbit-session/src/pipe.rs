//! Byte-level duplex adapter over a queue.
//!
//! Writing publishes each chunk as one message; reading yields the body of each
//! message consumed from the queue. Useful for plugging a queue into code that
//! speaks `Stream`/`Sink` of bytes.

use crate::error::SessionError;
use crate::options::{ConsumeOptions, TopicFilters};
use crate::session::QueueHandle;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Sink, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

pub struct QueuePipe {
    queue: QueueHandle,
    reader: Option<BoxStream<'static, Result<Bytes, SessionError>>>,
    in_flight: Option<BoxFuture<'static, Result<(), SessionError>>>,
}

impl QueuePipe {
    pub(crate) fn new(queue: QueueHandle) -> Self {
        Self {
            queue,
            reader: None,
            in_flight: None,
        }
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), SessionError>> {
        let Some(publish) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = futures::ready!(publish.poll_unpin(cx));
        self.in_flight = None;
        Poll::Ready(result)
    }
}

impl Stream for QueuePipe {
    type Item = Result<Bytes, SessionError>;

    /// Subscribes with default options on first poll.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let queue = &this.queue;
        let reader = this.reader.get_or_insert_with(|| {
            queue
                .subscribe(ConsumeOptions::default(), TopicFilters::none())
                .into_stream()
                .map(|item| item.map(|message| message.bytes()))
                .boxed()
        });
        reader.poll_next_unpin(cx)
    }
}

impl Sink<Bytes> for QueuePipe {
    type Error = SessionError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let queue = this.queue.clone();
        this.in_flight = Some(async move { queue.publish(item).await }.boxed());
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }
}

impl fmt::Debug for QueuePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePipe")
            .field("queue", &self.queue.name())
            .field("reading", &self.reader.is_some())
            .field("writing", &self.in_flight.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "pipe_tests.rs"]
mod tests;
