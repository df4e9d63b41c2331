//! Message counting wrappers for the two halves of a channel
//!
//! [`wrap`] puts a [`CountingSink`] around the send half and a
//! [`CountingStream`] around the receive half of a channel. Both forward every
//! operation unchanged and share one [`MessageCounts`].
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures_lite::Stream;
use futures_sink::Sink;
use pin_project::pin_project;

/// Number of messages that went through a pair of counting wrappers.
#[derive(Debug, Default)]
pub struct MessageCounts {
    received: AtomicU64,
    sent: AtomicU64,
}

impl MessageCounts {
    /// Messages successfully received
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages successfully sent
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Wrap the halves of a channel so that successful transfers are counted.
pub fn wrap<Si, St>(send: Si, recv: St) -> (CountingSink<Si>, CountingStream<St>, Arc<MessageCounts>) {
    let counts = Arc::new(MessageCounts::default());
    (
        CountingSink::new(send, Arc::clone(&counts)),
        CountingStream::new(recv, Arc::clone(&counts)),
        counts,
    )
}

/// A sink that counts the items the inner sink has delivered.
///
/// Sinks may buffer an item in `start_send` and only report a failure to
/// deliver it from a later `poll_ready`, `poll_flush` or `poll_close`. So an
/// item is pending after `start_send`, and counts as sent once one of those
/// returns `Ready(Ok)`. Pending items are dropped from the count if it returns
/// an error instead.
#[pin_project]
#[derive(Debug)]
pub struct CountingSink<Si> {
    #[pin]
    inner: Si,
    counts: Arc<MessageCounts>,
    pending: u64,
}

impl<Si> CountingSink<Si> {
    /// Wrap a sink, counting into `counts`
    pub fn new(inner: Si, counts: Arc<MessageCounts>) -> Self {
        Self {
            inner,
            counts,
            pending: 0,
        }
    }

    /// The shared counters
    pub fn counts(&self) -> &Arc<MessageCounts> {
        &self.counts
    }

    /// Get the wrapped sink back
    pub fn into_inner(self) -> Si {
        self.inner
    }
}

impl<Si: Sink<T>, T> Sink<T> for CountingSink<Si> {
    type Error = Si::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let res = this.inner.poll_ready(cx);
        settle(this.counts, this.pending, res)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let this = self.project();
        this.inner.start_send(item)?;
        *this.pending += 1;
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let res = this.inner.poll_flush(cx);
        settle(this.counts, this.pending, res)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let res = this.inner.poll_close(cx);
        settle(this.counts, this.pending, res)
    }
}

/// Count or drop the pending items once the inner sink has reported on them
fn settle<E>(
    counts: &MessageCounts,
    pending: &mut u64,
    res: Poll<Result<(), E>>,
) -> Poll<Result<(), E>> {
    if let Poll::Ready(res) = &res {
        let delivered = std::mem::take(pending);
        if res.is_ok() {
            counts.sent.fetch_add(delivered, Ordering::Relaxed);
        }
    }
    res
}

/// A stream of results that counts the `Ok` items it yields.
///
/// The end of the stream and `Err` items are passed through without counting.
#[pin_project]
#[derive(Debug)]
pub struct CountingStream<St> {
    #[pin]
    inner: St,
    counts: Arc<MessageCounts>,
}

impl<St> CountingStream<St> {
    /// Wrap a stream, counting into `counts`
    pub fn new(inner: St, counts: Arc<MessageCounts>) -> Self {
        Self { inner, counts }
    }

    /// The shared counters
    pub fn counts(&self) -> &Arc<MessageCounts> {
        &self.counts
    }

    /// Get the wrapped stream back
    pub fn into_inner(self) -> St {
        self.inner
    }
}

impl<St, T, E> Stream for CountingStream<St>
where
    St: Stream<Item = Result<T, E>>,
{
    type Item = St::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let res = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(_))) = &res {
            this.counts.received.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
