//! Live subscriber streams.
//!
//! [`FrameStream`] adapts a broadcast receiver into a `futures::Stream`
//! for UI-style consumers. Subscribers are independent of the durable
//! sinks: a lagging subscriber loses the oldest frames (the broadcast
//! ring overwrites them) and the loss is counted, never propagated
//! upstream; it is the same drop-oldest discipline the dispatcher applies to
//! sinks.
//!
//! [`ThrottleLatest`] bounds how often a consumer sees updates. Between
//! emissions it keeps only the newest frame, which is what a display
//! refreshing every few hundred milliseconds wants.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::broadcast;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use crate::types::Frame;

/// Stream of frames for one subscriber.
pub struct FrameStream {
    inner: BroadcastStream<Arc<Frame>>,
    lagged: u64,
}

impl FrameStream {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<Frame>>) -> Self {
        Self { inner: BroadcastStream::new(rx), lagged: 0 }
    }

    /// Frames this subscriber has missed by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Throttle to at most one frame per interval, keeping the newest.
    pub fn throttle_latest(self, interval: Duration) -> ThrottleLatest<Self> {
        ThrottleLatest::new(self, interval)
    }
}

impl Stream for FrameStream {
    type Item = Arc<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(frame)) => return Poll::Ready(Some(frame)),
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    self.lagged += n;
                    debug!(missed = n, total = self.lagged, "subscriber lagging, frames dropped");
                    // Keep polling; the receiver resumes at the oldest
                    // retained frame
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

pin_project! {
    /// Rate limiter that keeps only the newest pending item.
    pub struct ThrottleLatest<S: Stream> {
        #[pin]
        stream: S,
        ticker: Interval,
        pending: Option<S::Item>,
        done: bool,
    }
}

impl<S: Stream> ThrottleLatest<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        let mut ticker = interval(period);
        // A late consumer should not get a burst of stale ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { stream, ticker, pending: None, done: false }
    }
}

impl<S: Stream> Stream for ThrottleLatest<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain everything available right now, keeping the newest
        while !*this.done {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => *this.done = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_some() {
            ready!(this.ticker.poll_tick(cx));
            return Poll::Ready(this.pending.take());
        }

        if *this.done { Poll::Ready(None) } else { Poll::Pending }
    }
}
