//! Rate-limited telemetry sampling

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

/// Extension trait to add sampling to any Stream
///
/// The sampled stream holds a timer and is `!Unpin`; pin it (`Box::pin`)
/// before calling `StreamExt::next`.
pub trait SampleExt: Stream {
    /// Emit at most one item per `period`.
    ///
    /// Latest wins: items arriving while the gate is closed replace each
    /// other. An item arriving after a quiet period passes straight through,
    /// and a pending item is flushed when the source ends.
    fn sample(self, period: Duration) -> Sample<Self>
    where
        Self: Sized,
    {
        Sample::new(self, period)
    }
}

impl<T: Stream> SampleExt for T {}

pin_project! {
    /// Stream returned by [`SampleExt::sample`]
    pub struct Sample<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        gate: Sleep,
        period: Duration,
        latest: Option<S::Item>,
        done: bool,
    }
}

impl<S: Stream> Sample<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        Self { stream, gate: sleep(Duration::ZERO), period, latest: None, done: false }
    }
}

impl<S: Stream> Stream for Sample<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if !*this.done {
            loop {
                match this.stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(item)) => *this.latest = Some(item),
                    Poll::Ready(None) => {
                        *this.done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if *this.done {
            return Poll::Ready(this.latest.take());
        }
        if this.latest.is_none() {
            return Poll::Pending;
        }

        ready!(this.gate.as_mut().poll(cx));
        this.gate.as_mut().reset(Instant::now() + *this.period);
        Poll::Ready(this.latest.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn first_item_passes_then_latest_wins() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sampled = Box::pin(UnboundedReceiverStream::new(rx).sample(Duration::from_millis(100)));

        tx.send(1).unwrap();
        assert_eq!(sampled.next().await, Some(1));

        let started = Instant::now();
        for i in 2..=5 {
            tx.send(i).unwrap();
        }
        assert_eq!(sampled.next().await, Some(5));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_item_flushes_at_end() {
        let sampled = futures::stream::iter(vec![1, 2, 3]).sample(Duration::from_secs(10));
        let items: Vec<i32> = sampled.collect().await;
        assert_eq!(items, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_source_is_not_delayed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sampled = Box::pin(UnboundedReceiverStream::new(rx).sample(Duration::from_millis(100)));

        tx.send(1).unwrap();
        assert_eq!(sampled.next().await, Some(1));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        tx.send(2).unwrap();
        assert_eq!(sampled.next().await, Some(2));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
