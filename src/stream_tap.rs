//! A rebindable stream fan-out primitive.
//!
//! `StreamTap` exposes a single, never-closing outbound stream whose
//! upstream source can be swapped out at runtime. The supervisor uses one to
//! present a stable event stream to its callers across server restarts: each
//! time a fresh [`crate::initializer::LazyInitializer`] is spawned, the tap
//! is rebound to that incarnation's event stream without the outward
//! receiver ever seeing a gap become a close.
//!
//! The forwarder runs as a `tokio::spawn`ed task reading from the bound
//! source and pushing each item through an `mpsc::unbounded_channel`;
//! rebinding swaps which task is live by aborting the previous one and
//! spawning a new one against the new source.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type OnValue<T> = Arc<dyn Fn(T) -> BoxFuture<T> + Send + Sync>;

fn noop_on_value<T: Send + 'static>() -> OnValue<T> {
    Arc::new(|value: T| Box::pin(async move { value }))
}

/// A rebindable many-to-one stream fan-out.
///
/// Construction gives you both the tap and the outbound stream it feeds;
/// the outbound stream is created once and outlives any number of
/// `set_source` calls.
pub struct StreamTap<T> {
    outbound: mpsc::UnboundedSender<T>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl<T> StreamTap<T>
where
    T: Send + 'static,
{
    /// Create a tap with no source bound yet. The returned stream never
    /// closes on its own — it only yields items once a source is bound via
    /// [`Self::set_source`], and keeps yielding across rebinds.
    pub fn new() -> (Self, UnboundedReceiverStream<T>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound,
                forwarder: Mutex::new(None),
            },
            UnboundedReceiverStream::new(rx),
        )
    }

    /// Atomically cancel the previous forwarder (if any) and start forwarding
    /// from `source` instead.
    ///
    /// For each item pulled from `source`, `on_value` is awaited first (for
    /// side effects, e.g. observing the item), and its return value —
    /// ordinarily the same item, unchanged — is what gets forwarded
    /// downstream.
    pub async fn set_source<S>(&self, source: S)
    where
        S: Stream<Item = T> + Send + Unpin + 'static,
    {
        self.set_source_with(source, noop_on_value()).await;
    }

    /// As [`Self::set_source`], but with an explicit `on_value` hook.
    pub async fn set_source_with<S>(&self, source: S, on_value: OnValue<T>) {
        self.set_source_with_impl(source, on_value).await;
    }

    async fn set_source_with_impl<S>(&self, mut source: S, on_value: OnValue<T>)
    where
        S: Stream<Item = T> + Send + Unpin + 'static,
    {
        let outbound = self.outbound.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                let item = on_value(item).await;
                if outbound.send(item).is_err() {
                    break;
                }
            }
        });

        let previous = {
            let mut guard = self.forwarder.lock().await;
            guard.replace(handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop forwarding entirely. The outbound stream remains open but idle
    /// until a new source is bound.
    pub async fn clear_source(&self) {
        let previous = {
            let mut guard = self.forwarder.lock().await;
            guard.take()
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl<T> Drop for StreamTap<T> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.forwarder.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::UnboundedReceiverStream as RxStream;

    #[tokio::test]
    async fn forwards_items_from_bound_source() {
        let (tap, mut out) = StreamTap::<u32>::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tap.set_source(RxStream::new(rx)).await;

        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert_eq!(out.next().await, Some(1));
        assert_eq!(out.next().await, Some(2));
    }

    #[tokio::test]
    async fn rebinding_cancels_previous_source() {
        let (tap, mut out) = StreamTap::<u32>::new();

        let (tx1, rx1) = mpsc::unbounded_channel();
        tap.set_source(RxStream::new(rx1)).await;

        let (tx2, rx2) = mpsc::unbounded_channel();
        tap.set_source(RxStream::new(rx2)).await;

        // tx1 is now orphaned; nothing sent on it should ever surface.
        tx1.send(999).unwrap();
        tx2.send(7).unwrap();

        assert_eq!(out.next().await, Some(7));
    }

    #[tokio::test]
    async fn on_value_hook_observes_each_item() {
        let (tap, mut out) = StreamTap::<u32>::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let seen: Arc<std::sync::Mutex<Vec<u32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let on_value: OnValue<u32> = Arc::new(move |v: u32| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(v);
                v
            })
        });

        tap.set_source_with(RxStream::new(rx), on_value).await;
        tx.send(5).unwrap();

        assert_eq!(out.next().await, Some(5));
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }
}
