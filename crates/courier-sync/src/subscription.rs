//! Cancelable handles for live streams.
//!
//! Every realtime read returns a [`Subscription`]: updates arrive through an
//! unbounded channel and the producer is torn down by [`Subscription::cancel`]
//! or by dropping the handle.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type CancelFn = Box<dyn FnOnce() + Send>;

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    task: Option<JoinHandle<()>>,
    on_cancel: Option<CancelFn>,
}

impl<T: Send + 'static> Subscription<T> {
    /// Run `producer` on its own task.  The task is aborted on cancel.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedSender<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(producer(tx));
        Self {
            rx,
            task: Some(task),
            on_cancel: None,
        }
    }
}

impl<T> Subscription<T> {
    /// Wrap a receiver fed by someone else; `on_cancel` releases whatever
    /// feeds it.
    pub fn with_cancel(rx: mpsc::UnboundedReceiver<T>, on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            task: None,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Feed this stream's items through `transform` into a new stream.
    /// Cancelling the new stream releases this one's producer right away,
    /// not when the transform task next gets polled.
    pub fn pipe<U, F, Fut>(mut self, transform: F) -> Subscription<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnOnce(mpsc::UnboundedReceiver<T>, mpsc::UnboundedSender<U>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let upstream_task = self.task.take();
        let upstream_release = self.on_cancel.take();
        let (_, closed) = mpsc::unbounded_channel();
        let upstream = std::mem::replace(&mut self.rx, closed);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(transform(upstream, tx));
        Subscription {
            rx,
            task: Some(task),
            on_cancel: Some(Box::new(move || {
                if let Some(task) = upstream_task {
                    task.abort();
                }
                if let Some(release) = upstream_release {
                    release();
                }
            })),
        }
    }

    /// Next update, or `None` once the producer is finished or cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next update if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop the producer and release the underlying listener.  Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(release) = self.on_cancel.take() {
            release();
        }
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_none() && self.on_cancel.is_none()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn spawned_producer_feeds_the_stream() {
        let sub = Subscription::spawn(|tx| async move {
            for i in 0..3 {
                let _ = tx.send(i);
            }
        });
        let items: Vec<i32> = sub.collect().await;
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancel_runs_release_once() {
        let released = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel::<u8>();
        let flag = Arc::clone(&released);
        let mut sub = Subscription::with_cancel(rx, move || flag.store(true, Ordering::SeqCst));

        tx.send(1).unwrap();
        assert_eq!(sub.recv().await, Some(1));

        sub.cancel();
        assert!(released.load(Ordering::SeqCst));
        assert!(sub.is_cancelled());
        assert!(tx.send(2).is_err());
        sub.cancel();
    }

    #[tokio::test]
    async fn piped_cancel_releases_upstream_immediately() {
        let released = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel::<u8>();
        let flag = Arc::clone(&released);
        let upstream = Subscription::with_cancel(rx, move || flag.store(true, Ordering::SeqCst));

        let mut doubled = upstream.pipe(|mut rx, out| async move {
            while let Some(n) = rx.recv().await {
                let _ = out.send(u16::from(n) * 2);
            }
        });
        tx.send(21).unwrap();
        assert_eq!(doubled.recv().await, Some(42));

        doubled.cancel();
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drop_aborts_the_producer() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let sub = Subscription::<u8>::spawn(move |_tx| async move {
            let _guard = done_tx;
            std::future::pending::<()>().await;
        });
        drop(sub);
        // The sender inside the aborted task is dropped with it.
        assert_eq!(done_rx.recv().await, None);
    }
}
