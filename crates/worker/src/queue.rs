//! Bounded FIFO queues between the ingress task and the execution thread.
//!
//! `push` waits while the queue is full; nothing is ever dropped. Shutdown is a
//! watch signal: once raised, the consumer refuses new items and drains what is
//! already buffered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};

/// The consumer side is gone or shutting down; the item is handed back.
#[derive(Debug)]
pub struct QueueClosed<T>(pub T);

struct QueueCounters {
    enqueued: AtomicU64,
}

pub struct QueueProducer<T> {
    tx: mpsc::Sender<T>,
    counters: Arc<QueueCounters>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

pub struct EventQueue<T> {
    rx: mpsc::Receiver<T>,
    shutdown: watch::Receiver<bool>,
    draining: bool,
}

pub fn bounded<T>(
    capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> (QueueProducer<T>, EventQueue<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(QueueCounters {
        enqueued: AtomicU64::new(0),
    });
    (
        QueueProducer { tx, counters },
        EventQueue {
            rx,
            shutdown,
            draining: false,
        },
    )
}

impl<T> QueueProducer<T> {
    pub async fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        match self.tx.send(item).await {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => Err(QueueClosed(item)),
        }
    }

    /// Push from a plain thread. Must not be called from inside an async context.
    pub fn blocking_push(&self, item: T) -> Result<(), QueueClosed<T>> {
        match self.tx.blocking_send(item) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => Err(QueueClosed(item)),
        }
    }

    /// Items buffered in the channel. Producers waiting for capacity are not
    /// counted.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Items accepted since the queue was created.
    pub fn enqueued(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }
}

impl<T> EventQueue<T> {
    /// Up to `max` items. Waits only while the queue is empty; an empty result
    /// means the queue is closed and fully drained.
    pub async fn pop_window(&mut self, max: usize) -> Vec<T> {
        let max = max.max(1);
        let mut window = Vec::with_capacity(max);

        if !self.draining {
            let shutdown = &mut self.shutdown;
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => window.push(item),
                    None => return window,
                },
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => {}
            }
            if window.is_empty() {
                self.begin_drain();
            }
        }

        if window.is_empty() {
            // Draining: a closed receiver yields buffered items, then None.
            match self.rx.recv().await {
                Some(item) => window.push(item),
                None => return window,
            }
        }

        while window.len() < max {
            match self.rx.try_recv() {
                Ok(item) => window.push(item),
                Err(_) => break,
            }
        }

        window
    }

    fn begin_drain(&mut self) {
        if !self.draining {
            self.draining = true;
            self.rx.close();
            tracing::debug!("queue draining {} buffered items", self.depth());
        }
    }

    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn window_is_fifo_and_bounded() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (producer, mut queue) = bounded(16, stop_rx);
        for i in 0..5 {
            producer.push(i).await.expect("push");
        }
        assert_eq!(queue.depth(), 5);
        assert_eq!(queue.pop_window(3).await, vec![0, 1, 2]);
        assert_eq!(queue.pop_window(10).await, vec![3, 4]);
        assert_eq!(queue.depth(), 0);
        assert_eq!(producer.enqueued(), 5);
    }

    #[tokio::test]
    async fn push_waits_for_capacity() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (producer, mut queue) = bounded(1, stop_rx);
        producer.push(1).await.expect("push");

        let blocked = tokio::spawn({
            let producer = producer.clone();
            async move { producer.push(2).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        // The waiting producer is not a queued item.
        assert_eq!(producer.depth(), 1);
        assert_eq!(queue.depth(), 1);

        assert_eq!(queue.pop_window(1).await, vec![1]);
        blocked.await.expect("join").expect("push");
        assert_eq!(queue.pop_window(1).await, vec![2]);
    }

    #[tokio::test]
    async fn shutdown_drains_then_reports_empty() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (producer, mut queue) = bounded(8, stop_rx);
        producer.push("a").await.expect("push");
        producer.push("b").await.expect("push");
        stop_tx.send(true).expect("signal");

        let mut drained = Vec::new();
        loop {
            let window = queue.pop_window(1).await;
            if window.is_empty() {
                break;
            }
            drained.extend(window);
        }
        assert_eq!(drained, vec!["a", "b"]);
        assert!(producer.push("c").await.is_err());
    }

    #[tokio::test]
    async fn empty_queue_wakes_on_shutdown() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (_producer, mut queue) = bounded::<u32>(8, stop_rx);
        let waiter = tokio::spawn(async move { queue.pop_window(4).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).expect("signal");
        let window = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woke")
            .expect("join");
        assert!(window.is_empty());
    }
}
