use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::point::{Batch, DataPoint};

/// Bounded FIFO between spool watchers and transmitters.
///
/// Producers wait while the queue is full. Consumers take batches through
/// [`CollectQueue::next_batch`]; only one consumer assembles a batch at a time
/// so points leave in the order they were enqueued.
#[derive(Debug)]
pub struct CollectQueue {
    tx: mpsc::Sender<DataPoint>,
    rx: Mutex<mpsc::Receiver<DataPoint>>,
}

impl CollectQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);

        CollectQueue { tx, rx: Mutex::new(rx) }
    }

    /// Appends a point, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Errors if the receiving side has been dropped.
    pub async fn enqueue(&self, point: DataPoint) -> Result<(), QueueClosed> {
        self.tx.send(point).await.map_err(|_| QueueClosed)
    }

    /// Points currently waiting.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Waits for at least one point, then keeps collecting until `max` points
    /// are gathered or `linger` has passed since the first one arrived.
    ///
    /// Returns `None` if `stop` fires before any point arrives. If `stop`
    /// fires mid-batch the points gathered so far are returned.
    pub async fn next_batch(
        &self,
        max: usize,
        linger: Duration,
        stop: &CancellationToken,
    ) -> Option<Batch> {
        let max = max.max(1);
        let mut rx = tokio::select! {
            biased;

            () = stop.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };

        let mut batch = Vec::with_capacity(max.min(1024));
        tokio::select! {
            biased;

            () = stop.cancelled() => return None,
            received = rx.recv_many(&mut batch, max) => {
                if received == 0 {
                    return None;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + linger;
        while batch.len() < max {
            let remaining = max.saturating_sub(batch.len());
            tokio::select! {
                biased;

                () = stop.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => break,
                received = rx.recv_many(&mut batch, remaining) => {
                    if received == 0 {
                        break;
                    }
                }
            }
        }

        Some(batch)
    }

    /// Removes everything currently queued without waiting.
    pub async fn drain(&self) -> Batch {
        let mut rx = self.rx.lock().await;
        let mut points = Vec::with_capacity(self.depth());
        while let Ok(point) = rx.try_recv() {
            points.push(point);
        }

        points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Collect queue closed")]
pub struct QueueClosed;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn point(i: i64) -> DataPoint {
        DataPoint::new(format!("p{i}"), i, 1.0)
    }

    #[tokio::test]
    async fn batch_fills_to_max() {
        let queue = CollectQueue::new(16);
        for i in 0..5 {
            queue.enqueue(point(i)).await.unwrap();
        }

        let batch = queue
            .next_batch(3, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        let times: Vec<_> = batch.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(times, [0, 1, 2]);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_after_linger() {
        let queue = CollectQueue::new(16);
        queue.enqueue(point(7)).await.unwrap();

        let batch = queue
            .next_batch(100, Duration::from_millis(500), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch, [point(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_point() {
        let queue = CollectQueue::new(4);
        let stop = CancellationToken::new();
        stop.cancel();

        assert!(queue.next_batch(10, Duration::from_secs(1), &stop).await.is_none());
    }

    #[tokio::test]
    async fn blocked_producer_resumes_once_consumer_drains() {
        let queue = Arc::new(CollectQueue::new(2));
        let producer = tokio::spawn({
            let queue = queue.clone();
            async move {
                for i in 0..6 {
                    queue.enqueue(point(i)).await.unwrap();
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.depth(), 2);

        let mut received = Vec::new();
        while received.len() < 6 {
            let batch = queue
                .next_batch(6, Duration::from_millis(5), &CancellationToken::new())
                .await
                .unwrap();
            received.extend(batch);
        }
        producer.await.unwrap();

        assert_eq!(received, (0..6).map(point).collect::<Vec<_>>());
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn drain_preserves_order() {
        let queue = CollectQueue::new(8);
        for i in 0..4 {
            queue.enqueue(point(i)).await.unwrap();
        }

        let drained = queue.drain().await;

        assert_eq!(drained, (0..4).map(point).collect::<Vec<_>>());
        assert_eq!(queue.depth(), 0);
    }
}
