use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::dump::DumpFile;
use crate::line_protocol::encode_batch;
use crate::point::{Batch, DataPoint};
use crate::queue::CollectQueue;
use crate::stats::PipelineStats;

/// Result of one write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// The destination could not take the batch right now. It goes to the
    /// dump and is replayed later.
    Retryable(String),
    /// The destination will never accept this batch.
    Fatal(String),
}

/// Something that accepts line-protocol bodies.
pub trait Destination: Send + Sync {
    fn write(&self, body: String) -> BoxFuture<'_, Outcome>;

    /// Cheap reachability check used before replaying the dump.
    fn ping(&self) -> BoxFuture<'_, bool>;
}

/// Last known reachability of the destination. Starts out down so the first
/// replay pass pings before sending.
#[derive(Debug, Default)]
pub struct DestinationHealth {
    up: AtomicBool,
}

impl DestinationHealth {
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Returns the previous state.
    pub fn mark_up(&self) -> bool {
        self.up.swap(true, Ordering::Relaxed)
    }

    /// Returns the previous state.
    pub fn mark_down(&self) -> bool {
        self.up.swap(false, Ordering::Relaxed)
    }
}

/// Shared state of all transmitter workers.
pub struct Transmitter {
    queue: Arc<CollectQueue>,
    dump: Arc<DumpFile>,
    destination: Arc<dyn Destination>,
    health: Arc<DestinationHealth>,
    stats: Arc<PipelineStats>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl Transmitter {
    #[must_use]
    pub fn new(
        queue: Arc<CollectQueue>,
        dump: Arc<DumpFile>,
        destination: Arc<dyn Destination>,
        health: Arc<DestinationHealth>,
        stats: Arc<PipelineStats>,
        pool: &PoolConfig,
    ) -> Self {
        Transmitter {
            queue,
            dump,
            destination,
            health,
            stats,
            batch_size: pool.batch_size,
            batch_timeout: pool.batch_timeout,
        }
    }

    pub(crate) fn queue(&self) -> &Arc<CollectQueue> {
        &self.queue
    }

    pub(crate) fn dump(&self) -> &Arc<DumpFile> {
        &self.dump
    }

    pub(crate) fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Sends one batch without touching the dump or stats.
    pub async fn transmit(&self, batch: &[DataPoint]) -> Outcome {
        let body = encode_batch(batch);
        if body.is_empty() {
            return Outcome::Delivered;
        }

        self.destination.write(body).await
    }

    /// Worker loop. Exits once `retire` fires and the batch in hand is settled.
    ///
    /// `abandon` cuts an in-flight write short; the batch is then dumped.
    pub(crate) async fn run(
        self: Arc<Self>,
        id: usize,
        retire: CancellationToken,
        abandon: CancellationToken,
    ) {
        debug!(id, "transmitter started");

        while let Some(batch) =
            self.queue.next_batch(self.batch_size, self.batch_timeout, &retire).await
        {
            self.settle(batch, &abandon).await;
        }

        debug!(id, "transmitter retired");
    }

    async fn settle(&self, batch: Batch, abandon: &CancellationToken) {
        let points = batch.len();
        let outcome = tokio::select! {
            biased;

            outcome = self.transmit(&batch) => outcome,
            () = abandon.cancelled() => Outcome::Retryable("Shutdown deadline reached".to_string()),
        };

        match outcome {
            Outcome::Delivered => {
                if !self.health.mark_up() {
                    info!("destination reachable");
                }
                self.stats.record_delivered(points);
            }
            Outcome::Retryable(reason) => {
                match self.health.mark_down() {
                    true => warn!(%reason, points, "destination unavailable; dumping batches"),
                    false => debug!(%reason, points, "dumping batch"),
                }
                self.dump_batch(&batch).await;
            }
            Outcome::Fatal(reason) => {
                error!(%reason, points, "destination rejected batch; dropping");
                self.stats.record_dropped(points);
            }
        }
    }

    pub(crate) async fn dump_batch(&self, batch: &[DataPoint]) {
        match self.dump.append(batch).await {
            Ok(()) => self.stats.record_dumped(batch.len()),
            Err(err) => {
                error!(%err, points = batch.len(), "dump append failed; batch lost");
                self.stats.record_dump_failure(batch.len());
            }
        }
    }
}
