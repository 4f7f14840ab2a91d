use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::scaling::{ScaleDecision, ScalingPolicy};
use crate::transmitter::Transmitter;

struct Worker {
    id: usize,
    retire: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the transmitter pool and resizes it from queue depth samples.
pub struct Dispatcher {
    policy: ScalingPolicy,
    transmitter: Arc<Transmitter>,
    workers: Vec<Worker>,
    next_id: usize,
    sample_interval: Duration,
    shutdown_timeout: Duration,
    batch_size: usize,
    abandon: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(transmitter: Arc<Transmitter>, pool: &PoolConfig) -> Self {
        Dispatcher {
            policy: ScalingPolicy::new(pool),
            transmitter,
            workers: Vec::new(),
            next_id: 0,
            sample_interval: pool.sample_interval,
            shutdown_timeout: pool.shutdown_timeout,
            batch_size: pool.batch_size.max(1),
            abandon: CancellationToken::new(),
        }
    }

    /// Runs the pool until `cxl` fires, then shuts it down and flushes the
    /// queue to the dump.
    pub fn spawn(self, cxl: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cxl))
    }

    async fn run(mut self, cxl: CancellationToken) {
        self.refill();

        let mut interval = tokio::time::interval(self.sample_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cxl.cancelled() => break,
                _ = interval.tick() => self.sample().await,
            }
        }

        self.shutdown().await;
    }

    async fn sample(&mut self) {
        let (finished, live): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|worker| worker.handle.is_finished());
        self.workers = live;
        for worker in finished {
            match worker.handle.await {
                Ok(()) => warn!(id = worker.id, "transmitter exited unexpectedly"),
                Err(err) => error!(%err, id = worker.id, "transmitter died"),
            }
        }
        self.refill();

        let depth = self.transmitter.queue().depth();
        match self.policy.observe(depth, self.workers.len()) {
            ScaleDecision::Grow => {
                self.grow();
                info!(depth, workers = self.workers.len(), "grew transmitter pool");
            }
            ScaleDecision::Shrink => {
                self.retire_one().await;
                info!(depth, workers = self.workers.len(), "shrank transmitter pool");
            }
            ScaleDecision::Hold => {}
        }

        let stats = self.transmitter.stats();
        stats.set_queue_depth(depth);
        stats.set_pool_size(self.workers.len());
    }

    fn refill(&mut self) {
        while self.workers.len() < self.policy.min_workers() {
            self.grow();
        }
        self.transmitter.stats().set_pool_size(self.workers.len());
    }

    fn grow(&mut self) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let retire = CancellationToken::new();
        let handle =
            tokio::spawn(self.transmitter.clone().run(id, retire.clone(), self.abandon.clone()));

        self.workers.push(Worker { id, retire, handle });
    }

    /// Signals the newest worker and waits until it has settled its batch.
    async fn retire_one(&mut self) {
        let Some(worker) = self.workers.pop() else {
            return;
        };

        worker.retire.cancel();
        if let Err(err) = worker.handle.await {
            error!(%err, id = worker.id, "transmitter died while retiring");
        }
    }

    async fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.retire.cancel();
        }

        let (ids, handles): (Vec<_>, Vec<_>) =
            self.workers.drain(..).map(|worker| (worker.id, worker.handle)).unzip();
        let mut pending = std::pin::pin!(futures::future::join_all(handles));
        let results = match tokio::time::timeout(self.shutdown_timeout, pending.as_mut()).await {
            Ok(results) => results,
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "transmitters still busy; abandoning in-flight writes");
                self.abandon.cancel();
                pending.await
            }
        };
        for (id, result) in ids.into_iter().zip(results) {
            if let Err(err) = result {
                error!(%err, id, "transmitter died during shutdown; its batch is lost");
            }
        }

        let leftover = self.transmitter.queue().drain().await;
        if !leftover.is_empty() {
            info!(points = leftover.len(), "flushing collect queue to dump");
        }
        for chunk in leftover.chunks(self.batch_size) {
            self.transmitter.dump_batch(chunk).await;
        }

        let stats = self.transmitter.stats();
        stats.set_pool_size(0);
        stats.set_queue_depth(0);
        if let Ok(bytes) = self.transmitter.dump().len_bytes().await {
            stats.set_dump_bytes(bytes);
        }
    }
}
