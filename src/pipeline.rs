use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::dump::{DumpError, DumpFile, Replayer};
use crate::influx::{InfluxDestination, TransmitError};
use crate::livestatus::{Enricher, Livestatus};
use crate::parser::SpoolFormat;
use crate::queue::CollectQueue;
use crate::spool::{SpoolContext, SpoolError, SpoolWatcher};
use crate::stats::PipelineStats;
use crate::transmitter::{Destination, DestinationHealth, Transmitter};

/// A running collector: spool watchers, transmitter pool, dump replayer and
/// the optional Livestatus refresher.
pub struct Pipeline {
    cxl: CancellationToken,
    queue: Arc<CollectQueue>,
    stats: Arc<PipelineStats>,
    dump: Arc<DumpFile>,

    watchers: Vec<JoinHandle<()>>,
    replay: (CancellationToken, JoinHandle<()>),
    dispatcher: (CancellationToken, JoinHandle<()>),
    refresher: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Pipeline {
    /// Starts against the configured `InfluxDB`.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::start_with`]. Also errors if the HTTP client cannot be
    /// built. An unreachable `InfluxDB` is not an error: points go to the
    /// dump and a missing database is created once a ping succeeds.
    pub async fn start(cxl: CancellationToken, config: Config) -> Result<Self, StartError> {
        let destination = InfluxDestination::new(&config.influx)?;
        if let Err(err) = destination.ensure_database().await {
            warn!(%err, database = %config.influx.database, "cannot create database yet; retrying once InfluxDB answers pings");
        }

        Self::start_with(cxl, config, Arc::new(destination)).await
    }

    /// Starts every task, writing to `destination`. Cancelling `cxl` begins
    /// an orderly shutdown that [`Pipeline::join`] waits for.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid, a folder cannot be created or the
    /// dump cannot be opened.
    pub async fn start_with(
        cxl: CancellationToken,
        config: Config,
        destination: Arc<dyn Destination>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let folders = [
            config.spool.nagios_folder.as_deref(),
            config.spool.native_folder.as_deref(),
            config.spool.archive_folder.as_deref(),
        ];
        for folder in folders.into_iter().flatten() {
            create_folder(folder).await?;
        }

        let dump =
            Arc::new(DumpFile::open(config.dump.path.clone(), config.dump.read_timeout).await?);
        let queue = Arc::new(CollectQueue::new(config.pool.queue_capacity));
        let stats = Arc::new(PipelineStats::default());
        let health = Arc::new(DestinationHealth::default());

        let refresher_cxl = CancellationToken::new();
        let (enricher, refresher) = match config.livestatus.clone() {
            Some(livestatus) => {
                let livestatus = Arc::new(Livestatus::new(livestatus));
                if let Err(err) = livestatus.refresh().await {
                    warn!(%err, "initial livestatus refresh failed; points stay unenriched until it succeeds");
                }
                let handle = livestatus.clone().spawn_refresher(refresher_cxl.clone());

                (Some(livestatus as Arc<dyn Enricher>), Some((refresher_cxl, handle)))
            }
            None => (None, None),
        };

        let ctx = Arc::new(SpoolContext {
            enricher,
            ..SpoolContext::new(queue.clone(), stats.clone(), config.series.clone(), &config.spool)
        });
        let spools = [
            (config.spool.nagios_folder.clone(), SpoolFormat::Legacy, config.spool.nagios_workers),
            (config.spool.native_folder.clone(), SpoolFormat::Native, config.spool.native_workers),
        ];
        let mut watchers = Vec::new();
        for (folder, format, workers) in spools {
            let Some(folder) = folder else {
                continue;
            };

            let watcher = SpoolWatcher::new(folder, format, ctx.clone());
            watcher.recover_claims().await?;
            info!(folder = %watcher.folder().display(), ?format, workers, "watching spool folder");
            watchers.extend(watcher.spawn(workers, &cxl));
        }

        let transmitter = Arc::new(Transmitter::new(
            queue.clone(),
            dump.clone(),
            destination.clone(),
            health.clone(),
            stats.clone(),
            &config.pool,
        ));
        let dispatcher_cxl = CancellationToken::new();
        let dispatcher =
            Dispatcher::new(transmitter, &config.pool).spawn(dispatcher_cxl.clone());

        let replay_cxl = CancellationToken::new();
        let replayer = Replayer {
            dump: dump.clone(),
            queue: queue.clone(),
            destination,
            health,
            stats: stats.clone(),
            interval: config.dump.replay_interval,
        }
        .spawn(replay_cxl.clone());

        Ok(Pipeline {
            cxl,
            queue,
            stats,
            dump,
            watchers,
            replay: (replay_cxl, replayer),
            dispatcher: (dispatcher_cxl, dispatcher),
            refresher,
        })
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<CollectQueue> {
        &self.queue
    }

    #[must_use]
    pub fn dump(&self) -> &Arc<DumpFile> {
        &self.dump
    }

    /// Waits for `cxl`, then stops watchers, the replayer and finally the
    /// transmitter pool, in that order.
    pub async fn join(self) {
        self.cxl.cancelled().await;
        info!("shutting down");

        for result in futures::future::join_all(self.watchers).await {
            if let Err(err) = result {
                warn!(%err, "spool watcher panicked");
            }
        }

        let (replay_cxl, replayer) = self.replay;
        replay_cxl.cancel();
        if let Err(err) = replayer.await {
            warn!(%err, "dump replayer panicked");
        }

        let (dispatcher_cxl, dispatcher) = self.dispatcher;
        dispatcher_cxl.cancel();
        if let Err(err) = dispatcher.await {
            warn!(%err, "dispatcher panicked");
        }

        if let Some((refresher_cxl, refresher)) = self.refresher {
            refresher_cxl.cancel();
            if let Err(err) = refresher.await {
                warn!(%err, "livestatus refresher panicked");
            }
        }

        info!("shutdown complete");
    }
}

async fn create_folder(folder: &Path) -> Result<(), StartError> {
    tokio::fs::create_dir_all(folder)
        .await
        .map_err(|source| StartError::CreateFolder { path: folder.to_path_buf(), source })
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Invalid config; err={0}")]
    Config(#[from] ConfigError),
    #[error("Create folder; path={}; err={source}", .path.display())]
    CreateFolder { path: PathBuf, source: std::io::Error },
    #[error("Open dump; err={0}")]
    Dump(#[from] DumpError),
    #[error("Recover spool claims; err={0}")]
    Spool(#[from] SpoolError),
    #[error("Build destination; err={0}")]
    Transmit(#[from] TransmitError),
}
