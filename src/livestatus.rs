//! Check state lookup over the Livestatus protocol.
//!
//! A background task periodically asks the monitoring core for the current
//! state and downtime of every host and service. Spool watchers tag points
//! from that cached snapshot, so enrichment never waits on the socket.

use std::sync::{Arc, PoisonError, RwLock};

use hashbrown::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LivestatusConfig, LivestatusKind};
use crate::point::{DataPoint, Origin};

const SERVICES_QUERY: &str = "GET services\nColumns: host_name description state scheduled_downtime_depth\nOutputFormat: json\n\n";
const HOSTS_QUERY: &str =
    "GET hosts\nColumns: name state scheduled_downtime_depth\nOutputFormat: json\n\n";

/// Tag holding the numeric check state.
pub const STATE_TAG: &str = "state";
/// Tag set to `true` while the check is in scheduled downtime.
pub const DOWNTIME_TAG: &str = "downtime";

/// Adds metadata tags to freshly parsed points.
pub trait Enricher: Send + Sync {
    fn enrich(&self, points: &mut [DataPoint]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckStatus {
    pub state: i64,
    pub in_downtime: bool,
}

type Snapshot = HashMap<Origin, CheckStatus>;

pub struct Livestatus {
    config: LivestatusConfig,
    cache: RwLock<Snapshot>,
}

impl Livestatus {
    #[must_use]
    pub fn new(config: LivestatusConfig) -> Self {
        Livestatus { config, cache: RwLock::default() }
    }

    /// Replaces the cached snapshot with a fresh one.
    ///
    /// On failure the previous snapshot is kept.
    ///
    /// # Errors
    ///
    /// Errors if either query fails, times out or returns undecodable JSON.
    pub async fn refresh(&self) -> Result<usize, LivestatusError> {
        let mut snapshot = parse_hosts(&self.query(HOSTS_QUERY).await?)?;
        snapshot.extend(parse_services(&self.query(SERVICES_QUERY).await?)?);

        let checks = snapshot.len();
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = snapshot;

        Ok(checks)
    }

    #[must_use]
    pub fn status(&self, origin: &Origin) -> Option<CheckStatus> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .copied()
    }

    pub fn spawn_refresher(self: Arc<Self>, cxl: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    () = cxl.cancelled() => break,
                    _ = interval.tick() => match self.refresh().await {
                        Ok(checks) => debug!(checks, "refreshed livestatus snapshot"),
                        Err(err) => warn!(%err, address = %self.config.address, "livestatus refresh failed"),
                    },
                }
            }
        })
    }

    async fn query(&self, request: &str) -> Result<String, LivestatusError> {
        let address = self.config.address.as_str();
        let exchange = async {
            match self.config.kind {
                LivestatusKind::Tcp => exchange(tokio::net::TcpStream::connect(address).await?, request).await,
                #[cfg(unix)]
                LivestatusKind::Unix => exchange(tokio::net::UnixStream::connect(address).await?, request).await,
                #[cfg(not(unix))]
                LivestatusKind::Unix => Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )),
            }
        };

        tokio::time::timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| LivestatusError::Timeout(self.config.timeout))?
            .map_err(Into::into)
    }
}

impl Enricher for Livestatus {
    fn enrich(&self, points: &mut [DataPoint]) {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        if cache.is_empty() {
            return;
        }

        for point in points {
            let Some(status) = point.origin.as_ref().and_then(|origin| cache.get(origin)) else {
                continue;
            };

            point.tags.insert(STATE_TAG.to_string(), status.state.to_string());
            point.tags.insert(DOWNTIME_TAG.to_string(), status.in_downtime.to_string());
        }
    }
}

/// Sends one request, half-closes the connection and reads the response to
/// the end.
async fn exchange<S>(mut stream: S, request: &str) -> std::io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    Ok(response)
}

fn parse_services(body: &str) -> Result<Snapshot, serde_json::Error> {
    let rows: Vec<(String, String, i64, i64)> = serde_json::from_str(body)?;

    Ok(rows
        .into_iter()
        .map(|(host, service, state, downtime)| {
            (
                Origin { host, service: Some(service) },
                CheckStatus { state, in_downtime: downtime > 0 },
            )
        })
        .collect())
}

fn parse_hosts(body: &str) -> Result<Snapshot, serde_json::Error> {
    let rows: Vec<(String, i64, i64)> = serde_json::from_str(body)?;

    Ok(rows
        .into_iter()
        .map(|(host, state, downtime)| {
            (Origin { host, service: None }, CheckStatus { state, in_downtime: downtime > 0 })
        })
        .collect())
}

#[derive(Debug, Error)]
pub enum LivestatusError {
    #[error("Livestatus io; err={0}")]
    Io(#[from] std::io::Error),
    #[error("Livestatus timed out; timeout={0:?}")]
    Timeout(std::time::Duration),
    #[error("Decode livestatus response; err={0}")]
    Decode(#[from] serde_json::Error),
}
