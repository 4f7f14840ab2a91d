use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::InfluxConfig;
use crate::transmitter::{Destination, Outcome};

/// `InfluxDB` 1.x HTTP endpoint.
#[derive(Debug, Clone)]
pub struct InfluxDestination {
    client: Client,
    config: InfluxConfig,
    write_url: String,
    ping_url: String,
    /// Set while `create_database` is configured and has not succeeded yet.
    pending_create: Arc<AtomicBool>,
}

impl InfluxDestination {
    /// Every request made through this destination is bounded by
    /// `config.write_timeout`.
    ///
    /// # Errors
    ///
    /// Errors if the HTTP client cannot be built.
    pub fn new(config: &InfluxConfig) -> Result<Self, TransmitError> {
        let client = Client::builder()
            .timeout(config.write_timeout)
            .connect_timeout(config.write_timeout)
            .build()?;

        Ok(InfluxDestination {
            client,
            write_url: build_write_url(config),
            ping_url: format!("{}/ping", base_url(config)),
            pending_create: Arc::new(AtomicBool::new(config.create_database)),
            config: config.clone(),
        })
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Issues `CREATE DATABASE`, which is a no-op if it already exists.
    ///
    /// # Errors
    ///
    /// Errors on transport failure or a non-2xx status.
    pub async fn create_database(&self) -> Result<(), TransmitError> {
        let statement = format!("CREATE DATABASE \"{}\"", self.config.database);
        let mut params = vec![("q", statement.as_str())];
        if let Some(username) = &self.config.username {
            params.push(("u", username.as_str()));
        }
        if let Some(password) = &self.config.password {
            params.push(("p", password.as_str()));
        }

        let response = self
            .client
            .post(format!("{}/query", base_url(&self.config)))
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransmitError::Status { status, body });
        }
        info!(database = %self.config.database, "ensured database exists");

        Ok(())
    }

    /// Creates the database if `create_database` is configured and no earlier
    /// attempt has succeeded. Later calls after a success are no-ops.
    ///
    /// # Errors
    ///
    /// See [`InfluxDestination::create_database`].
    pub async fn ensure_database(&self) -> Result<(), TransmitError> {
        if !self.pending_create.load(Ordering::Acquire) {
            return Ok(());
        }

        self.create_database().await?;
        self.pending_create.store(false, Ordering::Release);

        Ok(())
    }

    async fn post(&self, body: String) -> Outcome {
        match self.client.post(&self.write_url).body(body).send().await {
            Ok(resp) if resp.status().is_success() => Outcome::Delivered,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                debug!(%status, %body, "InfluxDB write failed");

                classify(status, &body)
            }
            Err(err) if err.is_timeout() => Outcome::Retryable(format!("Request timed out; err={err}")),
            Err(err) => Outcome::Retryable(format!("Request failed; err={err}")),
        }
    }
}

impl Destination for InfluxDestination {
    fn write(&self, body: String) -> BoxFuture<'_, Outcome> {
        self.post(body).boxed()
    }

    fn ping(&self) -> BoxFuture<'_, bool> {
        async move {
            match self.client.get(&self.ping_url).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    debug!(status = %resp.status(), "InfluxDB ping rejected");
                    return false;
                }
                Err(err) => {
                    debug!(%err, "InfluxDB ping failed");
                    return false;
                }
            }

            // Writes into a missing database would only be dumped again.
            match self.ensure_database().await {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "InfluxDB reachable but database creation failed");
                    false
                }
            }
        }
        .boxed()
    }
}

/// Maps a non-2xx write response onto an [`Outcome`].
///
/// Client errors mean the batch itself is bad and will never be accepted,
/// except for a missing database, request timeouts and throttling.
pub(crate) fn classify(status: StatusCode, body: &str) -> Outcome {
    match status {
        s if s.is_success() => Outcome::Delivered,
        StatusCode::NOT_FOUND | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Outcome::Retryable(format!("status={status}; body={body}"))
        }
        s if s.is_client_error() => Outcome::Fatal(format!("status={status}; body={body}")),
        _ => Outcome::Retryable(format!("status={status}; body={body}")),
    }
}

fn base_url(config: &InfluxConfig) -> &str {
    config.address.trim_end_matches('/')
}

fn build_write_url(config: &InfluxConfig) -> String {
    let mut url = format!("{}/write?db={}&precision=ms", base_url(config), config.database);

    if let Some(username) = &config.username {
        url.push_str("&u=");
        url.push_str(username);
    }
    if let Some(password) = &config.password {
        url.push_str("&p=");
        url.push_str(password);
    }
    if let Some(arguments) = config
        .arguments
        .as_deref()
        .map(|arguments| arguments.trim_start_matches(['?', '&']))
        .filter(|arguments| !arguments.is_empty())
    {
        url.push('&');
        url.push_str(arguments);
    }

    url
}

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("HTTP request; err={0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status; status={status}; body={body}")]
    Status { status: StatusCode, body: String },
    #[error("Decode response; err={0}")]
    Decode(#[from] serde_json::Error),
}
