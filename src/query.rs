//! Read-side of the `InfluxDB` HTTP API.
//!
//! The pipeline never reads back. This exists for verification tooling that
//! wants to compare what was written with what the database returns.

use serde::{Deserialize, Serialize};

use crate::config::InfluxConfig;
use crate::influx::TransmitError;

/// The query that dumps every series with millisecond timestamps.
pub const SELECT_ALL: &str = "select * from /.*/";

/// One series as returned by `/query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueryResponse {
    /// All series of all statements.
    pub fn series(&self) -> impl Iterator<Item = &Series> {
        self.results.iter().flat_map(|result| result.series.iter())
    }
}

/// Runs [`SELECT_ALL`] against the configured database.
///
/// # Errors
///
/// Errors on transport failure, a non-2xx status or an undecodable body.
pub async fn select_all(
    client: &reqwest::Client,
    config: &InfluxConfig,
) -> Result<QueryResponse, TransmitError> {
    let mut params = vec![("db", config.database.as_str()), ("q", SELECT_ALL), ("epoch", "ms")];
    if let Some(username) = &config.username {
        params.push(("u", username.as_str()));
    }
    if let Some(password) = &config.password {
        params.push(("p", password.as_str()));
    }

    let url = format!("{}/query", config.address.trim_end_matches('/'));
    let response = client.get(&url).query(&params).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(TransmitError::Status { status, body });
    }

    serde_json::from_str(&body).map_err(Into::into)
}
