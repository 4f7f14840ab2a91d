//! TOML configuration.
//!
//! Every section is optional and falls back to [`Default`]. Only the spool
//! folders and the `InfluxDB` address really need to be set.
//!
//! ```toml
//! [spool]
//! nagios_folder = "/var/spool/nagios/perfdata"
//! nagios_workers = 2
//!
//! [pool]
//! min_workers = 2
//! max_workers = 8
//!
//! [influx]
//! address = "http://127.0.0.1:8086"
//! database = "nagios"
//!
//! [series]
//! separator = "&"
//! nasty_string = "\\ "
//! nasty_string_replacement = " "
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::logging::LogConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spool: SpoolConfig,
    pub pool: PoolConfig,
    pub influx: InfluxConfig,
    pub series: SeriesConfig,
    pub dump: DumpConfig,
    pub livestatus: Option<LivestatusConfig>,
    pub log: LogConfig,
}

impl Config {
    /// Loads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Errors if the file cannot be read, is not valid TOML, or fails
    /// [`Config::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        contents.parse()
    }

    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spool.nagios_folder.is_none() && self.spool.native_folder.is_none() {
            return Err(ConfigError::NoSpoolFolder);
        }
        if self.spool.nagios_folder.is_some() && self.spool.nagios_workers == 0 {
            return Err(ConfigError::invalid("spool.nagios_workers", "must be at least 1"));
        }
        if self.spool.native_folder.is_some() && self.spool.native_workers == 0 {
            return Err(ConfigError::invalid("spool.native_workers", "must be at least 1"));
        }
        if self.spool.poll_interval.is_zero() {
            return Err(ConfigError::invalid("spool.poll_interval", "must be non-zero"));
        }
        if self.pool.min_workers == 0 {
            return Err(ConfigError::invalid("pool.min_workers", "must be at least 1"));
        }
        if self.pool.min_workers > self.pool.max_workers {
            return Err(ConfigError::invalid(
                "pool.max_workers",
                "must be greater than or equal to pool.min_workers",
            ));
        }
        if self.pool.batch_size == 0 {
            return Err(ConfigError::invalid("pool.batch_size", "must be at least 1"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::invalid("pool.queue_capacity", "must be at least 1"));
        }
        if self.pool.sample_interval.is_zero() {
            return Err(ConfigError::invalid("pool.sample_interval", "must be non-zero"));
        }
        if self.dump.replay_interval.is_zero() {
            return Err(ConfigError::invalid("dump.replay_interval", "must be non-zero"));
        }
        if self.dump.read_timeout.is_zero() {
            return Err(ConfigError::invalid("dump.read_timeout", "must be non-zero"));
        }
        if self.series.separator.is_empty() {
            return Err(ConfigError::invalid("series.separator", "must not be empty"));
        }
        if self.influx.address.is_empty() {
            return Err(ConfigError::invalid("influx.address", "must not be empty"));
        }
        if self.influx.database.is_empty() {
            return Err(ConfigError::invalid("influx.database", "must not be empty"));
        }
        if let Some(livestatus) = &self.livestatus {
            if livestatus.address.is_empty() {
                return Err(ConfigError::invalid("livestatus.address", "must not be empty"));
            }
            if livestatus.refresh_interval.is_zero() {
                return Err(ConfigError::invalid("livestatus.refresh_interval", "must be non-zero"));
            }
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;

        Ok(config)
    }
}

/// Spool folders and the tasks that watch them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Folder receiving legacy `KEY::VALUE` perfdata spool files.
    pub nagios_folder: Option<PathBuf>,
    /// Watcher tasks for `nagios_folder`.
    pub nagios_workers: usize,
    /// Folder receiving native (header + rows) spool files.
    pub native_folder: Option<PathBuf>,
    /// Watcher tasks for `native_folder`.
    pub native_workers: usize,
    /// Delay between two scans of a folder.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Files modified more recently than this are assumed to still be written.
    #[serde(with = "humantime_serde")]
    pub min_file_age: Duration,
    /// Upper bound on reading one spool file.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Processed files are moved here instead of being deleted.
    pub archive_folder: Option<PathBuf>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            nagios_folder: None,
            nagios_workers: 1,
            native_folder: None,
            native_workers: 1,
            poll_interval: Duration::from_secs(1),
            min_file_age: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
            archive_folder: None,
        }
    }
}

/// Collect queue and transmitter pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Points the collect queue holds before producers block.
    pub queue_capacity: usize,
    /// Maximum points per write request.
    pub batch_size: usize,
    /// How long a transmitter waits to fill a batch.
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    /// How often the dispatcher samples queue depth.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Grow when queue depth exceeds this many points per running worker.
    pub high_water_per_worker: usize,
    /// A sample at or below this depth counts towards shrinking.
    pub low_water: usize,
    /// Consecutive low samples required before a worker is retired.
    pub shrink_after: u32,
    /// Grace period for in-flight batches on shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 5,
            queue_capacity: 100_000,
            batch_size: 5_000,
            batch_timeout: Duration::from_millis(500),
            sample_interval: Duration::from_secs(5),
            high_water_per_worker: 10_000,
            low_water: 100,
            shrink_after: 6,
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// `InfluxDB` write endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://127.0.0.1:8086`.
    pub address: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra query arguments appended verbatim to the write URL.
    pub arguments: Option<String>,
    /// Timeout of every HTTP request.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Issue `CREATE DATABASE` on startup, retried until `InfluxDB` answers.
    pub create_database: bool,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8086".to_string(),
            database: "perfflux".to_string(),
            username: None,
            password: None,
            arguments: None,
            write_timeout: Duration::from_secs(5),
            create_database: false,
        }
    }
}

/// Series naming rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// Joins host, service, command, label and field.
    pub separator: String,
    /// Substring replaced in every name component. Empty disables it.
    pub nasty_string: String,
    pub nasty_string_replacement: String,
    /// Service component used for host checks.
    pub host_check_service: String,
    /// Emit numeric warn/crit/min/max thresholds as their own series.
    pub emit_thresholds: bool,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            separator: "&".to_string(),
            nasty_string: String::new(),
            nasty_string_replacement: String::new(),
            host_check_service: "Hostcheck".to_string(),
            emit_thresholds: true,
        }
    }
}

/// Overflow store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub path: PathBuf,
    /// How often the dump is checked for replay.
    #[serde(with = "humantime_serde")]
    pub replay_interval: Duration,
    /// Upper bound on each read from the dump.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("perfflux.dump"),
            replay_interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivestatusKind {
    #[default]
    Tcp,
    Unix,
}

/// Livestatus state lookup used to tag points.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivestatusConfig {
    pub kind: LivestatusKind,
    /// `host:port` for TCP, a socket path for Unix.
    pub address: String,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LivestatusConfig {
    fn default() -> Self {
        Self {
            kind: LivestatusKind::Tcp,
            address: String::new(),
            refresh_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Read config; path={path:?}; err={source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse config; err={0}")]
    Parse(#[from] toml::de::Error),
    #[error("No spool folder configured; set spool.nagios_folder or spool.native_folder")]
    NoSpoolFolder,
    #[error("Invalid {field}; {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

impl ConfigError {
    const fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}
