//! Ships Nagios/Icinga performance data spool files into `InfluxDB`.
//!
//! Spool watchers parse files into [`DataPoint`]s and push them through a
//! bounded [`CollectQueue`]. A pool of transmitters, sized by the
//! [`ScalingPolicy`], batches the queue into line-protocol writes. Batches
//! the destination cannot take are appended to the [`DumpFile`] and replayed
//! once it is reachable again.

pub mod config;
pub mod dispatcher;
pub mod dump;
pub mod influx;
mod line_protocol;
pub mod livestatus;
pub mod logging;
pub mod parser;
pub mod pipeline;
pub mod point;
pub mod query;
pub mod queue;
pub mod scaling;
pub mod spool;
pub mod stats;
pub mod transmitter;

pub use config::{Config, ConfigError};
pub use dump::{DumpError, DumpFile};
pub use influx::{InfluxDestination, TransmitError};
pub use livestatus::{Enricher, Livestatus};
pub use parser::{parse_line, parse_spool, Grammar, ParseError, SpoolFormat};
pub use pipeline::{Pipeline, StartError};
pub use point::{Batch, DataPoint, Origin};
pub use query::{select_all, QueryResponse, Series};
pub use queue::CollectQueue;
pub use scaling::{ScaleDecision, ScalingPolicy};
pub use stats::{PipelineStats, StatusSnapshot};
pub use tokio_util::sync::CancellationToken;
pub use transmitter::{Destination, Outcome};
