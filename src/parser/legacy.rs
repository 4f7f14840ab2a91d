use hashbrown::HashMap;

use super::{perfdata, ParseError};
use crate::config::SeriesConfig;
use crate::point::{series_name, DataPoint, Origin, VALUE_FIELD};

const MILLIS_PER_SECOND: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    Service,
    Host,
}

impl CheckKind {
    fn from_datatype(datatype: &str) -> Option<Self> {
        match datatype {
            "SERVICEPERFDATA" => Some(CheckKind::Service),
            "HOSTPERFDATA" => Some(CheckKind::Host),
            _ => None,
        }
    }

    const fn perfdata_key(self) -> &'static str {
        match self {
            CheckKind::Service => "SERVICEPERFDATA",
            CheckKind::Host => "HOSTPERFDATA",
        }
    }

    const fn command_key(self) -> &'static str {
        match self {
            CheckKind::Service => "SERVICECHECKCOMMAND",
            CheckKind::Host => "HOSTCHECKCOMMAND",
        }
    }
}

/// A validated `KEY::VALUE` spool record.
#[derive(Debug)]
pub(super) struct LegacyRecord<'a> {
    timestamp_ms: i64,
    host: &'a str,
    /// `None` for host checks.
    service: Option<&'a str>,
    perfdata: &'a str,
    command: &'a str,
}

impl<'a> LegacyRecord<'a> {
    /// Returns `Ok(None)` for records that do not carry performance data.
    pub(super) fn from_line(line: &'a str) -> Result<Option<Self>, ParseError> {
        let fields: HashMap<&str, &str> =
            line.split('\t').filter_map(|field| field.split_once("::")).collect();
        let required =
            |key: &'static str| fields.get(key).copied().ok_or(ParseError::MissingField(key));

        let Some(kind) = CheckKind::from_datatype(required("DATATYPE")?) else {
            return Ok(None);
        };

        let timet = required("TIMET")?;
        let timestamp_ms = timet
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| secs.checked_mul(MILLIS_PER_SECOND))
            .ok_or_else(|| ParseError::InvalidTimestamp(timet.to_string()))?;
        let host = required("HOSTNAME")?;
        let service = fields.get("SERVICEDESC").copied().filter(|s| !s.is_empty());
        let perfdata = required(kind.perfdata_key())?;
        let command = required(kind.command_key())?
            .split_whitespace()
            .next()
            .unwrap_or_default();

        Ok(Some(LegacyRecord { timestamp_ms, host, service, perfdata, command }))
    }

    pub(super) fn into_points(self, config: &SeriesConfig) -> Result<Vec<DataPoint>, ParseError> {
        let service = self.service.unwrap_or(config.host_check_service.as_str());
        let origin =
            Origin { host: self.host.to_string(), service: self.service.map(str::to_string) };

        let mut points = Vec::new();
        for field in perfdata::parse(self.perfdata)? {
            let thresholds = match config.emit_thresholds {
                true => field.numeric_thresholds().collect(),
                false => Vec::new(),
            };

            for (name, value) in std::iter::once((VALUE_FIELD, field.value)).chain(thresholds) {
                let components = [self.host, service, self.command, field.label.as_str(), name];
                let mut point =
                    DataPoint::new(series_name(components, config), self.timestamp_ms, value);
                point.origin = Some(origin.clone());
                points.push(point);
            }
        }

        Ok(points)
    }
}
