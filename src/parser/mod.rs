//! Spool record parsing.
//!
//! Two grammars are understood:
//!
//! - [`Grammar::Legacy`]: the Nagios/Icinga perfdata spool, one
//!   `KEY::VALUE` tab-separated record per line.
//! - [`Grammar::Native`]: a tab-separated table whose first line names the
//!   columns (`table`, `time`, `t_<tag>`, `f_<field>`).
//!
//! Parsing is pure: the same line and [`SeriesConfig`] always produce the
//! same points.

mod legacy;
mod native;
pub mod perfdata;

use thiserror::Error;
use tracing::debug;

pub use self::native::NativeHeader;
use crate::config::SeriesConfig;
use crate::point::DataPoint;

/// Grammar of a line, carrying the header for native files.
#[derive(Debug, Clone, Copy)]
pub enum Grammar<'h> {
    Legacy,
    Native(&'h NativeHeader),
}

/// Format of a whole spool folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolFormat {
    Legacy,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Missing field; key={0}")]
    MissingField(&'static str),
    #[error("Invalid timestamp; value={0}")]
    InvalidTimestamp(String),
    #[error("Malformed perfdata token; token={0}")]
    MalformedPerfData(String),
    #[error("Invalid perfdata value; label={label}; value={value}")]
    InvalidValue { label: String, value: String },
    #[error("Missing native header column; column={0}")]
    MissingColumn(&'static str),
    #[error("Column count mismatch; expected={expected}; found={found}")]
    ColumnCount { expected: usize, found: usize },
}

/// Parses one spool line into its points.
///
/// Blank lines and legacy records of a non-perfdata `DATATYPE` yield no
/// points and no error.
///
/// # Errors
///
/// Errors if the line is malformed; callers skip it.
pub fn parse_line(
    line: &str,
    grammar: Grammar<'_>,
    config: &SeriesConfig,
) -> Result<Vec<DataPoint>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }

    match grammar {
        Grammar::Legacy => match legacy::LegacyRecord::from_line(line)? {
            Some(record) => record.into_points(config),
            None => Ok(Vec::new()),
        },
        Grammar::Native(header) => header.parse_record(line, config),
    }
}

/// Result of parsing a whole spool file.
#[derive(Debug, Default)]
pub struct ParsedSpool {
    /// Points in file order.
    pub points: Vec<DataPoint>,
    /// Non-blank lines seen, including the native header.
    pub lines: usize,
    /// Lines skipped as malformed.
    pub errors: usize,
}

/// Parses every line of a spool file, skipping malformed ones.
#[must_use]
pub fn parse_spool(text: &str, format: SpoolFormat, config: &SeriesConfig) -> ParsedSpool {
    let mut parsed = ParsedSpool::default();
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header = match format {
        SpoolFormat::Legacy => None,
        SpoolFormat::Native => {
            let Some(first) = lines.next() else {
                return parsed;
            };
            parsed.lines += 1;

            match NativeHeader::parse(first) {
                Ok(header) => Some(header),
                Err(err) => {
                    debug!(%err, "skipping native spool with invalid header");
                    let rest = lines.count();
                    parsed.lines += rest;
                    parsed.errors += rest + 1;

                    return parsed;
                }
            }
        }
    };
    let grammar = header.as_ref().map_or(Grammar::Legacy, Grammar::Native);

    for line in lines {
        parsed.lines += 1;
        match parse_line(line, grammar, config) {
            Ok(points) => parsed.points.extend(points),
            Err(err) => {
                parsed.errors += 1;
                debug!(%err, line, "skipping malformed spool line");
            }
        }
    }

    parsed
}
