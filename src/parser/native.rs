use std::collections::BTreeMap;

use super::ParseError;
use crate::config::SeriesConfig;
use crate::point::{series_name, DataPoint};

const TAG_PREFIX: &str = "t_";
const FIELD_PREFIX: &str = "f_";

/// Column layout of a native spool file, taken from its first line.
///
/// `table` and `time` (epoch milliseconds) are required. `t_<name>` columns
/// become tags and every non-empty `f_<name>` column becomes a point of the
/// series `<table><separator><name>`. Other columns are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeHeader {
    width: usize,
    table: usize,
    time: usize,
    tags: Vec<(usize, String)>,
    fields: Vec<(usize, String)>,
}

impl NativeHeader {
    /// # Errors
    ///
    /// Errors if `table` or `time` is missing.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let columns: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        let position = |name: &'static str| {
            columns
                .iter()
                .position(|column| *column == name)
                .ok_or(ParseError::MissingColumn(name))
        };

        let prefixed = |prefix: &str| -> Vec<(usize, String)> {
            columns
                .iter()
                .enumerate()
                .filter_map(|(i, column)| {
                    column
                        .strip_prefix(prefix)
                        .filter(|name| !name.is_empty())
                        .map(|name| (i, name.to_string()))
                })
                .collect()
        };

        Ok(NativeHeader {
            width: columns.len(),
            table: position("table")?,
            time: position("time")?,
            tags: prefixed(TAG_PREFIX),
            fields: prefixed(FIELD_PREFIX),
        })
    }

    /// Parses one data row.
    ///
    /// # Errors
    ///
    /// Errors on a wrong column count, a non-integer `time` or a non-numeric
    /// field value.
    pub fn parse_record(
        &self,
        line: &str,
        config: &SeriesConfig,
    ) -> Result<Vec<DataPoint>, ParseError> {
        let values: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        if values.len() != self.width {
            return Err(ParseError::ColumnCount { expected: self.width, found: values.len() });
        }

        let table = values[self.table];
        if table.is_empty() {
            return Err(ParseError::MissingField("table"));
        }
        let timestamp_ms = values[self.time]
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidTimestamp(values[self.time].to_string()))?;

        let tags: BTreeMap<String, String> = self
            .tags
            .iter()
            .filter(|(i, _)| !values[*i].is_empty())
            .map(|(i, name)| (name.clone(), values[*i].to_string()))
            .collect();

        self.fields
            .iter()
            .filter(|(i, _)| !values[*i].trim().is_empty())
            .map(|(i, name)| -> Result<DataPoint, ParseError> {
                let raw = values[*i].trim();
                let value = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ParseError::InvalidValue {
                        label: name.clone(),
                        value: raw.to_string(),
                    })?;

                let mut point =
                    DataPoint::new(series_name([table, name.as_str()], config), timestamp_ms, value);
                point.tags.clone_from(&tags);

                Ok(point)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;
    use crate::parser::{parse_line, parse_spool, Grammar, SpoolFormat};

    const HEADER: &str = "table\ttime\tt_host\tt_service\tf_value\tf_warn\tunused";

    #[test]
    fn parse_rows() {
        let header = NativeHeader::parse(HEADER).unwrap();
        let points = parse_line(
            "messages\t1500000000000\tweb1\thttp\t3\t\tx",
            Grammar::Native(&header),
            &SeriesConfig::default(),
        )
        .unwrap();

        expect![[r#"
            [
                DataPoint {
                    name: "messages&value",
                    timestamp_ms: 1500000000000,
                    value: 3.0,
                    tags: {
                        "host": "web1",
                        "service": "http",
                    },
                    origin: None,
                },
            ]
        "#]]
        .assert_debug_eq(&points);
    }

    #[test]
    fn spool_file() {
        let text = format!("{HEADER}\nt\t1\th\t\t1\t2\t\nt\tbad\th\ts\t1\t2\t\nt\t3\th\ts\t4\n");

        let parsed = parse_spool(&text, SpoolFormat::Native, &SeriesConfig::default());

        assert_eq!(parsed.lines, 4);
        assert_eq!(parsed.errors, 2);
        let names: Vec<_> = parsed.points.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["t&value", "t&warn"]);
        assert!(!parsed.points[0].tags.contains_key("service"));
    }

    #[test]
    fn missing_time_column() {
        expect!["Missing native header column; column=time"]
            .assert_eq(&NativeHeader::parse("table\tf_value").unwrap_err().to_string());
    }

    #[test]
    fn column_count_mismatch() {
        let header = NativeHeader::parse("table\ttime\tf_value").unwrap();

        expect!["Column count mismatch; expected=3; found=2"].assert_eq(
            &header
                .parse_record("t\t1", &SeriesConfig::default())
                .unwrap_err()
                .to_string(),
        );
    }

    #[test]
    fn invalid_field_value() {
        let header = NativeHeader::parse("table\ttime\tf_value").unwrap();

        expect!["Invalid perfdata value; label=value; value=abc"].assert_eq(
            &header
                .parse_record("t\t1\tabc", &SeriesConfig::default())
                .unwrap_err()
                .to_string(),
        );
    }
}
