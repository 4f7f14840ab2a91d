use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::SeriesConfig;
use crate::query::Series;

/// Field component of a series carrying the measured value.
pub const VALUE_FIELD: &str = "value";

/// A single timestamped value of one series.
///
/// This is the unit of delivery. Points are immutable once parsed apart from
/// enrichment tags, which are attached before the point is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    pub timestamp_ms: i64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

/// Check a legacy point was produced by. Used for enrichment lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub host: String,
    /// `None` for host checks.
    pub service: Option<String>,
}

/// Points assembled for one write attempt.
pub type Batch = Vec<DataPoint>;

impl DataPoint {
    #[must_use]
    pub fn new(name: String, timestamp_ms: i64, value: f64) -> Self {
        DataPoint { name, timestamp_ms, value, tags: BTreeMap::new(), origin: None }
    }

    /// Column names as the destination reports them: `time` first, then tag
    /// keys and `value` in lexical order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        let mut rest: Vec<&str> =
            self.tags.keys().map(String::as_str).chain([VALUE_FIELD]).collect();
        rest.sort_unstable();

        std::iter::once("time")
            .chain(rest)
            .map(str::to_string)
            .collect()
    }

    /// The single row of this point, aligned with [`DataPoint::columns`].
    #[must_use]
    pub fn rows(&self) -> Vec<Vec<serde_json::Value>> {
        #[allow(clippy::cast_precision_loss)]
        let time = self.timestamp_ms as f64;

        let row = self
            .columns()
            .iter()
            .map(|column| match column.as_str() {
                "time" => serde_json::Value::from(time),
                VALUE_FIELD => serde_json::Value::from(self.value),
                tag => self
                    .tags
                    .get(tag)
                    .map_or(serde_json::Value::Null, |v| serde_json::Value::from(v.as_str())),
            })
            .collect();

        vec![row]
    }

    #[must_use]
    pub fn to_series(&self) -> Series {
        Series { name: self.name.clone(), columns: self.columns(), values: self.rows() }
    }
}

/// Joins name components with the configured separator.
///
/// Each component has the nasty string substituted, then backslashes and the
/// separator itself escaped with a backslash so the components stay
/// recoverable.
#[must_use]
pub fn series_name<'a, I>(components: I, config: &SeriesConfig) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    components
        .into_iter()
        .map(|component| escape_component(component, config))
        .join(&config.separator)
}

fn escape_component(raw: &str, config: &SeriesConfig) -> String {
    let substituted = match config.nasty_string.is_empty() {
        true => raw.to_string(),
        false => raw.replace(&config.nasty_string, &config.nasty_string_replacement),
    };

    substituted
        .replace('\\', "\\\\")
        .replace(&config.separator, &format!("\\{}", config.separator))
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    fn config() -> SeriesConfig {
        SeriesConfig {
            nasty_string: "\\ ".to_string(),
            nasty_string_replacement: " ".to_string(),
            ..SeriesConfig::default()
        }
    }

    #[test]
    fn joins_with_separator() {
        expect!["a&a&ping&rta&value"]
            .assert_eq(&series_name(["a", "a", "ping", "rta", "value"], &config()));
    }

    #[test]
    fn nasty_string_substituted() {
        expect!["b&b&usage&C: use&value"]
            .assert_eq(&series_name(["b", "b", "usage", "C:\\ use", "value"], &config()));
    }

    #[test]
    fn separator_and_backslash_escaped() {
        expect![[r"h&s\&t&c&C:\\temp&value"]]
            .assert_eq(&series_name(["h", "s&t", "c", "C:\\temp", "value"], &config()));
    }

    #[test]
    fn multi_char_separator() {
        let config = SeriesConfig { separator: "::".to_string(), ..config() };

        expect![[r"a::b\::c::d"]].assert_eq(&series_name(["a", "b::c", "d"], &config));
    }

    #[test]
    fn empty_nasty_string_is_noop() {
        let config = SeriesConfig::default();

        expect![[r"h&C:\\ use"]].assert_eq(&series_name(["h", "C:\\ use"], &config));
    }

    #[test]
    fn columns_and_rows_without_tags() {
        let point = DataPoint::new("a&a&ping&rta&value".to_string(), 2000, 1.0);

        assert_eq!(point.columns(), ["time", "value"]);
        expect!["[[2000.0,1.0]]"].assert_eq(&serde_json::to_string(&point.rows()).unwrap());
    }

    #[test]
    fn columns_and_rows_with_tags() {
        let mut point = DataPoint::new("cpu".to_string(), 5, 0.5);
        point.tags.insert("zone".to_string(), "b".to_string());
        point.tags.insert("host".to_string(), "a".to_string());

        assert_eq!(point.columns(), ["time", "host", "value", "zone"]);
        expect![[r#"[[5.0,"a",0.5,"b"]]"#]]
            .assert_eq(&serde_json::to_string(&point.rows()).unwrap());
    }

    #[test]
    fn serialize_skips_empty_tags_and_origin() {
        let point = DataPoint::new("m".to_string(), 1000, 1.5);

        expect![[r#"{"name":"m","timestamp_ms":1000,"value":1.5}"#]]
            .assert_eq(&serde_json::to_string(&point).unwrap());
    }
}
