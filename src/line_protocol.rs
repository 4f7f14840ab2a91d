use std::collections::BTreeMap;
use std::fmt::Write;

use crate::point::{DataPoint, VALUE_FIELD};

/// Serializes a batch into one write request body.
///
/// Points with a non-finite value cannot be represented and are skipped.
pub(crate) fn encode_batch(batch: &[DataPoint]) -> String {
    let mut buf = String::with_capacity(batch.len().saturating_mul(64));
    for point in batch {
        write_point(&mut buf, &point.name, &point.tags, point.value, point.timestamp_ms);
    }

    buf
}

pub(crate) fn write_point(
    buf: &mut String,
    name: &str,
    tags: &BTreeMap<String, String>,
    value: f64,
    timestamp_ms: i64,
) {
    if !value.is_finite() {
        return;
    }

    escape_measurement(buf, name);
    for (key, value) in tags {
        write_single_tag(buf, key, value);
    }
    let _ = writeln!(buf, " {VALUE_FIELD}={value} {timestamp_ms}");
}

fn write_single_tag(buf: &mut String, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }

    buf.push(',');
    escape_tag_key_value(buf, key);
    buf.push('=');
    escape_tag_key_value(buf, value);
}

fn escape_measurement(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ',' | ' ' | '\\' => {
                buf.push('\\');
                buf.push(c);
            }
            '\n' => buf.push_str("\\n"),
            _ => buf.push(c),
        }
    }
}

fn escape_tag_key_value(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ',' | '=' | ' ' | '\\' => {
                buf.push('\\');
                buf.push(c);
            }
            '\n' => buf.push_str("\\n"),
            _ => buf.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    fn empty_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn sample_tags() -> BTreeMap<String, String> {
        BTreeMap::from_iter([
            ("host".to_string(), "server01".to_string()),
            ("region".to_string(), "us-east".to_string()),
        ])
    }

    #[test]
    fn point_basic() {
        let mut buf = String::new();
        write_point(&mut buf, "a&a&ping&rta&value", &empty_tags(), 1.0, 2_000);
        expect!["a&a&ping&rta&value value=1 2000\n"].assert_eq(&buf);
    }

    #[test]
    fn point_with_tags() {
        let mut buf = String::new();
        write_point(&mut buf, "load", &sample_tags(), 0.25, 1_700_000_000_000);
        expect!["load,host=server01,region=us-east value=0.25 1700000000000\n"].assert_eq(&buf);
    }

    #[test]
    fn nan_skipped() {
        let mut buf = String::new();
        write_point(&mut buf, "m", &empty_tags(), f64::NAN, 1_000);
        expect![""].assert_eq(&buf);
    }

    #[test]
    fn inf_skipped() {
        let mut buf = String::new();
        write_point(&mut buf, "m", &empty_tags(), f64::INFINITY, 1_000);
        expect![""].assert_eq(&buf);
    }

    #[test]
    fn escape_measurement_special_chars() {
        let mut buf = String::new();
        write_point(&mut buf, "b&b&usage&C: use,x&value", &empty_tags(), 1.0, 1_000);
        expect!["b&b&usage&C:\\ use\\,x&value value=1 1000\n"].assert_eq(&buf);
    }

    #[test]
    fn escape_tag_special_chars() {
        let mut buf = String::new();
        let tags = BTreeMap::from_iter([("host name".to_string(), "server=01,a".to_string())]);
        write_point(&mut buf, "m", &tags, 1.0, 1_000);
        expect!["m,host\\ name=server\\=01\\,a value=1 1000\n"].assert_eq(&buf);
    }

    #[test]
    fn empty_tag_value_omitted() {
        let mut buf = String::new();
        let tags = BTreeMap::from_iter([("state".to_string(), String::new())]);
        write_point(&mut buf, "m", &tags, 1.0, 1_000);
        expect!["m value=1 1000\n"].assert_eq(&buf);
    }

    #[test]
    fn backslash_in_measurement() {
        let mut buf = String::new();
        write_point(&mut buf, "path\\metric", &empty_tags(), 1.0, 1_000);
        expect!["path\\\\metric value=1 1000\n"].assert_eq(&buf);
    }

    #[test]
    fn batch_accumulates() {
        let batch = [
            DataPoint::new("a".to_string(), 100, 1.0),
            DataPoint::new("b".to_string(), 200, f64::NAN),
            DataPoint::new("c".to_string(), 300, 2.5),
        ];

        expect![[r#"
            a value=1 100
            c value=2.5 300
        "#]]
        .assert_eq(&encode_batch(&batch));
    }
}
