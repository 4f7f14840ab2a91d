//! Nagios performance data: `label=value[UOM];[warn];[crit];[min];[max]`.

use super::ParseError;

/// One metric of a performance data string.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceField {
    pub label: String,
    pub value: f64,
    pub unit: String,
    pub warn: Option<String>,
    pub crit: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
}

impl PerformanceField {
    /// Thresholds that are plain numbers, tagged with their field name.
    ///
    /// Ranges such as `10:20` or `@5:` are skipped.
    pub fn numeric_thresholds(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        [("warn", &self.warn), ("crit", &self.crit), ("min", &self.min), ("max", &self.max)]
            .into_iter()
            .filter_map(|(field, raw)| Some((field, parse_number(raw.as_deref()?)?)))
    }
}

/// Parses every metric of `perfdata`.
///
/// # Errors
///
/// Errors on the first token without `=` or with a non-numeric value.
pub fn parse(perfdata: &str) -> Result<Vec<PerformanceField>, ParseError> {
    tokenize(perfdata).iter().map(|token| parse_field(token)).collect()
}

/// Splits on whitespace, keeping backslash escapes and single-quoted labels
/// intact. Quotes are removed; `''` inside quotes is a literal quote.
pub(crate) fn tokenize(perfdata: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = perfdata.chars().peekable();

    while let Some(c) = chars.next() {
        match (quoted, c) {
            (true, '\'') => match chars.peek() {
                Some('\'') => {
                    chars.next();
                    current.push('\'');
                }
                _ => quoted = false,
            },
            (true, _) => current.push(c),
            (false, '\'') if current.is_empty() => quoted = true,
            (false, '\\') => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            (false, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (false, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn parse_field(token: &str) -> Result<PerformanceField, ParseError> {
    let (label, data) =
        token.rsplit_once('=').ok_or_else(|| ParseError::MalformedPerfData(token.to_string()))?;
    if label.is_empty() {
        return Err(ParseError::MalformedPerfData(token.to_string()));
    }

    let mut parts = data.split(';');
    let raw_value = parts.next().unwrap_or_default();
    let (number, unit) = split_unit(raw_value);
    let value = parse_number(number).ok_or_else(|| ParseError::InvalidValue {
        label: label.to_string(),
        value: raw_value.to_string(),
    })?;

    let mut threshold = || parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let (warn, crit, min, max) = (threshold(), threshold(), threshold(), threshold());

    Ok(PerformanceField { label: label.to_string(), value, unit: unit.to_string(), warn, crit, min, max })
}

/// Splits `12.5ms` into `("12.5", "ms")`.
fn split_unit(raw: &str) -> (&str, &str) {
    let end = raw
        .char_indices()
        .find(|&(i, c)| !is_number_char(raw, i, c))
        .map_or(raw.len(), |(i, _)| i);

    raw.split_at(end)
}

fn is_number_char(raw: &str, i: usize, c: char) -> bool {
    match c {
        '0'..='9' | '.' | ',' | '-' | '+' => true,
        // Exponent only when followed by a digit or sign, so units like `e` survive.
        'e' | 'E' => i > 0
            && raw[i + c.len_utf8()..]
                .chars()
                .next()
                .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+'),
        _ => false,
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let value: f64 = raw.replace(',', ".").parse().ok()?;

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn tokenize_plain() {
        expect![[r#"["rta=1;;;;", "pl=0%;80;100;0"]"#]]
            .assert_eq(&format!("{:?}", tokenize("rta=1;;;;  pl=0%;80;100;0 ")));
    }

    #[test]
    fn tokenize_escaped_space() {
        expect![[r#"["C:\\ use=1;;;;", "D:\\ use=2"]"#]]
            .assert_eq(&format!("{:?}", tokenize(r"C:\ use=1;;;; D:\ use=2")));
    }

    #[test]
    fn tokenize_quoted_label() {
        expect![[r#"["my label=5s", "it's=1"]"#]]
            .assert_eq(&format!("{:?}", tokenize("'my label'=5s 'it''s'=1")));
    }

    #[test]
    fn parse_with_thresholds_and_unit() {
        let fields = parse("time=0.012ms;0.5;1.0;0;").unwrap();

        expect![[r#"
            [
                PerformanceField {
                    label: "time",
                    value: 0.012,
                    unit: "ms",
                    warn: Some(
                        "0.5",
                    ),
                    crit: Some(
                        "1.0",
                    ),
                    min: Some(
                        "0",
                    ),
                    max: None,
                },
            ]
        "#]]
        .assert_debug_eq(&fields);
    }

    #[test]
    fn numeric_thresholds_skip_ranges() {
        let fields = parse("load=3;10:20;@5:;0;8").unwrap();

        assert_eq!(fields[0].numeric_thresholds().collect::<Vec<_>>(), [("min", 0.0), ("max", 8.0)]);
    }

    #[test]
    fn comma_decimal_and_exponent() {
        let fields = parse("a=1,5 b=2e3B c=-4").unwrap();

        assert_eq!(fields[0].value, 1.5);
        assert_eq!(fields[1].value, 2000.0);
        assert_eq!(fields[1].unit, "B");
        assert_eq!(fields[2].value, -4.0);
    }

    #[test]
    fn non_numeric_value_rejected() {
        expect![[r#"Invalid perfdata value; label=rta; value=U"#]]
            .assert_eq(&parse("rta=U;;;;").unwrap_err().to_string());
    }

    #[test]
    fn missing_equals_rejected() {
        expect!["Malformed perfdata token; token=garbage"]
            .assert_eq(&parse("garbage").unwrap_err().to_string());
    }

    #[test]
    fn empty_perfdata() {
        assert!(parse("   ").unwrap().is_empty());
    }
}
