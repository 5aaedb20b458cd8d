//! Shared utility functions used across the codebase.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

/// Milliseconds since the Unix epoch, the unit used for history timestamps.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Read an environment variable through `lookup`, treating blank values as unset.
pub fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Mask a secret for display as `first8...last4`.
///
/// Secrets too short to mask meaningfully are fully hidden.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Format an epoch-millisecond timestamp as `YYYY-MM-DD`, or `N/A` when absent.
pub fn format_date(timestamp_ms: Option<i64>) -> String {
    match timestamp_ms {
        None => "N/A".to_string(),
        Some(ms) => match Utc.timestamp_millis_opt(ms).single() {
            Some(dt) => dt.format("%Y-%m-%d").to_string(),
            None => "Invalid Date".to_string(),
        },
    }
}

/// Format a date given as epoch milliseconds (number or numeric string) or as
/// an RFC 3339 / `YYYY-MM-DD` string.
pub fn format_date_value(value: Option<&Value>) -> String {
    let millis = match value {
        None | Some(Value::Null) => return format_date(None),
        Some(v) => lenient::integer(v.clone()).or_else(|| v.as_str().and_then(parse_date_millis)),
    };
    match millis {
        Some(ms) => format_date(Some(ms)),
        None => "Invalid Date".to_string(),
    }
}

fn parse_date_millis(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight).timestamp_millis())
}

/// Compare two strings without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// Field deserializers for documents that other tools may have written.
///
/// A null or wrongly typed value falls back to the field's default instead of
/// failing the whole document.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn read<'de, D, T>(
        deserializer: D,
        coerce: fn(Value) -> Option<T>,
        fallback: fn() -> T,
    ) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(coerce(value).unwrap_or_else(fallback))
    }

    pub fn text(value: Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn flag(value: Value) -> Option<bool> {
        match value {
            Value::Bool(b) => Some(b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn float(value: Value) -> Option<f64> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.filter(|f: &f64| f.is_finite())
    }

    /// Integers, with fractional numbers rounded.
    pub fn integer(value: Value) -> Option<i64> {
        if let Value::Number(n) = &value {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
        }
        if let Value::String(s) = &value {
            if let Ok(i) = s.trim().parse::<i64>() {
                return Some(i);
            }
        }
        float(value)
            .filter(|f| f.abs() < i64::MAX as f64)
            .map(|f| f.round() as i64)
    }
}
