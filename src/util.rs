//! Small shared helpers: UTC clock, cookie-blob parsing, JSON deep search,
//! environment lookups.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Error, Result};

/// Current wall-clock time in UTC.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Current unix timestamp (seconds).
pub fn utc_ts() -> i64 {
    Utc::now().timestamp()
}

/// Canonical on-disk timestamp format. Matches what sqlite's `datetime()`
/// emits so values written by SQL and values written by [`crate::Account`]
/// round-trip identically.
pub fn to_utc_str(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parses timestamps as stored on disk: either sqlite's
/// `YYYY-MM-DD HH:MM:SS` or an RFC-3339 string. Always interpreted as UTC.
pub fn parse_utc(val: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(val) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(val, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    None
}

/// Parses a cookie blob in any of the four accepted encodings:
/// RFC-6265 concatenation (`k=v; k=v`), a JSON object, a JSON array of
/// `{name, value}` pairs, or base64 of either JSON form. A wrapping
/// `{"cookies": …}` object is unwrapped first.
pub fn parse_cookies(val: &str) -> Result<HashMap<String, String>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(val.trim())
        .ok()
        .and_then(|b| String::from_utf8(b).ok());
    let val = decoded.as_deref().unwrap_or(val);

    if let Ok(mut parsed) = serde_json::from_str::<Value>(val) {
        if let Some(inner) = parsed.get("cookies") {
            parsed = inner.clone();
        }

        match parsed {
            Value::Object(map) => {
                let mut res = HashMap::new();
                for (k, v) in map {
                    match v.as_str() {
                        Some(s) => res.insert(k, s.to_string()),
                        None => return Err(Error::InvalidCookies(val.to_string())),
                    };
                }
                return Ok(res);
            }
            Value::Array(items) => {
                let mut res = HashMap::new();
                for item in items {
                    let name = item.get("name").and_then(Value::as_str);
                    let value = item.get("value").and_then(Value::as_str);
                    match (name, value) {
                        (Some(n), Some(v)) => res.insert(n.to_string(), v.to_string()),
                        _ => return Err(Error::InvalidCookies(val.to_string())),
                    };
                }
                return Ok(res);
            }
            _ => return Err(Error::InvalidCookies(val.to_string())),
        }
    }

    let mut res = HashMap::new();
    for pair in val.split("; ") {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => res.insert(k.to_string(), v.to_string()),
            _ => return Err(Error::InvalidCookies(val.to_string())),
        };
    }
    Ok(res)
}

/// Encodes query parameters the way the GraphQL endpoints expect: object
/// values are stripped of nulls and JSON-encoded compactly, scalars are
/// stringified as-is.
pub fn encode_params(obj: &[(&str, Value)]) -> Vec<(String, String)> {
    let mut res = Vec::with_capacity(obj.len());
    for (k, v) in obj {
        let s = match v {
            Value::Object(map) => {
                let filtered: serde_json::Map<String, Value> = map
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                serde_json::to_string(&Value::Object(filtered)).unwrap_or_default()
            }
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        res.push((k.to_string(), s));
    }
    res
}

/// Follows a dot-separated path through nested objects.
pub fn get_or<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = obj;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

/// Depth-first search for the first occurrence of `key` anywhere in the
/// object graph, descending through both objects and arrays.
pub fn get_by_path<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    match obj {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v);
            }
            map.values().find_map(|v| get_by_path(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| get_by_path(v, key)),
        _ => None,
    }
}

/// Depth-first search for the first object satisfying `pred`.
pub fn find_obj<'a>(obj: &'a Value, pred: &dyn Fn(&Value) -> bool) -> Option<&'a Value> {
    match obj {
        Value::Object(map) => {
            if pred(obj) {
                return Some(obj);
            }
            map.values().find_map(|v| find_obj(v, pred))
        }
        Value::Array(items) => items.iter().find_map(|v| find_obj(v, pred)),
        _ => None,
    }
}

/// True when the variable is set to one of `1`, `true`, `yes` (any case).
pub fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub fn env_int(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expected() -> HashMap<String, String> {
        HashMap::from([
            ("abc".to_string(), "123".to_string()),
            ("def".to_string(), "456".to_string()),
            ("ghi".to_string(), "789".to_string()),
        ])
    }

    #[test]
    fn cookies_parse_all_encodings() {
        let val = "abc=123; def=456; ghi=789";
        assert_eq!(parse_cookies(val).unwrap(), expected());

        let val = r#"{"abc": "123", "def": "456", "ghi": "789"}"#;
        assert_eq!(parse_cookies(val).unwrap(), expected());

        let val = r#"[{"name": "abc", "value": "123"}, {"name": "def", "value": "456"}, {"name": "ghi", "value": "789"}]"#;
        assert_eq!(parse_cookies(val).unwrap(), expected());

        // base64 of the object form
        let val = "eyJhYmMiOiAiMTIzIiwgImRlZiI6ICI0NTYiLCAiZ2hpIjogIjc4OSJ9";
        assert_eq!(parse_cookies(val).unwrap(), expected());

        // base64 of the array form
        let val = "W3sibmFtZSI6ICJhYmMiLCAidmFsdWUiOiAiMTIzIn0sIHsibmFtZSI6ICJkZWYiLCAidmFsdWUiOiAiNDU2In0sIHsibmFtZSI6ICJnaGkiLCAidmFsdWUiOiAiNzg5In1d";
        assert_eq!(parse_cookies(val).unwrap(), expected());

        let val = r#"{"cookies": {"abc": "123", "def": "456", "ghi": "789"}}"#;
        assert_eq!(parse_cookies(val).unwrap(), expected());

        assert!(parse_cookies("{invalid}").is_err());
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        assert_eq!(parse_utc(&to_utc_str(&now)), Some(now));
        assert_eq!(parse_utc("2024-03-01T12:30:45+00:00"), Some(now));
        assert_eq!(parse_utc("not a date"), None);
    }

    #[test]
    fn deep_search_finds_nested_keys() {
        let obj = json!({
            "data": {"timeline": {"instructions": [{"entries": [1, 2, 3]}]}}
        });
        assert_eq!(get_by_path(&obj, "entries"), Some(&json!([1, 2, 3])));
        assert_eq!(get_by_path(&obj, "missing"), None);

        let obj = json!({"a": [{"b": {"cursorType": "Bottom", "value": "xyz"}}]});
        let found = find_obj(&obj, &|o| {
            o.get("cursorType").and_then(Value::as_str) == Some("Bottom")
        });
        assert_eq!(found.and_then(|o| o.get("value")), Some(&json!("xyz")));
    }

    #[test]
    fn params_encoding_strips_nulls() {
        let params = encode_params(&[
            ("variables", json!({"q": "rust", "cursor": null})),
            ("count", json!(20)),
        ]);
        assert_eq!(params[0], ("variables".to_string(), r#"{"q":"rust"}"#.to_string()));
        assert_eq!(params[1], ("count".to_string(), "20".to_string()));
    }
}
