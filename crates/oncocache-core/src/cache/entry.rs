//! Persisted cache entries and payload classification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Cache schema version. Bumping it invalidates every persisted entry the
/// next time [`CacheStore::init`](super::CacheStore::init) runs.
pub const CACHE_VERSION: &str = "2.1";

/// A cached value with its bookkeeping.
///
/// `timestamp` and `expiry` are epoch milliseconds; `expiry` is
/// `timestamp + ttl` when the entry is created. `is_stale` is computed on
/// read and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T = Value> {
    pub data: T,
    #[serde(default)]
    #[cfg_attr(feature = "ts", ts(type = "Record<string, unknown>"))]
    pub metadata: Value,
    pub timestamp: i64,
    pub expiry: i64,
    pub version: String,
    #[serde(skip)]
    pub is_stale: bool,
}

impl<T> CacheEntry<T> {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.expiry
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }

    /// Short human-readable age, e.g. "5m ago".
    pub fn age_display(&self, now_ms: i64) -> String {
        format_age(self.age_ms(now_ms))
    }
}

/// Format an age in milliseconds as "just now", "Nm ago", "Nh ago" or "Nd ago".
pub fn format_age(age_ms: i64) -> String {
    let minutes = age_ms / 60_000;
    if minutes < 1 {
        // Also covers clock skew (negative ages)
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// The shape of a cached value, decided once at the store boundary.
///
/// Collections come back from the API either as a bare array or wrapped as
/// `{ "data": [...], ...paging fields }`; the wrapper's other fields are kept
/// in `envelope` so the value can be written back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum CachePayload {
    Collection {
        items: Vec<Value>,
        envelope: Option<Map<String, Value>>,
    },
    Record(Value),
}

impl CachePayload {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => CachePayload::Collection {
                items,
                envelope: None,
            },
            Value::Object(mut map) if matches!(map.get("data"), Some(Value::Array(_))) => {
                let items = match map.remove("data") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                CachePayload::Collection {
                    items,
                    envelope: Some(map),
                }
            }
            other => CachePayload::Record(other),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            CachePayload::Collection {
                items,
                envelope: None,
            } => Value::Array(items),
            CachePayload::Collection {
                items,
                envelope: Some(mut map),
            } => {
                map.insert("data".to_string(), Value::Array(items));
                Value::Object(map)
            }
            CachePayload::Record(value) => value,
        }
    }

    pub fn items(&self) -> Option<&[Value]> {
        match self {
            CachePayload::Collection { items, .. } => Some(items),
            CachePayload::Record(_) => None,
        }
    }
}

/// Shallow merge: every field of `patch` overwrites the same field of `target`.
/// Returns `false` when either side is not a JSON object.
pub fn merge_record(target: &mut Value, patch: &Value) -> bool {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (field, value) in patch {
                target.insert(field.clone(), value.clone());
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(timestamp: i64, expiry: i64) -> CacheEntry {
        CacheEntry {
            data: json!([]),
            metadata: json!({}),
            timestamp,
            expiry,
            version: CACHE_VERSION.to_string(),
            is_stale: false,
        }
    }

    #[test]
    fn test_expiry_is_exclusive_of_boundary() {
        let e = entry(0, 1_000);
        assert!(!e.is_expired_at(1_000));
        assert!(e.is_expired_at(1_001));
    }

    #[test]
    fn test_is_stale_not_persisted() {
        let mut e = entry(5, 10);
        e.is_stale = true;
        let text = serde_json::to_string(&e).unwrap();
        assert!(!text.contains("isStale"));
        let back: CacheEntry = serde_json::from_str(&text).unwrap();
        assert!(!back.is_stale);
        assert_eq!(back.timestamp, 5);
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(-5_000), "just now");
        assert_eq!(format_age(30_000), "just now");
        assert_eq!(format_age(5 * 60_000), "5m ago");
        assert_eq!(format_age(90 * 60_000), "2h ago");
        assert_eq!(format_age(61 * 60_000), "1h ago");
        assert_eq!(format_age(36 * 60 * 60_000), "2d ago");
    }

    #[test]
    fn test_payload_bare_array() {
        let payload = CachePayload::from_value(json!([{"id": 1}]));
        assert_eq!(payload.items().map(|i| i.len()), Some(1));
        assert_eq!(payload.into_value(), json!([{"id": 1}]));
    }

    #[test]
    fn test_payload_wrapped_array_keeps_envelope() {
        let value = json!({"data": [{"id": 1}], "total": 40, "hasMore": true});
        let payload = CachePayload::from_value(value.clone());
        match &payload {
            CachePayload::Collection { items, envelope } => {
                assert_eq!(items.len(), 1);
                assert_eq!(envelope.as_ref().unwrap()["total"], json!(40));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(payload.into_value(), value);
    }

    #[test]
    fn test_payload_record() {
        let payload = CachePayload::from_value(json!({"data": "not a list"}));
        assert!(matches!(payload, CachePayload::Record(_)));
        assert!(payload.items().is_none());
    }

    #[test]
    fn test_merge_record_overwrites_fields() {
        let mut target = json!({"id": 5, "name": "old", "code": "A1"});
        assert!(merge_record(&mut target, &json!({"id": 5, "name": "new"})));
        assert_eq!(target, json!({"id": 5, "name": "new", "code": "A1"}));
        assert!(!merge_record(&mut json!([1]), &json!({"x": 1})));
    }
}
