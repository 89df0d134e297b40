use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::entry::CachePayload;

/// One page of a listing response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[cfg_attr(feature = "ts", ts(type = "Array<Record<string, unknown>>"))]
    pub data: Vec<Value>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub has_more: bool,
}

impl Page {
    pub fn new(data: Vec<Value>) -> Self {
        Self {
            data,
            total: None,
            has_more: false,
        }
    }

    /// Interpret a listing response, accepting a bare array or a `{ data: [...] }` wrapper.
    ///
    /// Returns `None` for anything else.
    pub fn from_value(value: Value) -> Option<Self> {
        match CachePayload::from_value(value) {
            CachePayload::Collection { items, envelope } => {
                let envelope = envelope.unwrap_or_default();
                let total = envelope
                    .get("total")
                    .or_else(|| envelope.get("count"))
                    .and_then(Value::as_u64);
                let has_more = envelope
                    .get("hasMore")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Some(Self {
                    data: items,
                    total,
                    has_more,
                })
            }
            CachePayload::Record(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "data": self.data, "total": self.total, "hasMore": self.has_more })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_bare_array() {
        let page = Page::from_value(json!([{"id": 1}, {"id": 2}])).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.total, None);
        assert!(!page.has_more);
    }

    #[test]
    fn test_page_from_wrapper() {
        let page = Page::from_value(json!({"data": [{"id": 1}], "total": 301, "hasMore": true})).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.total, Some(301));
        assert!(page.has_more);
    }

    #[test]
    fn test_page_rejects_record() {
        assert!(Page::from_value(json!({"id": 1})).is_none());
    }

    #[test]
    fn test_to_value_reads_back() {
        let page = Page {
            data: vec![json!({"id": 9})],
            total: Some(1),
            has_more: false,
        };
        assert_eq!(Page::from_value(page.to_value()).unwrap(), page);
    }
}
