use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A medication service in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: i64,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active_ingredient_id: Option<i64>,
    #[serde(default)]
    pub administration_route_id: Option<i64>,
    #[serde(default)]
    pub pharmaceutical_class_id: Option<i64>,
    #[serde(default)]
    pub fractionation_unit_id: Option<i64>,
    #[serde(default)]
    pub fee_schedule_id: Option<i64>,
    #[serde(default)]
    pub table_classification_id: Option<i64>,
    #[serde(default)]
    pub price: Option<f64>,
}

impl Service {
    /// Parse a cached or fetched record; `None` if it does not look like a service.
    pub fn from_record(record: &Value) -> Option<Self> {
        serde_json::from_value(record.clone()).ok()
    }

    pub fn display_name(&self) -> String {
        match (&self.code, &self.description) {
            (Some(code), Some(desc)) => format!("{} - {}", code, desc),
            (Some(code), None) => code.clone(),
            (None, Some(desc)) => desc.clone(),
            (None, None) => format!("Service #{}", self.id),
        }
    }

    pub fn display_price(&self) -> String {
        match self.price {
            Some(price) => format!("{:.2}", price),
            None => "-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_from_record() {
        let record = json!({
            "id": 12,
            "code": "ONC-004",
            "description": "Carboplatin 450mg",
            "administrationRouteId": 3,
            "price": 1520.5,
            "unmapped": true
        });
        let service = Service::from_record(&record).unwrap();
        assert_eq!(service.administration_route_id, Some(3));
        assert_eq!(service.display_name(), "ONC-004 - Carboplatin 450mg");
        assert_eq!(service.display_price(), "1520.50");
    }

    #[test]
    fn test_service_display_fallbacks() {
        let service = Service::from_record(&json!({"id": 7})).unwrap();
        assert_eq!(service.display_name(), "Service #7");
        assert_eq!(service.display_price(), "-");
        assert!(Service::from_record(&json!({"name": "no id"})).is_none());
    }
}
