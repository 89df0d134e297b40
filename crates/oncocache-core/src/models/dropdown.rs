//! Reference lists behind the catalog's foreign-key dropdowns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropdownKind {
    ActiveIngredient,
    AdministrationRoute,
    PharmaceuticalClass,
    FractionationUnit,
    FeeSchedule,
    TableClassification,
}

impl DropdownKind {
    pub const ALL: [DropdownKind; 6] = [
        DropdownKind::ActiveIngredient,
        DropdownKind::AdministrationRoute,
        DropdownKind::PharmaceuticalClass,
        DropdownKind::FractionationUnit,
        DropdownKind::FeeSchedule,
        DropdownKind::TableClassification,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            DropdownKind::ActiveIngredient => "active-ingredients",
            DropdownKind::AdministrationRoute => "administration-routes",
            DropdownKind::PharmaceuticalClass => "pharmaceutical-classes",
            DropdownKind::FractionationUnit => "fractionation-units",
            DropdownKind::FeeSchedule => "fee-schedules",
            DropdownKind::TableClassification => "table-classifications",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            DropdownKind::ActiveIngredient => "Active ingredient",
            DropdownKind::AdministrationRoute => "Administration route",
            DropdownKind::PharmaceuticalClass => "Pharmaceutical class",
            DropdownKind::FractionationUnit => "Fractionation unit",
            DropdownKind::FeeSchedule => "Fee schedule",
            DropdownKind::TableClassification => "Table classification",
        }
    }
}

impl std::str::FromStr for DropdownKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        DropdownKind::ALL
            .into_iter()
            .find(|kind| {
                let path: String = kind.path().chars().filter(|c| *c != '-').collect();
                // Accept singular forms too ("feeschedule")
                path == wanted || path.strip_suffix('s') == Some(wanted.as_str())
                    || path.strip_suffix("es") == Some(wanted.as_str())
            })
            .ok_or_else(|| format!("unknown dropdown: {}", s))
    }
}

/// One selectable option.
///
/// The API is inconsistent about the label field, so `name`, `description`
/// and `label` are all accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct DropdownOption {
    #[cfg_attr(feature = "ts", ts(type = "number | string"))]
    pub id: Value,
    #[serde(alias = "name", alias = "description")]
    pub label: String,
}

impl DropdownOption {
    pub fn id_display(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
