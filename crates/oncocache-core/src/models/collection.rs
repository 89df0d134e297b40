use std::time::Duration;

use crate::cache::store::NO_EXPIRY;

use super::dropdown::DropdownKind;

/// Service data changes rarely; 30 minutes between revalidations.
const SERVICE_TTL: Duration = Duration::from_secs(30 * 60);

/// Patient-facing data changes throughout the day.
const CLINICAL_TTL: Duration = Duration::from_secs(10 * 60);

/// A cached collection: its REST path, cache key prefix and default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Services,
    Patients,
    Protocols,
    PreAuthorizations,
    Dropdown(DropdownKind),
}

impl Collection {
    pub const PAGED: [Collection; 4] = [
        Collection::Services,
        Collection::Patients,
        Collection::Protocols,
        Collection::PreAuthorizations,
    ];

    /// Path segment under the API base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Collection::Services => "services",
            Collection::Patients => "patients",
            Collection::Protocols => "protocols",
            Collection::PreAuthorizations => "preauthorizations",
            Collection::Dropdown(kind) => kind.path(),
        }
    }

    /// Name used as the first segment of every cache key for this collection.
    pub fn cache_name(&self) -> String {
        match self {
            Collection::Dropdown(kind) => format!("dropdown_{}", kind.path()),
            other => other.path().to_string(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            Collection::Services => SERVICE_TTL,
            Collection::Patients | Collection::Protocols | Collection::PreAuthorizations => {
                CLINICAL_TTL
            }
            Collection::Dropdown(_) => NO_EXPIRY,
        }
    }

    /// Primary key field of the records in this collection.
    pub fn id_field(&self) -> &'static str {
        "id"
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_name())
    }
}

impl std::str::FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "services" | "service" => Ok(Collection::Services),
            "patients" | "patient" => Ok(Collection::Patients),
            "protocols" | "protocol" => Ok(Collection::Protocols),
            "preauthorizations" | "preauthorization" | "preauths" => {
                Ok(Collection::PreAuthorizations)
            }
            other => other
                .parse::<DropdownKind>()
                .map(Collection::Dropdown)
                .map_err(|_| format!("unknown collection: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_names_are_distinct() {
        let mut names: Vec<String> = Collection::PAGED.iter().map(|c| c.cache_name()).collect();
        names.extend(DropdownKind::ALL.iter().map(|k| Collection::Dropdown(*k).cache_name()));
        let count = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), count);
    }

    #[test]
    fn test_ttls() {
        assert_eq!(Collection::Services.default_ttl(), Duration::from_secs(1800));
        assert_eq!(Collection::Patients.default_ttl(), Duration::from_secs(600));
        assert_eq!(
            Collection::Dropdown(DropdownKind::AdministrationRoute).default_ttl(),
            NO_EXPIRY
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("Services".parse::<Collection>().unwrap(), Collection::Services);
        assert_eq!(
            "pre-authorizations".parse::<Collection>().unwrap(),
            Collection::PreAuthorizations
        );
        assert_eq!(
            "fee-schedules".parse::<Collection>().unwrap(),
            Collection::Dropdown(DropdownKind::FeeSchedule)
        );
        assert!("invoices".parse::<Collection>().is_err());
    }
}
