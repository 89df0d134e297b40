//! Query parameters and the cache keys derived from them.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 150;
pub const DEFAULT_SORT_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// Key segment for a sort field. Anything that could be mistaken for a
/// separator (`_`, `:`) moves the field behind a length prefix.
fn sort_segment(field: &str) -> String {
    let plain = field
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if plain {
        field.to_string()
    } else {
        format!("s{}:{}", field.len(), field)
    }
}

/// The full parameter set of a paginated listing request.
///
/// Two requests with equal parameters always share a cache key; requests
/// differing in any field never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub page: u32,
    pub page_size: u32,
    pub sort_field: String,
    pub sort_order: SortOrder,
    pub search_term: Option<String>,
    pub search_type: Option<String>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort_field: DEFAULT_SORT_FIELD.to_string(),
            sort_order: SortOrder::Asc,
            search_term: None,
            search_type: None,
        }
    }
}

impl QueryParams {
    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = field.into();
        self.sort_order = order;
        self
    }

    /// Set the search term; blank terms clear the search.
    pub fn search(mut self, term: impl Into<String>, search_type: Option<String>) -> Self {
        let term = term.into().trim().to_string();
        if term.is_empty() {
            self.search_term = None;
            self.search_type = None;
        } else {
            self.search_term = Some(term);
            self.search_type = search_type.filter(|t| !t.trim().is_empty());
        }
        self
    }

    /// Cache key for this request against `collection`, e.g. `services_1_150_asc_id`.
    ///
    /// Free-text parts are length-prefixed so no choice of search term or
    /// sort field can make two different requests collide. Plain sort fields
    /// (letters, digits, `.` and `-`) are written as-is.
    pub fn cache_key(&self, collection: &str) -> String {
        let mut key = format!(
            "{}_{}_{}_{}_{}",
            collection,
            self.page,
            self.page_size,
            self.sort_order.as_str(),
            sort_segment(&self.sort_field)
        );
        if let Some(ref term) = self.search_term {
            key.push_str(&format!("_q{}:{}", term.len(), term));
            if let Some(ref search_type) = self.search_type {
                key.push_str(&format!("_t{}:{}", search_type.len(), search_type));
            }
        }
        key
    }

    /// Query string pairs understood by the REST API.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.to_string()),
            ("limit", self.page_size.to_string()),
            ("order", self.sort_order.as_str().to_string()),
            ("orderBy", self.sort_field.clone()),
        ];
        if let Some(ref term) = self.search_term {
            pairs.push(("search", term.clone()));
            if let Some(ref search_type) = self.search_type {
                pairs.push(("searchType", search_type.clone()));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_key_format() {
        assert_eq!(
            QueryParams::default().cache_key("services"),
            "services_1_150_asc_id"
        );
    }

    #[test]
    fn test_search_changes_key() {
        let plain = QueryParams::default();
        let searched = QueryParams::default().search("cisplatin", Some("name".into()));
        assert_ne!(plain.cache_key("services"), searched.cache_key("services"));
        assert_eq!(
            searched.cache_key("services"),
            "services_1_150_asc_id_q9:cisplatin_t4:name"
        );
    }

    #[test]
    fn test_sort_field_cannot_forge_search_segment() {
        let forged = QueryParams::default().sort("id_q1:x", SortOrder::Asc);
        let searched = QueryParams::default().search("x", None);
        assert_ne!(forged.cache_key("services"), searched.cache_key("services"));
        assert_eq!(searched.cache_key("services"), "services_1_150_asc_id_q1:x");
        assert_eq!(forged.cache_key("services"), "services_1_150_asc_s7:id_q1:x");
    }

    #[test]
    fn test_plain_sort_fields_stay_readable() {
        let params = QueryParams::default().sort("createdAt", SortOrder::Desc);
        assert_eq!(params.cache_key("patients"), "patients_1_150_desc_createdAt");
    }

    #[test]
    fn test_blank_search_is_no_search() {
        let params = QueryParams::default().search("   ", Some("name".into()));
        assert_eq!(params, QueryParams::default());
    }

    #[test]
    fn test_query_pairs() {
        let params = QueryParams::default()
            .page(3)
            .sort("name", SortOrder::Desc)
            .search("5-FU", None);
        let pairs = params.to_query_pairs();
        assert!(pairs.contains(&("page", "3".to_string())));
        assert!(pairs.contains(&("limit", "150".to_string())));
        assert!(pairs.contains(&("order", "desc".to_string())));
        assert!(pairs.contains(&("orderBy", "name".to_string())));
        assert!(pairs.contains(&("search", "5-FU".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "searchType"));
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("sideways".parse::<SortOrder>().is_err());
    }

    fn params_strategy() -> impl Strategy<Value = QueryParams> {
        (
            1u32..50,
            prop_oneof![Just(25u32), Just(150u32)],
            prop_oneof![Just("id".to_string()), "[a-zA-Z0-9_:. -]{0,12}"],
            any::<bool>(),
            proptest::option::of("[a-zA-Z0-9 _:]{1,16}"),
            proptest::option::of("[a-z_:0-9]{1,8}"),
        )
            .prop_map(|(page, size, field, desc, term, search_type)| {
                let order = if desc { SortOrder::Desc } else { SortOrder::Asc };
                let params = QueryParams::default()
                    .page(page)
                    .page_size(size)
                    .sort(field, order);
                match term {
                    Some(term) => params.search(term, search_type),
                    None => params,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_key_is_deterministic(params in params_strategy()) {
            prop_assert_eq!(params.cache_key("services"), params.clone().cache_key("services"));
        }

        #[test]
        fn prop_distinct_params_distinct_keys(a in params_strategy(), b in params_strategy()) {
            if a != b {
                prop_assert_ne!(a.cache_key("services"), b.cache_key("services"));
            }
        }
    }
}
