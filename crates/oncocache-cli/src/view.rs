//! Terminal rendering of cached collections.

use std::io::{self, Write};
use std::sync::Mutex;

use oncocache_core::cache::{CacheStatus, DataSource, ViewSink};
use oncocache_core::models::{Collection, DropdownOption, Page, Service};
use serde_json::Value;

/// Longest rendered summary for a generic record.
const MAX_SUMMARY_WIDTH: usize = 72;

/// Prints whatever the cache layer pushes into it.
///
/// Records are held until the data source is known, so every table is
/// printed once with its origin.
pub struct TerminalView {
    json: bool,
    pending: Mutex<Option<Vec<Value>>>,
}

impl TerminalView {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            pending: Mutex::new(None),
        }
    }
}

impl ViewSink for TerminalView {
    fn set_records(&self, _collection: Collection, page: &Page) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(page.data.clone());
        }
    }

    fn set_loading(&self, collection: Collection, loading: bool) {
        if loading {
            eprintln!("Loading {}...", collection);
        }
    }

    fn set_error(&self, collection: Collection, error: Option<String>) {
        if let Some(error) = error {
            eprintln!("Error loading {}: {}", collection, error);
        }
    }

    fn set_data_source(&self, collection: Collection, source: DataSource) {
        let records = self.pending.lock().ok().and_then(|mut pending| pending.take());
        if let Some(records) = records {
            print_records(collection, &records, source, self.json);
        }
    }
}

pub fn print_records(collection: Collection, records: &[Value], source: DataSource, json: bool) {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if json {
        let _ = writeln!(out, "{}", Value::Array(records.to_vec()));
        return;
    }

    let _ = writeln!(out, "{} ({} rows, from {})", collection, records.len(), source.label());
    for record in records {
        let _ = writeln!(out, "  {}", record_line(collection, record));
    }
}

fn record_line(collection: Collection, record: &Value) -> String {
    if collection == Collection::Services {
        if let Some(service) = Service::from_record(record) {
            return format!(
                "{:>6}  {:<60}  {:>10}",
                service.id,
                truncate(&service.display_name(), 60),
                service.display_price()
            );
        }
    }

    let id = record
        .get(collection.id_field())
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "-".to_string());
    let rest = match record {
        Value::Object(map) => {
            let fields: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != collection.id_field())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(fields).to_string()
        }
        other => other.to_string(),
    };
    format!("{:>6}  {}", id, truncate(&rest, MAX_SUMMARY_WIDTH))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub fn print_options(title: &str, options: &[DropdownOption], source: DataSource) {
    println!("{} ({} options, from {})", title, options.len(), source.label());
    for option in options {
        println!("  {:>6}  {}", option.id_display(), option.label);
    }
}

pub fn print_status(status: &CacheStatus) {
    let stats = &status.stats;
    println!("Cache entries: {} ({} stale, {} invalid)", stats.entries, stats.stale, stats.invalid);
    println!(
        "Storage used:  {} / {} bytes ({}%)",
        stats.bytes_used,
        stats.quota_bytes,
        stats.usage_percent()
    );
    if stats.entries > 0 {
        println!("Oldest entry:  {}", status.oldest_age());
        println!("Newest entry:  {}", status.newest_age());
    }
    match status.last_write_age() {
        Some(age) => {
            let at = chrono::DateTime::from_timestamp_millis(stats.last_write)
                .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!("Last write:    {} ({})", age, at);
        }
        None => println!("Last write:    never"),
    }

    println!();
    println!("{:<36} {:>8} {:>8} {:>10}", "Collection", "Enabled", "Entries", "TTL");
    for domain in &status.domains {
        let ttl = match domain.ttl_secs {
            Some(secs) => format!("{}m", secs / 60),
            None => "none".to_string(),
        };
        println!(
            "{:<36} {:>8} {:>8} {:>10}",
            domain.name,
            if domain.enabled { "yes" } else { "no" },
            domain.entries,
            ttl
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_line_uses_model() {
        let line = record_line(
            Collection::Services,
            &json!({"id": 7, "code": "ONC-7", "description": "Cisplatin", "price": 10.5}),
        );
        assert!(line.contains("ONC-7 - Cisplatin"));
        assert!(line.ends_with("10.50"));
    }

    #[test]
    fn test_generic_line_omits_id_field() {
        let line = record_line(Collection::Patients, &json!({"id": "P-1", "name": "Ana"}));
        assert!(line.trim_start().starts_with("P-1"));
        assert!(line.contains(r#"{"name":"Ana"}"#));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
