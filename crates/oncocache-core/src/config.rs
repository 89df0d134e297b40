//! Application configuration management.
//!
//! Configuration is stored at `~/.config/oncocache/config.json`. Every field
//! has a default, so a missing or partial file is fine. `ONCOCACHE_API_URL`,
//! `ONCOCACHE_API_TOKEN` and `ONCOCACHE_CACHE_DIR` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::chunked::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RECORDS};
use crate::cache::revalidation::FocusPolicy;
use crate::cache::storage::DEFAULT_QUOTA_BYTES;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "oncocache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub api_token: Option<String>,
    /// Overrides the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Write logs to daily files here instead of stderr.
    pub log_dir: Option<PathBuf>,
    pub cache: CacheSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            cache_dir: None,
            log_dir: None,
            cache: CacheSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub service_ttl_secs: u64,
    pub clinical_ttl_secs: u64,
    pub chunk_size: usize,
    pub max_records: usize,
    pub quota_bytes: usize,
    pub focus_cooldown_secs: u64,
    pub focus_max_age_secs: u64,
    pub search_debounce_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            service_ttl_secs: 30 * 60,
            clinical_ttl_secs: 10 * 60,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            focus_cooldown_secs: 3 * 60,
            focus_max_age_secs: 10 * 60,
            search_debounce_ms: 300,
        }
    }
}

impl CacheSettings {
    pub fn service_ttl(&self) -> Duration {
        Duration::from_secs(self.service_ttl_secs)
    }

    pub fn clinical_ttl(&self) -> Duration {
        Duration::from_secs(self.clinical_ttl_secs)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn focus_policy(&self) -> FocusPolicy {
        FocusPolicy {
            cooldown: Duration::from_secs(self.focus_cooldown_secs),
            max_age: Duration::from_secs(self.focus_max_age_secs),
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `ONCOCACHE_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let set = |name: &str| var(name).filter(|value| !value.trim().is_empty());

        if let Some(url) = set("ONCOCACHE_API_URL") {
            self.api_url = url;
        }
        if let Some(token) = set("ONCOCACHE_API_TOKEN") {
            self.api_token = Some(token);
        }
        if let Some(dir) = set("ONCOCACHE_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    /// Directory holding the on-disk cache entries.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.service_ttl(), Duration::from_secs(1800));
        assert_eq!(config.cache.chunk_size, 500);
        assert_eq!(config.cache.max_records, 5000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_url": "https://example.test/api", "cache": {"chunk_size": 250}}"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_url, "https://example.test/api");
        assert_eq!(config.cache.chunk_size, 250);
        assert_eq!(config.cache.max_records, DEFAULT_MAX_RECORDS);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.cache.enabled = false;
        config.log_dir = Some(dir.path().join("logs"));
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ONCOCACHE_API_URL", "https://override.test"),
            ("ONCOCACHE_CACHE_DIR", "/tmp/oncocache-test"),
            ("ONCOCACHE_API_TOKEN", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.api_url, "https://override.test");
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/oncocache-test"));
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn test_focus_policy_from_settings() {
        let policy = CacheSettings::default().focus_policy();
        assert_eq!(policy, FocusPolicy::default());
    }
}
