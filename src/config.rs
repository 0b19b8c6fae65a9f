use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dirs_compat::data_dir;

pub const DEFAULT_PREFERENCE_THRESHOLD: u64 = 3;
pub const DEFAULT_HIGHLIGHT_COLOR: &str = "#ffeb3b";
pub const DEFAULT_ENRICHMENT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_ENRICHMENT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    /// `None` resolves to the platform data directory.
    pub database_path: Option<PathBuf>,
    pub preference_visit_threshold: u64,
    pub fallback_highlight_color: String,
    pub history: HistoryConfig,
    pub enrichment: EnrichmentConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            preference_visit_threshold: DEFAULT_PREFERENCE_THRESHOLD,
            fallback_highlight_color: DEFAULT_HIGHLIGHT_COLOR.to_string(),
            history: HistoryConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryConfig {
    pub sync_interval_secs: u64,
    pub lookback_hours: u64,
    pub max_entries: usize,
    /// Upper bound on simultaneous per-origin page fetches.
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub max_body_bytes: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 5 * 60,
            lookback_hours: 24,
            max_entries: 100,
            concurrency: 4,
            fetch_timeout_secs: 10,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl HistoryConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_hours * 60 * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: DEFAULT_ENRICHMENT_ENDPOINT.to_string(),
            model: DEFAULT_ENRICHMENT_MODEL.to_string(),
            timeout_secs: 20,
            max_tokens: 120,
        }
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServiceConfig {
    /// Defaults, then the JSON file named by `PAGELENS_CONFIG`, then
    /// individual `PAGELENS_*` overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("PAGELENS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse config file {path}"))?
            }
            _ => ServiceConfig::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(path) = env_value("PAGELENS_DB_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(threshold) = env_parsed::<u64>("PAGELENS_PREFERENCE_THRESHOLD")? {
            self.preference_visit_threshold = threshold;
        }
        if let Some(color) = env_value("PAGELENS_FALLBACK_COLOR") {
            self.fallback_highlight_color = color;
        }
        if let Some(secs) = env_parsed::<u64>("PAGELENS_HISTORY_INTERVAL_SECS")? {
            self.history.sync_interval_secs = secs;
        }
        if let Some(limit) = env_parsed::<usize>("PAGELENS_HISTORY_CONCURRENCY")? {
            self.history.concurrency = limit;
        }
        if let Some(endpoint) = env_value("PAGELENS_ENRICHMENT_ENDPOINT") {
            self.enrichment.endpoint = endpoint;
        }
        if let Some(model) = env_value("PAGELENS_ENRICHMENT_MODEL") {
            self.enrichment.model = model;
        }
        if let Some(value) = env_value("PAGELENS_ENRICHMENT_DISABLED") {
            self.enrichment.enabled = !matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.preference_visit_threshold == 0 {
            bail!("preference visit threshold must be at least 1");
        }
        if self.fallback_highlight_color.trim().is_empty() {
            bail!("fallback highlight color must not be empty");
        }
        if self.history.concurrency == 0 {
            bail!("history concurrency must be at least 1");
        }
        if self.history.sync_interval_secs == 0 {
            bail!("history sync interval must be positive");
        }
        Ok(())
    }

    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }

        data_dir()
            .map(|dir| dir.join("PageLens").join("pagelens.sqlite3"))
            .ok_or_else(|| anyhow!("failed to determine default database directory"))
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_value(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("invalid value for {name}: {err}")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};
    use tempfile::NamedTempFile;

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in [
            "PAGELENS_CONFIG",
            "PAGELENS_DB_PATH",
            "PAGELENS_PREFERENCE_THRESHOLD",
            "PAGELENS_FALLBACK_COLOR",
            "PAGELENS_HISTORY_INTERVAL_SECS",
            "PAGELENS_HISTORY_CONCURRENCY",
            "PAGELENS_ENRICHMENT_ENDPOINT",
            "PAGELENS_ENRICHMENT_MODEL",
            "PAGELENS_ENRICHMENT_DISABLED",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.preference_visit_threshold, 3);
        assert_eq!(config.history.sync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = env_guard().lock().expect("env guard poisoned");
        reset_env();

        std::env::set_var("PAGELENS_PREFERENCE_THRESHOLD", "5");
        std::env::set_var("PAGELENS_FALLBACK_COLOR", "#000000");
        std::env::set_var("PAGELENS_ENRICHMENT_DISABLED", "yes");
        std::env::set_var("PAGELENS_DB_PATH", "/tmp/pagelens-test.sqlite3");

        let config = ServiceConfig::load().expect("config loads");
        assert_eq!(config.preference_visit_threshold, 5);
        assert_eq!(config.fallback_highlight_color, "#000000");
        assert!(!config.enrichment.enabled);
        assert_eq!(
            config.resolve_database_path().expect("path"),
            PathBuf::from("/tmp/pagelens-test.sqlite3")
        );

        reset_env();
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let _lock = env_guard().lock().expect("env guard poisoned");
        reset_env();

        std::env::set_var("PAGELENS_HISTORY_CONCURRENCY", "many");
        let err = ServiceConfig::load().expect_err("invalid concurrency");
        assert!(err.to_string().contains("PAGELENS_HISTORY_CONCURRENCY"));

        reset_env();
    }

    #[test]
    fn file_config_is_merged_with_defaults() {
        let _lock = env_guard().lock().expect("env guard poisoned");
        reset_env();

        let file = NamedTempFile::new().expect("temp file");
        std::fs::write(
            file.path(),
            r#"{"preferenceVisitThreshold": 2, "history": {"concurrency": 8}}"#,
        )
        .expect("write config");
        std::env::set_var("PAGELENS_CONFIG", file.path());

        let config = ServiceConfig::load().expect("config loads");
        assert_eq!(config.preference_visit_threshold, 2);
        assert_eq!(config.history.concurrency, 8);
        assert_eq!(config.history.max_entries, 100);
        assert_eq!(config.fallback_highlight_color, DEFAULT_HIGHLIGHT_COLOR);

        reset_env();
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let config = ServiceConfig {
            preference_visit_threshold: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
