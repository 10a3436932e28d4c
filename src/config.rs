//! Daemon configuration (`forager.toml`).
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown top-level keys are accepted but logged as likely typos. The
//! `[[sources]]` list is the source of truth for what gets polled; it is
//! synced into the store at startup.
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::NewSource;
use crate::util::validate_source_url;

/// Shortest poll interval a source may ask for.
pub const MIN_POLL_INTERVAL_SECS: i64 = 60;

/// Longest poll interval a source may ask for (30 days).
pub const MAX_POLL_INTERVAL_SECS: i64 = 30 * 24 * 3600;

fn interval_in_range(secs: i64) -> bool {
    (MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&secs)
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level daemon configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,

    /// Poll interval for sources that do not set `interval_secs`.
    pub default_poll_interval_secs: i64,

    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherConfig,
    pub sync: SyncConfig,

    /// Sources to poll.
    pub sources: Vec<SourceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("forager.db"),
            default_poll_interval_secs: 3600,
            scheduler: SchedulerConfig::default(),
            fetcher: FetcherConfig::default(),
            sync: SyncConfig::default(),
            sources: Vec::new(),
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the coordinator scans for due sources.
    pub tick_secs: u64,
    /// Upper bound on simultaneous polls.
    pub max_concurrent_polls: usize,
    /// Ceiling on the failure backoff delay.
    pub max_backoff_secs: u64,
    /// Relative spread applied to backoff delays (0.15 = ±15%).
    pub jitter: f64,
    /// How long shutdown waits for in-flight polls before aborting them.
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            max_concurrent_polls: 8,
            max_backoff_secs: 24 * 3600,
            jitter: 0.15,
            shutdown_grace_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// `[fetcher]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Whole-request timeout.
    pub timeout_secs: u64,
    /// Retries for 429, 5xx and truncated bodies.
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry.
    pub retry_base_delay_ms: u64,
    /// Largest accepted response body.
    pub max_feed_bytes: usize,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            max_feed_bytes: 10 * 1024 * 1024,
            user_agent: concat!("forager/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// `[sync]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Disable stored sources that no longer appear in `[[sources]]`.
    pub disable_missing: bool,
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub interval_secs: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceEntry {
    pub fn to_new_source(&self) -> NewSource {
        NewSource {
            url: self.url.trim().to_string(),
            name: self.name.clone().unwrap_or_default(),
            category: self.category.clone(),
            tags: self.tags.clone(),
            poll_interval: self.interval_secs,
            enabled: self.enabled,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "database_path",
        "default_poll_interval_secs",
        "scheduler",
        "fetcher",
        "sync",
        "sources",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown top-level keys → accepted, logged as warning
    ///
    /// The result is not validated; call [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content, path)
    }

    fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Check values that serde cannot: URL schemes, duplicate URLs, interval
    /// floors and scheduler bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !interval_in_range(self.default_poll_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "default_poll_interval_secs must be between {} and {}",
                MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS
            )));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_polls == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_polls must be positive".to_string(),
            ));
        }
        if self.scheduler.max_backoff_secs < MIN_POLL_INTERVAL_SECS as u64 {
            return Err(ConfigError::Invalid(format!(
                "scheduler.max_backoff_secs must be at least {}",
                MIN_POLL_INTERVAL_SECS
            )));
        }
        if !(0.0..1.0).contains(&self.scheduler.jitter) {
            return Err(ConfigError::Invalid(
                "scheduler.jitter must be in [0, 1)".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let url = source.url.trim();
            validate_source_url(url)
                .map_err(|e| ConfigError::Invalid(format!("source {}: {}", url, e)))?;
            if !seen.insert(url) {
                return Err(ConfigError::Invalid(format!("duplicate source URL: {}", url)));
            }
            if let Some(interval) = source.interval_secs {
                if !interval_in_range(interval) {
                    return Err(ConfigError::Invalid(format!(
                        "source {}: interval_secs must be between {} and {}",
                        url, MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS
                    )));
                }
            }
        }
        Ok(())
    }

    /// Configured sources in store form.
    pub fn new_sources(&self) -> Vec<NewSource> {
        self.sources.iter().map(SourceEntry::to_new_source).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
