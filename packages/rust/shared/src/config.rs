//! Application configuration for seoscope.
//!
//! User config lives at `~/.seoscope/seoscope.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeoscopeError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "seoscope.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".seoscope";

/// Default cache database file name inside the config directory.
const CACHE_DB_NAME: &str = "cache.db";

/// Upper bound for `cache.ttl_hours` (ten years).
const MAX_TTL_HOURS: u64 = 24 * 365 * 10;

/// Upper bound for `cache.sweep_interval_minutes` (one year).
const MAX_SWEEP_INTERVAL_MINUTES: u64 = 60 * 24 * 365;

// ---------------------------------------------------------------------------
// Config structs (matching seoscope.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Which persistent medium backs the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// File-backed libSQL database.
    Libsql,
    /// Process-local map; nothing survives a restart.
    Memory,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_backend")]
    pub backend: CacheBackend,

    /// Database file for the libsql backend. Defaults to
    /// `~/.seoscope/cache.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Entry time-to-live.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Ceiling on stored entries; oldest are evicted beyond it.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// How many oldest entries to evict when a write hits the quota.
    #[serde(default = "default_eviction_batch")]
    pub eviction_batch: usize,

    /// Minimum spacing between expiry sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_minutes: u64,

    /// Optional byte quota applied by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            ttl_hours: default_ttl_hours(),
            max_entries: default_max_entries(),
            eviction_batch: default_eviction_batch(),
            sweep_interval_minutes: default_sweep_interval(),
            quota_bytes: None,
        }
    }
}

fn default_backend() -> CacheBackend {
    CacheBackend::Libsql
}
fn default_ttl_hours() -> u64 {
    7 * 24
}
fn default_max_entries() -> usize {
    50
}
fn default_eviction_batch() -> usize {
    5
}
fn default_sweep_interval() -> u64 {
    60
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Ranked URLs beyond this count are dropped before analysis.
    #[serde(default = "default_max_analyzed_urls")]
    pub max_analyzed_urls: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_analyzed_urls: default_max_analyzed_urls(),
        }
    }
}

fn default_max_analyzed_urls() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config file + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied by `store` when the caller passes none.
    pub default_ttl: Duration,
    /// Entry-count ceiling enforced after every successful store.
    pub max_entries: usize,
    /// Oldest entries evicted before retrying a write refused for quota.
    pub eviction_batch: usize,
    /// Minimum spacing between expiry sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CacheConfig {
    fn from(config: &AppConfig) -> Self {
        let cache = &config.cache;
        Self {
            default_ttl: Duration::hours(cache.ttl_hours.min(MAX_TTL_HOURS) as i64),
            max_entries: cache.max_entries,
            eviction_batch: cache.eviction_batch,
            sweep_interval: Duration::minutes(
                cache.sweep_interval_minutes.min(MAX_SWEEP_INTERVAL_MINUTES) as i64,
            ),
        }
    }
}

/// Runtime pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_analyzed_urls: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_analyzed_urls: config.pipeline.max_analyzed_urls,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.seoscope/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SeoscopeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.seoscope/seoscope.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the cache database path, falling back to `~/.seoscope/cache.db`.
pub fn cache_db_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.cache.path {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(config_dir()?.join(CACHE_DB_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SeoscopeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        SeoscopeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject settings that would make the cache or pipeline meaningless.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.cache.ttl_hours == 0 {
        return Err(SeoscopeError::config("cache.ttl_hours must be at least 1"));
    }
    if config.cache.ttl_hours > MAX_TTL_HOURS {
        return Err(SeoscopeError::config(format!(
            "cache.ttl_hours must be at most {MAX_TTL_HOURS}"
        )));
    }
    if config.cache.sweep_interval_minutes > MAX_SWEEP_INTERVAL_MINUTES {
        return Err(SeoscopeError::config(format!(
            "cache.sweep_interval_minutes must be at most {MAX_SWEEP_INTERVAL_MINUTES}"
        )));
    }
    if config.cache.max_entries == 0 {
        return Err(SeoscopeError::config("cache.max_entries must be at least 1"));
    }
    if config.cache.eviction_batch == 0 {
        return Err(SeoscopeError::config("cache.eviction_batch must be at least 1"));
    }
    if config.pipeline.max_analyzed_urls == 0 {
        return Err(SeoscopeError::config(
            "pipeline.max_analyzed_urls must be at least 1",
        ));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SeoscopeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SeoscopeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SeoscopeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
