//! Shared types, error model, and configuration for seoscope.
//!
//! This crate is the foundation depended on by all other seoscope crates.
//! It provides:
//! - [`SeoscopeError`]: the unified error type
//! - Domain types ([`RunId`], [`CachedFindings`], [`CacheStats`])
//! - Configuration ([`AppConfig`], [`CacheConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheBackend, CacheConfig, CacheSettings, PipelineConfig, PipelineSettings,
    cache_db_path, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_config,
};
pub use error::{Result, SeoscopeError};
pub use types::{CacheStats, CachedFindings, RunId};
