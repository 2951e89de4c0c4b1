//! Core domain types shared by the cache, the orchestrator, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// CachedFindings
// ---------------------------------------------------------------------------

/// The two expensive analysis payloads a full run produces and the cache
/// stores: site-wide findings and per-page findings. Both are opaque to the
/// cache and the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedFindings {
    pub site_wide: serde_json::Value,
    pub per_page: serde_json::Value,
}

// ---------------------------------------------------------------------------
// CacheStats
// ---------------------------------------------------------------------------

/// Observability snapshot of the result cache, computed by scanning live
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of live (parseable, unexpired) entries.
    pub entry_count: usize,
    /// Bytes used by live entries, keys included.
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn run_ids_sort_by_creation() {
        let first = RunId::new();
        let second = RunId::new();
        assert!(first.0 <= second.0);
    }

    #[test]
    fn empty_stats_omit_timestamps() {
        let json = serde_json::to_string(&CacheStats::default()).expect("serialize");
        assert!(!json.contains("oldest_created_at"));
        assert!(json.contains(r#""entry_count":0"#));
    }
}
