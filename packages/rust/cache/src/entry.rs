//! Stored record formats and key layout.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use seoscope_shared::CachedFindings;

/// Prefix of every entry key. Metadata deliberately lives outside it.
pub(crate) const ENTRY_PREFIX: &str = "seo-cache:";

/// Key of the process-wide metadata record.
pub(crate) const METADATA_KEY: &str = "seo-cache-meta";

/// `(domain, fingerprint)` identifying one cached analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain: String,
    pub fingerprint: String,
}

impl CacheKey {
    /// Resolve the key for a request URL and a URL set.
    pub fn resolve<I, S>(domain_url: &str, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domain: extract_domain(domain_url),
            fingerprint: seoscope_storage::compute_fingerprint(urls),
        }
    }

    /// Key under which the entry is stored.
    pub fn storage_key(&self) -> String {
        format!("{ENTRY_PREFIX}{}:{}", self.domain, self.fingerprint)
    }
}

/// Host component of `url`, or the raw string when it does not parse or has no host.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// One stored analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub domain: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// Time-to-live in milliseconds.
    pub ttl_ms: i64,
    pub site_wide: serde_json::Value,
    pub per_page: serde_json::Value,
}

impl CacheEntry {
    pub fn new(
        key: &CacheKey,
        created_at: DateTime<Utc>,
        ttl: Duration,
        findings: CachedFindings,
    ) -> Self {
        Self {
            domain: key.domain.clone(),
            fingerprint: key.fingerprint.clone(),
            created_at,
            ttl_ms: ttl.num_milliseconds(),
            site_wide: findings.site_wide,
            per_page: findings.per_page,
        }
    }

    /// Stored TTL, `None` when negative or out of range.
    pub fn ttl(&self) -> Option<Duration> {
        if self.ttl_ms < 0 {
            return None;
        }
        Duration::try_milliseconds(self.ttl_ms)
    }

    /// `now - created_at > ttl`. An entry without a usable TTL is always expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl() {
            Some(ttl) => now - self.created_at > ttl,
            None => true,
        }
    }

    pub fn into_findings(self) -> CachedFindings {
        CachedFindings {
            site_wide: self.site_wide,
            per_page: self.per_page,
        }
    }
}

/// Process-wide counters persisted next to the entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub entry_count: u64,
    pub last_cleanup_at: DateTime<Utc>,
}

impl CacheMetadata {
    pub(crate) fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            entry_count: 0,
            last_cleanup_at: now,
        }
    }
}
