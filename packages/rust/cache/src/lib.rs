//! Content-addressed result cache for analysis runs.
//!
//! Entries are keyed by `(domain, fingerprint of the discovered URL set)` and
//! hold the two expensive payloads of a full run. The cache is best-effort:
//! every store failure is logged and swallowed, and every unreadable entry is
//! a miss.
//!
//! Expiry is checked lazily on read. A sweep over all entries runs in the
//! background at most once per `sweep_interval`, and an entry-count ceiling is
//! enforced in the background after every successful write.

mod clock;
mod entry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use seoscope_shared::{CacheConfig, CacheStats, CachedFindings, Result};
use seoscope_storage::KvStore;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheKey, CacheMetadata, extract_domain};

use entry::{CacheEntry, ENTRY_PREFIX, METADATA_KEY};

/// Handle to the result cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    /// Serialises every read-modify-write of metadata and its entry.
    meta_lock: tokio::sync::Mutex<()>,
    sweep_in_flight: AtomicBool,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// A stored entry as seen by scans.
struct ScannedEntry {
    key: String,
    size: u64,
    /// `None` when the bytes do not parse.
    entry: Option<CacheEntry>,
}

impl ResultCache {
    /// Cache over `store` reading wall-clock time.
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Cache over `store` reading time from `clock`.
    pub fn with_clock(store: Arc<dyn KvStore>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                clock,
                meta_lock: tokio::sync::Mutex::new(()),
                sweep_in_flight: AtomicBool::new(false),
                maintenance: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Fetch the findings stored for `domain_url` and `urls`.
    ///
    /// Returns `None` for a missing, unreadable, or expired entry; the latter
    /// two are deleted on the way out. May schedule a background sweep.
    #[instrument(skip_all, fields(domain_url = %domain_url))]
    pub async fn lookup<S>(&self, domain_url: &str, urls: &[S]) -> Option<CachedFindings>
    where
        S: AsRef<str> + Sync,
    {
        self.schedule_sweep_if_due().await;

        let key = CacheKey::resolve(domain_url, urls.iter());
        let storage_key = key.storage_key();

        let bytes = match self.inner.store.get(&storage_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(domain = %key.domain, fingerprint = %key.fingerprint, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "corrupt cache entry, removing");
                self.remove_entry(&storage_key).await;
                return None;
            }
        };

        if entry.ttl().is_none() {
            warn!(key = %storage_key, ttl_ms = entry.ttl_ms, "cache entry has unusable ttl, removing");
            self.remove_entry(&storage_key).await;
            return None;
        }
        if entry.is_expired(self.now()) {
            debug!(key = %storage_key, created_at = %entry.created_at, "cache entry expired, removing");
            self.remove_entry(&storage_key).await;
            return None;
        }

        info!(domain = %key.domain, fingerprint = %key.fingerprint, "cache hit");
        Some(entry.into_findings())
    }

    /// Store findings for `domain_url` and `urls`. Uses the configured TTL
    /// when `ttl` is `None`.
    ///
    /// On a quota failure the oldest `eviction_batch` entries are evicted and
    /// the write is retried once. Any remaining failure abandons the write.
    #[instrument(skip_all, fields(domain_url = %domain_url))]
    pub async fn store<S>(
        &self,
        domain_url: &str,
        urls: &[S],
        findings: CachedFindings,
        ttl: Option<Duration>,
    ) where
        S: AsRef<str> + Sync,
    {
        let key = CacheKey::resolve(domain_url, urls.iter());
        let storage_key = key.storage_key();
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let entry = CacheEntry::new(&key, self.now(), ttl, findings);

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "failed to encode cache entry");
                return;
            }
        };

        {
            let _guard = self.inner.meta_lock.lock().await;
            let mut meta = self.load_metadata().await;
            let existed = matches!(self.inner.store.get(&storage_key).await, Ok(Some(_)));

            if let Err(e) = self
                .write_with_eviction(&storage_key, &bytes, &mut meta)
                .await
            {
                warn!(key = %storage_key, error = %e, "abandoning cache write");
                self.save_metadata(&meta).await;
                return;
            }

            if !existed {
                meta.entry_count += 1;
            }
            self.save_metadata(&meta).await;
            info!(
                domain = %key.domain,
                fingerprint = %key.fingerprint,
                bytes = bytes.len(),
                entry_count = meta.entry_count,
                "cached analysis"
            );
        }

        self.spawn_maintenance(|cache| async move { cache.enforce_ceiling().await });
    }

    /// Remove the entry for `domain_url` and `urls`, if present.
    pub async fn invalidate<S>(&self, domain_url: &str, urls: &[S])
    where
        S: AsRef<str> + Sync,
    {
        let key = CacheKey::resolve(domain_url, urls.iter());
        let storage_key = key.storage_key();

        match self.inner.store.get(&storage_key).await {
            Ok(Some(_)) => {
                self.remove_entry(&storage_key).await;
                info!(key = %storage_key, "cache entry invalidated");
            }
            Ok(None) => debug!(key = %storage_key, "nothing to invalidate"),
            Err(e) => warn!(key = %storage_key, error = %e, "cache read failed during invalidate"),
        }
    }

    /// Delete every entry whose key contains `filter` (all entries when
    /// `None`). Resets the sweep clock. Returns the number deleted.
    pub async fn clear(&self, filter: Option<&str>) -> usize {
        let _guard = self.inner.meta_lock.lock().await;

        let keys = match self.inner.store.keys(ENTRY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to list cache entries");
                return 0;
            }
        };

        let total = keys.len();
        let mut removed = 0;
        for key in keys.iter().filter(|k| filter.is_none_or(|f| k.contains(f))) {
            match self.inner.store.delete(key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(%key, error = %e, "failed to delete cache entry"),
            }
        }

        let meta = CacheMetadata {
            entry_count: (total - removed) as u64,
            last_cleanup_at: self.now(),
        };
        self.save_metadata(&meta).await;

        info!(removed, remaining = meta.entry_count, filter = filter.unwrap_or("*"), "cache cleared");
        removed
    }

    /// Scan live entries. For observability only.
    pub async fn stats(&self) -> CacheStats {
        let now = self.now();
        let mut stats = CacheStats::default();

        for scanned in self.scan_entries().await {
            let Some(entry) = scanned.entry else { continue };
            if entry.is_expired(now) {
                continue;
            }
            stats.entry_count += 1;
            stats.total_bytes += scanned.size;
            stats.oldest_created_at = Some(
                stats
                    .oldest_created_at
                    .map_or(entry.created_at, |t| t.min(entry.created_at)),
            );
            stats.newest_created_at = Some(
                stats
                    .newest_created_at
                    .map_or(entry.created_at, |t| t.max(entry.created_at)),
            );
        }

        stats
    }

    /// Current persisted counters.
    pub async fn metadata(&self) -> CacheMetadata {
        self.load_metadata().await
    }

    /// Wait for every background sweep and eviction spawned so far.
    pub async fn settle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut pending = self
                    .inner
                    .maintenance
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                std::mem::take(&mut *pending)
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "cache maintenance task failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background maintenance
    // -----------------------------------------------------------------------

    fn spawn_maintenance<F, Fut>(&self, task: F)
    where
        F: FnOnce(ResultCache) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.clone()));
        let mut pending = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn schedule_sweep_if_due(&self) {
        let meta = self.load_metadata().await;
        if self.now() - meta.last_cleanup_at < self.inner.config.sweep_interval {
            return;
        }
        if self.inner.sweep_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        self.spawn_maintenance(|cache| async move {
            cache.sweep().await;
            cache.inner.sweep_in_flight.store(false, Ordering::Release);
        });
    }

    /// Delete expired and unreadable entries.
    async fn sweep(&self) {
        let _guard = self.inner.meta_lock.lock().await;
        let now = self.now();
        let mut meta = self.load_metadata().await;
        if now - meta.last_cleanup_at < self.inner.config.sweep_interval {
            return;
        }

        let mut removed: u64 = 0;
        for scanned in self.scan_entries().await {
            let stale = scanned.entry.as_ref().is_none_or(|e| e.is_expired(now));
            if !stale {
                continue;
            }
            match self.inner.store.delete(&scanned.key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %scanned.key, error = %e, "failed to delete stale entry"),
            }
        }

        meta.entry_count = meta.entry_count.saturating_sub(removed);
        meta.last_cleanup_at = now;
        self.save_metadata(&meta).await;
        info!(removed, entry_count = meta.entry_count, "cache sweep complete");
    }

    /// Trim to `max_entries`, oldest first.
    async fn enforce_ceiling(&self) {
        let _guard = self.inner.meta_lock.lock().await;
        let mut meta = self.load_metadata().await;
        let ceiling = self.inner.config.max_entries;
        if meta.entry_count <= ceiling as u64 {
            return;
        }

        let mut entries = self.scan_entries().await;
        sort_oldest_first(&mut entries);
        let excess = entries.len().saturating_sub(ceiling);

        let mut removed = 0;
        for scanned in entries.iter().take(excess) {
            match self.inner.store.delete(&scanned.key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %scanned.key, error = %e, "failed to evict entry"),
            }
        }

        meta.entry_count = (entries.len() - removed) as u64;
        self.save_metadata(&meta).await;
        info!(removed, ceiling, entry_count = meta.entry_count, "enforced cache ceiling");
    }

    // -----------------------------------------------------------------------
    // Helpers (callers hold `meta_lock` where noted)
    // -----------------------------------------------------------------------

    /// Write `bytes`, evicting and retrying once on quota. Caller holds `meta_lock`.
    async fn write_with_eviction(
        &self,
        storage_key: &str,
        bytes: &[u8],
        meta: &mut CacheMetadata,
    ) -> Result<()> {
        match self.inner.store.set(storage_key, bytes).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_quota_exceeded() => {
                let batch = self.inner.config.eviction_batch;
                warn!(key = %storage_key, batch, "storage quota exceeded, evicting oldest entries");
                let evicted = self.evict_oldest(batch, storage_key).await;
                meta.entry_count = meta.entry_count.saturating_sub(evicted as u64);
                self.inner.store.set(storage_key, bytes).await
            }
            Err(e) => Err(e),
        }
    }

    /// Delete up to `count` entries by ascending `created_at`, never
    /// `keep`. Caller holds `meta_lock`.
    async fn evict_oldest(&self, count: usize, keep: &str) -> usize {
        let mut entries = self.scan_entries().await;
        entries.retain(|e| e.key != keep);
        sort_oldest_first(&mut entries);

        let mut evicted = 0;
        for scanned in entries.iter().take(count) {
            match self.inner.store.delete(&scanned.key).await {
                Ok(()) => {
                    debug!(key = %scanned.key, "evicted cache entry");
                    evicted += 1;
                }
                Err(e) => warn!(key = %scanned.key, error = %e, "failed to evict entry"),
            }
        }
        evicted
    }

    /// Delete one entry and decrement the counter. A concurrent sweep may
    /// already have removed it, in which case nothing is counted.
    async fn remove_entry(&self, storage_key: &str) {
        let _guard = self.inner.meta_lock.lock().await;
        if !matches!(self.inner.store.get(storage_key).await, Ok(Some(_))) {
            return;
        }
        if let Err(e) = self.inner.store.delete(storage_key).await {
            warn!(key = %storage_key, error = %e, "failed to delete cache entry");
            return;
        }
        let mut meta = self.load_metadata().await;
        meta.entry_count = meta.entry_count.saturating_sub(1);
        self.save_metadata(&meta).await;
    }

    async fn scan_entries(&self) -> Vec<ScannedEntry> {
        let keys = match self.inner.store.keys(ENTRY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to list cache entries");
                return Vec::new();
            }
        };

        let mut scanned = Vec::with_capacity(keys.len());
        for key in keys {
            match self.inner.store.get(&key).await {
                Ok(Some(bytes)) => scanned.push(ScannedEntry {
                    size: (key.len() + bytes.len()) as u64,
                    entry: serde_json::from_slice(&bytes).ok(),
                    key,
                }),
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "failed to read cache entry during scan"),
            }
        }
        scanned
    }

    /// Load metadata, creating and persisting it on first use. Garbage is
    /// replaced with a fresh record.
    async fn load_metadata(&self) -> CacheMetadata {
        match self.inner.store.get(METADATA_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(meta) => return meta,
                Err(e) => warn!(error = %e, "corrupt cache metadata, resetting"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to read cache metadata");
                return CacheMetadata::fresh(self.now());
            }
        }
        let meta = CacheMetadata::fresh(self.now());
        self.save_metadata(&meta).await;
        meta
    }

    async fn save_metadata(&self, meta: &CacheMetadata) {
        let bytes = match serde_json::to_vec(meta) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode cache metadata");
                return;
            }
        };
        if let Err(e) = self.inner.store.set(METADATA_KEY, &bytes).await {
            warn!(error = %e, "failed to persist cache metadata");
        }
    }
}

/// Unreadable entries first, then ascending `created_at`, then key.
fn sort_oldest_first(entries: &mut [ScannedEntry]) {
    entries.sort_by(|a, b| {
        let a_at = a.entry.as_ref().map(|e| e.created_at);
        let b_at = b.entry.as_ref().map(|e| e.created_at);
        a_at.cmp(&b_at).then_with(|| a.key.cmp(&b.key))
    });
}
