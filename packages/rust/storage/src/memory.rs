//! In-process [`KvStore`] backed by a map, with an optional byte quota.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use seoscope_shared::{Result, SeoscopeError};

use crate::KvStore;

/// Map-backed store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    quota_bytes: Option<u64>,
}

impl MemoryStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses writes once keys plus values would exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Bytes currently held, keys included.
    pub fn used_bytes(&self) -> u64 {
        self.lock()
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A poisoned map is still structurally valid.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.lock();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            let needed = (key.len() + value.len()) as u64;
            if used + needed > quota {
                return Err(SeoscopeError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.set("a", b"one").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some(&b"one"[..]));

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        // Deleting a missing key is not an error.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn keys_filter_by_prefix() {
        let store = MemoryStore::new();
        store.set("seo-cache:a", b"1").await.unwrap();
        store.set("seo-cache:b", b"2").await.unwrap();
        store.set("seo-cache-meta", b"{}").await.unwrap();

        let keys = store.keys("seo-cache:").await.unwrap();
        assert_eq!(keys, vec!["seo-cache:a", "seo-cache:b"]);
        assert_eq!(store.keys("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn quota_refuses_oversized_write() {
        let store = MemoryStore::with_quota(10);
        store.set("k1", b"12345").await.unwrap(); // 7 bytes

        let err = store.set("k2", b"12345").await.unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(store.get("k2").await.unwrap().is_none());

        // Overwriting an existing key only counts the new value.
        store.set("k1", b"12345678").await.unwrap();
        assert_eq!(store.used_bytes(), 10);
    }
}
