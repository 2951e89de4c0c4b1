//! Turso Embedded / libSQL key/value store (offline mode).
//!
//! **Access rules:**
//! - the orchestrator and `seoscope` CLI: read-write via [`LibsqlStore::open`]
//! - inspection tooling: read-only via [`LibsqlStore::open_readonly`]

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use seoscope_shared::{Result, SeoscopeError};

use crate::KvStore;
use crate::migrations;

/// [`KvStore`] persisted in a single libSQL table.
pub struct LibsqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    quota_bytes: Option<u64>,
}

impl std::fmt::Debug for LibsqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibsqlStore")
            .field("readonly", &self.readonly)
            .field("quota_bytes", &self.quota_bytes)
            .finish_non_exhaustive()
    }
}

fn storage_err(e: libsql::Error) -> SeoscopeError {
    SeoscopeError::Storage(e.to_string())
}

impl LibsqlStore {
    /// Open or create a database at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SeoscopeError::io(parent, e))?;
        }
        let store = Self::connect(path, false).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Open an existing database without ever writing to it.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SeoscopeError::Storage(format!(
                "no cache database at {}",
                path.display()
            )));
        }
        Self::connect(path, true).await
    }

    /// Refuse writes once stored keys plus values would exceed `quota_bytes`.
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        Ok(Self {
            db,
            conn,
            readonly,
            quota_bytes: None,
        })
    }

    /// Apply every migration newer than the recorded schema version, each in
    /// its own transaction.
    async fn migrate(&self) -> Result<()> {
        let applied = self.schema_version().await?;
        for migration in migrations::all_migrations()
            .into_iter()
            .filter(|m| m.version > applied)
        {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying cache schema migration"
            );
            let batch = format!("BEGIN;\n{}\nCOMMIT;", migration.sql);
            if let Err(e) = self.conn.execute_batch(&batch).await {
                self.conn.execute_batch("ROLLBACK;").await.ok();
                return Err(SeoscopeError::Storage(format!(
                    "cache schema v{} failed: {e}",
                    migration.version
                )));
            }
        }
        Ok(())
    }

    /// Highest applied migration; 0 for a fresh database.
    async fn schema_version(&self) -> Result<u32> {
        let mut tracked = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                params![],
            )
            .await
            .map_err(storage_err)?;
        let has_table = match tracked.next().await.map_err(storage_err)? {
            Some(row) => row.get::<i64>(0).map_err(storage_err)? > 0,
            None => false,
        };
        if !has_table {
            return Ok(0);
        }

        let mut rows = self
            .conn
            .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u32),
            None => Ok(0),
        }
    }

    fn ensure_writable(&self, key: &str) -> Result<()> {
        if self.readonly {
            return Err(SeoscopeError::Storage(format!(
                "cannot write {key}: cache database is read-only"
            )));
        }
        Ok(())
    }

    /// Bytes held by every row except `key`.
    async fn used_bytes_excluding(&self, key: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(length(key) + length(value)), 0) FROM kv WHERE key != ?1",
                params![key],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }
}

#[async_trait]
impl KvStore for LibsqlStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: Vec<u8> = row
                    .get(0)
                    .map_err(storage_err)?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_writable(key)?;

        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes_excluding(key).await?;
            let needed = (key.len() + value.len()) as u64;
            if used + needed > quota {
                return Err(SeoscopeError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value.to_vec(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_writable(key)?;
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        // substr() rather than LIKE so '%' and '_' in keys stay literal.
        let mut rows = self
            .conn
            .query(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                params![prefix],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(
                row.get::<String>(0)
                    .map_err(storage_err)?,
            );
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("seoscope_test_{}.db", Uuid::now_v7()))
    }

    /// Create a temp file store for testing.
    async fn test_store() -> LibsqlStore {
        LibsqlStore::open(&temp_db()).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_db();
        let first = LibsqlStore::open(&tmp).await.expect("first open");
        drop(first);
        let second = LibsqlStore::open(&tmp).await.expect("second open");
        assert_eq!(second.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blob_roundtrip_and_overwrite() {
        let store = test_store().await;
        assert!(store.get("missing").await.unwrap().is_none());

        store.set("k", &[0, 159, 146, 150]).await.expect("set");
        assert_eq!(store.get("k").await.unwrap(), Some(vec![0, 159, 146, 150]));

        store.set("k", b"second").await.expect("overwrite");
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"second"[..]));

        store.delete("k").await.expect("delete");
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keys_by_prefix_are_literal() {
        let store = test_store().await;
        store.set("seo-cache:a.com:1", b"x").await.unwrap();
        store.set("seo-cache:b.com:2", b"y").await.unwrap();
        store.set("seo-cache-meta", b"{}").await.unwrap();
        store.set("seo_cache:c.com:3", b"z").await.unwrap();

        let keys = store.keys("seo-cache:").await.unwrap();
        assert_eq!(keys, vec!["seo-cache:a.com:1", "seo-cache:b.com:2"]);
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let store = test_store().await.with_quota(Some(12));
        store.set("k1", b"123456").await.expect("fits"); // 8 bytes

        let err = store.set("k2", b"123456").await.unwrap_err();
        assert!(err.is_quota_exceeded());

        store.delete("k1").await.unwrap();
        store.set("k2", b"123456").await.expect("fits after delete");
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_db();
        let rw = LibsqlStore::open(&tmp).await.unwrap();
        rw.set("k", b"v").await.unwrap();
        drop(rw);

        let ro = LibsqlStore::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
        let result = ro.set("k2", b"v2").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_open_shares_the_migrated_schema() {
        let tmp = temp_db();
        let rw = LibsqlStore::open(&tmp).await.unwrap();
        rw.set("seo-cache:a.com:1", b"payload").await.unwrap();
        drop(rw);

        let ro = LibsqlStore::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.schema_version().await.unwrap(), 1);
        assert_eq!(ro.keys("seo-cache:").await.unwrap(), vec!["seo-cache:a.com:1"]);
        assert!(ro.delete("seo-cache:a.com:1").await.is_err());
    }

    #[tokio::test]
    async fn readonly_open_requires_an_existing_database() {
        let tmp = temp_db();
        let err = LibsqlStore::open_readonly(&tmp).await.unwrap_err();
        assert!(err.to_string().contains("no cache database"));
        assert!(!tmp.exists());
    }
}
