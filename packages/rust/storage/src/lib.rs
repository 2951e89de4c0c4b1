//! Cache primitives: URL-set fingerprints and the persistent key/value medium.
//!
//! The [`KvStore`] trait is the narrow contract the result cache is written
//! against. Two implementations ship here:
//! - [`MemoryStore`]: in-process map, optional byte quota
//! - [`LibsqlStore`]: file-backed libSQL table, optional byte quota
//!
//! Any other medium (a remote database, a browser-style local storage) only
//! needs to implement the four methods below.

mod fingerprint;
mod libsql_store;
mod memory;
mod migrations;

use async_trait::async_trait;
use seoscope_shared::Result;

pub use fingerprint::compute_fingerprint;
pub use libsql_store::LibsqlStore;
pub use memory::MemoryStore;

/// Byte-oriented persistent key/value medium.
///
/// Implementations may fail at any call. `set` must report a full medium
/// with [`SeoscopeError::QuotaExceeded`](seoscope_shared::SeoscopeError::QuotaExceeded)
/// so callers can evict and retry.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Remove a value. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Every key starting with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
