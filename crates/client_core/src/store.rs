//! Local persistent store surface consumed by the queue and the key cache.

use anyhow::Result;
use async_trait::async_trait;

/// Atomic key-value store for offline outbox entries and the session-key
/// mirror. Every operation is a single independent entry; there are no
/// multi-entry transactions.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Entries under `prefix`, ordered by key ascending.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

#[async_trait]
impl OfflineStore for storage::LocalStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        storage::LocalStore::put(self, key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        storage::LocalStore::get(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        storage::LocalStore::delete(self, key).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = storage::LocalStore::list_prefix(self, prefix).await?;
        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }
}
