/*!
Durable key-value stores.

[`KeyValueStore`] is the port the persistence gateway writes through. Values
are opaque bytes; the gateway decides the encoding. Two adapters ship with
the crate:

- [`MemoryStore`] keeps values in a shared map for the life of the process.
- [`FileStore`] writes one file per key under a base directory.
*/

pub mod file;

use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use file::FileStore;

/// Async get/set/delete of byte values by string key.
///
/// Implementations must tolerate concurrent calls for unrelated keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, or `None` if there is none.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

static SHARED: Lazy<MemoryStore> = Lazy::new(MemoryStore::new);

/// In-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store used when a manager has an identifier but no
    /// explicit store.
    pub fn shared() -> Self {
        SHARED.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryStore::new();

        assert_eq!(store.get("todos").await.unwrap(), None);

        store.set("todos", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get("todos").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.len(), 1);

        store.delete("todos").await.unwrap();
        store.delete("todos").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_contents() {
        let store = MemoryStore::new();
        let other = store.clone();

        store.set("b", vec![2]).await.unwrap();
        other.set("a", vec![1]).await.unwrap();

        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(other.get("b").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_shared_store_is_process_wide() {
        MemoryStore::shared()
            .set("memory_store_shared_test", vec![7])
            .await
            .unwrap();
        assert_eq!(
            MemoryStore::shared().get("memory_store_shared_test").await.unwrap(),
            Some(vec![7])
        );
    }
}
