/*!
Filesystem key-value store.
*/

use super::KeyValueStore;
use crate::compression::{CompressionAdapter, NoCompression};
use crate::{Result, StateError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// Shared by every FileStore in the process; with the process id it keeps
// temporary names unique across stores pointed at the same directory.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One file per key under `base_dir`.
///
/// File names are the SHA-256 of the key, so any identifier is safe to use.
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never sees a half-written record.
///
/// # Example
/// ```rust,no_run
/// use rewind_core::store::{FileStore, KeyValueStore};
/// use rewind_core::compression::GzipCompressor;
///
/// # async fn demo() -> rewind_core::Result<()> {
/// let store = FileStore::new("/var/lib/myapp/state").with_compression(GzipCompressor::new());
/// store.set("todos", br#"{"todos":{}}"#.to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FileStore {
    base_dir: PathBuf,
    compressor: Arc<dyn CompressionAdapter>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("base_dir", &self.base_dir)
            .field("compression", &self.compressor.algorithm_name())
            .finish()
    }
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            compressor: Arc::new(NoCompression),
        }
    }

    pub fn with_compression<C: CompressionAdapter + 'static>(mut self, compressor: C) -> Self {
        self.compressor = Arc::new(compressor);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Where the value for `key` lives on disk.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = format!("{digest:x}.json");
        if self.compressor.algorithm_name() != "none" {
            name.push('.');
            name.push_str(self.compressor.algorithm_name());
        }
        self.base_dir.join(name)
    }

    fn tmp_path_for(path: &Path) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("{}.{n}.tmp", std::process::id()))
    }

    async fn ensure_base_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StateError::storage(format!(
                "Failed to create directory {}: {e}",
                self.base_dir.display()
            ))
        })
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => self.compressor.decompress(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::storage(format!(
                "Failed to read {} from {}: {e}",
                key,
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.ensure_base_dir().await?;

        let path = self.path_for(key);
        let tmp = Self::tmp_path_for(&path);
        let bytes = self.compressor.compress(&value)?;

        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await.map_err(|e| {
                StateError::storage(format!("Failed to move record into {}: {e}", path.display()))
            }),
            Err(e) => Err(StateError::storage(format!(
                "Failed to write {}: {e}",
                tmp.display()
            ))),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %cleanup, "failed to remove temporary file");
                }
            }
            return Err(e);
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "wrote record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::storage(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::GzipCompressor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());

        assert_eq!(store.get("todos").await.unwrap(), None);

        store.set("todos", b"{\"a\":1}".to_vec()).await.unwrap();
        assert!(store.path_for("todos").exists());
        assert_eq!(store.get("todos").await.unwrap(), Some(b"{\"a\":1}".to_vec()));

        store.delete("todos").await.unwrap();
        assert!(!store.path_for("todos").exists());
        store.delete("todos").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_with_path_separators_are_safe() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());

        store.set("../escape/attempt", vec![1]).await.unwrap();

        let path = store.path_for("../escape/attempt");
        assert_eq!(path.parent(), Some(temp_dir.path()));
        assert_eq!(store.get("../escape/attempt").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_creates_missing_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().join("nested/state"));

        store.set("k", vec![9]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_compressed_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).with_compression(GzipCompressor::new());
        let value = br#"{"text":"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"}"#.to_vec();

        store.set("big", value.clone()).await.unwrap();

        let path = store.path_for("big");
        assert!(path.to_string_lossy().ends_with(".json.gzip"));
        assert!(std::fs::metadata(&path).unwrap().len() < value.len() as u64);
        assert_eq!(store.get("big").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_no_temporary_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());

        for i in 0..5 {
            store.set("todos", vec![i]).await.unwrap();
        }

        let entries: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.get("todos").await.unwrap(), Some(vec![4]));
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temporary_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let target = store.path_for("todos");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        let err = store.set("todos", vec![1]).await.unwrap_err();

        assert!(matches!(err, StateError::Storage(_)));
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_stores_sharing_a_directory_use_distinct_temporary_files() {
        let temp_dir = TempDir::new().unwrap();
        let first = FileStore::new(temp_dir.path());
        let second = FileStore::new(temp_dir.path());

        let a = FileStore::tmp_path_for(&first.path_for("todos"));
        let b = FileStore::tmp_path_for(&second.path_for("todos"));
        assert_ne!(a, b);
        assert!(a
            .to_string_lossy()
            .contains(&format!(".{}.", std::process::id())));

        let (left, right) = tokio::join!(
            first.set("todos", vec![1]),
            second.set("todos", vec![2])
        );
        left.unwrap();
        right.unwrap();
        let stored = first.get("todos").await.unwrap().unwrap();
        assert!(stored == vec![1] || stored == vec![2]);
    }
}
