//! Configuration for store selection and manager setup
//!
//! These structures are serde-friendly so an application can keep its state
//! settings next to the rest of its configuration and build the store and
//! manager from them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::compression::GzipCompressor;
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::{Result, StateError};

/// Enumeration of supported key-value backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-wide in-memory store
    Memory,
    /// One file per key under a directory
    File,
}

/// Configuration structure for the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The backend to use
    pub backend: StoreBackend,
    /// Directory for the file backend
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    /// Gzip each record (file backend only)
    #[serde(default)]
    pub compression: bool,
}

impl StoreConfig {
    /// The shared in-memory store
    pub fn default_memory() -> Self {
        StoreConfig {
            backend: StoreBackend::Memory,
            base_path: None,
            compression: false,
        }
    }

    /// Uncompressed files under `path`
    pub fn file_at(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            backend: StoreBackend::File,
            base_path: Some(path.into()),
            compression: false,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Parse a store URI
    ///
    /// Supports formats:
    /// - `memory://` for the shared in-memory store
    /// - `file:///some/dir`, `/some/dir` or `./relative/dir` for the file store
    pub fn from_uri(uri: &str) -> Result<StoreConfig> {
        if let Some(rest) = uri.strip_prefix("memory://") {
            if !rest.is_empty() {
                return Err(StateError::validation(format!(
                    "Invalid memory URI: unexpected path '{rest}'"
                )));
            }
            return Ok(StoreConfig::default_memory());
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        if path.is_empty() {
            return Err(StateError::validation("Invalid store URI: missing path"));
        }
        if path.contains("://") {
            return Err(StateError::validation(format!(
                "Unsupported store URI scheme: {uri}"
            )));
        }
        Ok(StoreConfig::file_at(path))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StoreBackend::File => match &self.base_path {
                Some(path) if !path.as_os_str().is_empty() => {}
                _ => {
                    return Err(StateError::validation(
                        "File backend requires a base path",
                    ))
                }
            },
            StoreBackend::Memory => {
                if self.compression {
                    return Err(StateError::validation(
                        "Compression is only supported by the file backend",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::default_memory()
    }
}

/// Serde-driven manager settings. Pair with
/// [`StateManagerBuilder::config`](crate::StateManagerBuilder::config).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Persistence key. `None` disables persistence.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Schema version of the state shape
    #[serde(default)]
    pub schema_version: Option<i64>,
    #[serde(default)]
    pub store: StoreConfig,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.identifier, Some(id) if id.is_empty()) {
            return Err(StateError::validation("Identifier must not be empty"));
        }
        self.store.validate()
    }
}

/// Build the store described by `config`.
pub fn create_store_from_config(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    config.validate()?;

    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::shared())),
        StoreBackend::File => {
            let base = config
                .base_path
                .clone()
                .ok_or_else(|| StateError::validation("File backend requires a base path"))?;
            let store = FileStore::new(base);
            if config.compression {
                Ok(Arc::new(store.with_compression(GzipCompressor::new())))
            } else {
                Ok(Arc::new(store))
            }
        }
    }
}
