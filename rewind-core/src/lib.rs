/*!
# Rewind Core

A state container with patch-based undo/redo and durable snapshots.

A [`StateManager`] holds one JSON-shaped document ([`Node`]). Changes are
deep-partial [`Patch`]es; undoable changes are [`Command`]s carrying a
forward and a reverse patch, kept in a linear [`History`]. After every
durable transition the manager writes the full state to a
[`KeyValueStore`] on a background task, and at construction it loads, and
if needed migrates, whatever was stored under its identifier.

## Modules

- [`node`]: the immutable document type
- [`patch`]: deep-partial patches and the merge that applies them
- [`command`]: commands and the undo/redo history
- [`store`]: the key-value store port with memory and file adapters
- [`gateway`]: versioned load and retried writes
- [`observable`]: publish target with selector subscriptions
- [`manager`]: the state manager
- [`config`]: serde-friendly store and manager settings
- [`observability`]: logging setup and optional metrics
*/

pub mod command;
pub mod compression;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod manager;
pub mod node;
pub mod observability;
pub mod observable;
pub mod patch;
pub mod runtime;
pub mod store;


pub use command::{Command, History};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{create_store_from_config, ManagerConfig, StoreBackend, StoreConfig};
pub use error::{Result, StateError};
pub use gateway::{PersistenceGateway, Readiness, Restored, UpgradeFn};
pub use hooks::{Change, ChangeKind, Hooks, NoHooks};
pub use manager::{StateManager, StateManagerBuilder, Status};
pub use node::{deep_copy, Node};
pub use observability::{init_default_observability, init_observability};
pub use observable::{Observable, Subscription};
pub use patch::{merge, Patch};
pub use store::{FileStore, KeyValueStore, MemoryStore};

#[cfg(feature = "metrics")]
pub use observability::{gather_metrics, MetricsTimer, RewindMetrics};

pub use rewind_retry::RetryPolicy;
