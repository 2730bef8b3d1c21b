/*!
Persistence gateway: versioned load at startup and retried writes after
every durable transition.

Two records live under a manager's identifier:

- `identifier`: the full state as JSON.
- `identifier + "_version"`: the schema version as a JSON integer (`-1` when
  no version is configured).
*/

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rewind_retry::{classify, with_backoff, RetryPolicy};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::observability::{MetricsTimer, RewindMetrics};
use crate::hooks::{Change, Hooks};
use crate::node::{deep_copy, Node};
use crate::store::KeyValueStore;
use crate::{runtime, Result, StateError};

/// Version written when none is configured.
pub const UNVERSIONED: i64 = -1;

/// `upgrade(stored, new_initial, stored_version)` produces the state to adopt
/// when the persisted schema is older than the configured one.
pub type UpgradeFn = Arc<dyn Fn(Node, &Node, i64) -> Node + Send + Sync>;

/// How the startup load resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    /// Nothing was stored, or there is no identifier. State stays initial.
    None,
    /// A stored state was adopted as-is.
    Restored,
    /// A stored state was passed through the upgrade path.
    Migrated,
}

/// Result of [`PersistenceGateway::load`].
#[derive(Debug, Clone)]
pub struct Restored {
    pub readiness: Readiness,
    /// State to install, `None` when the initial state should stay.
    pub state: Option<Node>,
}

impl Restored {
    fn nothing() -> Self {
        Self {
            readiness: Readiness::None,
            state: None,
        }
    }
}

/// Reads and writes one manager's records in a [`KeyValueStore`].
///
/// Clones share a write generation: every save takes the next number, and a
/// save that is still retrying gives up once a newer one has been issued.
#[derive(Clone)]
pub struct PersistenceGateway {
    identifier: String,
    version_key: String,
    store: Arc<dyn KeyValueStore>,
    schema_version: Option<i64>,
    upgrade: Option<UpgradeFn>,
    retry: RetryPolicy,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("identifier", &self.identifier)
            .field("schema_version", &self.schema_version)
            .field("has_upgrade", &self.upgrade.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

impl PersistenceGateway {
    pub fn new(identifier: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        let identifier = identifier.into();
        Self {
            version_key: format!("{identifier}_version"),
            identifier,
            store,
            schema_version: None,
            upgrade: None,
            retry: RetryPolicy::default(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_schema_version(mut self, version: Option<i64>) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_upgrade(mut self, upgrade: Option<UpgradeFn>) -> Self {
        self.upgrade = upgrade;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn version_key(&self) -> &str {
        &self.version_key
    }

    pub fn schema_version(&self) -> Option<i64> {
        self.schema_version
    }

    pub async fn read_state(&self) -> Result<Option<Node>> {
        match self.store.get(&self.identifier).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn read_version(&self) -> Result<Option<i64>> {
        match self.store.get(&self.version_key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn write_version(&self, version: i64) -> Result<()> {
        let bytes = serde_json::to_vec(&version)?;
        self.store.set(&self.version_key, bytes).await
    }

    /// Read the stored state, migrating it if its version is older than the
    /// configured one, and record the configured version.
    ///
    /// A stored record with no version record is adopted without migration.
    ///
    /// # Errors
    /// Store failures, undecodable records, and a panicking upgrade function.
    pub async fn load(&self, initial: &Node) -> Result<Restored> {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = RewindMetrics::global() {
            metrics.loads_total.inc();
        }

        let Some(stored) = self.read_state().await? else {
            self.write_version(self.schema_version.unwrap_or(UNVERSIONED))
                .await?;
            info!(identifier = %self.identifier, "no persisted state, starting fresh");
            return Ok(Restored::nothing());
        };

        let Some(version) = self.schema_version else {
            self.write_version(UNVERSIONED).await?;
            info!(identifier = %self.identifier, "restored persisted state");
            return Ok(Restored {
                readiness: Readiness::Restored,
                state: Some(stored),
            });
        };

        let restored = match self.read_version().await? {
            Some(previous) if previous < version => {
                info!(
                    identifier = %self.identifier,
                    from = previous,
                    to = version,
                    "migrating persisted state"
                );
                #[cfg(feature = "metrics")]
                if let Some(metrics) = RewindMetrics::global() {
                    metrics.migrations_total.inc();
                }
                Restored {
                    readiness: Readiness::Migrated,
                    state: Some(self.migrate(stored, initial, previous)?),
                }
            }
            _ => {
                info!(identifier = %self.identifier, version, "restored persisted state");
                Restored {
                    readiness: Readiness::Restored,
                    state: Some(stored),
                }
            }
        };

        self.write_version(version).await?;
        Ok(restored)
    }

    fn migrate(&self, stored: Node, initial: &Node, previous: i64) -> Result<Node> {
        let Some(upgrade) = &self.upgrade else {
            debug!(identifier = %self.identifier, "no upgrade function, using initial state");
            return Ok(deep_copy(initial));
        };

        panic::catch_unwind(AssertUnwindSafe(|| upgrade(stored, initial, previous))).map_err(
            |payload| {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "upgrade function panicked".to_string());
                StateError::migration(format!(
                    "upgrade of {} from version {previous} failed: {reason}",
                    self.identifier
                ))
            },
        )
    }

    /// Write `state` under the identifier, retrying transient store errors.
    pub async fn save(&self, state: &Node) -> Result<()> {
        let generation = self.next_generation();
        self.save_generation(state, generation).await.map(|_| ())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns `false` when a newer save was issued before this one reached
    /// the store; the record is left to the newer save.
    async fn save_generation(&self, state: &Node, generation: u64) -> Result<bool> {
        let bytes = serde_json::to_vec(state)?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = RewindMetrics::global() {
            metrics.record_state_size(bytes.len());
        }
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start_write();

        let store = Arc::clone(&self.store);
        let key = self.identifier.clone();
        let latest = Arc::clone(&self.generation);
        let result = with_backoff("persist_state", &self.retry, move |_attempt| {
            let store = Arc::clone(&store);
            let key = key.clone();
            let bytes = bytes.clone();
            let latest = Arc::clone(&latest);
            Box::pin(async move {
                if latest.load(Ordering::SeqCst) > generation {
                    return Ok(false);
                }
                store
                    .set(&key, bytes)
                    .await
                    .map(|()| true)
                    .map_err(|e| classify("persist_state", e))
            })
        })
        .await
        .map_err(StateError::from);

        #[cfg(feature = "metrics")]
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }

        result
    }

    /// Remove both records.
    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&self.identifier).await?;
        self.store.delete(&self.version_key).await
    }

    /// Start [`load`](Self::load) in the background. The receiver yields its
    /// result; if no runtime is available it yields a load error.
    pub fn spawn_load(&self, initial: Node) -> oneshot::Receiver<Result<Restored>> {
        let (tx, rx) = oneshot::channel();
        let Some(handle) = runtime::handle() else {
            let _ = tx.send(Err(StateError::load("no async runtime available")));
            return rx;
        };

        let gateway = self.clone();
        handle.spawn(async move {
            let result = gateway.load(&initial).await;
            if let Err(e) = &result {
                error!(identifier = %gateway.identifier, error = %e, "failed to load persisted state");
            }
            // The manager may already be gone.
            let _ = tx.send(result);
        });
        rx
    }

    /// Write `state` in the background and report the outcome to `hooks`.
    ///
    /// The write takes its generation when spawned, so a later `spawn_save`
    /// supersedes it even if this one is still waiting to retry. A superseded
    /// write reports to neither hook.
    pub fn spawn_save(
        &self,
        state: Node,
        change: Change,
        hooks: Arc<dyn Hooks>,
    ) -> Option<JoinHandle<()>> {
        let Some(handle) = runtime::handle() else {
            let e = StateError::storage("no async runtime available for state write");
            warn!(identifier = %self.identifier, change = %change, "skipping state write");
            hooks.on_persist_error(&e, &change);
            return None;
        };

        let generation = self.next_generation();
        let gateway = self.clone();
        Some(handle.spawn(async move {
            match gateway.save_generation(&state, generation).await {
                Ok(true) => {
                    debug!(identifier = %gateway.identifier, change = %change, "persisted state");
                    hooks.on_persist(&state, &change);
                }
                Ok(false) => {
                    debug!(
                        identifier = %gateway.identifier,
                        change = %change,
                        generation,
                        "state write superseded by a newer one"
                    );
                }
                Err(e) => {
                    error!(
                        identifier = %gateway.identifier,
                        change = %change,
                        error = %e,
                        "failed to persist state"
                    );
                    hooks.on_persist_error(&e, &change);
                }
            }
        }))
    }
}
