/*!
The state manager: current state, linear undo/redo history, and durable
snapshots.

Domain code wraps a [`StateManager`] and expresses each user action as a
[`Command`] whose `after` patch performs the action and whose `before` patch
reverses it. The manager applies commands, records them, publishes every new
state to its [`Observable`], and mirrors the state to a key-value store in
the background.

```rust,no_run
use rewind_core::{Command, Node, Patch, StateManager};
use serde_json::json;

# async fn demo() -> rewind_core::Result<()> {
let mut manager = StateManager::builder(Node::from(json!({
    "todos": {"todo0": {"text": "Scrub the dog.", "isComplete": false}}
})))
.identifier("todos")
.build();

manager.ready().await?;

manager.set_state(
    Command::new(
        Patch::at(["todos", "todo0", "isComplete"], false),
        Patch::at(["todos", "todo0", "isComplete"], true),
    ),
    Some("toggle_todo"),
);
manager.undo();
manager.flush().await;
# Ok(())
# }
```
*/

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use rewind_retry::RetryPolicy;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{Command, History};
use crate::config::{create_store_from_config, ManagerConfig};
use crate::gateway::{PersistenceGateway, Readiness, Restored, UpgradeFn};
use crate::hooks::{Change, ChangeKind, Hooks, NoHooks};
use crate::node::{deep_copy, Node};
use crate::observable::Observable;
use crate::patch::{merge, Patch};
use crate::store::{KeyValueStore, MemoryStore};
use crate::{Result, StateError};

/// Whether the persisted state has been installed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Loading,
    Ready,
}

/// Builder for [`StateManager`].
pub struct StateManagerBuilder {
    initial: Node,
    identifier: Option<String>,
    schema_version: Option<i64>,
    upgrade: Option<UpgradeFn>,
    store: Option<Arc<dyn KeyValueStore>>,
    hooks: Arc<dyn Hooks>,
    retry: RetryPolicy,
}

impl StateManagerBuilder {
    fn new(initial: Node) -> Self {
        Self {
            initial,
            identifier: None,
            schema_version: None,
            upgrade: None,
            store: None,
            hooks: Arc::new(NoHooks),
            retry: RetryPolicy::default(),
        }
    }

    /// Persist under `identifier`. An empty identifier disables persistence.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        let identifier: String = identifier.into();
        self.identifier = Some(identifier).filter(|id| !id.is_empty());
        self
    }

    pub fn schema_version(mut self, version: i64) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Called as `upgrade(stored, initial, stored_version)` when the stored
    /// schema version is older than the configured one.
    pub fn upgrade<F>(mut self, upgrade: F) -> Self
    where
        F: Fn(Node, &Node, i64) -> Node + Send + Sync + 'static,
    {
        self.upgrade = Some(Arc::new(upgrade));
        self
    }

    /// Store for persisted records. Defaults to [`MemoryStore::shared`].
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply identifier, schema version and store from `config`.
    pub fn config(mut self, config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        self.identifier = config.identifier.clone();
        self.schema_version = config.schema_version;
        self.store = Some(create_store_from_config(&config.store)?);
        Ok(self)
    }

    /// Create the manager and, with an identifier, start loading persisted
    /// state in the background.
    pub fn build(self) -> StateManager {
        let initial = deep_copy(&self.initial);
        let state = initial.clone();
        let snapshot = deep_copy(&initial);

        let gateway = self.identifier.map(|identifier| {
            let store = self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::shared()));
            PersistenceGateway::new(identifier, store)
                .with_schema_version(self.schema_version)
                .with_upgrade(self.upgrade)
                .with_retry_policy(self.retry)
        });

        let mut manager = StateManager {
            observable: Observable::new(state.clone()),
            state,
            initial,
            snapshot,
            history: History::new(),
            status: Status::Loading,
            readiness: None,
            load_error: None,
            pending: None,
            gateway,
            hooks: self.hooks,
            writes: Vec::new(),
        };

        match &manager.gateway {
            Some(gateway) => {
                debug!(identifier = %gateway.identifier(), "loading persisted state");
                manager.pending = Some(gateway.spawn_load(deep_copy(&manager.initial)));
            }
            None => {
                manager.status = Status::Ready;
                manager.readiness = Some(Readiness::None);
                manager.hooks.on_ready(Readiness::None, &manager.state);
            }
        }

        manager
    }
}

/// Owns the current state, its history, and its persistence.
///
/// Every mutating operation takes `&mut self` and has finished its in-memory
/// work when it returns. Persistence happens on detached tasks; await
/// [`flush`](Self::flush) to wait for them. Nothing is written while the
/// status is [`Status::Loading`], including after a failed load.
pub struct StateManager {
    state: Node,
    initial: Node,
    snapshot: Node,
    history: History,
    status: Status,
    readiness: Option<Readiness>,
    load_error: Option<String>,
    pending: Option<oneshot::Receiver<Result<Restored>>>,
    gateway: Option<PersistenceGateway>,
    observable: Observable,
    hooks: Arc<dyn Hooks>,
    writes: Vec<JoinHandle<()>>,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("identifier", &self.identifier())
            .field("status", &self.status)
            .field("history_len", &self.history.len())
            .field("pointer", &self.history.pointer())
            .finish()
    }
}

impl StateManager {
    pub fn builder(initial: impl Into<Node>) -> StateManagerBuilder {
        StateManagerBuilder::new(initial.into())
    }

    /// A manager with no persistence and no hooks.
    pub fn new(initial: impl Into<Node>) -> Self {
        Self::builder(initial).build()
    }

    // Accessors ---------------------------------

    pub fn state(&self) -> &Node {
        &self.state
    }

    /// The current state decoded into an application type.
    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T> {
        self.state.to_typed()
    }

    pub fn snapshot(&self) -> &Node {
        &self.snapshot
    }

    pub fn initial_state(&self) -> &Node {
        &self.initial
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Install a finished load, if any, and report the status.
    pub fn poll_ready(&mut self) -> Status {
        self.poll_restore();
        self.status
    }

    /// How the load resolved, once it has been installed.
    pub fn readiness(&self) -> Option<Readiness> {
        self.readiness
    }

    /// Why the load failed, if it did.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.gateway.as_ref().map(PersistenceGateway::identifier)
    }

    pub fn gateway(&self) -> Option<&PersistenceGateway> {
        self.gateway.as_ref()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// The observable store the manager publishes to.
    pub fn store(&self) -> &Observable {
        &self.observable
    }

    // Lifecycle ---------------------------------

    /// Wait for the persisted state to be loaded and installed.
    ///
    /// Resolves immediately without an identifier or once installed. Calls
    /// after a failed load keep returning the failure.
    pub async fn ready(&mut self) -> Result<Readiness> {
        if let Some(readiness) = self.readiness {
            return Ok(readiness);
        }

        match self.pending.take() {
            Some(rx) => {
                let result = rx
                    .await
                    .map_err(|_| StateError::load("load task ended without a result"))
                    .and_then(|result| result);
                self.install(result)
            }
            None => Err(StateError::load(
                self.load_error
                    .clone()
                    .unwrap_or_else(|| "persisted state was never loaded".to_string()),
            )),
        }
    }

    /// Wait for every write issued so far.
    pub async fn flush(&mut self) {
        let writes = std::mem::take(&mut self.writes);
        for result in join_all(writes).await {
            if let Err(e) = result {
                warn!(error = %e, "state write task did not complete");
            }
        }
    }

    // Primitives ---------------------------------

    /// Merge `patch` into the state and publish. Not recorded, not persisted.
    pub fn patch_state(&mut self, patch: impl Into<Patch>, id: Option<&str>) -> &mut Self {
        self.poll_restore();
        let patch = patch.into();
        let change = Change::new(ChangeKind::Patch, id.map(str::to_string));
        self.apply_patch(&patch, &change);
        self.hooks.on_patch(&self.state, &change);
        self
    }

    /// Replace the whole state and publish. Not recorded, not persisted.
    pub fn replace_state(&mut self, state: impl Into<Node>, id: Option<&str>) -> &mut Self {
        self.poll_restore();
        let change = Change::new(ChangeKind::Replace, id.map(str::to_string));
        let next = self.hooks.cleanup(state.into(), &self.state, None, &change);
        self.transition(next, &change);
        self.hooks.on_replace(&self.state, &change);
        self
    }

    /// Apply `command.after`, record the command, and persist.
    ///
    /// Any commands after the history pointer are discarded first. `id`
    /// overrides the command's own id and is stored with it.
    pub fn set_state(&mut self, command: Command, id: Option<&str>) -> &mut Self {
        self.poll_restore();
        let id = id.map(str::to_string).or(command.id);
        let after = command.after.clone();
        self.history.push(Command {
            id: id.clone(),
            before: command.before,
            after: command.after,
        });

        let change = Change::new(ChangeKind::Command, id);
        self.apply_patch(&after, &change);
        self.hooks.on_command(&self.state, &change);
        self.spawn_persist(change);
        self
    }

    // Public operations ---------------------------------

    /// Reverse the most recently applied command. No-op if there is none.
    pub fn undo(&mut self) -> &mut Self {
        self.poll_restore();
        let Some(command) = self.history.step_back() else {
            return self;
        };
        let change = Change::new(ChangeKind::Undo, command.id.clone());
        let before = command.before.clone();

        self.apply_patch(&before, &change);
        self.spawn_persist(change.clone());
        self.hooks.on_undo(&self.state, &change);
        self
    }

    /// Re-apply the next undone command. No-op if there is none.
    pub fn redo(&mut self) -> &mut Self {
        self.poll_restore();
        let Some(command) = self.history.step_forward() else {
            return self;
        };
        let change = Change::new(ChangeKind::Redo, command.id.clone());
        let after = command.after.clone();

        self.apply_patch(&after, &change);
        self.spawn_persist(change.clone());
        self.hooks.on_redo(&self.state, &change);
        self
    }

    /// Return to the initial state and clear history. Cannot be undone.
    pub fn reset(&mut self) -> &mut Self {
        self.poll_restore();
        let change = Change::anonymous(ChangeKind::Reset);
        self.transition(self.initial.clone(), &change);
        self.history.clear();
        self.hooks.on_reset(&self.state, &change);
        self.spawn_persist(change);
        self
    }

    /// Forget every command, keeping the current state.
    pub fn reset_history(&mut self) -> &mut Self {
        self.poll_restore();
        self.history.clear();
        self.hooks
            .on_reset_history(&self.state, &Change::anonymous(ChangeKind::ResetHistory));
        self
    }

    /// Install `commands` as the history with the pointer on the last one.
    ///
    /// The commands are not applied; they must fit the current state.
    pub fn replace_history(&mut self, commands: Vec<Command>) -> &mut Self {
        let pointer = commands.len().checked_sub(1);
        self.replace_history_at(commands, pointer)
    }

    /// Install `commands` as the history. `pointer` is clamped into range;
    /// `None` means nothing is applied.
    pub fn replace_history_at(
        &mut self,
        commands: Vec<Command>,
        pointer: Option<usize>,
    ) -> &mut Self {
        self.poll_restore();
        self.history.replace(commands, pointer);
        self.hooks
            .on_replace(&self.state, &Change::anonymous(ChangeKind::ReplaceHistory));
        self
    }

    /// Remember the current state as the snapshot.
    pub fn set_snapshot(&mut self) -> &mut Self {
        self.snapshot = self.state.clone();
        self
    }

    /// Publish the current state again without changing it.
    pub fn force_update(&mut self) -> &mut Self {
        self.poll_restore();
        if self.observable.get_state().ptr_eq(&self.state) {
            self.observable.refresh();
        } else {
            self.observable.set_state(self.state.clone(), true);
        }
        self
    }

    /// Write the current state to the store.
    pub fn persist(&mut self) -> &mut Self {
        self.poll_restore();
        self.spawn_persist(Change::anonymous(ChangeKind::Persist));
        self
    }

    // Internals ---------------------------------

    fn poll_restore(&mut self) {
        let Some(rx) = self.pending.as_mut() else {
            return;
        };
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => Err(StateError::load("load task ended without a result")),
        };
        self.pending = None;
        // Failures are kept and surfaced through ready().
        let _ = self.install(result);
    }

    fn install(&mut self, result: Result<Restored>) -> Result<Readiness> {
        let restored = match result {
            Ok(restored) => restored,
            Err(e) => {
                self.load_error = Some(e.to_string());
                return Err(e);
            }
        };

        if let Some(state) = restored.state {
            let change = Change::anonymous(ChangeKind::Restore);
            self.snapshot = deep_copy(&state);
            self.transition(state, &change);
        }

        self.status = Status::Ready;
        self.readiness = Some(restored.readiness);
        info!(
            identifier = ?self.identifier(),
            readiness = ?restored.readiness,
            "state manager ready"
        );
        self.hooks.on_ready(restored.readiness, &self.state);
        Ok(restored.readiness)
    }

    fn apply_patch(&mut self, patch: &Patch, change: &Change) {
        let next = merge(&self.state, patch);
        let next = self.hooks.cleanup(next, &self.state, Some(patch), change);
        self.transition(next, change);
    }

    fn transition(&mut self, next: Node, change: &Change) {
        self.hooks.on_state_will_change(&next, change);
        self.state = next;
        self.observable.set_state(self.state.clone(), true);
        self.hooks.on_state_did_change(&self.state, change);
        debug!(change = %change, pointer = ?self.history.pointer(), "state changed");
    }

    fn spawn_persist(&mut self, change: Change) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        // Until the load is installed the stored record is unread; writing now
        // could replace it with a state the load is about to discard.
        if self.status == Status::Loading {
            debug!(
                identifier = %gateway.identifier(),
                change = %change,
                "persisted state not loaded, skipping write"
            );
            return;
        }
        if let Some(handle) = gateway.spawn_save(self.state.clone(), change, Arc::clone(&self.hooks)) {
            self.writes.retain(|write| !write.is_finished());
            self.writes.push(handle);
        }
    }
}
