/*!
Lifecycle callbacks for a [`StateManager`](crate::StateManager).

Every method has a default, so an implementation overrides only what it
needs. Hooks run synchronously inside the manager operation that triggers
them, except `on_persist` and `on_persist_error`, which run on the write
task once the store call finishes.
*/

use std::fmt;

use crate::gateway::Readiness;
use crate::node::Node;
use crate::patch::Patch;
use crate::StateError;

/// What kind of transition produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Patch,
    Replace,
    Command,
    Undo,
    Redo,
    Reset,
    ReplaceHistory,
    ResetHistory,
    Restore,
    Persist,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Patch => "patch",
            ChangeKind::Replace => "replace",
            ChangeKind::Command => "command",
            ChangeKind::Undo => "undo",
            ChangeKind::Redo => "redo",
            ChangeKind::Reset => "reset",
            ChangeKind::ReplaceHistory => "replace_history",
            ChangeKind::ResetHistory => "reset_history",
            ChangeKind::Restore => "restore",
            ChangeKind::Persist => "persist",
        }
    }
}

/// A transition and the command id it carried, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub id: Option<String>,
}

impl Change {
    pub fn new(kind: ChangeKind, id: Option<String>) -> Self {
        Self { kind, id }
    }

    pub fn anonymous(kind: ChangeKind) -> Self {
        Self { kind, id: None }
    }
}

/// Renders as `kind` or `kind:id`, e.g. `command:toggle_todo`.
impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind.as_str(), id),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

/// Callbacks fired around state transitions.
pub trait Hooks: Send + Sync {
    /// Final say over the next state before it becomes current.
    ///
    /// `patch` is `None` for full replacements. The default returns `next`
    /// unchanged.
    fn cleanup(&self, next: Node, _prev: &Node, _patch: Option<&Patch>, _change: &Change) -> Node {
        next
    }

    fn on_state_will_change(&self, _next: &Node, _change: &Change) {}

    fn on_state_did_change(&self, _state: &Node, _change: &Change) {}

    fn on_patch(&self, _state: &Node, _change: &Change) {}

    fn on_replace(&self, _state: &Node, _change: &Change) {}

    fn on_command(&self, _state: &Node, _change: &Change) {}

    fn on_undo(&self, _state: &Node, _change: &Change) {}

    fn on_redo(&self, _state: &Node, _change: &Change) {}

    fn on_reset(&self, _state: &Node, _change: &Change) {}

    fn on_reset_history(&self, _state: &Node, _change: &Change) {}

    /// The persisted load was installed (or there was nothing to load).
    fn on_ready(&self, _readiness: Readiness, _state: &Node) {}

    /// A write of `state` reached the store.
    fn on_persist(&self, _state: &Node, _change: &Change) {}

    /// A write gave up. The in-memory state is unaffected.
    fn on_persist_error(&self, _error: &StateError, _change: &Change) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
