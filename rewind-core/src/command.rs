/*!
Undoable commands and the linear history that records them.
*/

use serde::{Deserialize, Serialize};

use crate::patch::Patch;

/// One undoable unit: `after` performs the change, `before` reverses it.
///
/// `before` and `after` are expected to cover the same leaf paths. The
/// manager does not check this; [`Command::is_symmetric`] is available for
/// tests and debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub before: Patch,
    pub after: Patch,
}

impl Command {
    pub fn new(before: impl Into<Patch>, after: impl Into<Patch>) -> Self {
        Self {
            id: None,
            before: before.into(),
            after: after.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Whether `before` and `after` touch exactly the same leaf paths.
    pub fn is_symmetric(&self) -> bool {
        self.before.leaf_paths() == self.after.leaf_paths()
    }
}

/// Ordered commands plus a pointer at the most recently applied one.
///
/// `pointer()` is `None` when nothing is applied. Pushing while commands sit
/// past the pointer discards them; there is no branching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    commands: Vec<Command>,
    pointer: Option<usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from existing commands. A pointer past the end is
    /// clamped to the last command.
    pub fn from_commands(commands: Vec<Command>, pointer: Option<usize>) -> Self {
        let pointer = clamp_pointer(pointer, commands.len());
        Self { commands, pointer }
    }

    pub fn pointer(&self) -> Option<usize> {
        self.pointer
    }

    /// Number of commands currently applied (`pointer + 1`).
    pub fn applied(&self) -> usize {
        self.pointer.map_or(0, |p| p + 1)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn can_undo(&self) -> bool {
        self.pointer.is_some()
    }

    pub fn can_redo(&self) -> bool {
        self.applied() < self.commands.len()
    }

    /// Drop everything after the pointer, append `command`, and point at it.
    pub fn push(&mut self, command: Command) {
        self.commands.truncate(self.applied());
        self.commands.push(command);
        self.pointer = Some(self.commands.len() - 1);
    }

    /// The command to reverse, moving the pointer back past it.
    pub fn step_back(&mut self) -> Option<&Command> {
        let current = self.pointer?;
        self.pointer = current.checked_sub(1);
        self.commands.get(current)
    }

    /// The next command to re-apply, moving the pointer onto it.
    pub fn step_forward(&mut self) -> Option<&Command> {
        let next = self.applied();
        if next >= self.commands.len() {
            return None;
        }
        self.pointer = Some(next);
        self.commands.get(next)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.pointer = None;
    }

    pub fn replace(&mut self, commands: Vec<Command>, pointer: Option<usize>) {
        *self = Self::from_commands(commands, pointer);
    }
}

fn clamp_pointer(pointer: Option<usize>, len: usize) -> Option<usize> {
    match (pointer, len.checked_sub(1)) {
        (Some(p), Some(last)) => Some(p.min(last)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(n: i64) -> Command {
        Command::new(Patch::at(["n"], n - 1), Patch::at(["n"], n)).with_id(format!("c{n}"))
    }

    fn assert_invariants(history: &History) {
        assert_eq!(history.can_undo(), history.pointer().is_some());
        assert_eq!(history.can_redo(), history.applied() < history.len());
        if let Some(p) = history.pointer() {
            assert!(p < history.len());
        }
    }

    #[test]
    fn test_push_and_step() {
        let mut history = History::new();
        assert!(!history.can_undo());
        assert!(!history.can_redo());

        history.push(cmd(1));
        history.push(cmd(2));
        assert_eq!(history.pointer(), Some(1));
        assert_invariants(&history);

        assert_eq!(history.step_back().and_then(|c| c.id.clone()), Some("c2".into()));
        assert_eq!(history.step_back().and_then(|c| c.id.clone()), Some("c1".into()));
        assert!(history.step_back().is_none());
        assert_eq!(history.pointer(), None);
        assert!(history.can_redo());
        assert_invariants(&history);

        assert_eq!(history.step_forward().and_then(|c| c.id.clone()), Some("c1".into()));
        assert_eq!(history.step_forward().and_then(|c| c.id.clone()), Some("c2".into()));
        assert!(history.step_forward().is_none());
        assert_invariants(&history);
    }

    #[test]
    fn test_push_truncates_redo_branch() {
        let mut history = History::new();
        for n in 1..=4 {
            history.push(cmd(n));
        }
        history.step_back();
        history.step_back();
        assert!(history.can_redo());

        history.push(cmd(9));

        assert_eq!(history.len(), 3);
        assert!(!history.can_redo());
        assert_eq!(history.commands()[2].id.as_deref(), Some("c9"));
        assert_invariants(&history);
    }

    #[test]
    fn test_push_after_undoing_everything() {
        let mut history = History::new();
        history.push(cmd(1));
        history.step_back();
        history.push(cmd(2));

        assert_eq!(history.len(), 1);
        assert_eq!(history.pointer(), Some(0));
    }

    #[test]
    fn test_from_commands_clamps_pointer() {
        let history = History::from_commands(vec![cmd(1), cmd(2)], Some(7));
        assert_eq!(history.pointer(), Some(1));

        let history = History::from_commands(Vec::new(), Some(0));
        assert_eq!(history.pointer(), None);

        let history = History::from_commands(vec![cmd(1)], None);
        assert!(history.can_redo());
        assert_invariants(&history);
    }

    #[test]
    fn test_clear() {
        let mut history = History::from_commands(vec![cmd(1), cmd(2)], Some(0));
        history.clear();
        assert!(history.is_empty());
        assert!(!history.can_undo());
        assert!(!history.can_redo());
    }

    #[test]
    fn test_symmetry_check() {
        assert!(cmd(1).is_symmetric());

        let lopsided = Command::new(
            Patch::at(["todos", "a", "text"], "old"),
            Patch::from(serde_json::json!({"todos": {"a": {"text": "new", "isComplete": true}}})),
        );
        assert!(!lopsided.is_symmetric());
    }

    #[test]
    fn test_command_serde_roundtrip_keeps_id() {
        let command = cmd(3);
        let text = serde_json::to_string(&command).unwrap();
        assert!(text.contains(r#""id":"c3""#));
        assert_eq!(serde_json::from_str::<Command>(&text).unwrap(), command);

        let anonymous: Command =
            serde_json::from_str(r#"{"before":{"merge":{}},"after":{"merge":{}}}"#).unwrap();
        assert!(anonymous.id.is_none());
    }
}
