/*!
Deep-partial patches and the merge that applies them.

A [`Patch`] describes a change to a [`Node`] field by field. A key missing
from a `Merge` map leaves that field alone, `Remove` deletes it, `Set`
replaces it, and a nested `Merge` recurses. Arrays are always replaced
whole.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::node::Node;

/// One field's worth of change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Patch {
    /// Delete the key from its containing object.
    Remove,
    /// Replace the value outright.
    Set(Node),
    /// Recurse into an object, changing only the listed keys.
    Merge(BTreeMap<String, Patch>),
}

impl Patch {
    /// An empty field-wise patch. Merging it changes nothing.
    pub fn object() -> Self {
        Patch::Merge(BTreeMap::new())
    }

    /// Replace with `value`.
    pub fn set(value: impl Into<Node>) -> Self {
        Patch::Set(value.into())
    }

    /// Add a field change. A non-`Merge` patch is discarded in favour of a
    /// fresh `Merge` holding just this field.
    pub fn with(self, key: impl Into<String>, field: impl Into<Patch>) -> Self {
        let mut fields = match self {
            Patch::Merge(fields) => fields,
            _ => BTreeMap::new(),
        };
        fields.insert(key.into(), field.into());
        Patch::Merge(fields)
    }

    /// A patch that changes only the value at `path`.
    ///
    /// ```
    /// use rewind_core::Patch;
    ///
    /// let patch = Patch::at(["todos", "todo0", "isComplete"], true);
    /// assert_eq!(patch, Patch::object().with("todos",
    ///     Patch::object().with("todo0", Patch::object().with("isComplete", true))));
    /// ```
    pub fn at<I, K>(path: I, leaf: impl Into<Patch>) -> Self
    where
        I: IntoIterator<Item = K>,
        I::IntoIter: DoubleEndedIterator,
        K: Into<String>,
    {
        path.into_iter()
            .rev()
            .fold(leaf.into(), |inner, key| Patch::object().with(key, inner))
    }

    /// True for a `Merge` that lists no fields.
    pub fn is_empty(&self) -> bool {
        matches!(self, Patch::Merge(fields) if fields.is_empty())
    }

    /// Every path this patch sets or removes.
    pub fn leaf_paths(&self) -> BTreeSet<Vec<String>> {
        let mut paths = BTreeSet::new();
        collect_leaves(self, &mut Vec::new(), &mut paths);
        paths
    }
}

fn collect_leaves(patch: &Patch, prefix: &mut Vec<String>, out: &mut BTreeSet<Vec<String>>) {
    match patch {
        Patch::Merge(fields) => {
            for (key, field) in fields {
                prefix.push(key.clone());
                collect_leaves(field, prefix, out);
                prefix.pop();
            }
        }
        Patch::Set(_) | Patch::Remove => {
            out.insert(prefix.clone());
        }
    }
}

/// Merge `patch` into `target`, returning the new document.
///
/// Neither input is modified. Fields the patch does not mention are carried
/// over by reference, so untouched sub-trees of the result are
/// [`Node::ptr_eq`] to those of `target`. A `Merge` over a missing or
/// non-object value starts from an empty object.
pub fn merge(target: &Node, patch: &Patch) -> Node {
    match patch {
        Patch::Set(value) => value.clone(),
        Patch::Remove => Node::Null,
        Patch::Merge(fields) => {
            let mut result = match target {
                Node::Object(map) => BTreeMap::clone(map),
                _ => BTreeMap::new(),
            };
            for (key, field) in fields {
                if let Patch::Remove = field {
                    result.remove(key);
                    continue;
                }
                let next = merge(result.get(key).unwrap_or(&Node::Null), field);
                result.insert(key.clone(), next);
            }
            Node::Object(Arc::new(result))
        }
    }
}

impl From<Node> for Patch {
    fn from(value: Node) -> Self {
        Patch::Set(value)
    }
}

/// JSON objects become field-wise merges; every other JSON value is a `Set`.
///
/// JSON has no way to say "delete", so removals must be spelled with
/// [`Patch::Remove`].
impl From<Value> for Patch {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Patch::Merge(
                map.into_iter()
                    .map(|(key, field)| (key, Patch::from(field)))
                    .collect(),
            ),
            other => Patch::Set(other.into()),
        }
    }
}

impl From<bool> for Patch {
    fn from(b: bool) -> Self {
        Patch::Set(b.into())
    }
}

impl From<i32> for Patch {
    fn from(n: i32) -> Self {
        Patch::Set(n.into())
    }
}

impl From<i64> for Patch {
    fn from(n: i64) -> Self {
        Patch::Set(n.into())
    }
}

impl From<&str> for Patch {
    fn from(s: &str) -> Self {
        Patch::Set(s.into())
    }
}

impl From<String> for Patch {
    fn from(s: String) -> Self {
        Patch::Set(s.into())
    }
}
