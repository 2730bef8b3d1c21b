/*!
Publish target for state changes.

An [`Observable`] holds the latest published [`Node`] and notifies listeners
with `(next, previous)` after each change. Besides plain callbacks it offers
selector subscriptions that fire only when a slice of the state changes, and
a [`tokio::sync::watch`] receiver for async consumers.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;

use crate::node::Node;

type Listener = Arc<dyn Fn(&Node, &Node) + Send + Sync>;

struct Inner {
    sender: watch::Sender<Node>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl Inner {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: u64) {
        self.listeners().retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Shared handle to published state. Clones observe the same store.
#[derive(Clone)]
pub struct Observable {
    inner: Arc<Inner>,
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Default for Observable {
    fn default() -> Self {
        Self::new(Node::object())
    }
}

impl Observable {
    pub fn new(initial: Node) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                sender,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The last published state.
    pub fn get_state(&self) -> Node {
        self.inner.sender.borrow().clone()
    }

    /// Publish `value`.
    ///
    /// With `replace` false and both old and new values being objects, the
    /// new fields are laid over the old top-level fields. Otherwise `value`
    /// becomes the state as given. Publishing the very same document again
    /// notifies nobody.
    pub fn set_state(&self, value: Node, replace: bool) {
        let prev = self.get_state();
        let next = match (&prev, &value) {
            (Node::Object(old), Node::Object(fields)) if !replace => {
                let mut merged = BTreeMap::clone(old);
                for (key, field) in fields.iter() {
                    merged.insert(key.clone(), field.clone());
                }
                Node::Object(Arc::new(merged))
            }
            _ => value,
        };

        if next.ptr_eq(&prev) {
            return;
        }

        self.inner.sender.send_replace(next.clone());
        self.notify(&next, &prev);
    }

    /// Notify listeners and watchers with the current state as both `next`
    /// and `previous`.
    pub fn refresh(&self) {
        let current = self.get_state();
        self.inner.sender.send_modify(|_| {});
        self.notify(&current, &current);
    }

    /// Call `listener(next, previous)` after every change until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Node, &Node) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Call `listener(next_slice, previous_slice)` only when the value
    /// returned by `selector` changes.
    pub fn subscribe_with_selector<T, S, F>(&self, selector: S, listener: F) -> Subscription
    where
        T: PartialEq + Send + 'static,
        S: Fn(&Node) -> T + Send + Sync + 'static,
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let current = Mutex::new(selector(&self.get_state()));
        self.subscribe(move |next, _prev| {
            let slice = selector(next);
            let mut current = current.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slice != *current {
                let previous = std::mem::replace(&mut *current, slice);
                listener(&current, &previous);
            }
        })
    }

    /// A receiver that sees every published state.
    pub fn watch(&self) -> watch::Receiver<Node> {
        self.inner.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.inner.listeners().clear();
    }

    fn notify(&self, next: &Node, prev: &Node) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(next, prev);
        }
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the listener for the life of the store.
    pub fn detach(mut self) {
        self.inner = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.id);
        }
    }
}
