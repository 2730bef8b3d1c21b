use rewind_core::{
    Change, Command, FileStore, GzipCompressor, Hooks, KeyValueStore, ManagerConfig, MemoryStore,
    Node, Patch, Readiness, Result, RetryPolicy, StateError, StateManager, Status, StoreConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn initial_state() -> Node {
    Node::from(json!({
        "todos": {
            "todo0": {"id": "todo0", "text": "Scrub the dog.", "isComplete": false},
            "todo1": {"id": "todo1", "text": "Sharpen the dishes.", "isComplete": false}
        }
    }))
}

fn toggle(manager: &mut StateManager, id: &str) {
    let done = manager.state()["todos"][id]["isComplete"]
        .as_bool()
        .unwrap_or(false);
    manager.set_state(
        Command::new(
            Patch::at(["todos", id, "isComplete"], done),
            Patch::at(["todos", id, "isComplete"], !done),
        ),
        Some("toggle_todo"),
    );
}

fn manager_on(store: Arc<dyn KeyValueStore>, identifier: &str) -> StateManager {
    StateManager::builder(initial_state())
        .identifier(identifier)
        .store(store)
        .build()
}

#[tokio::test]
async fn test_state_survives_a_restart() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let mut first = manager_on(Arc::clone(&store), "restart");
    assert_eq!(first.ready().await.unwrap(), Readiness::None);
    toggle(&mut first, "todo0");
    first.flush().await;
    drop(first);

    let mut second = manager_on(store, "restart");
    assert_eq!(second.ready().await.unwrap(), Readiness::Restored);
    assert_eq!(second.state()["todos"]["todo0"]["isComplete"].as_bool(), Some(true));
    assert_eq!(second.snapshot(), second.state());
    assert!(!second.can_undo());
}

#[tokio::test]
async fn test_undo_redo_and_reset_are_persisted() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut manager = manager_on(Arc::clone(&store), "persisted_ops");
    manager.ready().await.unwrap();

    toggle(&mut manager, "todo0");
    manager.undo();
    manager.flush().await;
    let saved: serde_json::Value =
        serde_json::from_slice(&store.get("persisted_ops").await.unwrap().unwrap()).unwrap();
    assert_eq!(saved["todos"]["todo0"]["isComplete"], json!(false));

    manager.redo();
    manager.flush().await;
    let saved: serde_json::Value =
        serde_json::from_slice(&store.get("persisted_ops").await.unwrap().unwrap()).unwrap();
    assert_eq!(saved["todos"]["todo0"]["isComplete"], json!(true));

    manager.reset();
    manager.flush().await;
    let saved: serde_json::Value =
        serde_json::from_slice(&store.get("persisted_ops").await.unwrap().unwrap()).unwrap();
    assert_eq!(saved, initial_state().to_value());
}

#[tokio::test]
async fn test_patches_are_not_persisted() {
    let store = MemoryStore::new();
    let mut manager = manager_on(Arc::new(store.clone()), "unpersisted_patch");
    manager.ready().await.unwrap();

    manager.patch_state(Patch::at(["todos", "todo0", "text"], "draft"), None);
    manager.flush().await;

    assert_eq!(store.get("unpersisted_patch").await.unwrap(), None);
}

#[tokio::test]
async fn test_upgrade_runs_once_per_version_bump() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let mut v1 = StateManager::builder(initial_state())
        .identifier("upgrade_test")
        .schema_version(1)
        .store(Arc::clone(&store))
        .build();
    v1.ready().await.unwrap();
    toggle(&mut v1, "todo0");
    v1.flush().await;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let build_v2 = |calls: Arc<Mutex<Vec<i64>>>| {
        StateManager::builder(initial_state())
            .identifier("upgrade_test")
            .schema_version(2)
            .store(Arc::clone(&store))
            .upgrade(move |stored: Node, _initial: &Node, version: i64| {
                calls.lock().unwrap().push(version);
                let open: Node = stored["todos"]
                    .as_object()
                    .map(|todos| {
                        todos
                            .iter()
                            .filter(|(_, todo)| todo["isComplete"].as_bool() != Some(true))
                            .map(|(id, todo)| (id.clone(), todo.clone()))
                            .collect()
                    })
                    .unwrap_or_else(Node::object);
                [("todos", open)].into_iter().collect()
            })
            .build()
    };

    let mut v2 = build_v2(Arc::clone(&calls));
    assert_eq!(v2.ready().await.unwrap(), Readiness::Migrated);
    let remaining = v2.state()["todos"].as_object().unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains_key("todo1"));
    v2.persist();
    v2.flush().await;

    let mut again = build_v2(Arc::clone(&calls));
    assert_eq!(again.ready().await.unwrap(), Readiness::Restored);
    assert_eq!(again.state()["todos"].as_object().map(|t| t.len()), Some(1));

    assert_eq!(*calls.lock().unwrap(), vec![1]);
    assert_eq!(
        store.get("upgrade_test_version").await.unwrap(),
        Some(b"2".to_vec())
    );
}

#[tokio::test]
async fn test_file_store_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::new(temp_dir.path()).with_compression(GzipCompressor::new()));

    let mut first = manager_on(Arc::clone(&store), "file_todos");
    first.ready().await.unwrap();
    toggle(&mut first, "todo1");
    first.flush().await;

    let mut second = manager_on(store, "file_todos");
    assert_eq!(second.ready().await.unwrap(), Readiness::Restored);
    assert_eq!(second.state()["todos"]["todo1"]["isComplete"].as_bool(), Some(true));
}

#[tokio::test]
async fn test_manager_from_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = ManagerConfig {
        identifier: Some("configured".into()),
        schema_version: Some(4),
        store: StoreConfig::file_at(temp_dir.path()),
    };

    let mut manager = StateManager::builder(initial_state())
        .config(&config)
        .unwrap()
        .build();
    assert_eq!(manager.ready().await.unwrap(), Readiness::None);
    assert_eq!(manager.identifier(), Some("configured"));

    let reader = FileStore::new(temp_dir.path());
    assert_eq!(
        reader.get("configured_version").await.unwrap(),
        Some(b"4".to_vec())
    );
}

struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
}

#[async_trait::async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 && !key.ends_with("_version") {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StateError::storage("temporarily unavailable"));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

#[derive(Default)]
struct PersistLog {
    ok: AtomicUsize,
    failed: AtomicUsize,
}

impl Hooks for PersistLog {
    fn on_persist(&self, _state: &Node, _change: &Change) {
        self.ok.fetch_add(1, Ordering::SeqCst);
    }

    fn on_persist_error(&self, _error: &StateError, _change: &Change) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

fn quick_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_interval: std::time::Duration::from_millis(1),
        max_interval: std::time::Duration::from_millis(2),
        max_elapsed_time: Some(std::time::Duration::from_secs(5)),
        multiplier: 1.0,
    }
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let inner = MemoryStore::new();
    let store = Arc::new(FlakyStore {
        inner: inner.clone(),
        failures_left: AtomicUsize::new(2),
    });
    let log = Arc::new(PersistLog::default());

    let mut manager = StateManager::builder(initial_state())
        .identifier("flaky")
        .store(store)
        .retry_policy(quick_retry(3))
        .hooks(log.clone())
        .build();
    manager.ready().await.unwrap();

    toggle(&mut manager, "todo0");
    manager.flush().await;

    assert_eq!(log.ok.load(Ordering::SeqCst), 1);
    assert_eq!(log.failed.load(Ordering::SeqCst), 0);
    assert!(inner.get("flaky").await.unwrap().is_some());
}

#[tokio::test]
async fn test_exhausted_writes_do_not_disturb_memory_state() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures_left: AtomicUsize::new(usize::MAX),
    });
    let log = Arc::new(PersistLog::default());

    let mut manager = StateManager::builder(initial_state())
        .identifier("always_failing")
        .store(store)
        .retry_policy(quick_retry(2))
        .hooks(log.clone())
        .build();
    manager.ready().await.unwrap();

    toggle(&mut manager, "todo0");
    manager.undo();
    manager.flush().await;

    // The toggle's write is superseded by the undo's before its first attempt.
    assert_eq!(log.failed.load(Ordering::SeqCst), 1);
    assert_eq!(log.ok.load(Ordering::SeqCst), 0);
    assert_eq!(manager.status(), Status::Ready);
    assert!(manager.can_redo());
}

#[test]
fn test_works_outside_a_tokio_runtime() {
    let mut manager = StateManager::builder(initial_state())
        .identifier("no_runtime")
        .store(Arc::new(MemoryStore::new()))
        .build();

    let handle = rewind_core::runtime::handle().unwrap();
    let readiness = handle.block_on(manager.ready()).unwrap();
    assert_eq!(readiness, Readiness::None);

    toggle(&mut manager, "todo0");
    handle.block_on(manager.flush());
    assert!(manager.can_undo());
}
