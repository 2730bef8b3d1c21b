/*!
A small todo list built on the state manager, persisted to a directory.

Run it twice to see the state restored:

    cargo run -p rewind-core --example todo -- /tmp/rewind-todo
*/

use rewind_core::{
    init_default_observability, Command, FileStore, Node, Patch, Readiness, StateManager,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> rewind_core::Result<()> {
    init_default_observability()?;

    let dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| std::env::temp_dir().join("rewind-todo").display().to_string());

    let initial = Node::from(json!({
        "todos": {
            "todo0": {"id": "todo0", "text": "Scrub the dog.", "isComplete": false},
            "todo1": {"id": "todo1", "text": "Sharpen the dishes.", "isComplete": false}
        }
    }));

    let mut todos = StateManager::builder(initial)
        .identifier("todos")
        .schema_version(1)
        .store(Arc::new(FileStore::new(&dir)))
        .build();

    match todos.ready().await? {
        Readiness::None => println!("fresh start in {dir}"),
        Readiness::Restored => println!("restored from {dir}"),
        Readiness::Migrated => println!("migrated state in {dir}"),
    }

    let _sub = todos.store().subscribe(|next, _prev| {
        println!("state: {next}");
    });

    let done = todos.state()["todos"]["todo0"]["isComplete"]
        .as_bool()
        .unwrap_or(false);
    todos.set_state(
        Command::new(
            Patch::at(["todos", "todo0", "isComplete"], done),
            Patch::at(["todos", "todo0", "isComplete"], !done),
        ),
        Some("toggle_todo"),
    );
    todos.undo();
    todos.redo();

    todos.flush().await;
    Ok(())
}
