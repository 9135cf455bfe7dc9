//! Cross-worker shared-memory scenarios: concurrent writes with conflict
//! resolution, causal read-then-write, and deletion visibility.

use std::sync::Arc;

use sentinel_common::config::MemoryConfig;
use sentinel_common::ids::WorkerId;
use sentinel_coord::events::EventBus;
use sentinel_coord::memory::{
    ClockOrdering, InMemoryBackend, MemoryBackend, MemorySynchronizer, WriteOptions,
};

fn synchronizer(backend: &Arc<InMemoryBackend>) -> (Arc<MemorySynchronizer>, EventBus) {
    let events = EventBus::default();
    let sync = MemorySynchronizer::new(
        Arc::clone(backend) as Arc<dyn MemoryBackend>,
        WorkerId::new(),
        MemoryConfig::default(),
        events.clone(),
    );
    (sync, events)
}

#[tokio::test]
async fn test_concurrent_map_writes_shallow_merge() {
    let backend = Arc::new(InMemoryBackend::new());
    let (w1, _) = synchronizer(&backend);
    let (w2, w2_events) = synchronizer(&backend);
    let mut conflict_rx = w2_events.subscribe();

    // W1 writes {a: 1} and flushes.
    w1.write(
        "tasks/100/state",
        serde_json::json!({"a": 1}),
        WriteOptions::default(),
    )
    .unwrap();
    w1.flush().await;

    // W2, unaware of W1's write, writes {b: 2}. Its flush finds the
    // concurrent entry on the backend and shallow-merges.
    w2.write(
        "tasks/100/state",
        serde_json::json!({"b": 2}),
        WriteOptions::default(),
    )
    .unwrap();
    w2.flush().await;

    // A later reader with no cached state sees the merged value.
    let (w3, _) = synchronizer(&backend);
    let resolved = w3.read("tasks/100/state").await.unwrap().unwrap();
    assert_eq!(resolved, serde_json::json!({"a": 1, "b": 2}));

    // One conflict-resolved event with one discarded entry, no errors.
    let event = conflict_rx.try_recv().unwrap();
    match event {
        sentinel_coord::events::CoordinationEvent::ConflictResolved {
            key,
            strategy,
            discarded,
        } => {
            assert_eq!(key, "tasks/100/state");
            assert_eq!(strategy, "shallow-merge");
            assert_eq!(discarded, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_set_writes_union() {
    let backend = Arc::new(InMemoryBackend::new());
    let (w1, _) = synchronizer(&backend);
    let (w2, _) = synchronizer(&backend);

    w1.write(
        "coordination/queue",
        serde_json::json!([1, 2]),
        WriteOptions::default(),
    )
    .unwrap();
    w1.flush().await;

    w2.write(
        "coordination/queue",
        serde_json::json!([2, 3]),
        WriteOptions::default(),
    )
    .unwrap();
    w2.flush().await;

    let (reader, _) = synchronizer(&backend);
    let resolved = reader.read("coordination/queue").await.unwrap().unwrap();
    assert_eq!(resolved, serde_json::json!([1, 2, 3]));
}

#[tokio::test]
async fn test_read_then_write_is_causally_ordered() {
    let backend = Arc::new(InMemoryBackend::new());
    let (w1, _) = synchronizer(&backend);
    let (w2, _) = synchronizer(&backend);

    w1.write("tasks/5/progress", serde_json::json!(10), WriteOptions::default())
        .unwrap();
    w1.flush().await;

    // W2 reads first, so its subsequent write causally follows W1's.
    let first = w2.read_entry("tasks/5/progress").await.unwrap().unwrap();
    let second = w2
        .write("tasks/5/progress", serde_json::json!(20), WriteOptions::default())
        .unwrap();

    assert_eq!(second.clock.compare(&first.clock), ClockOrdering::After);
    w2.flush().await;

    // No conflict: the dominant entry simply wins.
    let (reader, _) = synchronizer(&backend);
    let resolved = reader.read("tasks/5/progress").await.unwrap().unwrap();
    assert_eq!(resolved, serde_json::json!(20));
}

#[tokio::test]
async fn test_delete_is_visible_across_workers() {
    let backend = Arc::new(InMemoryBackend::new());
    let (w1, _) = synchronizer(&backend);
    let (w2, _) = synchronizer(&backend);

    w1.write("tasks/9/state", serde_json::json!("done"), WriteOptions::default())
        .unwrap();
    w1.flush().await;
    assert!(w2.read("tasks/9/state").await.unwrap().is_some());

    w1.delete("tasks/9/state").await.unwrap();

    let (fresh, _) = synchronizer(&backend);
    assert!(fresh.read("tasks/9/state").await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_then_read_returns_causally_newer_value() {
    let backend = Arc::new(InMemoryBackend::new());
    let (w1, _) = synchronizer(&backend);

    let written = w1
        .write("workers/x/capacity", serde_json::json!(4), WriteOptions::default())
        .unwrap();
    w1.flush().await;

    let read_back = w1.read_entry("workers/x/capacity").await.unwrap().unwrap();
    // Causally >= the written entry: same clock or a descendant.
    assert_ne!(read_back.clock.compare(&written.clock), ClockOrdering::Before);
    assert_eq!(read_back.value, serde_json::json!(4));
}
