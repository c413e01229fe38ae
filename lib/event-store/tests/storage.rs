//! End-to-end behavior of the hour-file storage engine.

use std::time::Duration;

use event_store::{
    Compression, EventFilter, EventStore, StoreConfigBuilder, hour_file_name, hour_start_ns,
    sweep_once,
};
use spectre_event::{ChangeEvent, EventType, ResourceRef};
use tempfile::TempDir;

const BASE_TS: i64 = 1_700_000_000_000_000_000; // 2023-11-14T22:13:20Z
const HOUR_NS: i64 = 3_600 * 1_000_000_000;

fn event(id: u64, kind: &str, ns: &str, uid: &str, rv: &str, ts: i64) -> ChangeEvent {
    ChangeEvent {
        id,
        timestamp_ns: ts,
        event_type: EventType::Update,
        resource: ResourceRef {
            group: if kind == "Deployment" { "apps".into() } else { String::new() },
            version: "v1".into(),
            kind: kind.into(),
            namespace: ns.into(),
            name: format!("{}-{uid}", kind.to_lowercase()),
            uid: uid.into(),
            resource_version: rv.into(),
            ..Default::default()
        },
        data: serde_json::json!({
            "metadata": { "uid": uid, "resourceVersion": rv },
            "status": { "phase": "Running" },
        }),
    }
}

async fn open_store(dir: &TempDir) -> EventStore {
    let config = StoreConfigBuilder::from_path(dir.path()).build().unwrap();
    EventStore::open(config).await.unwrap()
}

#[tokio::test]
async fn round_trip_preserves_events_and_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let inputs: Vec<ChangeEvent> = (0..100)
        .map(|i| {
            event(
                i,
                "Pod",
                "default",
                &format!("uid-{i}"),
                &i.to_string(),
                BASE_TS + i as i64 * 1_000_000,
            )
        })
        .collect();
    for e in &inputs {
        assert!(store.write_event(e).await.unwrap());
    }
    store.close().await.unwrap();

    // A fresh store handle reads the finalised file back.
    let store = open_store(&dir).await;
    let (events, _stats) = store
        .query(BASE_TS, BASE_TS + HOUR_NS, &EventFilter::default())
        .await
        .unwrap();
    similar_asserts::assert_eq!(inputs, events);
}

#[tokio::test]
async fn duplicate_uid_resource_version_is_written_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let e = event(1, "Pod", "default", "uid-1", "42", BASE_TS);
    assert!(store.write_event(&e).await.unwrap());
    assert!(!store.write_event(&e).await.unwrap());

    let (events, _) = store
        .query(BASE_TS, BASE_TS + 1, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn open_hour_is_visible_to_queries_before_close() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let e = event(1, "Pod", "default", "uid-1", "1", BASE_TS);
    store.write_event(&e).await.unwrap();

    let (events, _) = store
        .query(BASE_TS, BASE_TS + 1, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn hour_rollover_finalises_previous_file() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let first_hour = hour_start_ns(BASE_TS);
    store
        .write_event(&event(1, "Pod", "default", "uid-1", "1", BASE_TS))
        .await
        .unwrap();
    store
        .write_event(&event(2, "Pod", "default", "uid-1", "2", BASE_TS + HOUR_NS))
        .await
        .unwrap();
    store.close().await.unwrap();

    assert!(dir.path().join(hour_file_name(first_hour)).exists());
    assert!(dir.path().join(hour_file_name(first_hour + HOUR_NS)).exists());

    let (events, _) = store
        .query(BASE_TS, BASE_TS + 2 * HOUR_NS, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn append_after_reopen_keeps_earlier_events() {
    let dir = TempDir::new().unwrap();

    let store = open_store(&dir).await;
    store
        .write_event(&event(1, "Pod", "default", "uid-1", "1", BASE_TS))
        .await
        .unwrap();
    store.close().await.unwrap();
    drop(store);

    // Same hour, new process: the finalised file is reopened for append.
    let store = open_store(&dir).await;
    store
        .write_event(&event(2, "Pod", "default", "uid-1", "2", BASE_TS + 1))
        .await
        .unwrap();
    store.close().await.unwrap();

    let (events, _) = store
        .query(BASE_TS, BASE_TS + HOUR_NS, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn crashed_file_is_quarantined_and_queries_continue() {
    let dir = TempDir::new().unwrap();

    // One complete hour file.
    let store = open_store(&dir).await;
    store
        .write_event(&event(1, "Pod", "default", "uid-1", "1", BASE_TS))
        .await
        .unwrap();
    store.close().await.unwrap();
    drop(store);

    // A writer death leaves the next hour's file without a footer.
    let crashed = dir.path().join(hour_file_name(hour_start_ns(BASE_TS) + HOUR_NS));
    std::fs::write(&crashed, b"RPKBLOCKgarbage-that-never-got-a-footer").unwrap();

    let store = open_store(&dir).await;
    assert!(!crashed.exists(), "crashed file should have been renamed");
    let quarantined: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".incomplete."))
        .collect();
    assert_eq!(quarantined.len(), 1);

    // Queries crossing the crashed hour still return the intact events.
    let (events, _) = store
        .query(BASE_TS, BASE_TS + 2 * HOUR_NS, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn filters_are_and_combined() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .write_event(&event(1, "Pod", "default", "uid-1", "1", BASE_TS))
        .await
        .unwrap();
    store
        .write_event(&event(2, "Pod", "kube-system", "uid-2", "1", BASE_TS + 1))
        .await
        .unwrap();
    store
        .write_event(&event(3, "Deployment", "default", "uid-3", "1", BASE_TS + 2))
        .await
        .unwrap();
    store.close().await.unwrap();

    let filter = EventFilter {
        kind: Some("Pod".into()),
        namespace: Some("default".into()),
        group: None,
    };
    let (events, _) = store
        .query(BASE_TS, BASE_TS + HOUR_NS, &filter)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource.uid, "uid-1");

    let filter = EventFilter {
        group: Some("apps".into()),
        ..Default::default()
    };
    let (events, _) = store
        .query(BASE_TS, BASE_TS + HOUR_NS, &filter)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource.kind, "Deployment");
}

#[tokio::test]
async fn rare_filter_skips_at_least_half_the_blocks() {
    let dir = TempDir::new().unwrap();
    // Small blocks so the file has many of them.
    let config = StoreConfigBuilder::from_path(dir.path())
        .block_size_limit(2 * 1024)
        .compression(Compression::Zstd)
        .build()
        .unwrap();
    let store = EventStore::open(config).await.unwrap();

    // The rare kind appears only at the very start of the hour, so only the
    // first block(s) can contain it.
    for i in 0..5u64 {
        store
            .write_event(&event(
                i,
                "ConfigMap",
                "default",
                &format!("cm-{i}"),
                "1",
                BASE_TS + i as i64,
            ))
            .await
            .unwrap();
    }
    for i in 0..1000u64 {
        store
            .write_event(&event(
                100 + i,
                "Pod",
                "default",
                &format!("pod-{i}"),
                "1",
                BASE_TS + 1_000 + i as i64,
            ))
            .await
            .unwrap();
    }
    store.close().await.unwrap();

    let filter = EventFilter {
        kind: Some("ConfigMap".into()),
        ..Default::default()
    };
    let (events, stats) = store
        .query(BASE_TS, BASE_TS + HOUR_NS, &filter)
        .await
        .unwrap();
    assert_eq!(events.len(), 5);
    assert!(stats.total_blocks >= 10, "expected many blocks, got {}", stats.total_blocks);
    assert!(
        stats.blocks_skipped * 2 >= stats.total_blocks,
        "expected at least half the blocks skipped: {stats:?}"
    );
}

#[tokio::test]
async fn final_states_reflect_the_last_event_before_the_cutoff() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut deleted = event(2, "Pod", "default", "uid-1", "2", BASE_TS + 10);
    deleted.event_type = EventType::Delete;

    store
        .write_event(&event(1, "Pod", "default", "uid-1", "1", BASE_TS))
        .await
        .unwrap();
    store.write_event(&deleted).await.unwrap();
    store.close().await.unwrap();

    let states = store.final_states(BASE_TS + 5).await.unwrap();
    let state = states.values().next().unwrap();
    assert_eq!(state.last_event_type, EventType::Update);

    let states = store.final_states(BASE_TS + 20).await.unwrap();
    let state = states.values().next().unwrap();
    assert_eq!(state.last_event_type, EventType::Delete);
}

#[tokio::test]
async fn retention_sweep_removes_expired_files() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store
        .write_event(&event(1, "Pod", "default", "uid-1", "1", BASE_TS))
        .await
        .unwrap();
    store.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = sweep_once(dir.path(), Duration::ZERO).await.unwrap();
    assert_eq!(removed, 1);

    let (events, _) = store
        .query(BASE_TS, BASE_TS + HOUR_NS, &EventFilter::default())
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn export_import_round_trips() {
    let source_dir = TempDir::new().unwrap();
    let store = open_store(&source_dir).await;
    let inputs: Vec<ChangeEvent> = (0..10)
        .map(|i| {
            event(
                i,
                "Pod",
                "default",
                &format!("uid-{i}"),
                "1",
                BASE_TS + i as i64,
            )
        })
        .collect();
    for e in &inputs {
        store.write_event(e).await.unwrap();
    }
    store.close().await.unwrap();

    let exported = store.export(BASE_TS, BASE_TS + HOUR_NS).await.unwrap();
    similar_asserts::assert_eq!(inputs, exported);

    let target_dir = TempDir::new().unwrap();
    let target = open_store(&target_dir).await;
    let written = target.import(&exported).await.unwrap();
    assert_eq!(written, 10);

    let (round_tripped, _) = target
        .query(BASE_TS, BASE_TS + HOUR_NS, &EventFilter::default())
        .await
        .unwrap();
    similar_asserts::assert_eq!(inputs, round_tripped);
}
