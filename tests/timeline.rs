//! Timeline service behavior: wildcards, limits, segment merging, impact
//! ranking.

use std::sync::Arc;

use event_store::{EventStore, StoreConfigBuilder};
use spectre::{
    analysis::{ResourceStatus, RootCauseAnalyzer, RootCauseConfig},
    graph::MemoryStore,
    test_util::{BASE_TS, EventBuilder, SEC, pod_manifest_waiting},
    timeline::{ChangesQuery, TimelineConfig, TimelineQuery, TimelineService},
};
use spectre_event::{ChangeEvent, EventType};
use tempfile::TempDir;

const BASE_SECS: i64 = BASE_TS / SEC;

async fn service_with(events: &[ChangeEvent]) -> (TimelineService, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = EventStore::open(StoreConfigBuilder::from_path(dir.path()).build().unwrap())
        .await
        .unwrap();
    for event in events {
        store.write_event(event).await.unwrap();
    }
    store.close().await.unwrap();

    let graph = Arc::new(MemoryStore::new());
    let analyzer = RootCauseAnalyzer::new(graph.clone(), store.clone(), RootCauseConfig::default());
    let service = TimelineService::new(store, graph, analyzer, TimelineConfig::default());
    (service, dir)
}

// Wildcard + limit: fifty pods in the namespace, maxResults=10, exactly ten
// timeline entries come back.
#[tokio::test]
async fn wildcard_query_honors_max_results() {
    let mut events = Vec::new();
    for i in 0..50 {
        events.push(
            EventBuilder::new("Pod", "default", &format!("pod-{i:02}"), &format!("uid-{i:02}"))
                .id(i as u64 + 1)
                .at(BASE_TS + i as i64 * SEC)
                .data(serde_json::json!({ "status": { "phase": "Running" } }))
                .build(),
        );
    }
    let (service, _dir) = service_with(&events).await;

    let entries = service
        .get_timeline(&TimelineQuery {
            kind: "Pod".into(),
            name: Some("*".into()),
            namespace: Some("default".into()),
            start: BASE_SECS,
            end: BASE_SECS + 3600,
            max_results: Some(10),
        })
        .await
        .unwrap();

    assert_eq!(entries.len(), 10);
    for entry in &entries {
        assert_eq!(entry.kind, "Pod");
        assert_eq!(entry.current_status, ResourceStatus::Running);
    }
}

#[tokio::test]
async fn named_query_returns_only_that_resource() {
    let events = vec![
        EventBuilder::new("Pod", "default", "web", "uid-web")
            .at(BASE_TS)
            .data(serde_json::json!({ "status": { "phase": "Running" } }))
            .build(),
        EventBuilder::new("Pod", "default", "db", "uid-db")
            .at(BASE_TS + SEC)
            .data(serde_json::json!({ "status": { "phase": "Running" } }))
            .build(),
    ];
    let (service, _dir) = service_with(&events).await;

    let entries = service
        .get_timeline(&TimelineQuery {
            kind: "Pod".into(),
            name: Some("web".into()),
            namespace: Some("default".into()),
            start: BASE_SECS,
            end: BASE_SECS + 3600,
            max_results: None,
        })
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "web");
    assert_eq!(entries[0].resource_id, "uid-web");
}

// Status-segment merging end to end: five consecutive CrashLoopBackOff
// observations at ten-second intervals produce exactly one Error segment.
#[tokio::test]
async fn equal_statuses_merge_into_one_segment() {
    let events: Vec<ChangeEvent> = (0..5)
        .map(|i| {
            EventBuilder::new("Pod", "default", "web", "uid-web")
                .id(i as u64 + 1)
                .event_type(EventType::Update)
                .resource_version(&(i + 1).to_string())
                .at(BASE_TS + i as i64 * 10 * SEC)
                .data(pod_manifest_waiting("CrashLoopBackOff", "", 3))
                .build()
        })
        .collect();
    let (service, _dir) = service_with(&events).await;

    let entries = service
        .get_timeline(&TimelineQuery {
            kind: "Pod".into(),
            name: Some("web".into()),
            namespace: None,
            start: BASE_SECS,
            end: BASE_SECS + 3600,
            max_results: None,
        })
        .await
        .unwrap();

    let segments = &entries[0].status_segments;
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].status, ResourceStatus::Error);
    assert_eq!(segments[0].message, "CrashLoopBackOff");
    assert_eq!(segments[0].start.timestamp_ns, BASE_TS);
    assert_eq!(segments[0].end.timestamp_ns, BASE_TS + 40 * SEC);

    // Both timestamp forms are present.
    assert!(segments[0].start.timestamp.ends_with('Z'));
}

#[tokio::test]
async fn millisecond_timestamps_are_auto_detected() {
    let events = vec![
        EventBuilder::new("Pod", "default", "web", "uid-web")
            .at(BASE_TS)
            .data(serde_json::json!({ "status": { "phase": "Running" } }))
            .build(),
    ];
    let (service, _dir) = service_with(&events).await;

    let entries = service
        .get_timeline(&TimelineQuery {
            kind: "Pod".into(),
            name: None,
            namespace: None,
            start: BASE_SECS * 1_000,
            end: (BASE_SECS + 3600) * 1_000,
            max_results: None,
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn snapshots_are_captured_at_error_transitions() {
    let events = vec![
        EventBuilder::new("Pod", "default", "web", "uid-web")
            .event_type(EventType::Update)
            .resource_version("1")
            .at(BASE_TS)
            .data(serde_json::json!({ "status": { "phase": "Running" } }))
            .build(),
        EventBuilder::new("Pod", "default", "web", "uid-web")
            .event_type(EventType::Update)
            .resource_version("2")
            .at(BASE_TS + 10 * SEC)
            .data(pod_manifest_waiting("CrashLoopBackOff", "restarting", 2))
            .build(),
    ];
    let (service, _dir) = service_with(&events).await;

    let entries = service
        .get_timeline(&TimelineQuery {
            kind: "Pod".into(),
            name: Some("web".into()),
            namespace: None,
            start: BASE_SECS,
            end: BASE_SECS + 3600,
            max_results: None,
        })
        .await
        .unwrap();

    let snapshots = &entries[0].snapshots;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, ResourceStatus::Error);
    assert_eq!(snapshots[0].at.timestamp_ns, BASE_TS + 10 * SEC);
}

#[tokio::test]
async fn changes_are_ranked_by_impact() {
    let mut events = Vec::new();
    // A healthy pod with a couple of quiet updates.
    for i in 0..2 {
        events.push(
            EventBuilder::new("Pod", "default", "quiet", "uid-quiet")
                .id(100 + i)
                .event_type(EventType::Update)
                .resource_version(&(i + 1).to_string())
                .at(BASE_TS + i as i64 * SEC)
                .data(serde_json::json!({ "status": { "phase": "Running" } }))
                .build(),
        );
    }
    // A crash-looping pod with errors.
    for i in 0..12 {
        events.push(
            EventBuilder::new("Pod", "default", "noisy", "uid-noisy")
                .id(200 + i)
                .event_type(EventType::Update)
                .resource_version(&(i + 1).to_string())
                .at(BASE_TS + i as i64 * SEC)
                .data(pod_manifest_waiting("CrashLoopBackOff", "restarting", i))
                .build(),
        );
    }
    let (service, _dir) = service_with(&events).await;

    let summaries = service
        .get_changes(&ChangesQuery {
            start: BASE_SECS,
            end: BASE_SECS + 3600,
            kinds: None,
            impact_threshold: None,
            max_resources: None,
        })
        .await
        .unwrap();

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].name, "noisy");
    assert!(summaries[0].impact_score > summaries[1].impact_score);
    assert_eq!(summaries[0].error_events, 12);
    assert!(
        summaries[0]
            .container_issues
            .contains(&"CrashLoopBackOff".to_string())
    );

    // Threshold filtering drops the quiet pod.
    let filtered = service
        .get_changes(&ChangesQuery {
            start: BASE_SECS,
            end: BASE_SECS + 3600,
            kinds: None,
            impact_threshold: Some(0.5),
            max_resources: None,
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "noisy");
}

#[tokio::test]
async fn detect_anomalies_reports_per_resource_findings() {
    let events: Vec<ChangeEvent> = (0..3)
        .map(|i| {
            EventBuilder::new("Pod", "default", "web", "uid-web")
                .id(i as u64 + 1)
                .event_type(EventType::Update)
                .resource_version(&(i + 1).to_string())
                .at(BASE_TS + i as i64 * 10 * SEC)
                .data(pod_manifest_waiting("CrashLoopBackOff", "restarting", 3 + i))
                .build()
        })
        .collect();
    let (service, _dir) = service_with(&events).await;

    let anomalies = service
        .detect_anomalies(Some("Pod"), Some("default"), BASE_SECS, BASE_SECS + 3600)
        .await
        .unwrap();

    assert!(!anomalies.is_empty());
    assert!(anomalies.iter().any(|a| a.anomaly_type == "crash-loop"));
}
