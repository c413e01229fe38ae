//! Root-cause analysis over a synthetic image-bump incident.

use std::sync::Arc;

use event_store::{EventStore, StoreConfigBuilder};
use spectre::{
    analysis::{RootCauseAnalyzer, RootCauseConfig, NO_ROOT_FOUND},
    extractors::ExtractorRegistry,
    graph::MemoryStore,
    pipeline::{EventProcessor, ProcessorConfig},
    test_util::{BASE_TS, EventBuilder, SEC},
};
use spectre_event::{ChangeEvent, EventType};
use tempfile::TempDir;

fn deployment_manifest(image: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "replicas": 2,
            "template": { "spec": { "containers": [{ "name": "web", "image": image }] } },
        },
        "status": { "readyReplicas": 2 },
    })
}

fn failing_pod_manifest(image: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "ownerReferences": [
            { "kind": "ReplicaSet", "uid": "rs-2", "controller": true },
        ]},
        "status": {
            "phase": "Pending",
            "containerStatuses": [{
                "name": "web",
                "image": image,
                "restartCount": 0,
                "state": { "waiting": {
                    "reason": "ImagePullBackOff",
                    "message": format!("Back-off pulling image \"{image}\""),
                }},
            }],
        },
    })
}

/// The S1 history: image bump on a Deployment, new ReplicaSet, new Pod that
/// cannot pull the image.
fn image_bump_history() -> Vec<ChangeEvent> {
    vec![
        EventBuilder::new("Deployment", "default", "web", "dep-1")
            .id(1)
            .at(BASE_TS)
            .data(deployment_manifest("nginx:1.25"))
            .build(),
        EventBuilder::new("Deployment", "default", "web", "dep-1")
            .id(2)
            .event_type(EventType::Update)
            .resource_version("2")
            .at(BASE_TS + 10 * SEC)
            .data(deployment_manifest("nginx:nonexistent"))
            .build(),
        EventBuilder::new("ReplicaSet", "default", "web-7f8", "rs-2")
            .id(3)
            .at(BASE_TS + 12 * SEC)
            .data(serde_json::json!({
                "metadata": { "ownerReferences": [
                    { "kind": "Deployment", "uid": "dep-1", "controller": true },
                ]},
            }))
            .build(),
        EventBuilder::new("Pod", "default", "web-7f8-abc", "pod-9")
            .id(4)
            .at(BASE_TS + 15 * SEC)
            .data(failing_pod_manifest("nginx:nonexistent"))
            .build(),
        EventBuilder::new("Pod", "default", "web-7f8-abc", "pod-9")
            .id(5)
            .event_type(EventType::Update)
            .resource_version("2")
            .at(BASE_TS + 25 * SEC)
            .data(failing_pod_manifest("nginx:nonexistent"))
            .build(),
    ]
}

async fn ingest(events: &[ChangeEvent]) -> (Arc<MemoryStore>, EventStore, TempDir) {
    let graph = Arc::new(MemoryStore::new());
    let processor = EventProcessor::new(
        graph.clone(),
        Arc::new(ExtractorRegistry::with_defaults()),
        ProcessorConfig::default(),
    );

    let dir = TempDir::new().unwrap();
    let store = EventStore::open(StoreConfigBuilder::from_path(dir.path()).build().unwrap())
        .await
        .unwrap();

    for event in events {
        store.write_event(event).await.unwrap();
        processor.process(event).await.unwrap();
    }
    store.close().await.unwrap();

    (graph, store, dir)
}

// Image bump → ImagePullBackOff: the Deployment is the top root-cause
// candidate, with the image change named in the explanation.
#[tokio::test]
async fn image_bump_names_the_deployment_as_root_cause() {
    let events = image_bump_history();
    let (graph, store, _dir) = ingest(&events).await;

    let analyzer = RootCauseAnalyzer::new(graph.clone(), store, RootCauseConfig::default());
    let failure_ts = BASE_TS + 25 * SEC;
    let result = analyzer
        .analyze(&spectre::analysis::RootCauseRequest {
            symptom_uid: "pod-9".into(),
            failure_ts_ns: failure_ts,
            max_depth: None,
            min_confidence: None,
        })
        .await
        .unwrap();

    assert!(result.reason.is_none());
    let top = &result.candidates[0];
    assert_eq!(top.root_uid, "dep-1");
    assert!(
        top.confidence >= 0.7,
        "expected confidence >= 0.7, got {}",
        top.confidence
    );
    assert!(top.explanation.contains("image changed"));
    assert!(top.explanation.contains("failed to pull"));

    // The path runs root → symptom.
    assert_eq!(top.steps.first().unwrap().uid, "dep-1");
    assert_eq!(top.steps.last().unwrap().uid, "pod-9");
}

// Two invocations with identical parameters over a fixed history produce
// identical ranked output.
#[tokio::test]
async fn root_cause_is_deterministic() {
    let events = image_bump_history();
    let (graph, store, _dir) = ingest(&events).await;

    let analyzer = RootCauseAnalyzer::new(graph, store, RootCauseConfig::default());
    let request = spectre::analysis::RootCauseRequest {
        symptom_uid: "pod-9".into(),
        failure_ts_ns: BASE_TS + 25 * SEC,
        max_depth: None,
        min_confidence: None,
    };

    let first = analyzer.analyze(&request).await.unwrap();
    let second = analyzer.analyze(&request).await.unwrap();

    let first_json = serde_json::to_string(&first.candidates).unwrap();
    let second_json = serde_json::to_string(&second.candidates).unwrap();
    similar_asserts::assert_eq!(first_json, second_json);
}

#[tokio::test]
async fn a_healthy_history_returns_no_root_found() {
    let events = vec![
        EventBuilder::new("Pod", "default", "web", "pod-1")
            .at(BASE_TS)
            .data(serde_json::json!({ "status": { "phase": "Running" } }))
            .build(),
    ];
    let (graph, store, _dir) = ingest(&events).await;

    let analyzer = RootCauseAnalyzer::new(graph, store, RootCauseConfig::default());
    let result = analyzer
        .analyze(&spectre::analysis::RootCauseRequest {
            symptom_uid: "pod-1".into(),
            failure_ts_ns: BASE_TS + SEC,
            max_depth: None,
            min_confidence: None,
        })
        .await
        .unwrap();

    assert!(result.candidates.is_empty());
    assert_eq!(result.reason, Some(NO_ROOT_FOUND));
}

#[tokio::test]
async fn unknown_symptom_uid_is_not_an_error() {
    let (graph, store, _dir) = ingest(&[]).await;
    let analyzer = RootCauseAnalyzer::new(graph, store, RootCauseConfig::default());
    let result = analyzer
        .analyze(&spectre::analysis::RootCauseRequest {
            symptom_uid: "no-such-uid".into(),
            failure_ts_ns: BASE_TS,
            max_depth: None,
            min_confidence: None,
        })
        .await
        .unwrap();
    assert_eq!(result.reason, Some(NO_ROOT_FOUND));
}
