//! Sync-pipeline behavior against the in-process graph backend.

use std::sync::Arc;

use spectre::{
    extractors::ExtractorRegistry,
    graph::{EdgeType, EventNode, GraphStore, MemoryStore},
    pipeline::{EventProcessor, ProcessorConfig},
    test_util::{BASE_TS, EventBuilder, SEC},
};
use spectre_event::EventType;

fn processor(graph: Arc<MemoryStore>) -> EventProcessor {
    EventProcessor::new(
        graph,
        Arc::new(ExtractorRegistry::with_defaults()),
        ProcessorConfig::default(),
    )
}

#[tokio::test]
async fn create_then_delete_leaves_a_tombstone() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    let create = EventBuilder::new("Pod", "default", "web", "pod-1")
        .at(BASE_TS)
        .build();
    processor.process(&create).await.unwrap();

    let node = graph.get_resource("pod-1").await.unwrap().unwrap();
    assert!(!node.deleted);
    assert_eq!(node.first_seen_ns, BASE_TS);

    let delete = EventBuilder::new("Pod", "default", "web", "pod-1")
        .event_type(EventType::Delete)
        .resource_version("2")
        .at(BASE_TS + 10 * SEC)
        .build();
    processor.process(&delete).await.unwrap();

    let node = graph.get_resource("pod-1").await.unwrap().unwrap();
    assert!(node.deleted, "delete must tombstone, not remove");
    assert_eq!(node.last_seen_ns, BASE_TS + 10 * SEC);
}

#[tokio::test]
async fn reprocessing_an_event_does_not_duplicate_edges() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    let node_create = EventBuilder::new("Node", "", "node-a", "node-a-uid")
        .at(BASE_TS)
        .data(serde_json::json!({ "metadata": { "name": "node-a" } }))
        .build();
    processor.process(&node_create).await.unwrap();

    let pod = EventBuilder::new("Pod", "default", "web", "pod-1")
        .at(BASE_TS + SEC)
        .data(serde_json::json!({ "spec": { "nodeName": "node-a" } }))
        .build();
    processor.process(&pod).await.unwrap();
    processor.process(&pod).await.unwrap();

    let edges: Vec<_> = graph
        .edges_from("pod-1")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::ScheduledOn)
        .collect();
    assert_eq!(edges.len(), 1);
}

#[tokio::test]
async fn events_are_linked_to_their_resource_and_predecessor() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    for (rv, ts) in [("1", BASE_TS), ("2", BASE_TS + SEC)] {
        let event = EventBuilder::new("Pod", "default", "web", "pod-1")
            .event_type(if rv == "1" {
                EventType::Create
            } else {
                EventType::Update
            })
            .resource_version(rv)
            .at(ts)
            .build();
        processor.process(&event).await.unwrap();
    }

    let events = graph.recent_events("pod-1", BASE_TS).await.unwrap();
    assert_eq!(events.len(), 2);

    // OBSERVED_ON from each event node, PRECEDES between them.
    let first_id = EventNode::event_id_for("pod-1", "1");
    let second_id = EventNode::event_id_for("pod-1", "2");
    let observed: Vec<_> = graph
        .edges_to("pod-1")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::ObservedOn)
        .collect();
    assert_eq!(observed.len(), 2);

    let precedes = graph.edges_from(&first_id).await.unwrap();
    assert!(
        precedes
            .iter()
            .any(|e| e.edge_type == EdgeType::Precedes && e.to_uid == second_id)
    );
}

// ConfigMap change propagation: an update to a mounted ConfigMap followed by
// a pod restart within two minutes yields a CAUSES edge with the
// config-change-restart heuristic.
#[tokio::test]
async fn config_change_propagation_emits_a_causes_edge() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    let cm_update = EventBuilder::new("ConfigMap", "default", "app-config", "cm-1")
        .event_type(EventType::Update)
        .resource_version("5")
        .at(BASE_TS)
        .data(serde_json::json!({ "data": { "key": "new-value" } }))
        .build();
    processor.process(&cm_update).await.unwrap();

    let pod_update = EventBuilder::new("Pod", "default", "web-abc", "pod-1")
        .event_type(EventType::Update)
        .resource_version("7")
        .at(BASE_TS + 60 * SEC)
        .data(serde_json::json!({ "status": { "phase": "Running" } }))
        .build();
    processor.process(&pod_update).await.unwrap();

    let cause_id = EventNode::event_id_for("cm-1", "5");
    let effect_id = EventNode::event_id_for("pod-1", "7");
    let causes: Vec<_> = graph
        .edges_from(&cause_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::Causes)
        .collect();
    assert_eq!(causes.len(), 1);
    assert_eq!(causes[0].to_uid, effect_id);
    assert_eq!(
        causes[0].properties.get("heuristic").and_then(|v| v.as_str()),
        Some("config-change-restart")
    );
    assert_eq!(
        causes[0].properties.get("confidence").and_then(|v| v.as_f64()),
        Some(0.75)
    );

    // And the inverse TRIGGERED_BY edge for traversal from the effect.
    let triggered: Vec<_> = graph
        .edges_from(&effect_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::TriggeredBy)
        .collect();
    assert_eq!(triggered.len(), 1);
}

// Namespace cascade: deleting a namespace with ten resources produces ten
// CAUSES edges off the namespace DELETE event.
#[tokio::test]
async fn namespace_cascade_links_every_contained_delete() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    // Seed the resources so their deletes have nodes to tombstone.
    for i in 0..10 {
        let create = EventBuilder::new("Pod", "staging", &format!("pod-{i}"), &format!("p-{i}"))
            .at(BASE_TS - 100 * SEC)
            .build();
        processor.process(&create).await.unwrap();
    }

    let ns_delete = EventBuilder::new("Namespace", "", "staging", "ns-1")
        .event_type(EventType::Delete)
        .resource_version("9")
        .at(BASE_TS)
        .build();
    processor.process(&ns_delete).await.unwrap();

    for i in 0..10 {
        let delete = EventBuilder::new("Pod", "staging", &format!("pod-{i}"), &format!("p-{i}"))
            .event_type(EventType::Delete)
            .resource_version("10")
            .at(BASE_TS + (i as i64 + 1) * SEC)
            .build();
        processor.process(&delete).await.unwrap();
    }

    let ns_event_id = EventNode::event_id_for("ns-1", "9");
    let causes: Vec<_> = graph
        .edges_from(&ns_event_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::Causes)
        .collect();
    assert_eq!(causes.len(), 10);
    for edge in &causes {
        assert_eq!(
            edge.properties.get("heuristic").and_then(|v| v.as_str()),
            Some("namespace-cascade-delete")
        );
        assert_eq!(
            edge.properties.get("confidence").and_then(|v| v.as_f64()),
            Some(0.95)
        );
    }
}

#[tokio::test]
async fn unresolved_targets_materialise_dangling_edges_and_heal_on_reextraction() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    // The pod mounts a ConfigMap that has not been observed yet.
    let pod = EventBuilder::new("Pod", "default", "web", "pod-1")
        .at(BASE_TS)
        .data(serde_json::json!({
            "spec": { "volumes": [{ "name": "cfg", "configMap": { "name": "app-config" } }] },
        }))
        .build();
    processor.process(&pod).await.unwrap();

    let dangling = graph.dangling_edges().await.unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].edge_type, EdgeType::Mounts);

    // The ConfigMap appears; re-extraction (as the reconciler would drive)
    // resolves the edge.
    let cm = EventBuilder::new("ConfigMap", "default", "app-config", "cm-1")
        .at(BASE_TS + SEC)
        .build();
    processor.process(&cm).await.unwrap();

    let pod_again = EventBuilder::new("Pod", "default", "web", "pod-1")
        .event_type(EventType::Update)
        .resource_version("2")
        .at(BASE_TS + 2 * SEC)
        .data(serde_json::json!({
            "spec": { "volumes": [{ "name": "cfg", "configMap": { "name": "app-config" } }] },
        }))
        .build();
    processor.process(&pod_again).await.unwrap();

    let mounts: Vec<_> = graph
        .edges_from("pod-1")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::Mounts && e.to_uid == "cm-1")
        .collect();
    assert_eq!(mounts.len(), 1);
}

#[tokio::test]
async fn ownership_chain_is_projected_from_owner_references() {
    let graph = Arc::new(MemoryStore::new());
    let processor = processor(graph.clone());

    let rs = EventBuilder::new("ReplicaSet", "default", "web-5c9", "rs-1")
        .at(BASE_TS)
        .data(serde_json::json!({
            "metadata": { "ownerReferences": [
                { "kind": "Deployment", "uid": "dep-1", "controller": true },
            ]},
        }))
        .build();
    processor.process(&rs).await.unwrap();

    let pod = EventBuilder::new("Pod", "default", "web-5c9-abc", "pod-1")
        .at(BASE_TS + SEC)
        .data(serde_json::json!({
            "metadata": { "ownerReferences": [
                { "kind": "ReplicaSet", "uid": "rs-1", "controller": true },
            ]},
        }))
        .build();
    processor.process(&pod).await.unwrap();

    let owns_rs = graph.edges_from("dep-1").await.unwrap();
    assert!(
        owns_rs
            .iter()
            .any(|e| e.edge_type == EdgeType::Owns && e.to_uid == "rs-1")
    );
    let owns_pod = graph.edges_from("rs-1").await.unwrap();
    assert!(
        owns_pod
            .iter()
            .any(|e| e.edge_type == EdgeType::Owns && e.to_uid == "pod-1")
    );
}
