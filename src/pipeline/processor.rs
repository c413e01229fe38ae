//! Per-event processing: node upsert, extraction, edge bookkeeping, event
//! node insertion, and causality feeding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use snafu::{ResultExt, Snafu};
use spectre_event::{ChangeEvent, EventType, ValidationError};
use tracing::debug;

use super::causality::{CausalityConfig, CausalityEngine};
use crate::{
    extractors::{DanglingPolicy, EdgeSpec, ExtractorRegistry, Lookup, TargetRef},
    graph::{EdgeRecord, EdgeType, EventNode, GraphError, GraphStore, ResourceNode},
};

#[derive(Debug, Snafu)]
pub enum ProcessError {
    #[snafu(display("event rejected: {source}"))]
    Invalid { source: ValidationError },

    #[snafu(display("graph mutation failed: {source}"))]
    Graph { source: GraphError },
}

impl ProcessError {
    /// Validation failures are dropped, not retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProcessError::Invalid { .. })
    }
}

/// Settings for the per-event processor.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Window after which un-refreshed edges out of a re-observed resource
    /// are marked stale. Two windows must elapse.
    pub observation_window: Duration,
    pub causality: CausalityConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(600),
            causality: CausalityConfig::default(),
        }
    }
}

/// Stateful per-event processor shared by the pipeline workers.
pub struct EventProcessor {
    graph: Arc<dyn GraphStore>,
    registry: Arc<ExtractorRegistry>,
    lookup: Lookup,
    config: ProcessorConfig,
    causality: Mutex<CausalityEngine>,
    /// Last manifest per uid, for diff summaries.
    last_manifest: DashMap<String, serde_json::Value>,
    /// Last event id per uid, for `PRECEDES` linking.
    last_event_id: DashMap<String, String>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor").finish_non_exhaustive()
    }
}

impl EventProcessor {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        registry: Arc<ExtractorRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            lookup: Lookup::new(graph.clone()),
            causality: Mutex::new(CausalityEngine::new(config.causality)),
            graph,
            registry,
            config,
            last_manifest: DashMap::new(),
            last_event_id: DashMap::new(),
        }
    }

    /// Runs one event through every pipeline stage.
    pub async fn process(&self, event: &ChangeEvent) -> Result<(), ProcessError> {
        event.validate().context(InvalidSnafu)?;

        self.apply_resource(event).await?;
        let edges = self.run_extractors(event).await?;
        self.apply_edges(event, edges).await?;
        self.record_event_node(event).await?;
        self.apply_causality(event).await?;

        Ok(())
    }

    async fn apply_resource(&self, event: &ChangeEvent) -> Result<(), ProcessError> {
        match event.event_type {
            EventType::Create | EventType::Update => {
                let node = ResourceNode {
                    uid: event.resource.uid.clone(),
                    kind: event.resource.kind.clone(),
                    group: event.resource.group.clone(),
                    namespace: event.resource.namespace.clone(),
                    name: event.resource.name.clone(),
                    resource_version: event.resource.resource_version.clone(),
                    labels: event.resource.labels.clone(),
                    deleted: false,
                    first_seen_ns: event.timestamp_ns,
                    last_seen_ns: event.timestamp_ns,
                };
                self.graph.upsert_resource(&node).await.context(GraphSnafu)
            }
            EventType::Delete => self
                .graph
                .mark_deleted(&event.resource.uid, event.timestamp_ns)
                .await
                .context(GraphSnafu),
        }
    }

    async fn run_extractors(&self, event: &ChangeEvent) -> Result<Vec<EdgeSpec>, ProcessError> {
        let mut specs = Vec::new();
        for extractor in self.registry.matching(event) {
            // One faulty extractor must not block the others.
            match extractor.extract(event, &self.lookup).await {
                Ok(mut edges) => specs.append(&mut edges),
                Err(error) => {
                    debug!(
                        extractor = extractor.name(),
                        event_id = event.id,
                        %error,
                        "extractor failed, continuing with the rest"
                    );
                }
            }
        }
        Ok(specs)
    }

    async fn resolve(&self, target: &TargetRef) -> Result<Option<String>, GraphError> {
        match target {
            TargetRef::Uid(uid) => Ok(Some(uid.clone())),
            TargetRef::Named {
                kind,
                namespace,
                name,
            } => Ok(self
                .lookup
                .find_by_namespaced_name(kind, namespace, name)
                .await?
                .map(|node| node.uid)),
        }
    }

    async fn apply_edges(
        &self,
        event: &ChangeEvent,
        specs: Vec<EdgeSpec>,
    ) -> Result<(), ProcessError> {
        for spec in specs {
            let from_uid = match &spec.source {
                None => Some(event.resource.uid.clone()),
                Some(source) => self.resolve(source).await.context(GraphSnafu)?,
            };
            let Some(from_uid) = from_uid else {
                debug!(edge = spec.edge_type.as_str(), "edge source unresolved, dropping");
                continue;
            };

            let to_uid = self.resolve(&spec.target).await.context(GraphSnafu)?;
            let to_uid = match (to_uid, spec.dangling) {
                (Some(uid), _) => uid,
                (None, DanglingPolicy::Drop) => {
                    debug!(
                        edge = spec.edge_type.as_str(),
                        target = ?spec.target,
                        "edge target not in graph, dropping"
                    );
                    continue;
                }
                // Materialise with an empty target; the reconciler repairs
                // it once the resource appears.
                (None, DanglingPolicy::Materialise) => String::new(),
            };

            let mut edge = EdgeRecord {
                edge_type: spec.edge_type,
                from_uid,
                to_uid,
                semantic_key: spec.semantic_key,
                observed_at_ns: event.timestamp_ns,
                last_observed_at_ns: event.timestamp_ns,
                stale: false,
                properties: spec.properties,
            };
            if edge.is_dangling()
                && let TargetRef::Named {
                    kind,
                    namespace,
                    name,
                } = &spec.target
            {
                edge.properties.insert(
                    "danglingTarget".to_string(),
                    serde_json::json!({ "kind": kind, "namespace": namespace, "name": name }),
                );
            }
            self.graph.upsert_edge(&edge).await.context(GraphSnafu)?;
        }

        // Edges out of this resource that two observation windows failed to
        // refresh go stale.
        let stale_cutoff =
            event.timestamp_ns - 2 * self.config.observation_window.as_nanos() as i64;
        self.graph
            .mark_edges_stale(&event.resource.uid, stale_cutoff)
            .await
            .context(GraphSnafu)?;

        Ok(())
    }

    async fn record_event_node(&self, event: &ChangeEvent) -> Result<(), ProcessError> {
        let uid = &event.resource.uid;
        let previous = self.last_manifest.get(uid).map(|e| e.value().clone());
        let summary = summarize_change(event, previous.as_ref());
        let messages = extract_messages(&event.data);

        let node = EventNode {
            event_id: EventNode::event_id_for(uid, &event.resource.resource_version),
            resource_uid: uid.clone(),
            timestamp_ns: event.timestamp_ns,
            event_type: event.event_type,
            summary,
            messages,
        };
        self.graph.insert_event(&node).await.context(GraphSnafu)?;

        // Link time-adjacent events on the same resource.
        if let Some(prev_id) = self.last_event_id.get(uid).map(|e| e.value().clone())
            && prev_id != node.event_id
        {
            let edge = EdgeRecord::new(EdgeType::Precedes, prev_id, node.event_id.clone())
                .observed_at(event.timestamp_ns);
            self.graph.upsert_edge(&edge).await.context(GraphSnafu)?;
        }

        if event.event_type == EventType::Delete {
            self.last_manifest.remove(uid);
            self.last_event_id.remove(uid);
        } else {
            self.last_manifest.insert(uid.clone(), event.data.clone());
            self.last_event_id.insert(uid.clone(), node.event_id);
        }
        Ok(())
    }

    async fn apply_causality(&self, event: &ChangeEvent) -> Result<(), ProcessError> {
        let links = {
            let mut engine = self.causality.lock().expect("causality lock poisoned");
            engine.observe(event)
        };

        for link in links {
            let edge = EdgeRecord::new(
                EdgeType::Causes,
                link.cause_event_id.clone(),
                link.effect_event_id.clone(),
            )
            .observed_at(event.timestamp_ns)
            .with_property("heuristic", link.heuristic)
            .with_property("confidence", link.confidence)
            .with_property("lagMs", link.lag_ms);
            self.graph.upsert_edge(&edge).await.context(GraphSnafu)?;

            let inverse = EdgeRecord::new(
                EdgeType::TriggeredBy,
                link.effect_event_id,
                link.cause_event_id,
            )
            .observed_at(event.timestamp_ns)
            .with_property("heuristic", link.heuristic)
            .with_property("confidence", link.confidence);
            self.graph.upsert_edge(&inverse).await.context(GraphSnafu)?;
        }
        Ok(())
    }
}

/// Short human-readable description of what changed.
fn summarize_change(event: &ChangeEvent, previous: Option<&serde_json::Value>) -> String {
    match event.event_type {
        EventType::Create => format!("{} created", event.resource.kind),
        EventType::Delete => format!("{} deleted", event.resource.kind),
        EventType::Update => {
            let Some(previous) = previous else {
                return format!("{} updated", event.resource.kind);
            };
            let changed = changed_sections(previous, &event.data);
            if changed.is_empty() {
                format!("{} updated", event.resource.kind)
            } else {
                format!("{} updated ({})", event.resource.kind, changed.join(", "))
            }
        }
    }
}

/// Top-level and spec-level sections that differ between two manifests.
fn changed_sections(previous: &serde_json::Value, current: &serde_json::Value) -> Vec<String> {
    const SECTIONS: &[&str] = &["metadata", "spec", "status", "data"];
    let mut changed = Vec::new();

    for section in SECTIONS {
        let (prev, curr) = (previous.get(section), current.get(section));
        if prev == curr {
            continue;
        }
        if *section != "spec" {
            changed.push((*section).to_string());
            continue;
        }
        // Name the offending spec fields, they carry the most signal.
        let empty = serde_json::Map::new();
        let prev_map = prev.and_then(|v| v.as_object()).unwrap_or(&empty);
        let curr_map = curr.and_then(|v| v.as_object()).unwrap_or(&empty);
        let mut fields: Vec<&String> = curr_map
            .iter()
            .filter(|(k, v)| prev_map.get(*k) != Some(v))
            .map(|(k, _)| k)
            .collect();
        for key in prev_map.keys() {
            if !curr_map.contains_key(key) && !fields.contains(&key) {
                fields.push(key);
            }
        }
        fields.sort();
        if fields.is_empty() {
            changed.push("spec".to_string());
        } else {
            changed.extend(fields.into_iter().take(5).map(|f| format!("spec.{f}")));
        }
    }

    changed
}

/// Error and warning messages carried by the manifest: failing container
/// states and false conditions.
fn extract_messages(manifest: &serde_json::Value) -> Vec<String> {
    let mut messages = Vec::new();

    for statuses in ["/status/containerStatuses", "/status/initContainerStatuses"] {
        for status in manifest
            .pointer(statuses)
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if let Some(waiting) = status.pointer("/state/waiting") {
                let reason = waiting.get("reason").and_then(|v| v.as_str()).unwrap_or("");
                if !reason.is_empty() && reason != "ContainerCreating" {
                    let message = waiting
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    messages.push(if message.is_empty() {
                        reason.to_string()
                    } else {
                        format!("{reason}: {message}")
                    });
                }
            }
            if let Some(reason) = status
                .pointer("/lastState/terminated/reason")
                .and_then(|v| v.as_str())
                && reason != "Completed"
            {
                messages.push(format!("last termination: {reason}"));
            }
        }
    }

    for condition in manifest
        .pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let status = condition.get("status").and_then(|v| v.as_str());
        let condition_type = condition.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let is_bad = match condition_type {
            "Ready" | "Available" | "PodScheduled" | "ContainersReady" => status == Some("False"),
            "MemoryPressure" | "DiskPressure" | "PIDPressure" => status == Some("True"),
            _ => false,
        };
        if is_bad && let Some(message) = condition.get("message").and_then(|v| v.as_str()) {
            messages.push(format!("{condition_type}: {message}"));
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use spectre_event::ResourceRef;

    use super::*;

    fn update_event(data: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            id: 1,
            timestamp_ns: 1,
            event_type: EventType::Update,
            resource: ResourceRef {
                version: "v1".into(),
                kind: "Pod".into(),
                namespace: "default".into(),
                name: "web".into(),
                uid: "pod-1".into(),
                resource_version: "2".into(),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn spec_image_change_is_named_in_the_summary() {
        let previous = serde_json::json!({ "spec": { "image": "nginx:1.25", "replicas": 3 } });
        let event = update_event(serde_json::json!({
            "spec": { "image": "nginx:1.26", "replicas": 3 },
        }));
        let summary = summarize_change(&event, Some(&previous));
        assert_eq!(summary, "Pod updated (spec.image)");
    }

    #[test]
    fn waiting_reason_and_bad_conditions_become_messages() {
        let manifest = serde_json::json!({
            "status": {
                "containerStatuses": [{
                    "state": { "waiting": {
                        "reason": "ImagePullBackOff",
                        "message": "Back-off pulling image \"nginx:nonexistent\"",
                    }},
                    "lastState": { "terminated": { "reason": "OOMKilled" } },
                }],
                "conditions": [{
                    "type": "Ready",
                    "status": "False",
                    "message": "containers with unready status",
                }],
            },
        });
        let messages = extract_messages(&manifest);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with("ImagePullBackOff"));
        assert!(messages[1].contains("OOMKilled"));
        assert!(messages[2].starts_with("Ready:"));
    }
}
