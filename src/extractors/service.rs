//! Service → Pod label-selector edges.

use async_trait::async_trait;
use spectre_event::ChangeEvent;

use super::{EdgeSpec, Extractor, Lookup, TargetRef, util};
use crate::graph::{EdgeType, GraphError};

pub struct ServiceSelector;

#[async_trait]
impl Extractor for ServiceSelector {
    fn name(&self) -> &'static str {
        "service-selector"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.resource.group.is_empty() && event.resource.kind == "Service"
    }

    async fn extract(
        &self,
        event: &ChangeEvent,
        lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError> {
        let selector = util::string_map_at(&event.data, "/spec/selector");
        if selector.is_empty() {
            // Headless services without selectors are backed by manual
            // Endpoints; nothing to link here.
            return Ok(Vec::new());
        }

        let selector_json = serde_json::to_value(&selector).unwrap_or_default();
        let pods = lookup
            .pods_matching(&event.resource.namespace, &selector)
            .await?;

        Ok(pods
            .into_iter()
            .map(|pod| {
                EdgeSpec::to_target(EdgeType::Selects, TargetRef::Uid(pod.uid))
                    .property("selector", selector_json.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spectre_event::{EventType, ResourceRef};

    use super::*;
    use crate::graph::{GraphStore, MemoryStore, ResourceNode};

    fn pod(uid: &str, labels: &[(&str, &str)]) -> ResourceNode {
        ResourceNode {
            uid: uid.into(),
            kind: "Pod".into(),
            group: String::new(),
            namespace: "default".into(),
            name: uid.into(),
            resource_version: "1".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            deleted: false,
            first_seen_ns: 1,
            last_seen_ns: 1,
        }
    }

    #[tokio::test]
    async fn selects_only_pods_matching_every_label() {
        let graph = Arc::new(MemoryStore::new());
        graph
            .upsert_resource(&pod("pod-a", &[("app", "web"), ("tier", "frontend")]))
            .await
            .unwrap();
        graph
            .upsert_resource(&pod("pod-b", &[("app", "web")]))
            .await
            .unwrap();
        graph
            .upsert_resource(&pod("pod-c", &[("app", "db"), ("tier", "frontend")]))
            .await
            .unwrap();

        let event = ChangeEvent {
            id: 1,
            timestamp_ns: 1,
            event_type: EventType::Update,
            resource: ResourceRef {
                version: "v1".into(),
                kind: "Service".into(),
                namespace: "default".into(),
                name: "web".into(),
                uid: "svc-1".into(),
                resource_version: "1".into(),
                ..Default::default()
            },
            data: serde_json::json!({
                "spec": { "selector": { "app": "web", "tier": "frontend" } },
            }),
        };

        let lookup = Lookup::new(graph);
        let edges = ServiceSelector.extract(&event, &lookup).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, TargetRef::Uid("pod-a".into()));
    }
}
