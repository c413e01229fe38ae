//! NetworkPolicy → Pod selector edges.

use async_trait::async_trait;
use spectre_event::ChangeEvent;

use super::{EdgeSpec, Extractor, Lookup, TargetRef, util};
use crate::graph::{EdgeType, GraphError};

pub struct NetworkPolicySelector;

#[async_trait]
impl Extractor for NetworkPolicySelector {
    fn name(&self) -> &'static str {
        "network-policy-selector"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.resource.group == "networking.k8s.io" && event.resource.kind == "NetworkPolicy"
    }

    async fn extract(
        &self,
        event: &ChangeEvent,
        lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError> {
        let selector = util::string_map_at(&event.data, "/spec/podSelector/matchLabels");

        // An empty podSelector selects every pod in the namespace.
        let pods = if selector.is_empty()
            && event.data.pointer("/spec/podSelector").is_some()
        {
            lookup
                .pods_matching(&event.resource.namespace, &Default::default())
                .await?
        } else if selector.is_empty() {
            return Ok(Vec::new());
        } else {
            lookup
                .pods_matching(&event.resource.namespace, &selector)
                .await?
        };

        Ok(pods
            .into_iter()
            .map(|pod| {
                EdgeSpec::to_target(EdgeType::Selects, TargetRef::Uid(pod.uid))
                    .property("policy", event.resource.name.clone())
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

    #[tokio::test]
    async fn empty_pod_selector_selects_the_whole_namespace() {
        let graph = Arc::new(MemoryStore::new());
        for uid in ["pod-a", "pod-b"] {
            graph
                .upsert_resource(&ResourceNode {
                    uid: uid.into(),
                    kind: "Pod".into(),
                    group: String::new(),
                    namespace: "default".into(),
                    name: uid.into(),
                    resource_version: "1".into(),
                    labels: Default::default(),
                    deleted: false,
                    first_seen_ns: 1,
                    last_seen_ns: 1,
                })
                .await
                .unwrap();
        }

        let event = ChangeEvent {
            id: 1,
            timestamp_ns: 1,
            event_type: EventType::Create,
            resource: ResourceRef {
                group: "networking.k8s.io".into(),
                version: "v1".into(),
                kind: "NetworkPolicy".into(),
                namespace: "default".into(),
                name: "deny-all".into(),
                uid: "np-1".into(),
                resource_version: "1".into(),
                ..Default::default()
            },
            data: serde_json::json!({ "spec": { "podSelector": {} } }),
        };

        let lookup = Lookup::new(graph);
        let edges = NetworkPolicySelector.extract(&event, &lookup).await.unwrap();
        assert_eq!(edges.len(), 2);
    }
}
