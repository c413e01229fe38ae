//! Owner-reference chain: Deployment → ReplicaSet → Pod, StatefulSet → Pod,
//! DaemonSet → Pod, Job → Pod, and any other ownerReference.

use async_trait::async_trait;
use spectre_event::ChangeEvent;

use super::{EdgeSpec, Extractor, Lookup, TargetRef, util};
use crate::graph::{EdgeType, GraphError};

pub struct OwnershipChain;

#[async_trait]
impl Extractor for OwnershipChain {
    fn name(&self) -> &'static str {
        "ownership-chain"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        !util::array_at(&event.data, "/metadata/ownerReferences").is_empty()
    }

    async fn extract(
        &self,
        event: &ChangeEvent,
        _lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError> {
        let mut edges = Vec::new();

        for owner in util::array_at(&event.data, "/metadata/ownerReferences") {
            let Some(owner_uid) = owner.get("uid").and_then(|v| v.as_str()) else {
                continue;
            };
            let controller = owner
                .get("controller")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let kind = owner.get("kind").and_then(|v| v.as_str()).unwrap_or("");

            // The controlling owner OWNS the object; auxiliary owners merely
            // MANAGE it.
            let edge_type = if controller {
                EdgeType::Owns
            } else {
                EdgeType::Manages
            };

            edges.push(
                EdgeSpec::from_source(
                    edge_type,
                    TargetRef::Uid(owner_uid.to_string()),
                    TargetRef::Uid(event.resource.uid.clone()),
                )
                .property("ownerKind", kind)
                .property("controller", controller),
            );
        }

        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use spectre_event::{EventType, ResourceRef};

    use super::*;

    #[tokio::test]
    async fn controller_reference_becomes_owns_and_auxiliary_becomes_manages() {
        let event = ChangeEvent {
            id: 1,
            timestamp_ns: 1,
            event_type: EventType::Create,
            resource: ResourceRef {
                version: "v1".into(),
                kind: "Pod".into(),
                namespace: "default".into(),
                name: "web-abc".into(),
                uid: "pod-1".into(),
                resource_version: "1".into(),
                ..Default::default()
            },
            data: serde_json::json!({
                "metadata": {
                    "ownerReferences": [
                        { "kind": "ReplicaSet", "uid": "rs-1", "controller": true },
                        { "kind": "Workflow", "uid": "wf-1" },
                    ],
                },
            }),
        };

        let lookup = Lookup::new(std::sync::Arc::new(crate::graph::MemoryStore::new()));
        let edges = OwnershipChain.extract(&event, &lookup).await.unwrap();
        assert_eq!(edges.len(), 2);

        assert_eq!(edges[0].edge_type, EdgeType::Owns);
        assert_eq!(edges[0].source, Some(TargetRef::Uid("rs-1".into())));
        assert_eq!(edges[0].target, TargetRef::Uid("pod-1".into()));

        assert_eq!(edges[1].edge_type, EdgeType::Manages);
        assert_eq!(edges[1].source, Some(TargetRef::Uid("wf-1".into())));
    }
}
