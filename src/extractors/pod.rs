//! Pod relationships: scheduling, config/secret references, service account.

use async_trait::async_trait;
use spectre_event::ChangeEvent;

use super::{DanglingPolicy, EdgeSpec, Extractor, Lookup, TargetRef, util};
use crate::graph::{EdgeType, GraphError};

pub struct PodRelationships;

impl PodRelationships {
    fn volume_edges(event: &ChangeEvent) -> Vec<EdgeSpec> {
        let ns = &event.resource.namespace;
        let mut edges = Vec::new();

        for volume in util::array_at(&event.data, "/spec/volumes") {
            let volume_name = volume
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            if let Some(name) = util::string_at(volume, "/configMap/name") {
                edges.push(
                    EdgeSpec::to_target(EdgeType::Mounts, TargetRef::named("ConfigMap", ns, name))
                        .key(volume_name)
                        .property("source", "volume")
                        .dangling(DanglingPolicy::Materialise),
                );
            }
            if let Some(name) = util::string_at(volume, "/secret/secretName") {
                edges.push(
                    EdgeSpec::to_target(EdgeType::Mounts, TargetRef::named("Secret", ns, name))
                        .key(volume_name)
                        .property("source", "volume")
                        .dangling(DanglingPolicy::Materialise),
                );
            }
            for source in util::array_at(volume, "/projected/sources") {
                if let Some(name) = util::string_at(source, "/configMap/name") {
                    edges.push(
                        EdgeSpec::to_target(
                            EdgeType::Mounts,
                            TargetRef::named("ConfigMap", ns, name),
                        )
                        .key(volume_name)
                        .property("source", "projected")
                        .dangling(DanglingPolicy::Materialise),
                    );
                }
                if let Some(name) = util::string_at(source, "/secret/name") {
                    edges.push(
                        EdgeSpec::to_target(EdgeType::Mounts, TargetRef::named("Secret", ns, name))
                            .key(volume_name)
                            .property("source", "projected")
                            .dangling(DanglingPolicy::Materialise),
                    );
                }
            }
        }

        edges
    }

    fn env_edges(event: &ChangeEvent) -> Vec<EdgeSpec> {
        let ns = &event.resource.namespace;
        let mut edges = Vec::new();

        let container_lists = ["/spec/containers", "/spec/initContainers"];
        for list in container_lists {
            for container in util::array_at(&event.data, list) {
                let container_name = container
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();

                for env_from in util::array_at(container, "/envFrom") {
                    if let Some(name) = util::string_at(env_from, "/configMapRef/name") {
                        edges.push(
                            EdgeSpec::to_target(
                                EdgeType::ReferencesSpec,
                                TargetRef::named("ConfigMap", ns, name),
                            )
                            .key(format!("{container_name}/envFrom"))
                            .property("via", "envFrom")
                            .dangling(DanglingPolicy::Materialise),
                        );
                    }
                    if let Some(name) = util::string_at(env_from, "/secretRef/name") {
                        edges.push(
                            EdgeSpec::to_target(
                                EdgeType::ReferencesSpec,
                                TargetRef::named("Secret", ns, name),
                            )
                            .key(format!("{container_name}/envFrom"))
                            .property("via", "envFrom")
                            .dangling(DanglingPolicy::Materialise),
                        );
                    }
                }

                for env in util::array_at(container, "/env") {
                    if let Some(name) = util::string_at(env, "/valueFrom/configMapKeyRef/name") {
                        edges.push(
                            EdgeSpec::to_target(
                                EdgeType::ReferencesSpec,
                                TargetRef::named("ConfigMap", ns, name),
                            )
                            .key(format!("{container_name}/env"))
                            .property("via", "env.valueFrom")
                            .dangling(DanglingPolicy::Materialise),
                        );
                    }
                    if let Some(name) = util::string_at(env, "/valueFrom/secretKeyRef/name") {
                        edges.push(
                            EdgeSpec::to_target(
                                EdgeType::ReferencesSpec,
                                TargetRef::named("Secret", ns, name),
                            )
                            .key(format!("{container_name}/env"))
                            .property("via", "env.valueFrom")
                            .dangling(DanglingPolicy::Materialise),
                        );
                    }
                }
            }
        }

        edges
    }
}

#[async_trait]
impl Extractor for PodRelationships {
    fn name(&self) -> &'static str {
        "pod-relationships"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.resource.group.is_empty() && event.resource.kind == "Pod"
    }

    async fn extract(
        &self,
        event: &ChangeEvent,
        _lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError> {
        let mut edges = Vec::new();

        if let Some(node_name) = util::string_at(&event.data, "/spec/nodeName") {
            edges.push(
                EdgeSpec::to_target(
                    EdgeType::ScheduledOn,
                    TargetRef::named("Node", "", node_name),
                )
                .dangling(DanglingPolicy::Materialise),
            );
        }

        edges.extend(Self::volume_edges(event));
        edges.extend(Self::env_edges(event));

        if let Some(sa) = util::string_at(&event.data, "/spec/serviceAccountName") {
            edges.push(EdgeSpec::to_target(
                EdgeType::UsesServiceAccount,
                TargetRef::named("ServiceAccount", &event.resource.namespace, sa),
            ));
        }

        Ok(edges)
    }
}
