//! Ingress → Service backend references, both the `networking.k8s.io/v1`
//! shape (`backend.service.name`) and the legacy `backend.serviceName` one.

use async_trait::async_trait;
use spectre_event::ChangeEvent;

use super::{DanglingPolicy, EdgeSpec, Extractor, Lookup, TargetRef, util};
use crate::graph::{EdgeType, GraphError};

pub struct IngressBackends;

impl IngressBackends {
    fn backend_service(backend: &serde_json::Value) -> Option<String> {
        util::string_at(backend, "/service/name")
            .or_else(|| util::string_at(backend, "/serviceName"))
            .map(str::to_string)
    }
}

#[async_trait]
impl Extractor for IngressBackends {
    fn name(&self) -> &'static str {
        "ingress-backends"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.resource.kind == "Ingress"
            && (event.resource.group == "networking.k8s.io"
                || event.resource.group == "extensions")
    }

    async fn extract(
        &self,
        event: &ChangeEvent,
        _lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError> {
        let ns = &event.resource.namespace;
        let mut edges = Vec::new();

        if let Some(backend) = event.data.pointer("/spec/defaultBackend")
            && let Some(service) = Self::backend_service(backend)
        {
            edges.push(
                EdgeSpec::to_target(
                    EdgeType::ReferencesSpec,
                    TargetRef::named("Service", ns, &service),
                )
                .key("defaultBackend")
                .property("role", "defaultBackend")
                .dangling(DanglingPolicy::Materialise),
            );
        }

        for rule in util::array_at(&event.data, "/spec/rules") {
            let host = rule.get("host").and_then(|v| v.as_str()).unwrap_or("*");
            for path in util::array_at(rule, "/http/paths") {
                let Some(backend) = path.get("backend") else {
                    continue;
                };
                let Some(service) = Self::backend_service(backend) else {
                    continue;
                };
                let path_str = path.get("path").and_then(|v| v.as_str()).unwrap_or("/");
                edges.push(
                    EdgeSpec::to_target(
                        EdgeType::ReferencesSpec,
                        TargetRef::named("Service", ns, &service),
                    )
                    .key(format!("{host}{path_str}"))
                    .property("host", host)
                    .property("path", path_str)
                    .dangling(DanglingPolicy::Materialise),
                );
            }
        }

        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use spectre_event::{EventType, ResourceRef};

    use super::*;

    fn ingress_event(data: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            id: 1,
            timestamp_ns: 1,
            event_type: EventType::Update,
            resource: ResourceRef {
                group: "networking.k8s.io".into(),
                version: "v1".into(),
                kind: "Ingress".into(),
                namespace: "default".into(),
                name: "web".into(),
                uid: "ing-1".into(),
                resource_version: "1".into(),
                ..Default::default()
            },
            data,
        }
    }

    #[tokio::test]
    async fn new_and_legacy_backend_shapes_both_resolve() {
        let event = ingress_event(serde_json::json!({
            "spec": {
                "defaultBackend": { "service": { "name": "fallback" } },
                "rules": [
                    { "host": "a.example.com", "http": { "paths": [
                        { "path": "/api", "backend": { "service": { "name": "api-svc" } } },
                    ]}},
                    { "http": { "paths": [
                        { "backend": { "serviceName": "legacy-svc" } },
                    ]}},
                ],
            },
        }));

        let lookup = Lookup::new(std::sync::Arc::new(crate::graph::MemoryStore::new()));
        let edges = IngressBackends.extract(&event, &lookup).await.unwrap();
        assert_eq!(edges.len(), 3);

        let targets: Vec<_> = edges.iter().map(|e| e.target.clone()).collect();
        assert!(targets.contains(&TargetRef::named("Service", "default", "fallback")));
        assert!(targets.contains(&TargetRef::named("Service", "default", "api-svc")));
        assert!(targets.contains(&TargetRef::named("Service", "default", "legacy-svc")));
    }
}
