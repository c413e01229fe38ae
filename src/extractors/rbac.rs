//! RBAC binding edges: RoleBinding/ClusterRoleBinding → Role and
//! → ServiceAccount subjects.

use async_trait::async_trait;
use spectre_event::ChangeEvent;

use super::{DanglingPolicy, EdgeSpec, Extractor, Lookup, TargetRef, util};
use crate::graph::{EdgeType, GraphError};

pub struct RbacBindings;

#[async_trait]
impl Extractor for RbacBindings {
    fn name(&self) -> &'static str {
        "rbac-bindings"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.resource.group == "rbac.authorization.k8s.io"
            && matches!(
                event.resource.kind.as_str(),
                "RoleBinding" | "ClusterRoleBinding"
            )
    }

    async fn extract(
        &self,
        event: &ChangeEvent,
        _lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError> {
        let mut edges = Vec::new();

        if let (Some(role_kind), Some(role_name)) = (
            util::string_at(&event.data, "/roleRef/kind"),
            util::string_at(&event.data, "/roleRef/name"),
        ) {
            // ClusterRoles are cluster-scoped; Roles live in the binding's
            // namespace.
            let role_namespace = if role_kind == "ClusterRole" {
                ""
            } else {
                event.resource.namespace.as_str()
            };
            edges.push(
                EdgeSpec::to_target(
                    EdgeType::BindsRole,
                    TargetRef::named(role_kind, role_namespace, role_name),
                )
                .dangling(DanglingPolicy::Materialise),
            );
        }

        for subject in util::array_at(&event.data, "/subjects") {
            let kind = subject.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if kind != "ServiceAccount" {
                continue;
            }
            let Some(name) = subject.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let namespace = subject
                .get("namespace")
                .and_then(|v| v.as_str())
                .unwrap_or(event.resource.namespace.as_str());
            edges.push(
                EdgeSpec::to_target(
                    EdgeType::GrantsTo,
                    TargetRef::named("ServiceAccount", namespace, name),
                )
                .key(format!("{namespace}/{name}"))
                .dangling(DanglingPolicy::Materialise),
            );
        }

        Ok(edges)
    }
}
