//! Shared helpers for unit and integration tests.

#![allow(dead_code)]

use spectre_event::{ChangeEvent, EventType, ResourceRef};

pub const SEC: i64 = 1_000_000_000;
pub const BASE_TS: i64 = 1_700_000_000 * SEC;

/// Fully-populated event builder for tests.
pub struct EventBuilder {
    event: ChangeEvent,
}

impl EventBuilder {
    pub fn new(kind: &str, namespace: &str, name: &str, uid: &str) -> Self {
        let group = match kind {
            "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" => "apps",
            "Job" | "CronJob" => "batch",
            "Ingress" | "NetworkPolicy" => "networking.k8s.io",
            "RoleBinding" | "ClusterRoleBinding" | "Role" | "ClusterRole" => {
                "rbac.authorization.k8s.io"
            }
            _ => "",
        };
        Self {
            event: ChangeEvent {
                id: 1,
                timestamp_ns: BASE_TS,
                event_type: EventType::Create,
                resource: ResourceRef {
                    group: group.into(),
                    version: "v1".into(),
                    kind: kind.into(),
                    namespace: namespace.into(),
                    name: name.into(),
                    uid: uid.into(),
                    resource_version: "1".into(),
                    ..Default::default()
                },
                data: serde_json::json!({}),
            },
        }
    }

    pub fn id(mut self, id: u64) -> Self {
        self.event.id = id;
        self
    }

    pub fn at(mut self, timestamp_ns: i64) -> Self {
        self.event.timestamp_ns = timestamp_ns;
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event.event_type = event_type;
        self
    }

    pub fn resource_version(mut self, rv: &str) -> Self {
        self.event.resource.resource_version = rv.into();
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.event
            .resource
            .labels
            .insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event.data = data;
        self
    }

    pub fn build(self) -> ChangeEvent {
        self.event
    }
}

/// A minimal valid Pod update event.
pub fn pod_event(uid: &str, rv: &str, timestamp_ns: i64) -> ChangeEvent {
    EventBuilder::new("Pod", "default", &format!("pod-{uid}"), uid)
        .event_type(EventType::Update)
        .resource_version(rv)
        .at(timestamp_ns)
        .data(serde_json::json!({ "status": { "phase": "Running" } }))
        .build()
}

/// A Pod manifest with one container in the given waiting state.
pub fn pod_manifest_waiting(reason: &str, message: &str, restart_count: u64) -> serde_json::Value {
    serde_json::json!({
        "status": {
            "phase": "Running",
            "containerStatuses": [{
                "name": "app",
                "restartCount": restart_count,
                "state": { "waiting": { "reason": reason, "message": message } },
            }],
        },
    })
}
