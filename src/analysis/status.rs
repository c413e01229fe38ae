//! Status-segment reconstruction.
//!
//! Events carry the full manifest, so the status at each observation can be
//! derived from the kind's status schema. Adjacent segments with equal
//! `(status, message)` are merged.

use serde::Serialize;
use serde_json::Value;
use spectre_event::{ChangeEvent, EventType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ResourceStatus {
    Ready,
    Running,
    Warning,
    Error,
    Terminating,
    Unknown,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Ready => "Ready",
            ResourceStatus::Running => "Running",
            ResourceStatus::Warning => "Warning",
            ResourceStatus::Error => "Error",
            ResourceStatus::Terminating => "Terminating",
            ResourceStatus::Unknown => "Unknown",
        }
    }
}

/// One contiguous span of an unchanged `(status, message)` pair.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSegment {
    pub start_ns: i64,
    pub end_ns: i64,
    pub status: ResourceStatus,
    pub message: String,
}

/// Derives `(status, message)` from one observation.
pub fn derive_status(
    kind: &str,
    event_type: EventType,
    manifest: &Value,
) -> (ResourceStatus, String) {
    if event_type == EventType::Delete {
        return (ResourceStatus::Terminating, String::new());
    }

    match kind {
        "Pod" => pod_status(manifest),
        "Deployment" | "StatefulSet" => workload_status(manifest),
        "DaemonSet" => daemonset_status(manifest),
        "Node" => node_status(manifest),
        // Passive resources are ready by existing.
        "ConfigMap" | "Secret" | "ServiceAccount" | "Service" | "Role" | "ClusterRole"
        | "RoleBinding" | "ClusterRoleBinding" | "Namespace" => {
            (ResourceStatus::Ready, String::new())
        }
        _ => generic_status(manifest),
    }
}

fn pod_status(manifest: &Value) -> (ResourceStatus, String) {
    // Failing container states outrank the phase.
    for status in manifest
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        if let Some(reason) = status
            .pointer("/state/waiting/reason")
            .and_then(Value::as_str)
        {
            match reason {
                "CrashLoopBackOff" | "ImagePullBackOff" | "ErrImagePull"
                | "CreateContainerConfigError" | "CreateContainerError" => {
                    return (ResourceStatus::Error, reason.to_string());
                }
                "ContainerCreating" | "PodInitializing" => {
                    return (ResourceStatus::Warning, reason.to_string());
                }
                _ => {}
            }
        }
    }

    match manifest.pointer("/status/phase").and_then(Value::as_str) {
        Some("Running") => {
            let all_ready = manifest
                .pointer("/status/containerStatuses")
                .and_then(Value::as_array)
                .is_none_or(|statuses| {
                    statuses
                        .iter()
                        .all(|s| s.get("ready").and_then(Value::as_bool).unwrap_or(false))
                });
            if all_ready {
                (ResourceStatus::Running, String::new())
            } else {
                (ResourceStatus::Warning, "containers not ready".to_string())
            }
        }
        Some("Pending") => (ResourceStatus::Warning, "Pending".to_string()),
        Some("Succeeded") => (ResourceStatus::Ready, "Completed".to_string()),
        Some("Failed") => (ResourceStatus::Error, "Failed".to_string()),
        _ => (ResourceStatus::Unknown, String::new()),
    }
}

fn workload_status(manifest: &Value) -> (ResourceStatus, String) {
    let desired = manifest
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = manifest
        .pointer("/status/readyReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if desired == 0 || ready >= desired {
        (ResourceStatus::Ready, String::new())
    } else if ready > 0 {
        (
            ResourceStatus::Warning,
            format!("{ready}/{desired} replicas ready"),
        )
    } else {
        (
            ResourceStatus::Error,
            format!("0/{desired} replicas ready"),
        )
    }
}

fn daemonset_status(manifest: &Value) -> (ResourceStatus, String) {
    let desired = manifest
        .pointer("/status/desiredNumberScheduled")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let ready = manifest
        .pointer("/status/numberReady")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if ready >= desired {
        (ResourceStatus::Ready, String::new())
    } else if ready > 0 {
        (
            ResourceStatus::Warning,
            format!("{ready}/{desired} pods ready"),
        )
    } else {
        (ResourceStatus::Error, format!("0/{desired} pods ready"))
    }
}

fn node_status(manifest: &Value) -> (ResourceStatus, String) {
    let conditions = manifest
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for condition in conditions {
        let condition_type = condition.get("type").and_then(Value::as_str).unwrap_or("");
        let status = condition.get("status").and_then(Value::as_str);
        match condition_type {
            "Ready" if status == Some("False") => {
                return (ResourceStatus::Error, "NotReady".to_string());
            }
            "MemoryPressure" | "DiskPressure" | "PIDPressure" if status == Some("True") => {
                return (ResourceStatus::Warning, condition_type.to_string());
            }
            _ => {}
        }
    }

    let ready = conditions.iter().any(|c| {
        c.get("type").and_then(Value::as_str) == Some("Ready")
            && c.get("status").and_then(Value::as_str) == Some("True")
    });
    if ready {
        (ResourceStatus::Ready, String::new())
    } else {
        (ResourceStatus::Unknown, String::new())
    }
}

fn generic_status(manifest: &Value) -> (ResourceStatus, String) {
    // Custom resources commonly expose a Ready condition.
    let conditions = manifest
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for condition in conditions {
        if condition.get("type").and_then(Value::as_str) == Some("Ready") {
            return match condition.get("status").and_then(Value::as_str) {
                Some("True") => (ResourceStatus::Ready, String::new()),
                Some("False") => {
                    let message = condition
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("not ready");
                    (ResourceStatus::Error, message.to_string())
                }
                _ => (ResourceStatus::Unknown, String::new()),
            };
        }
    }
    (ResourceStatus::Unknown, String::new())
}

/// Builds the chronologically ordered, deduplicated segment list for one
/// resource's events.
pub fn build_segments(events: &[ChangeEvent]) -> Vec<StatusSegment> {
    let mut segments: Vec<StatusSegment> = Vec::new();

    for event in events {
        let (status, message) = derive_status(&event.resource.kind, event.event_type, &event.data);
        match segments.last_mut() {
            Some(last) if last.status == status && last.message == message => {
                last.end_ns = event.timestamp_ns;
            }
            _ => segments.push(StatusSegment {
                start_ns: event.timestamp_ns,
                end_ns: event.timestamp_ns,
                status,
                message,
            }),
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use crate::test_util::{BASE_TS, EventBuilder, SEC, pod_manifest_waiting};

    use super::*;

    #[test]
    fn five_equal_error_statuses_merge_into_one_segment() {
        let events: Vec<_> = (0..5)
            .map(|i| {
                EventBuilder::new("Pod", "default", "web", "pod-1")
                    .event_type(EventType::Update)
                    .resource_version(&(i + 1).to_string())
                    .at(BASE_TS + i as i64 * 10 * SEC)
                    .data(pod_manifest_waiting("CrashLoopBackOff", "", 3))
                    .build()
            })
            .collect();

        let segments = build_segments(&events);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_ns, BASE_TS);
        assert_eq!(segments[0].end_ns, BASE_TS + 40 * SEC);
        assert_eq!(segments[0].status, ResourceStatus::Error);
        assert_eq!(segments[0].message, "CrashLoopBackOff");
    }

    #[test]
    fn no_two_adjacent_segments_are_equal() {
        let running = serde_json::json!({ "status": { "phase": "Running" } });
        let sequence = [
            pod_manifest_waiting("CrashLoopBackOff", "", 1),
            running.clone(),
            running.clone(),
            pod_manifest_waiting("CrashLoopBackOff", "", 2),
            pod_manifest_waiting("CrashLoopBackOff", "", 3),
        ];
        let events: Vec<_> = sequence
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                EventBuilder::new("Pod", "default", "web", "pod-1")
                    .event_type(EventType::Update)
                    .resource_version(&(i + 1).to_string())
                    .at(BASE_TS + i as i64 * SEC)
                    .data(data)
                    .build()
            })
            .collect();

        let segments = build_segments(&events);
        assert_eq!(segments.len(), 3);
        for pair in segments.windows(2) {
            assert!(
                (pair[0].status, &pair[0].message) != (pair[1].status, &pair[1].message),
                "adjacent segments must differ"
            );
        }
    }

    #[test]
    fn delete_events_terminate_the_timeline() {
        let (status, _) = derive_status("Pod", EventType::Delete, &serde_json::Value::Null);
        assert_eq!(status, ResourceStatus::Terminating);
    }

    #[test]
    fn deployment_status_follows_replica_counts() {
        let manifest = serde_json::json!({
            "spec": { "replicas": 3 },
            "status": { "readyReplicas": 3 },
        });
        assert_eq!(
            derive_status("Deployment", EventType::Update, &manifest).0,
            ResourceStatus::Ready
        );

        let degraded = serde_json::json!({
            "spec": { "replicas": 3 },
            "status": { "readyReplicas": 1 },
        });
        let (status, message) = derive_status("Deployment", EventType::Update, &degraded);
        assert_eq!(status, ResourceStatus::Warning);
        assert_eq!(message, "1/3 replicas ready");
    }
}
