//! Anomaly classifiers.
//!
//! Each classifier inspects the chronologically ordered events of one
//! resource within a window and produces zero or more anomalies. Anomalies
//! are derived, never stored: they are recomputed on demand.

use serde::Serialize;
use serde_json::Value;
use spectre_event::{ChangeEvent, EventType};

const PENDING_THRESHOLD_NS: i64 = 2 * 60 * 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AnomalyCategory {
    Event,
    State,
    Change,
}

/// One detected anomaly on a resource.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub severity: Severity,
    pub category: AnomalyCategory,
    pub uid: String,
    pub timestamp_ns: i64,
    pub summary: String,
    pub details: serde_json::Map<String, Value>,
}

/// Whether an anomaly can plausibly start a causal chain (vs. merely being
/// a downstream symptom). Used by the root-cause ranker.
pub fn is_cause_introducing(anomaly: &Anomaly) -> bool {
    matches!(
        anomaly.anomaly_type.as_str(),
        "config-change" | "spec-change" | "image-change" | "pvc-binding-failed" | "node-pressure"
    )
}

pub trait AnomalyClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `events` are all observations of one resource, ordered by timestamp.
    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly>;
}

fn container_statuses(manifest: &Value) -> &[Value] {
    manifest
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn waiting_reason(status: &Value) -> Option<&str> {
    status
        .pointer("/state/waiting/reason")
        .and_then(Value::as_str)
}

fn anomaly(
    event: &ChangeEvent,
    anomaly_type: &str,
    severity: Severity,
    category: AnomalyCategory,
    summary: String,
) -> Anomaly {
    Anomaly {
        anomaly_type: anomaly_type.to_string(),
        severity,
        category,
        uid: event.resource.uid.clone(),
        timestamp_ns: event.timestamp_ns,
        summary,
        details: serde_json::Map::new(),
    }
}

/// `CrashLoopBackOff` with a monotonically increasing restart count.
pub struct CrashLoop;

impl AnomalyClassifier for CrashLoop {
    fn name(&self) -> &'static str {
        "crash-loop"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        let mut last_restarts: i64 = -1;
        let mut increasing = false;
        let mut latest: Option<&ChangeEvent> = None;

        for event in events {
            for status in container_statuses(&event.data) {
                if waiting_reason(status) == Some("CrashLoopBackOff") {
                    let restarts = status
                        .get("restartCount")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    if restarts > last_restarts && last_restarts >= 0 {
                        increasing = true;
                    }
                    last_restarts = last_restarts.max(restarts);
                    latest = Some(event);
                }
            }
        }

        match latest {
            Some(event) if increasing || last_restarts > 0 => {
                let mut a = anomaly(
                    event,
                    "crash-loop",
                    Severity::High,
                    AnomalyCategory::State,
                    format!(
                        "container is in CrashLoopBackOff with {last_restarts} restarts"
                    ),
                );
                a.details.insert("restartCount".into(), last_restarts.into());
                vec![a]
            }
            _ => Vec::new(),
        }
    }
}

/// `ImagePullBackOff` / `ErrImagePull`.
pub struct ImagePullBackOff;

impl AnomalyClassifier for ImagePullBackOff {
    fn name(&self) -> &'static str {
        "image-pull-backoff"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        for event in events.iter().rev() {
            for status in container_statuses(&event.data) {
                let reason = waiting_reason(status);
                if matches!(reason, Some("ImagePullBackOff") | Some("ErrImagePull")) {
                    let image = status.get("image").and_then(Value::as_str).unwrap_or("");
                    let message = status
                        .pointer("/state/waiting/message")
                        .and_then(Value::as_str)
                        .unwrap_or("failed to pull image");
                    let mut a = anomaly(
                        event,
                        "image-pull-backoff",
                        Severity::High,
                        AnomalyCategory::State,
                        format!("failed to pull image {image}: {message}"),
                    );
                    a.details.insert("image".into(), image.into());
                    return vec![a];
                }
            }
        }
        Vec::new()
    }
}

/// Container terminated with `OOMKilled`.
pub struct OomKilled;

impl AnomalyClassifier for OomKilled {
    fn name(&self) -> &'static str {
        "oom-killed"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        for event in events.iter().rev() {
            for status in container_statuses(&event.data) {
                if status
                    .pointer("/lastState/terminated/reason")
                    .and_then(Value::as_str)
                    == Some("OOMKilled")
                {
                    let name = status.get("name").and_then(Value::as_str).unwrap_or("");
                    return vec![anomaly(
                        event,
                        "oom-killed",
                        Severity::High,
                        AnomalyCategory::State,
                        format!("container {name} was OOM killed"),
                    )];
                }
            }
        }
        Vec::new()
    }
}

/// Pod pending for more than two minutes with `PodScheduled=False`.
pub struct FailedScheduling;

impl AnomalyClassifier for FailedScheduling {
    fn name(&self) -> &'static str {
        "failed-scheduling"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        let mut first_pending: Option<i64> = None;
        let mut latest: Option<(&ChangeEvent, String)> = None;

        for event in events {
            let phase = event
                .data
                .pointer("/status/phase")
                .and_then(Value::as_str);
            let unschedulable = event
                .data
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .is_some_and(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(Value::as_str) == Some("PodScheduled")
                            && c.get("status").and_then(Value::as_str) == Some("False")
                    })
                });

            if phase == Some("Pending") && unschedulable {
                first_pending.get_or_insert(event.timestamp_ns);
                let message = event
                    .data
                    .pointer("/status/conditions")
                    .and_then(Value::as_array)
                    .and_then(|conditions| {
                        conditions.iter().find_map(|c| {
                            (c.get("type").and_then(Value::as_str) == Some("PodScheduled"))
                                .then(|| c.get("message").and_then(Value::as_str))
                                .flatten()
                        })
                    })
                    .unwrap_or("pod cannot be scheduled")
                    .to_string();
                latest = Some((event, message));
            } else {
                first_pending = None;
                latest = None;
            }
        }

        match (first_pending, latest) {
            (Some(first), Some((event, message)))
                if event.timestamp_ns - first >= PENDING_THRESHOLD_NS =>
            {
                vec![anomaly(
                    event,
                    "failed-scheduling",
                    Severity::Medium,
                    AnomalyCategory::State,
                    format!("pod pending for over two minutes: {message}"),
                )]
            }
            _ => Vec::new(),
        }
    }
}

/// Workload ready replicas below desired.
pub struct InsufficientReplicas;

impl AnomalyClassifier for InsufficientReplicas {
    fn name(&self) -> &'static str {
        "insufficient-replicas"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        for event in events.iter().rev() {
            if !matches!(
                event.resource.kind.as_str(),
                "Deployment" | "StatefulSet" | "DaemonSet"
            ) {
                continue;
            }
            let desired = if event.resource.kind == "DaemonSet" {
                event
                    .data
                    .pointer("/status/desiredNumberScheduled")
                    .and_then(Value::as_i64)
            } else {
                event.data.pointer("/spec/replicas").and_then(Value::as_i64)
            };
            let ready = if event.resource.kind == "DaemonSet" {
                event
                    .data
                    .pointer("/status/numberReady")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
            } else {
                event
                    .data
                    .pointer("/status/readyReplicas")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
            };

            if let Some(desired) = desired
                && desired > 0
                && ready < desired
            {
                let mut a = anomaly(
                    event,
                    "insufficient-replicas",
                    Severity::Medium,
                    AnomalyCategory::State,
                    format!("{ready}/{desired} replicas ready"),
                );
                a.details.insert("desired".into(), desired.into());
                a.details.insert("ready".into(), ready.into());
                return vec![a];
            }
            return Vec::new();
        }
        Vec::new()
    }
}

/// Node under memory/disk/PID pressure or not ready.
pub struct NodePressure;

impl AnomalyClassifier for NodePressure {
    fn name(&self) -> &'static str {
        "node-pressure"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        for event in events.iter().rev() {
            if event.resource.kind != "Node" {
                return Vec::new();
            }
            let conditions = event
                .data
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for condition in conditions {
                let condition_type = condition.get("type").and_then(Value::as_str).unwrap_or("");
                let status = condition.get("status").and_then(Value::as_str);
                let firing = match condition_type {
                    "MemoryPressure" | "DiskPressure" | "PIDPressure" => status == Some("True"),
                    "Ready" => status == Some("False"),
                    _ => false,
                };
                if firing {
                    return vec![anomaly(
                        event,
                        "node-pressure",
                        Severity::High,
                        AnomalyCategory::State,
                        format!("node condition {condition_type} is firing"),
                    )];
                }
            }
            return Vec::new();
        }
        Vec::new()
    }
}

/// Material spec difference between consecutive snapshots. Container image
/// changes are singled out since they are the most common rollout trigger.
pub struct SpecChange;

impl SpecChange {
    fn images(manifest: &Value) -> Vec<String> {
        let mut images = Vec::new();
        for pointer in [
            "/spec/containers",
            "/spec/template/spec/containers",
            "/spec/jobTemplate/spec/template/spec/containers",
        ] {
            for container in manifest
                .pointer(pointer)
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                if let Some(image) = container.get("image").and_then(Value::as_str) {
                    images.push(image.to_string());
                }
            }
        }
        images
    }
}

impl AnomalyClassifier for SpecChange {
    fn name(&self) -> &'static str {
        "spec-change"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for pair in events.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            if current.event_type != EventType::Update {
                continue;
            }
            let (prev_spec, curr_spec) = (previous.data.get("spec"), current.data.get("spec"));
            if prev_spec == curr_spec {
                continue;
            }

            let prev_images = Self::images(&previous.data);
            let curr_images = Self::images(&current.data);
            if prev_images != curr_images && !curr_images.is_empty() {
                let mut a = anomaly(
                    current,
                    "image-change",
                    Severity::Medium,
                    AnomalyCategory::Change,
                    format!(
                        "container image changed from {} to {}",
                        prev_images.join(", "),
                        curr_images.join(", ")
                    ),
                );
                a.details
                    .insert("previousImages".into(), prev_images.into());
                a.details.insert("currentImages".into(), curr_images.into());
                anomalies.push(a);
            } else {
                anomalies.push(anomaly(
                    current,
                    "spec-change",
                    Severity::Low,
                    AnomalyCategory::Change,
                    format!("{} spec was modified", current.resource.kind),
                ));
            }
        }

        anomalies
    }
}

/// ConfigMap/Secret content modification.
pub struct ConfigChange;

impl AnomalyClassifier for ConfigChange {
    fn name(&self) -> &'static str {
        "config-change"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        for event in events {
            if matches!(event.resource.kind.as_str(), "ConfigMap" | "Secret")
                && event.event_type == EventType::Update
            {
                anomalies.push(anomaly(
                    event,
                    "config-change",
                    Severity::Low,
                    AnomalyCategory::Change,
                    format!(
                        "{} {} was modified",
                        event.resource.kind, event.resource.name
                    ),
                ));
            }
        }
        anomalies
    }
}

/// PVC stuck unbound.
pub struct PvcBindingFailed;

impl AnomalyClassifier for PvcBindingFailed {
    fn name(&self) -> &'static str {
        "pvc-binding-failed"
    }

    fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        for event in events.iter().rev() {
            if event.resource.kind != "PersistentVolumeClaim" {
                return Vec::new();
            }
            if event.data.pointer("/status/phase").and_then(Value::as_str) == Some("Pending") {
                return vec![anomaly(
                    event,
                    "pvc-binding-failed",
                    Severity::Medium,
                    AnomalyCategory::State,
                    format!("claim {} is not bound", event.resource.name),
                )];
            }
            return Vec::new();
        }
        Vec::new()
    }
}

/// The full battery, run over a `(resource, window)` pair.
pub struct ClassifierBattery {
    classifiers: Vec<Box<dyn AnomalyClassifier>>,
}

impl std::fmt::Debug for ClassifierBattery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.classifiers.iter().map(|c| c.name()).collect();
        f.debug_struct("ClassifierBattery")
            .field("classifiers", &names)
            .finish()
    }
}

impl Default for ClassifierBattery {
    fn default() -> Self {
        Self {
            classifiers: vec![
                Box::new(CrashLoop),
                Box::new(ImagePullBackOff),
                Box::new(OomKilled),
                Box::new(FailedScheduling),
                Box::new(InsufficientReplicas),
                Box::new(NodePressure),
                Box::new(SpecChange),
                Box::new(ConfigChange),
                Box::new(PvcBindingFailed),
            ],
        }
    }
}

impl ClassifierBattery {
    pub fn classify(&self, events: &[ChangeEvent]) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = self
            .classifiers
            .iter()
            .flat_map(|c| c.classify(events))
            .collect();
        anomalies.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.timestamp_ns.cmp(&b.timestamp_ns))
                .then(a.anomaly_type.cmp(&b.anomaly_type))
        });
        anomalies
    }
}
