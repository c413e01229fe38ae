//! Temporal causality inference.
//!
//! The engine keeps a sliding window of recent events. For each ordered pair
//! `(cause, effect)` with `effect.ts > cause.ts` inside the window, the first
//! matching heuristic from the table wins; a `CAUSES` link is emitted when
//! its confidence clears the configured minimum.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use spectre_event::{ChangeEvent, EventType};

use crate::graph::EventNode;

/// One inferred causal relationship between two change events.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalLink {
    pub cause_event_id: String,
    pub effect_event_id: String,
    pub heuristic: &'static str,
    pub confidence: f64,
    pub lag_ms: i64,
}

/// Slimmed view of an event kept in the sliding window.
#[derive(Clone, Debug)]
struct WindowEntry {
    event_id: String,
    uid: String,
    kind: String,
    namespace: String,
    name: String,
    event_type: EventType,
    timestamp_ns: i64,
}

impl WindowEntry {
    fn from_event(event: &ChangeEvent) -> Self {
        Self {
            event_id: EventNode::event_id_for(
                &event.resource.uid,
                &event.resource.resource_version,
            ),
            uid: event.resource.uid.clone(),
            kind: event.resource.kind.clone(),
            namespace: event.resource.namespace.clone(),
            name: event.resource.name.clone(),
            event_type: event.event_type,
            timestamp_ns: event.timestamp_ns,
        }
    }
}

struct Heuristic {
    name: &'static str,
    max_lag: Duration,
    confidence: f64,
    matches: fn(&WindowEntry, &WindowEntry) -> bool,
}

const MIN_TRANSITION_LAG_NS: i64 = 100_000_000; // 100ms

fn same_namespace(cause: &WindowEntry, effect: &WindowEntry) -> bool {
    cause.namespace == effect.namespace
}

/// The heuristic table, in evaluation order.
static HEURISTICS: &[Heuristic] = &[
    Heuristic {
        name: "deployment-rollout",
        max_lag: Duration::from_secs(300),
        confidence: 0.90,
        matches: |cause, effect| {
            cause.kind == "Deployment"
                && cause.event_type == EventType::Update
                && effect.kind == "Pod"
                && matches!(effect.event_type, EventType::Create | EventType::Delete)
                && same_namespace(cause, effect)
        },
    },
    Heuristic {
        name: "deployment-replicaset",
        max_lag: Duration::from_secs(60),
        confidence: 0.90,
        matches: |cause, effect| {
            cause.kind == "Deployment"
                && cause.event_type == EventType::Update
                && effect.kind == "ReplicaSet"
                && matches!(effect.event_type, EventType::Create | EventType::Update)
                && same_namespace(cause, effect)
        },
    },
    Heuristic {
        name: "replicaset-scaling",
        max_lag: Duration::from_secs(60),
        confidence: 0.85,
        matches: |cause, effect| {
            cause.kind == "ReplicaSet"
                && cause.event_type == EventType::Update
                && effect.kind == "Pod"
                && same_namespace(cause, effect)
        },
    },
    Heuristic {
        name: "node-pressure-eviction",
        max_lag: Duration::from_secs(180),
        confidence: 0.70,
        matches: |cause, effect| {
            cause.kind == "Node"
                && cause.event_type == EventType::Update
                && effect.kind == "Pod"
                && effect.event_type == EventType::Delete
        },
    },
    Heuristic {
        name: "config-change-restart",
        max_lag: Duration::from_secs(120),
        confidence: 0.75,
        matches: |cause, effect| {
            matches!(cause.kind.as_str(), "ConfigMap" | "Secret")
                && cause.event_type == EventType::Update
                && effect.kind == "Pod"
                && matches!(effect.event_type, EventType::Update | EventType::Delete)
                && same_namespace(cause, effect)
        },
    },
    Heuristic {
        name: "pvc-pending",
        max_lag: Duration::from_secs(300),
        confidence: 0.80,
        matches: |cause, effect| {
            cause.kind == "PersistentVolumeClaim"
                && effect.kind == "Pod"
                && effect.event_type == EventType::Update
                && same_namespace(cause, effect)
        },
    },
    Heuristic {
        name: "same-resource-transition",
        max_lag: Duration::from_secs(600),
        confidence: 0.95,
        matches: |cause, effect| {
            cause.uid == effect.uid
                && cause.event_type == EventType::Update
                && effect.event_type == EventType::Update
                && effect.timestamp_ns - cause.timestamp_ns >= MIN_TRANSITION_LAG_NS
        },
    },
    Heuristic {
        name: "error-propagation",
        max_lag: Duration::from_secs(60),
        confidence: 0.65,
        matches: |cause, effect| {
            cause.event_type == EventType::Update
                && effect.event_type == EventType::Update
                && !cause.namespace.is_empty()
                && same_namespace(cause, effect)
        },
    },
    Heuristic {
        name: "namespace-cascade-delete",
        max_lag: Duration::from_secs(120),
        confidence: 0.95,
        matches: |cause, effect| {
            cause.kind == "Namespace"
                && cause.event_type == EventType::Delete
                && effect.event_type == EventType::Delete
                && effect.namespace == cause.name
        },
    },
];

/// Configuration for the causality engine.
#[derive(Clone, Copy, Debug)]
pub struct CausalityConfig {
    /// Oldest event retained as a potential cause.
    pub window: Duration,
    /// Minimum heuristic confidence for a link to be emitted.
    pub min_confidence: f64,
}

impl Default for CausalityConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            min_confidence: 0.6,
        }
    }
}

#[derive(Debug)]
pub struct CausalityEngine {
    config: CausalityConfig,
    window: VecDeque<WindowEntry>,
}

impl CausalityEngine {
    pub fn new(config: CausalityConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
        }
    }

    /// Feeds one event through the engine, returning the causal links it
    /// completes as the effect. Links are ordered by confidence, then by
    /// smaller lag.
    pub fn observe(&mut self, event: &ChangeEvent) -> Vec<CausalLink> {
        let effect = WindowEntry::from_event(event);
        let window_ns = self.config.window.as_nanos() as i64;

        while let Some(front) = self.window.front() {
            if front.timestamp_ns < effect.timestamp_ns - window_ns {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let mut links = Vec::new();
        for cause in &self.window {
            if effect.timestamp_ns <= cause.timestamp_ns || cause.event_id == effect.event_id {
                continue;
            }
            let lag_ns = effect.timestamp_ns - cause.timestamp_ns;

            for heuristic in HEURISTICS {
                if lag_ns > heuristic.max_lag.as_nanos() as i64 {
                    continue;
                }
                if !(heuristic.matches)(cause, &effect) {
                    continue;
                }
                // First match wins for this pair.
                if heuristic.confidence >= self.config.min_confidence {
                    links.push(CausalLink {
                        cause_event_id: cause.event_id.clone(),
                        effect_event_id: effect.event_id.clone(),
                        heuristic: heuristic.name,
                        confidence: heuristic.confidence,
                        lag_ms: lag_ns / 1_000_000,
                    });
                }
                break;
            }
        }

        links.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.lag_ms.cmp(&b.lag_ms))
        });

        self.window.push_back(effect);
        links
    }
}
