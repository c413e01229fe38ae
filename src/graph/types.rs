use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use spectre_event::EventType;

/// Directed, typed relationships between graph nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    // Structural.
    Owns,
    Manages,
    ScheduledOn,
    Selects,
    ReferencesSpec,
    Mounts,
    UsesServiceAccount,
    BindsRole,
    GrantsTo,
    // Temporal/causal.
    Precedes,
    Causes,
    TriggeredBy,
    ObservedOn,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Owns => "OWNS",
            EdgeType::Manages => "MANAGES",
            EdgeType::ScheduledOn => "SCHEDULED_ON",
            EdgeType::Selects => "SELECTS",
            EdgeType::ReferencesSpec => "REFERENCES_SPEC",
            EdgeType::Mounts => "MOUNTS",
            EdgeType::UsesServiceAccount => "USES_SERVICE_ACCOUNT",
            EdgeType::BindsRole => "BINDS_ROLE",
            EdgeType::GrantsTo => "GRANTS_TO",
            EdgeType::Precedes => "PRECEDES",
            EdgeType::Causes => "CAUSES",
            EdgeType::TriggeredBy => "TRIGGERED_BY",
            EdgeType::ObservedOn => "OBSERVED_ON",
        }
    }

    /// Whether this edge carries causal semantics (vs. structure).
    pub fn is_causal(&self) -> bool {
        matches!(self, EdgeType::Causes | EdgeType::TriggeredBy)
    }
}

/// One live-or-recently-live Kubernetes object, keyed by uid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNode {
    pub uid: String,
    pub kind: String,
    pub group: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub deleted: bool,
    pub first_seen_ns: i64,
    pub last_seen_ns: i64,
}

/// A first-class graph node for one change event, linked to its resource by
/// `OBSERVED_ON`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNode {
    /// `"<uid>:<resourceVersion>"`, unique per observation.
    pub event_id: String,
    pub resource_uid: String,
    pub timestamp_ns: i64,
    pub event_type: EventType,
    /// Summarised diff against the previous observation.
    pub summary: String,
    /// Error/warning messages inferred from the manifest.
    #[serde(default)]
    pub messages: Vec<String>,
}

impl EventNode {
    pub fn event_id_for(uid: &str, resource_version: &str) -> String {
        format!("{uid}:{resource_version}")
    }
}

/// One directed edge. At most one active edge exists per
/// `(edge_type, from, to, semantic_key)`; re-observation refreshes
/// `last_observed_at_ns`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub edge_type: EdgeType,
    pub from_uid: String,
    /// Empty for a dangling edge whose target has not been seen yet.
    pub to_uid: String,
    /// Distinguishes parallel edges of the same type, e.g. two volume mounts
    /// of different ConfigMap keys.
    #[serde(default)]
    pub semantic_key: String,
    pub observed_at_ns: i64,
    pub last_observed_at_ns: i64,
    pub stale: bool,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EdgeRecord {
    pub fn new(edge_type: EdgeType, from_uid: impl Into<String>, to_uid: impl Into<String>) -> Self {
        Self {
            edge_type,
            from_uid: from_uid.into(),
            to_uid: to_uid.into(),
            semantic_key: String::new(),
            observed_at_ns: 0,
            last_observed_at_ns: 0,
            stale: false,
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.semantic_key = key.into();
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn observed_at(mut self, at_ns: i64) -> Self {
        self.observed_at_ns = at_ns;
        self.last_observed_at_ns = at_ns;
        self
    }

    /// Identity under the single-active-edge invariant.
    pub fn identity(&self) -> (EdgeType, String, String, String) {
        (
            self.edge_type,
            self.from_uid.clone(),
            self.to_uid.clone(),
            self.semantic_key.clone(),
        )
    }

    pub fn is_dangling(&self) -> bool {
        self.to_uid.is_empty()
    }
}

/// Mutation counters reported by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationStats {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub properties_set: u64,
}

/// Result of a raw parameterised query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Value>,
    pub stats: MutationStats,
}
