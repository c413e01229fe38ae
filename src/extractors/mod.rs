//! Relationship extraction.
//!
//! An extractor is a pure mapping from one change event to a set of typed
//! edge specifications. The registry runs every matching extractor in
//! priority order (native kinds first); the sync pipeline resolves the specs
//! into graph edges. Extractors are idempotent: re-running one on the same
//! event only refreshes `lastObservedAt` timestamps.

mod ingress;
mod network_policy;
mod ownership;
mod pod;
mod rbac;
mod service;
mod util;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use spectre_event::ChangeEvent;
use tracing::debug;

use crate::graph::{
    EdgeType, EventNode, GraphError, GraphStore, Params, QueryResult, ResourceNode,
};

pub use self::{
    ingress::IngressBackends, network_policy::NetworkPolicySelector, ownership::OwnershipChain,
    pod::PodRelationships, rbac::RbacBindings, service::ServiceSelector,
};

/// What to do when an edge's target is not present in the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DanglingPolicy {
    /// Best-effort relationship: drop the edge with a debug log.
    Drop,
    /// Materialise the edge with an empty `toUid`; the reconciler repairs it
    /// once the target appears.
    Materialise,
}

/// Reference to an edge endpoint, resolved by the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetRef {
    Uid(String),
    Named {
        kind: String,
        namespace: String,
        name: String,
    },
}

impl TargetRef {
    pub fn named(kind: &str, namespace: &str, name: &str) -> Self {
        TargetRef::Named {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// One edge produced by an extractor, before endpoint resolution.
#[derive(Clone, Debug)]
pub struct EdgeSpec {
    pub edge_type: EdgeType,
    /// `None` means the event's own resource.
    pub source: Option<TargetRef>,
    pub target: TargetRef,
    pub semantic_key: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub dangling: DanglingPolicy,
}

impl EdgeSpec {
    pub fn to_target(edge_type: EdgeType, target: TargetRef) -> Self {
        Self {
            edge_type,
            source: None,
            target,
            semantic_key: String::new(),
            properties: serde_json::Map::new(),
            dangling: DanglingPolicy::Drop,
        }
    }

    pub fn from_source(edge_type: EdgeType, source: TargetRef, target: TargetRef) -> Self {
        Self {
            source: Some(source),
            ..Self::to_target(edge_type, target)
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.semantic_key = key.into();
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn dangling(mut self, policy: DanglingPolicy) -> Self {
        self.dangling = policy;
        self
    }
}

/// Read access to the graph offered to extractors.
#[derive(Clone, Debug)]
pub struct Lookup {
    graph: Arc<dyn GraphStore>,
}

impl Lookup {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    pub async fn find_by_uid(&self, uid: &str) -> Result<Option<ResourceNode>, GraphError> {
        self.graph.get_resource(uid).await
    }

    pub async fn find_by_namespaced_name(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceNode>, GraphError> {
        self.graph.find_by_name(kind, namespace, name).await
    }

    pub async fn find_recent_events(
        &self,
        uid: &str,
        since_ns: i64,
    ) -> Result<Vec<EventNode>, GraphError> {
        self.graph.recent_events(uid, since_ns).await
    }

    pub async fn query(&self, query: &str, params: Params) -> Result<QueryResult, GraphError> {
        self.graph.execute(query, params).await
    }

    /// Live pods in `namespace` whose labels satisfy `selector` (exact-match
    /// semantics, the way label selectors on Services and NetworkPolicies
    /// behave).
    pub async fn pods_matching(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceNode>, GraphError> {
        let pods = self
            .graph
            .resources_by_kind("Pod", Some(namespace), None)
            .await?;
        Ok(pods
            .into_iter()
            .filter(|pod| !pod.deleted)
            .filter(|pod| {
                selector
                    .iter()
                    .all(|(k, v)| pod.labels.get(k).is_some_and(|have| have == v))
            })
            .collect())
    }
}

/// A registered relationship extractor.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower priorities run first; native-kind extractors sit below 100 so
    /// custom-resource extractors can see their output.
    fn priority(&self) -> u8 {
        50
    }

    fn matches(&self, event: &ChangeEvent) -> bool;

    async fn extract(
        &self,
        event: &ChangeEvent,
        lookup: &Lookup,
    ) -> Result<Vec<EdgeSpec>, GraphError>;
}

/// Build-time registry of `(matches, extract, priority)` records.
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.extractors.iter().map(|e| e.name()).collect();
        f.debug_struct("ExtractorRegistry")
            .field("extractors", &names)
            .finish()
    }
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Registry with every built-in extractor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OwnershipChain));
        registry.register(Arc::new(PodRelationships));
        registry.register(Arc::new(ServiceSelector));
        registry.register(Arc::new(IngressBackends));
        registry.register(Arc::new(NetworkPolicySelector));
        registry.register(Arc::new(RbacBindings));
        registry
    }

    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.extractors.push(extractor);
        self.extractors.sort_by_key(|e| e.priority());
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Extractors matching `event`, in priority order.
    pub fn matching(&self, event: &ChangeEvent) -> Vec<Arc<dyn Extractor>> {
        let matching: Vec<Arc<dyn Extractor>> = self
            .extractors
            .iter()
            .filter(|e| e.matches(event))
            .cloned()
            .collect();
        debug!(
            event_id = event.id,
            kind = %event.resource.kind,
            extractors = matching.len(),
            "matched extractors"
        );
        matching
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
