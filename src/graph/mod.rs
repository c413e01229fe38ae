//! The property-graph contract and its backends.
//!
//! Everything above this module speaks [`GraphStore`]: the sync pipeline to
//! upsert nodes and edges, the extractor framework for lookups, analysis for
//! traversal. `Neo4jStore` talks Bolt/Cypher to an external store,
//! `MemoryStore` is a process-local backend used by tests and development
//! servers, and `CachedStore` decorates either with an LRU read cache.

mod cache;
mod memory;
mod neo4j;
mod types;

use async_trait::async_trait;
use snafu::Snafu;

pub use self::{
    cache::CachedStore,
    memory::MemoryStore,
    neo4j::{Neo4jConfig, Neo4jStore},
    types::{EdgeRecord, EdgeType, EventNode, MutationStats, QueryResult, ResourceNode},
};

#[derive(Debug, Snafu)]
pub enum GraphError {
    #[snafu(display("graph connection failed: {message}"))]
    Connection { message: String },

    #[snafu(display("graph query failed: {message}"))]
    Query { message: String },

    #[snafu(display("graph backend does not support {operation}"))]
    Unsupported { operation: &'static str },
}

/// Parameters for a raw parameterised query.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// The property-graph store contract.
///
/// Implementations must be safe for concurrent use: the pipeline workers,
/// the reconciler, and request handlers all share one store. Edge upserts are
/// idempotent; re-observing an edge refreshes `last_observed_at` instead of
/// duplicating it.
#[async_trait]
pub trait GraphStore: Send + Sync + std::fmt::Debug {
    async fn ping(&self) -> Result<(), GraphError>;

    /// Raw parameterised query escape hatch (a Cypher-like dialect).
    async fn execute(&self, query: &str, params: Params) -> Result<QueryResult, GraphError>;

    /// Creates or updates a resource node keyed by uid. `first_seen` is kept
    /// from the existing node when it is earlier.
    async fn upsert_resource(&self, node: &ResourceNode) -> Result<(), GraphError>;

    /// Tombstones a resource node. The node is retained (with its edges
    /// marked stale) until retention prunes it.
    async fn mark_deleted(&self, uid: &str, at_ns: i64) -> Result<(), GraphError>;

    async fn get_resource(&self, uid: &str) -> Result<Option<ResourceNode>, GraphError>;

    /// Alternate-key lookup. May return the latest of several nodes that
    /// carried this `(kind, namespace, name)` across delete/recreate cycles.
    async fn find_by_name(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceNode>, GraphError>;

    /// All resource nodes of a kind, optionally restricted by namespace and
    /// exact name.
    async fn resources_by_kind(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<ResourceNode>, GraphError>;

    async fn all_resources(&self) -> Result<Vec<ResourceNode>, GraphError>;

    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), GraphError>;

    async fn edges_from(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError>;

    async fn edges_to(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError>;

    /// Marks edges out of `from_uid` stale when their `last_observed_at` is
    /// older than `older_than_ns`. Returns how many were marked.
    async fn mark_edges_stale(&self, from_uid: &str, older_than_ns: i64)
    -> Result<usize, GraphError>;

    /// Removes stale edges not re-observed since `older_than_ns`. Returns how
    /// many were pruned.
    async fn prune_stale_edges(&self, older_than_ns: i64) -> Result<usize, GraphError>;

    /// Edges whose target has not been seen yet (`toUid` empty); the
    /// reconciler repairs them.
    async fn dangling_edges(&self) -> Result<Vec<EdgeRecord>, GraphError>;

    /// Inserts a change-event node and its `OBSERVED_ON` edge.
    async fn insert_event(&self, event: &EventNode) -> Result<(), GraphError>;

    async fn recent_events(&self, uid: &str, since_ns: i64) -> Result<Vec<EventNode>, GraphError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<EventNode>, GraphError>;

    /// Deletes a resource node, its events, and every edge touching them.
    async fn delete_subgraph(&self, uid: &str) -> Result<(), GraphError>;
}
