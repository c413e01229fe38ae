//! Process-local graph backend.
//!
//! Used by tests and by development servers running without an external
//! graph database. Semantics match the Bolt backend: uid-keyed nodes,
//! single-active-edge identity, tombstoned deletes.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{
    EdgeRecord, EdgeType, EventNode, GraphError, GraphStore, Params, QueryResult, ResourceNode,
};

type EdgeIdentity = (EdgeType, String, String, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    resources: RwLock<HashMap<String, ResourceNode>>,
    edges: RwLock<HashMap<EdgeIdentity, EdgeRecord>>,
    events: RwLock<HashMap<String, EventNode>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_poisoned() -> GraphError {
        GraphError::Query {
            message: "memory store lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn ping(&self) -> Result<(), GraphError> {
        Ok(())
    }

    async fn execute(&self, _query: &str, _params: Params) -> Result<QueryResult, GraphError> {
        Err(GraphError::Unsupported {
            operation: "raw queries on the memory backend",
        })
    }

    async fn upsert_resource(&self, node: &ResourceNode) -> Result<(), GraphError> {
        let mut resources = self.resources.write().map_err(|_| Self::lock_poisoned())?;
        match resources.get_mut(&node.uid) {
            Some(existing) => {
                let first_seen_ns = existing.first_seen_ns.min(node.first_seen_ns);
                *existing = node.clone();
                existing.first_seen_ns = first_seen_ns;
            }
            None => {
                resources.insert(node.uid.clone(), node.clone());
            }
        }
        Ok(())
    }

    async fn mark_deleted(&self, uid: &str, at_ns: i64) -> Result<(), GraphError> {
        let mut resources = self.resources.write().map_err(|_| Self::lock_poisoned())?;
        if let Some(node) = resources.get_mut(uid) {
            node.deleted = true;
            node.last_seen_ns = node.last_seen_ns.max(at_ns);
        }
        drop(resources);

        // Dependent edges go stale immediately; pruning happens later.
        let mut edges = self.edges.write().map_err(|_| Self::lock_poisoned())?;
        for edge in edges.values_mut() {
            if edge.from_uid == uid || edge.to_uid == uid {
                edge.stale = true;
            }
        }
        Ok(())
    }

    async fn get_resource(&self, uid: &str) -> Result<Option<ResourceNode>, GraphError> {
        let resources = self.resources.read().map_err(|_| Self::lock_poisoned())?;
        Ok(resources.get(uid).cloned())
    }

    async fn find_by_name(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceNode>, GraphError> {
        let resources = self.resources.read().map_err(|_| Self::lock_poisoned())?;
        // The alternate key may match several nodes across delete/recreate
        // cycles; prefer the live one, then the most recently seen.
        let mut best: Option<&ResourceNode> = None;
        for node in resources.values() {
            if node.kind != kind || node.namespace != namespace || node.name != name {
                continue;
            }
            best = match best {
                None => Some(node),
                Some(current) => {
                    let better = (!node.deleted, node.last_seen_ns)
                        > (!current.deleted, current.last_seen_ns);
                    if better { Some(node) } else { Some(current) }
                }
            };
        }
        Ok(best.cloned())
    }

    async fn resources_by_kind(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<ResourceNode>, GraphError> {
        let resources = self.resources.read().map_err(|_| Self::lock_poisoned())?;
        let mut matches: Vec<ResourceNode> = resources
            .values()
            .filter(|node| node.kind == kind)
            .filter(|node| namespace.is_none_or(|ns| node.namespace == ns))
            .filter(|node| name.is_none_or(|n| node.name == n))
            .cloned()
            .collect();
        matches.sort_by(|a, b| (&a.namespace, &a.name, &a.uid).cmp(&(&b.namespace, &b.name, &b.uid)));
        Ok(matches)
    }

    async fn all_resources(&self) -> Result<Vec<ResourceNode>, GraphError> {
        let resources = self.resources.read().map_err(|_| Self::lock_poisoned())?;
        let mut all: Vec<ResourceNode> = resources.values().cloned().collect();
        all.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(all)
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), GraphError> {
        let mut edges = self.edges.write().map_err(|_| Self::lock_poisoned())?;
        match edges.get_mut(&edge.identity()) {
            Some(existing) => {
                // Concurrent upserts converge to the later observation.
                existing.last_observed_at_ns =
                    existing.last_observed_at_ns.max(edge.last_observed_at_ns);
                existing.stale = false;
                existing.properties = edge.properties.clone();
            }
            None => {
                edges.insert(edge.identity(), edge.clone());
            }
        }
        Ok(())
    }

    async fn edges_from(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError> {
        let edges = self.edges.read().map_err(|_| Self::lock_poisoned())?;
        let mut out: Vec<EdgeRecord> = edges
            .values()
            .filter(|e| e.from_uid == uid)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.identity().cmp(&b.identity()));
        Ok(out)
    }

    async fn edges_to(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError> {
        let edges = self.edges.read().map_err(|_| Self::lock_poisoned())?;
        let mut out: Vec<EdgeRecord> = edges
            .values()
            .filter(|e| e.to_uid == uid)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.identity().cmp(&b.identity()));
        Ok(out)
    }

    async fn mark_edges_stale(
        &self,
        from_uid: &str,
        older_than_ns: i64,
    ) -> Result<usize, GraphError> {
        let mut edges = self.edges.write().map_err(|_| Self::lock_poisoned())?;
        let mut marked = 0;
        for edge in edges.values_mut() {
            if edge.from_uid == from_uid && !edge.stale && edge.last_observed_at_ns < older_than_ns
            {
                edge.stale = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn prune_stale_edges(&self, older_than_ns: i64) -> Result<usize, GraphError> {
        let mut edges = self.edges.write().map_err(|_| Self::lock_poisoned())?;
        let before = edges.len();
        edges.retain(|_, e| !(e.stale && e.last_observed_at_ns < older_than_ns));
        Ok(before - edges.len())
    }

    async fn dangling_edges(&self) -> Result<Vec<EdgeRecord>, GraphError> {
        let edges = self.edges.read().map_err(|_| Self::lock_poisoned())?;
        let mut out: Vec<EdgeRecord> = edges
            .values()
            .filter(|e| e.is_dangling())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.identity().cmp(&b.identity()));
        Ok(out)
    }

    async fn insert_event(&self, event: &EventNode) -> Result<(), GraphError> {
        {
            let mut events = self.events.write().map_err(|_| Self::lock_poisoned())?;
            events.insert(event.event_id.clone(), event.clone());
        }

        let edge = EdgeRecord::new(
            EdgeType::ObservedOn,
            event.event_id.clone(),
            event.resource_uid.clone(),
        )
        .observed_at(event.timestamp_ns);
        self.upsert_edge(&edge).await
    }

    async fn recent_events(&self, uid: &str, since_ns: i64) -> Result<Vec<EventNode>, GraphError> {
        let events = self.events.read().map_err(|_| Self::lock_poisoned())?;
        let mut out: Vec<EventNode> = events
            .values()
            .filter(|e| e.resource_uid == uid && e.timestamp_ns >= since_ns)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.timestamp_ns, &a.event_id).cmp(&(b.timestamp_ns, &b.event_id)));
        Ok(out)
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<EventNode>, GraphError> {
        let events = self.events.read().map_err(|_| Self::lock_poisoned())?;
        Ok(events.get(event_id).cloned())
    }

    async fn delete_subgraph(&self, uid: &str) -> Result<(), GraphError> {
        let mut resources = self.resources.write().map_err(|_| Self::lock_poisoned())?;
        resources.remove(uid);
        drop(resources);

        let removed_events: Vec<String> = {
            let mut events = self.events.write().map_err(|_| Self::lock_poisoned())?;
            let ids: Vec<String> = events
                .values()
                .filter(|e| e.resource_uid == uid)
                .map(|e| e.event_id.clone())
                .collect();
            for id in &ids {
                events.remove(id);
            }
            ids
        };

        let mut edges = self.edges.write().map_err(|_| Self::lock_poisoned())?;
        edges.retain(|_, e| {
            e.from_uid != uid
                && e.to_uid != uid
                && !removed_events.contains(&e.from_uid)
                && !removed_events.contains(&e.to_uid)
        });
        Ok(())
    }
}
