//! LRU read cache in front of any [`GraphStore`].
//!
//! Pipeline processing performs the same lookups many times in a short
//! window (owner chains, selector targets). Read results are cached keyed by
//! `(operation, arguments)`; writes invalidate every entry touching the
//! written uids, which is coarse but fits the access pattern.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;

use super::{
    EdgeRecord, EventNode, GraphError, GraphStore, Params, QueryResult, ResourceNode,
};

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
enum Cached {
    Resource(Option<ResourceNode>),
    Events(Vec<EventNode>),
}

#[derive(Debug)]
struct Entry {
    value: Cached,
    /// Uids whose mutation invalidates this entry.
    uids: Vec<String>,
}

pub struct CachedStore {
    inner: Arc<dyn GraphStore>,
    cache: Mutex<LruCache<String, Entry>>,
}

impl std::fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl CachedStore {
    pub fn new(inner: Arc<dyn GraphStore>) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn GraphStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get(&self, key: &str) -> Option<Cached> {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.get(key).map(|entry| entry.value.clone())
    }

    fn put(&self, key: String, value: Cached, uids: Vec<String>) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.put(key, Entry { value, uids });
    }

    fn invalidate_uid(&self, uid: &str) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        let stale_keys: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.uids.iter().any(|u| u == uid))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale_keys {
            cache.pop(&key);
        }
    }

    fn invalidate_all(&self) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.clear();
    }
}

#[async_trait]
impl GraphStore for CachedStore {
    async fn ping(&self) -> Result<(), GraphError> {
        self.inner.ping().await
    }

    async fn execute(&self, query: &str, parameters: Params) -> Result<QueryResult, GraphError> {
        // Raw queries may mutate; pass through and drop the cache.
        self.invalidate_all();
        self.inner.execute(query, parameters).await
    }

    async fn upsert_resource(&self, node: &ResourceNode) -> Result<(), GraphError> {
        self.invalidate_uid(&node.uid);
        self.inner.upsert_resource(node).await
    }

    async fn mark_deleted(&self, uid: &str, at_ns: i64) -> Result<(), GraphError> {
        self.invalidate_uid(uid);
        self.inner.mark_deleted(uid, at_ns).await
    }

    async fn get_resource(&self, uid: &str) -> Result<Option<ResourceNode>, GraphError> {
        let key = format!("resource/{uid}");
        if let Some(Cached::Resource(node)) = self.get(&key) {
            return Ok(node);
        }
        let node = self.inner.get_resource(uid).await?;
        self.put(key, Cached::Resource(node.clone()), vec![uid.to_string()]);
        Ok(node)
    }

    async fn find_by_name(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceNode>, GraphError> {
        let key = format!("name/{kind}/{namespace}/{name}");
        if let Some(Cached::Resource(node)) = self.get(&key) {
            return Ok(node);
        }
        let node = self.inner.find_by_name(kind, namespace, name).await?;
        let uids = node.iter().map(|n| n.uid.clone()).collect();
        self.put(key, Cached::Resource(node.clone()), uids);
        Ok(node)
    }

    async fn resources_by_kind(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<ResourceNode>, GraphError> {
        self.inner.resources_by_kind(kind, namespace, name).await
    }

    async fn all_resources(&self) -> Result<Vec<ResourceNode>, GraphError> {
        self.inner.all_resources().await
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), GraphError> {
        self.invalidate_uid(&edge.from_uid);
        if !edge.to_uid.is_empty() {
            self.invalidate_uid(&edge.to_uid);
        }
        self.inner.upsert_edge(edge).await
    }

    async fn edges_from(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError> {
        self.inner.edges_from(uid).await
    }

    async fn edges_to(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError> {
        self.inner.edges_to(uid).await
    }

    async fn mark_edges_stale(
        &self,
        from_uid: &str,
        older_than_ns: i64,
    ) -> Result<usize, GraphError> {
        self.invalidate_uid(from_uid);
        self.inner.mark_edges_stale(from_uid, older_than_ns).await
    }

    async fn prune_stale_edges(&self, older_than_ns: i64) -> Result<usize, GraphError> {
        self.invalidate_all();
        self.inner.prune_stale_edges(older_than_ns).await
    }

    async fn dangling_edges(&self) -> Result<Vec<EdgeRecord>, GraphError> {
        self.inner.dangling_edges().await
    }

    async fn insert_event(&self, event: &EventNode) -> Result<(), GraphError> {
        self.invalidate_uid(&event.resource_uid);
        self.inner.insert_event(event).await
    }

    async fn recent_events(&self, uid: &str, since_ns: i64) -> Result<Vec<EventNode>, GraphError> {
        let key = format!("events/{uid}/{since_ns}");
        if let Some(Cached::Events(events)) = self.get(&key) {
            return Ok(events);
        }
        let events = self.inner.recent_events(uid, since_ns).await?;
        self.put(key, Cached::Events(events.clone()), vec![uid.to_string()]);
        Ok(events)
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<EventNode>, GraphError> {
        self.inner.get_event(event_id).await
    }

    async fn delete_subgraph(&self, uid: &str) -> Result<(), GraphError> {
        self.invalidate_uid(uid);
        self.inner.delete_subgraph(uid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryStore;

    fn node(uid: &str) -> ResourceNode {
        ResourceNode {
            uid: uid.into(),
            kind: "Pod".into(),
            group: String::new(),
            namespace: "default".into(),
            name: "web".into(),
            resource_version: "1".into(),
            labels: Default::default(),
            deleted: false,
            first_seen_ns: 1,
            last_seen_ns: 1,
        }
    }

    #[tokio::test]
    async fn cached_lookup_is_invalidated_by_writes_to_the_uid() {
        let inner = Arc::new(MemoryStore::new());
        let cached = CachedStore::new(inner.clone());

        cached.upsert_resource(&node("u1")).await.unwrap();
        let first = cached.get_resource("u1").await.unwrap().unwrap();
        assert_eq!(first.resource_version, "1");

        let mut updated = node("u1");
        updated.resource_version = "2".into();
        cached.upsert_resource(&updated).await.unwrap();

        let second = cached.get_resource("u1").await.unwrap().unwrap();
        assert_eq!(second.resource_version, "2");
    }

    #[tokio::test]
    async fn unrelated_writes_keep_cache_entries() {
        let inner = Arc::new(MemoryStore::new());
        let cached = CachedStore::new(inner.clone());

        cached.upsert_resource(&node("u1")).await.unwrap();
        cached.get_resource("u1").await.unwrap();

        // A write to a different uid leaves the u1 entry alone; mutate the
        // inner store directly to prove the next read is served from cache.
        cached.upsert_resource(&node("u2")).await.unwrap();
        let mut hidden = node("u1");
        hidden.resource_version = "99".into();
        inner.upsert_resource(&hidden).await.unwrap();

        let cached_read = cached.get_resource("u1").await.unwrap().unwrap();
        assert_eq!(cached_read.resource_version, "1");
    }
}
