//! Periodic reconciliation of the live cluster against the graph.
//!
//! The watcher's queue drops on overflow and watches can miss deletes while
//! disconnected; this task is the back-stop. It lists every watched GVR,
//! emits synthetic UPDATE events for resources the graph is missing or has
//! stale, synthetic DELETEs for graph nodes the cluster no longer has, and
//! re-extracts sources of dangling edges.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kube::{
    Api,
    api::ListParams,
    core::{ApiResource, DynamicObject},
};
use spectre_event::{ChangeEvent, EventIdAllocator, EventType, ResourceRef};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::translate::{TimestampSequencer, translate_object};
use crate::{
    config::{WatchConfig, WatchEntry},
    graph::GraphStore,
};

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
        }
    }
}

pub struct Reconciler {
    client: kube::Client,
    graph: Arc<dyn GraphStore>,
    tx: mpsc::Sender<ChangeEvent>,
    config: ReconcilerConfig,
    ids: Arc<EventIdAllocator>,
    sequencer: Arc<TimestampSequencer>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        client: kube::Client,
        graph: Arc<dyn GraphStore>,
        tx: mpsc::Sender<ChangeEvent>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            graph,
            tx,
            config,
            ids: Arc::new(EventIdAllocator::new()),
            sequencer: Arc::new(TimestampSequencer::new()),
        }
    }

    /// Runs forever; callers race this against their shutdown signal.
    pub async fn run(self, config_rx: watch::Receiver<Arc<WatchConfig>>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh server first
        // fills the graph through the watcher.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let snapshot = config_rx.borrow().clone();
            match self.reconcile_once(&snapshot).await {
                Ok(stats) => {
                    info!(
                        resynced = stats.resynced,
                        deleted = stats.deleted,
                        repaired = stats.repaired,
                        "reconciliation pass complete"
                    );
                }
                Err(error) => warn!(%error, "reconciliation pass failed"),
            }
        }
    }

    async fn reconcile_once(
        &self,
        config: &WatchConfig,
    ) -> Result<ReconcileStats, kube::Error> {
        let mut stats = ReconcileStats::default();
        let mut cluster_uids: HashSet<String> = HashSet::new();
        let mut watched_kinds: HashSet<String> = HashSet::new();

        let dangling_sources: HashSet<String> = match self.graph.dangling_edges().await {
            Ok(edges) => edges.into_iter().map(|e| e.from_uid).collect(),
            Err(error) => {
                warn!(%error, "cannot list dangling edges");
                HashSet::new()
            }
        };

        for entry in &config.watch {
            watched_kinds.insert(entry.kind.clone());
            let objects = match self.list_entry(entry).await {
                Ok(objects) => objects,
                Err(error) => {
                    warn!(gvr = %entry.gvr_key(), %error, "list failed, skipping GVR");
                    continue;
                }
            };

            for object in objects {
                let Some(uid) = object.metadata.uid.clone() else {
                    continue;
                };
                cluster_uids.insert(uid.clone());

                let rv = object.metadata.resource_version.clone().unwrap_or_default();
                let out_of_sync = match self.graph.get_resource(&uid).await {
                    Ok(Some(node)) => node.deleted || node.resource_version != rv,
                    Ok(None) => true,
                    Err(error) => {
                        warn!(%error, "graph lookup failed during reconcile");
                        continue;
                    }
                };

                if out_of_sync || dangling_sources.contains(&uid) {
                    if self.emit_update(entry, &object).await {
                        stats.resynced += 1;
                        if dangling_sources.contains(&uid) && !out_of_sync {
                            stats.repaired += 1;
                        }
                    }
                }
            }
        }

        // Deletes missed while the watcher was offline: present in the
        // graph, absent in the cluster, not seen for two intervals.
        let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let grace_ns = 2 * self.config.interval.as_nanos() as i64;
        let nodes = match self.graph.all_resources().await {
            Ok(nodes) => nodes,
            Err(error) => {
                warn!(%error, "cannot list graph resources");
                return Ok(stats);
            }
        };
        for node in nodes {
            if node.deleted
                || !watched_kinds.contains(&node.kind)
                || cluster_uids.contains(&node.uid)
                || node.last_seen_ns >= now_ns - grace_ns
            {
                continue;
            }
            debug!(uid = %node.uid, kind = %node.kind, "resource vanished, emitting synthetic delete");
            let event = ChangeEvent {
                id: self.ids.next_id(),
                timestamp_ns: self.sequencer.stamp(&node.uid, now_ns),
                event_type: EventType::Delete,
                resource: ResourceRef {
                    group: node.group.clone(),
                    version: "v1".to_string(),
                    kind: node.kind.clone(),
                    namespace: node.namespace.clone(),
                    name: node.name.clone(),
                    uid: node.uid.clone(),
                    resource_version: node.resource_version.clone(),
                    labels: node.labels.clone(),
                    annotations: Default::default(),
                },
                data: serde_json::Value::Null,
            };
            if self.tx.send(event).await.is_ok() {
                stats.deleted += 1;
            }
        }

        Ok(stats)
    }

    async fn list_entry(&self, entry: &WatchEntry) -> Result<Vec<DynamicObject>, kube::Error> {
        let api_resource = ApiResource {
            group: entry.group.clone(),
            version: entry.version.clone(),
            api_version: if entry.group.is_empty() {
                entry.version.clone()
            } else {
                format!("{}/{}", entry.group, entry.version)
            },
            kind: entry.kind.clone(),
            plural: entry.resource.clone(),
        };
        let api: Api<DynamicObject> = match entry.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };

        let mut params = ListParams::default();
        if let Some(selector) = entry.label_selector.as_deref() {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn emit_update(&self, entry: &WatchEntry, object: &DynamicObject) -> bool {
        let Some(event) =
            translate_object(entry, object, EventType::Update, &self.ids, &self.sequencer)
        else {
            return false;
        };
        self.tx.send(event).await.is_ok()
    }
}

#[derive(Debug, Default)]
struct ReconcileStats {
    resynced: usize,
    deleted: usize,
    repaired: usize,
}
