//! Dynamic watcher: one watch task per configured GVR, translated into the
//! canonical event stream.
//!
//! Backoff on failed list/watch calls is delegated to `kube`'s watcher
//! machinery; this layer never retries by re-emitting events. The relist
//! after a watch restart flows through as CREATE events and is deduplicated
//! downstream by `(uid, resourceVersion)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    Api,
    core::{ApiResource, DynamicObject},
    runtime::{WatchStreamExt, watcher},
};
use spectre_event::{ChangeEvent, EventIdAllocator, EventType};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::translate::{TimestampSequencer, translate_object};
use crate::config::{WatchConfig, WatchEntry};

/// Owns the per-GVR watch tasks and reconciles them against watch-config
/// snapshots.
pub struct KubeWatcher {
    client: kube::Client,
    tx: mpsc::Sender<ChangeEvent>,
    ids: Arc<EventIdAllocator>,
    sequencer: Arc<TimestampSequencer>,
    tasks: HashMap<String, (WatchEntry, JoinHandle<()>)>,
}

impl std::fmt::Debug for KubeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatcher")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl KubeWatcher {
    pub fn new(client: kube::Client, tx: mpsc::Sender<ChangeEvent>) -> Self {
        Self {
            client,
            tx,
            ids: Arc::new(EventIdAllocator::new()),
            sequencer: Arc::new(TimestampSequencer::new()),
            tasks: HashMap::new(),
        }
    }

    /// Runs until the configuration channel closes, applying every snapshot
    /// by diffing it against the running watch set: additions start new
    /// tasks, removals stop theirs, unchanged entries are untouched.
    pub async fn run(mut self, mut config_rx: watch::Receiver<Arc<WatchConfig>>) {
        let initial = config_rx.borrow_and_update().clone();
        self.apply(&initial);

        while config_rx.changed().await.is_ok() {
            let snapshot = config_rx.borrow_and_update().clone();
            self.apply(&snapshot);
        }

        info!("watch configuration channel closed, stopping watchers");
        for (key, (_, task)) in self.tasks.drain() {
            debug!(gvr = %key, "stopping watch task");
            task.abort();
        }
    }

    fn apply(&mut self, config: &WatchConfig) {
        let desired: HashMap<String, &WatchEntry> = config
            .watch
            .iter()
            .map(|entry| (entry.gvr_key(), entry))
            .collect();

        let running: HashSet<String> = self.tasks.keys().cloned().collect();

        for key in &running {
            let stop = match desired.get(key) {
                None => true,
                // A changed selector restarts the task under the same key.
                Some(entry) => self.tasks[key].0 != **entry,
            };
            if stop {
                if let Some((_, task)) = self.tasks.remove(key) {
                    info!(gvr = %key, "stopping watch");
                    task.abort();
                }
            }
        }

        for (key, entry) in desired {
            if self.tasks.contains_key(&key) {
                continue;
            }
            info!(gvr = %key, "starting watch");
            let task = self.spawn_watch(entry.clone());
            self.tasks.insert(key, (entry.clone(), task));
        }
    }

    fn spawn_watch(&self, entry: WatchEntry) -> JoinHandle<()> {
        let client = self.client.clone();
        let tx = self.tx.clone();
        let ids = self.ids.clone();
        let sequencer = self.sequencer.clone();

        tokio::spawn(async move {
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
                Some(ns) => Api::namespaced_with(client, ns, &api_resource),
                None => Api::all_with(client, &api_resource),
            };

            let mut config = watcher::Config::default();
            if let Some(selector) = entry.label_selector.as_deref() {
                config = config.labels(selector);
            }

            let mut seen: HashSet<String> = HashSet::new();
            let mut stream = watcher(api, config).default_backoff().boxed();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(watcher::Event::Init) => {
                        // A (re)list is starting; everything it applies is a
                        // CREATE from this watcher's perspective.
                        seen.clear();
                    }
                    Ok(watcher::Event::InitApply(object)) => {
                        submit(&tx, &entry, &object, EventType::Create, &ids, &sequencer);
                        if let Some(uid) = object.metadata.uid.clone() {
                            seen.insert(uid);
                        }
                    }
                    Ok(watcher::Event::InitDone) => {
                        debug!(gvr = %entry.gvr_key(), objects = seen.len(), "relist complete");
                    }
                    Ok(watcher::Event::Apply(object)) => {
                        let event_type = match object.metadata.uid.as_deref() {
                            Some(uid) if seen.contains(uid) => EventType::Update,
                            _ => EventType::Create,
                        };
                        submit(&tx, &entry, &object, event_type, &ids, &sequencer);
                        if let Some(uid) = object.metadata.uid.clone() {
                            seen.insert(uid);
                        }
                    }
                    Ok(watcher::Event::Delete(object)) => {
                        submit(&tx, &entry, &object, EventType::Delete, &ids, &sequencer);
                        if let Some(uid) = object.metadata.uid.as_deref() {
                            seen.remove(uid);
                        }
                    }
                    Err(error) => {
                        // The stream keeps itself alive with backoff; this
                        // is informational only.
                        warn!(gvr = %entry.gvr_key(), %error, "watch error");
                    }
                }
            }
        })
    }
}

fn submit(
    tx: &mpsc::Sender<ChangeEvent>,
    entry: &WatchEntry,
    object: &DynamicObject,
    event_type: EventType,
    ids: &EventIdAllocator,
    sequencer: &TimestampSequencer,
) {
    let Some(event) = translate_object(entry, object, event_type, ids, sequencer) else {
        debug!(gvr = %entry.gvr_key(), "object without uid ignored");
        return;
    };

    // The queue is bounded and never exerts back-pressure on the informer;
    // an overflowed event is dropped and the reconciler heals the gap.
    if let Err(error) = tx.try_send(event) {
        warn!(
            gvr = %entry.gvr_key(),
            %error,
            "event queue full, dropping event"
        );
    }
}
