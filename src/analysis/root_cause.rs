//! Confidence-scored root-cause search.
//!
//! Anchored at a symptom resource, the analyzer walks backwards in time over
//! causal and structural edges, bounded by depth and a time window. Nodes
//! carrying a cause-introducing anomaly become candidates; confidence is the
//! product of heuristic confidences along the causal path, decayed
//! exponentially by the root's age relative to the failure instant. Output
//! order is deterministic for a fixed event history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use event_store::{EventFilter, EventStore};
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use spectre_event::{ChangeEvent, to_rfc3339};
use tracing::debug;

use super::anomaly::{Anomaly, ClassifierBattery, is_cause_introducing};
use crate::graph::{EdgeType, GraphError, GraphStore, ResourceNode};

pub const NO_ROOT_FOUND: &str = "no-root-found-within-window";

#[derive(Debug, Snafu)]
pub enum RootCauseError {
    #[snafu(display("graph traversal failed: {source}"))]
    Traversal { source: GraphError },

    #[snafu(display("event lookup failed: {source}"))]
    Events { source: event_store::StoreError },
}

#[derive(Clone, Debug)]
pub struct RootCauseConfig {
    pub max_depth: usize,
    /// How far back from the failure instant the search reaches.
    pub window: Duration,
    /// Time-decay constant for candidate confidence.
    pub tau: Duration,
    pub max_results: usize,
    pub min_confidence: f64,
}

impl Default for RootCauseConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            window: Duration::from_secs(3600),
            tau: Duration::from_secs(1800),
            max_results: 3,
            min_confidence: 0.2,
        }
    }
}

/// Analyzer input, with per-request overrides of the defaults.
#[derive(Clone, Debug)]
pub struct RootCauseRequest {
    pub symptom_uid: String,
    pub failure_ts_ns: i64,
    pub max_depth: Option<usize>,
    pub min_confidence: Option<f64>,
}

/// One inbound hop on the path from root to symptom.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEdge {
    pub edge_type: EdgeType,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heuristic: Option<String>,
}

/// One node along the causal path.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalStep {
    pub uid: String,
    pub kind: String,
    pub name: String,
    /// Edge leading into this node from the previous step; `None` on the
    /// root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<StepEdge>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCauseCandidate {
    pub root_uid: String,
    pub confidence: f64,
    pub anomaly: Anomaly,
    pub steps: Vec<CausalStep>,
    pub explanation: String,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCauseResult {
    pub candidates: Vec<RootCauseCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

pub struct RootCauseAnalyzer {
    graph: Arc<dyn GraphStore>,
    store: EventStore,
    battery: ClassifierBattery,
    config: RootCauseConfig,
}

impl std::fmt::Debug for RootCauseAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCauseAnalyzer").finish_non_exhaustive()
    }
}

/// Path bookkeeping during the breadth-first walk.
#[derive(Clone, Debug)]
struct Visit {
    /// Path from the symptom to this node, inclusive.
    path: Vec<(String, Option<StepEdge>)>,
    confidence: f64,
}

impl RootCauseAnalyzer {
    pub fn new(graph: Arc<dyn GraphStore>, store: EventStore, config: RootCauseConfig) -> Self {
        Self {
            graph,
            store,
            battery: ClassifierBattery::default(),
            config,
        }
    }

    pub async fn analyze(
        &self,
        request: &RootCauseRequest,
    ) -> Result<RootCauseResult, RootCauseError> {
        let max_depth = request.max_depth.unwrap_or(self.config.max_depth);
        let min_confidence = request.min_confidence.unwrap_or(self.config.min_confidence);
        let failure_ts = request.failure_ts_ns;
        let window_start = failure_ts - self.config.window.as_nanos() as i64;

        let Some(symptom) = self
            .graph
            .get_resource(&request.symptom_uid)
            .await
            .context(TraversalSnafu)?
        else {
            return Ok(RootCauseResult {
                candidates: Vec::new(),
                reason: Some(NO_ROOT_FOUND),
            });
        };

        // Breadth-first, bounded by depth and by the time window; the
        // visited set also bounds traversal over ownerReference cycles.
        let mut visits: HashMap<String, Visit> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        visited.insert(symptom.uid.clone());
        visits.insert(
            symptom.uid.clone(),
            Visit {
                path: vec![(symptom.uid.clone(), None)],
                confidence: 1.0,
            },
        );
        queue.push_back((symptom.uid.clone(), 0));

        while let Some((uid, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let current = visits[&uid].clone();

            for (neighbor, edge) in self
                .upstream_neighbors(&uid, window_start, failure_ts)
                .await?
            {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let mut path = current.path.clone();
                path.push((neighbor.clone(), Some(edge.clone())));
                visits.insert(
                    neighbor.clone(),
                    Visit {
                        path,
                        confidence: current.confidence * edge.confidence,
                    },
                );
                queue.push_back((neighbor, depth + 1));
            }
        }

        // Every visited node other than the symptom is a potential root.
        let symptom_events = self.events_for(&symptom, window_start, failure_ts).await?;
        let symptom_summary = self.symptom_summary(&symptom, &symptom_events);

        let mut candidates = Vec::new();
        let tau_ns = self.config.tau.as_nanos() as f64;
        let mut uids: Vec<&String> = visits.keys().collect();
        uids.sort();

        for uid in uids {
            if *uid == symptom.uid {
                continue;
            }
            let visit = &visits[uid];
            let Some(node) = self.graph.get_resource(uid).await.context(TraversalSnafu)? else {
                continue;
            };

            let events = self.events_for(&node, window_start, failure_ts).await?;
            let root_anomaly = self
                .battery
                .classify(&events)
                .into_iter()
                .filter(|a| is_cause_introducing(a))
                .filter(|a| a.timestamp_ns <= failure_ts)
                .max_by_key(|a| a.timestamp_ns);
            let Some(anomaly) = root_anomaly else {
                continue;
            };

            let decay = (-((failure_ts - anomaly.timestamp_ns) as f64) / tau_ns).exp();
            let confidence = visit.confidence * decay;
            if confidence < min_confidence {
                debug!(
                    root = %uid,
                    confidence,
                    "candidate below confidence threshold"
                );
                continue;
            }

            let steps = self.build_steps(visit).await?;
            let explanation =
                build_explanation(&steps, &anomaly, &symptom, &symptom_summary, confidence);
            candidates.push(RootCauseCandidate {
                root_uid: uid.clone(),
                confidence,
                anomaly,
                steps,
                explanation,
            });
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.root_uid.cmp(&b.root_uid))
        });
        candidates.truncate(self.config.max_results);

        if candidates.is_empty() {
            return Ok(RootCauseResult {
                candidates,
                reason: Some(NO_ROOT_FOUND),
            });
        }
        Ok(RootCauseResult {
            candidates,
            reason: None,
        })
    }

    /// Upstream neighbors of a resource: structural sources, structural
    /// references, and causal predecessors of its events within the window.
    async fn upstream_neighbors(
        &self,
        uid: &str,
        window_start: i64,
        failure_ts: i64,
    ) -> Result<Vec<(String, StepEdge)>, RootCauseError> {
        let mut neighbors: HashMap<String, StepEdge> = HashMap::new();
        let mut add = |uid: String, edge: StepEdge| {
            neighbors
                .entry(uid)
                .and_modify(|existing| {
                    if edge.confidence > existing.confidence {
                        *existing = edge.clone();
                    }
                })
                .or_insert(edge);
        };

        for edge in self.graph.edges_to(uid).await.context(TraversalSnafu)? {
            if matches!(
                edge.edge_type,
                EdgeType::Owns | EdgeType::Manages | EdgeType::Selects
            ) && !edge.from_uid.contains(':')
            {
                add(
                    edge.from_uid.clone(),
                    StepEdge {
                        edge_type: edge.edge_type,
                        confidence: 1.0,
                        heuristic: None,
                    },
                );
            }
        }

        for edge in self.graph.edges_from(uid).await.context(TraversalSnafu)? {
            if edge.edge_type == EdgeType::ReferencesSpec && !edge.to_uid.is_empty() {
                add(
                    edge.to_uid.clone(),
                    StepEdge {
                        edge_type: edge.edge_type,
                        confidence: 1.0,
                        heuristic: None,
                    },
                );
            }
        }

        // Causal predecessors: CAUSES edges terminate on this resource's
        // event nodes.
        let events = self
            .graph
            .recent_events(uid, window_start)
            .await
            .context(TraversalSnafu)?;
        for event in events {
            if event.timestamp_ns > failure_ts {
                continue;
            }
            for edge in self
                .graph
                .edges_to(&event.event_id)
                .await
                .context(TraversalSnafu)?
            {
                if edge.edge_type != EdgeType::Causes {
                    continue;
                }
                let Some((cause_uid, _)) = edge.from_uid.split_once(':') else {
                    continue;
                };
                if cause_uid == uid {
                    continue;
                }
                let confidence = edge
                    .properties
                    .get("confidence")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5);
                let heuristic = edge
                    .properties
                    .get("heuristic")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                add(
                    cause_uid.to_string(),
                    StepEdge {
                        edge_type: EdgeType::Causes,
                        confidence,
                        heuristic,
                    },
                );
            }
        }

        let mut sorted: Vec<(String, StepEdge)> = neighbors.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(sorted)
    }

    async fn events_for(
        &self,
        node: &ResourceNode,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<ChangeEvent>, RootCauseError> {
        let filter = EventFilter {
            kind: Some(node.kind.clone()),
            namespace: if node.namespace.is_empty() {
                None
            } else {
                Some(node.namespace.clone())
            },
            group: None,
        };
        let (events, _stats) = self
            .store
            .query(start_ns, end_ns, &filter)
            .await
            .context(EventsSnafu)?;
        Ok(events
            .into_iter()
            .filter(|e| e.resource.uid == node.uid)
            .collect())
    }

    fn symptom_summary(&self, symptom: &ResourceNode, events: &[ChangeEvent]) -> String {
        self.battery
            .classify(events)
            .first()
            .map(|a| a.summary.clone())
            .unwrap_or_else(|| format!("{} {} was affected", symptom.kind, symptom.name))
    }

    /// Path steps ordered root → symptom with kind/name looked up.
    async fn build_steps(&self, visit: &Visit) -> Result<Vec<CausalStep>, RootCauseError> {
        // The walk recorded symptom → root, with each entry carrying the
        // edge that led upstream to it. Reversed, that edge belongs to the
        // step downstream of it.
        let reversed: Vec<&(String, Option<StepEdge>)> = visit.path.iter().rev().collect();
        let mut steps = Vec::with_capacity(reversed.len());
        for (index, (uid, _)) in reversed.iter().enumerate() {
            let inbound = if index == 0 {
                None
            } else {
                reversed[index - 1].1.clone()
            };
            let node = self.graph.get_resource(uid).await.context(TraversalSnafu)?;
            let (kind, name) = node
                .map(|n| (n.kind, n.name))
                .unwrap_or_else(|| ("Unknown".to_string(), uid.clone()));
            steps.push(CausalStep {
                uid: uid.clone(),
                kind,
                name,
                edge: inbound,
            });
        }
        Ok(steps)
    }
}

fn edge_label(edge: &StepEdge) -> String {
    match &edge.heuristic {
        Some(heuristic) => heuristic.clone(),
        None => edge.edge_type.as_str().to_lowercase(),
    }
}

fn build_explanation(
    steps: &[CausalStep],
    root_anomaly: &Anomaly,
    symptom: &ResourceNode,
    symptom_summary: &str,
    confidence: f64,
) -> String {
    let root = steps.first();
    let mut explanation = match root {
        Some(root) => format!(
            "{} {} had {} at {}. ",
            root.kind,
            root.name,
            root_anomaly.summary,
            to_rfc3339(root_anomaly.timestamp_ns)
        ),
        None => String::new(),
    };

    if steps.len() > 2 {
        let hops: Vec<String> = steps[1..steps.len() - 1]
            .iter()
            .map(|step| {
                let label = step
                    .edge
                    .as_ref()
                    .map(edge_label)
                    .unwrap_or_else(|| "related".to_string());
                format!("{} ({label})", step.kind)
            })
            .collect();
        explanation.push_str(&format!("This propagated through {}, ", hops.join(" → ")));
    }

    explanation.push_str(&format!(
        "ultimately affecting {} {} which {}. Confidence {:.0}%.",
        symptom.kind,
        symptom.name,
        symptom_summary,
        confidence * 100.0
    ));
    explanation
}
