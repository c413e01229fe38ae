//! The timeline service: storage + graph + analysis composed into the
//! per-resource views served to the external RPC transport.

mod impact;
mod types;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use event_store::{EventFilter, EventStore};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use spectre_event::{ChangeEvent, normalize_api_timestamp, normalize_failure_timestamp};

use crate::{
    analysis::{
        Anomaly, ClassifierBattery, ResourceStatus, RootCauseAnalyzer, RootCauseError,
        RootCauseRequest, RootCauseResult, build_segments, derive_status,
    },
    graph::{GraphError, GraphStore},
};

pub use self::{
    impact::impact_score,
    types::{
        ChangeSummary, EventView, PatternView, SegmentView, SnapshotView, TimelineEntry,
        Timestamp, TransitionView, truncate_message,
    },
};

#[derive(Debug, Snafu)]
pub enum TimelineError {
    #[snafu(display("event query failed: {source}"))]
    Store { source: event_store::StoreError },

    #[snafu(display("graph query failed: {source}"))]
    Graph { source: GraphError },

    #[snafu(display("root cause analysis failed: {source}"))]
    RootCause { source: RootCauseError },

    #[snafu(display("request exceeded its {limit_secs}s deadline"))]
    DeadlineExceeded { limit_secs: u64 },
}

#[derive(Clone, Debug)]
pub struct TimelineConfig {
    /// Default result cap when a wildcard is used.
    pub default_max_results: usize,
    /// Hard cap on the result count.
    pub max_results_cap: usize,
    /// Head/tail lengths kept when truncating long messages.
    pub truncate_keep: usize,
    /// Deadline for read-style requests.
    pub read_timeout: std::time::Duration,
    /// Deadline for analysis requests (anomalies, root cause).
    pub analysis_timeout: std::time::Duration,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            default_max_results: 20,
            max_results_cap: 100,
            truncate_keep: 256,
            read_timeout: std::time::Duration::from_secs(30),
            analysis_timeout: std::time::Duration::from_secs(120),
        }
    }
}

/// Applies a per-request deadline. Cancellation from the caller's side is
/// observed at the next suspension point by dropping the future.
async fn with_deadline<T>(
    limit: std::time::Duration,
    fut: impl Future<Output = Result<T, TimelineError>>,
) -> Result<T, TimelineError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TimelineError::DeadlineExceeded {
            limit_secs: limit.as_secs(),
        }),
    }
}

/// A timeline request. `start`/`end` accept Unix seconds or milliseconds.
#[derive(Clone, Debug)]
pub struct TimelineQuery {
    pub kind: String,
    /// `"*"` or empty means every resource of the kind.
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub start: i64,
    pub end: i64,
    pub max_results: Option<usize>,
}

/// A change-summary request.
#[derive(Clone, Debug)]
pub struct ChangesQuery {
    pub start: i64,
    pub end: i64,
    pub kinds: Option<Vec<String>>,
    pub impact_threshold: Option<f64>,
    pub max_resources: Option<usize>,
}

pub struct TimelineService {
    store: EventStore,
    graph: Arc<dyn GraphStore>,
    battery: ClassifierBattery,
    analyzer: RootCauseAnalyzer,
    config: TimelineConfig,
}

impl std::fmt::Debug for TimelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineService").finish_non_exhaustive()
    }
}

impl TimelineService {
    pub fn new(
        store: EventStore,
        graph: Arc<dyn GraphStore>,
        analyzer: RootCauseAnalyzer,
        config: TimelineConfig,
    ) -> Self {
        Self {
            store,
            graph,
            battery: ClassifierBattery::default(),
            analyzer,
            config,
        }
    }

    fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_max_results)
            .clamp(1, self.config.max_results_cap)
    }

    /// Per-resource timelines for a kind, a namespace, and a name or
    /// wildcard.
    pub async fn get_timeline(
        &self,
        query: &TimelineQuery,
    ) -> Result<Vec<TimelineEntry>, TimelineError> {
        with_deadline(self.config.read_timeout, self.get_timeline_inner(query)).await
    }

    async fn get_timeline_inner(
        &self,
        query: &TimelineQuery,
    ) -> Result<Vec<TimelineEntry>, TimelineError> {
        let start_ns = normalize_api_timestamp(query.start);
        let end_ns = normalize_api_timestamp(query.end);
        let wildcard = matches!(query.name.as_deref(), None | Some("") | Some("*"));
        let limit = self.effective_limit(query.max_results);

        let filter = EventFilter {
            kind: Some(query.kind.clone()),
            namespace: query.namespace.clone(),
            group: None,
        };
        let (events, _stats) = self
            .store
            .query(start_ns, end_ns, &filter)
            .await
            .context(StoreSnafu)?;

        let mut grouped: BTreeMap<(String, String, String), Vec<ChangeEvent>> = BTreeMap::new();
        for event in events {
            if !wildcard && Some(event.resource.name.as_str()) != query.name.as_deref() {
                continue;
            }
            grouped
                .entry((
                    event.resource.namespace.clone(),
                    event.resource.name.clone(),
                    event.resource.uid.clone(),
                ))
                .or_default()
                .push(event);
        }

        let mut entries = Vec::new();
        for ((namespace, name, uid), events) in grouped {
            if entries.len() >= limit {
                break;
            }
            entries.push(self.build_entry(
                &query.kind,
                namespace,
                name,
                uid,
                events,
                start_ns,
                end_ns,
            ));
        }
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_entry(
        &self,
        kind: &str,
        namespace: String,
        name: String,
        uid: String,
        events: Vec<ChangeEvent>,
        start_ns: i64,
        end_ns: i64,
    ) -> TimelineEntry {
        let segments = build_segments(&events);

        let mut views = Vec::with_capacity(events.len());
        let mut snapshots = Vec::new();
        let mut previous_status: Option<ResourceStatus> = None;

        for event in &events {
            let (status, message) =
                derive_status(&event.resource.kind, event.event_type, &event.data);

            views.push(EventView {
                id: event.id,
                at: Timestamp::from(event.timestamp_ns),
                event_type: event.event_type.as_str().to_string(),
                summary: format!("{} {}", event.resource.kind, event.event_type.as_str()),
                message: truncate_message(&message, self.config.truncate_keep),
            });

            // Raw snapshots at transitions into Error/Warning.
            let transitioned = previous_status != Some(status);
            if transitioned
                && matches!(status, ResourceStatus::Error | ResourceStatus::Warning)
                && event.data != Value::Null
            {
                snapshots.push(SnapshotView {
                    at: Timestamp::from(event.timestamp_ns),
                    status,
                    manifest: event.data.clone(),
                });
            }
            previous_status = Some(status);
        }

        let (current_status, current_message) = segments
            .last()
            .map(|s| (s.status, s.message.clone()))
            .unwrap_or((ResourceStatus::Unknown, String::new()));

        TimelineEntry {
            resource_id: uid,
            kind: kind.to_string(),
            namespace,
            name,
            current_status,
            current_message,
            timeline_start: Timestamp::from(start_ns),
            timeline_end: Timestamp::from(end_ns),
            status_segments: segments
                .into_iter()
                .map(|s| SegmentView {
                    start: Timestamp::from(s.start_ns),
                    end: Timestamp::from(s.end_ns),
                    status: s.status,
                    message: s.message,
                })
                .collect(),
            events: views,
            snapshots,
        }
    }

    /// Impact-ranked change summaries across the cluster.
    pub async fn get_changes(
        &self,
        query: &ChangesQuery,
    ) -> Result<Vec<ChangeSummary>, TimelineError> {
        with_deadline(self.config.read_timeout, self.get_changes_inner(query)).await
    }

    async fn get_changes_inner(
        &self,
        query: &ChangesQuery,
    ) -> Result<Vec<ChangeSummary>, TimelineError> {
        let start_ns = normalize_api_timestamp(query.start);
        let end_ns = normalize_api_timestamp(query.end);
        let limit = self.effective_limit(query.max_resources);

        let (events, _stats) = self
            .store
            .query(start_ns, end_ns, &EventFilter::default())
            .await
            .context(StoreSnafu)?;

        let mut grouped: BTreeMap<String, Vec<ChangeEvent>> = BTreeMap::new();
        for event in events {
            if let Some(kinds) = &query.kinds
                && !kinds.contains(&event.resource.kind)
            {
                continue;
            }
            grouped
                .entry(event.resource.uid.clone())
                .or_default()
                .push(event);
        }

        let mut summaries: Vec<ChangeSummary> = grouped
            .into_iter()
            .map(|(uid, events)| summarize_resource(uid, events))
            .collect();

        if let Some(threshold) = query.impact_threshold {
            summaries.retain(|s| s.impact_score >= threshold);
        }
        summaries.sort_by(|a, b| {
            b.impact_score
                .partial_cmp(&a.impact_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.resource_id.cmp(&b.resource_id))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Anomalies for every matching resource in the window.
    pub async fn detect_anomalies(
        &self,
        kind: Option<&str>,
        namespace: Option<&str>,
        start: i64,
        end: i64,
    ) -> Result<Vec<Anomaly>, TimelineError> {
        with_deadline(
            self.config.analysis_timeout,
            self.detect_anomalies_inner(kind, namespace, start, end),
        )
        .await
    }

    async fn detect_anomalies_inner(
        &self,
        kind: Option<&str>,
        namespace: Option<&str>,
        start: i64,
        end: i64,
    ) -> Result<Vec<Anomaly>, TimelineError> {
        let start_ns = normalize_api_timestamp(start);
        let end_ns = normalize_api_timestamp(end);

        let filter = EventFilter {
            kind: kind.map(str::to_string),
            namespace: namespace.map(str::to_string),
            group: None,
        };
        let (events, _stats) = self
            .store
            .query(start_ns, end_ns, &filter)
            .await
            .context(StoreSnafu)?;

        let mut grouped: BTreeMap<String, Vec<ChangeEvent>> = BTreeMap::new();
        for event in events {
            grouped
                .entry(event.resource.uid.clone())
                .or_default()
                .push(event);
        }

        let mut anomalies = Vec::new();
        for events in grouped.values() {
            anomalies.extend(self.battery.classify(events));
        }
        Ok(anomalies)
    }

    /// Root-cause analysis for a symptom resource at a failure instant. The
    /// timestamp accepts Unix seconds or nanoseconds.
    pub async fn find_root_cause(
        &self,
        resource_uid: &str,
        failure_timestamp: i64,
        max_depth: Option<usize>,
        min_confidence: Option<f64>,
    ) -> Result<RootCauseResult, TimelineError> {
        let request = RootCauseRequest {
            symptom_uid: resource_uid.to_string(),
            failure_ts_ns: normalize_failure_timestamp(failure_timestamp),
            max_depth,
            min_confidence,
        };
        with_deadline(self.config.analysis_timeout, async {
            self.analyzer
                .analyze(&request)
                .await
                .context(RootCauseSnafu)
        })
        .await
    }

    /// The graph handle, for callers that need raw lookups next to timeline
    /// data.
    pub fn graph(&self) -> Arc<dyn GraphStore> {
        self.graph.clone()
    }
}

const ISSUE_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "OOMKilled",
    "CreateContainerConfigError",
    "Evicted",
];

fn summarize_resource(uid: String, events: Vec<ChangeEvent>) -> ChangeSummary {
    let first = &events[0];
    let (kind, namespace, name) = (
        first.resource.kind.clone(),
        first.resource.namespace.clone(),
        first.resource.name.clone(),
    );

    let mut error_events = 0;
    let mut warning_events = 0;
    let mut change_count = 0;
    let mut issue_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut previous_spec: Option<Value> = None;

    for event in &events {
        let (status, _) = derive_status(&event.resource.kind, event.event_type, &event.data);
        match status {
            ResourceStatus::Error => error_events += 1,
            ResourceStatus::Warning => warning_events += 1,
            _ => {}
        }

        let spec = event.data.get("spec").cloned();
        match event.event_type {
            spectre_event::EventType::Create | spectre_event::EventType::Delete => {
                change_count += 1;
            }
            spectre_event::EventType::Update => {
                if previous_spec.is_some() && previous_spec != spec {
                    change_count += 1;
                }
            }
        }
        previous_spec = spec;

        let manifest = serde_json::to_string(&event.data).unwrap_or_default();
        for reason in ISSUE_REASONS.iter().copied() {
            if manifest.contains(reason) {
                *issue_counts.entry(reason).or_default() += 1;
            }
        }
    }

    let segments = build_segments(&events);
    let status_transitions: Vec<TransitionView> = segments
        .windows(2)
        .map(|pair| TransitionView {
            at: Timestamp::from(pair[1].start_ns),
            from: pair[0].status,
            to: pair[1].status,
            message: pair[1].message.clone(),
        })
        .collect();

    let container_issues: Vec<String> = issue_counts.keys().map(|k| k.to_string()).collect();
    let event_patterns: Vec<PatternView> = issue_counts
        .iter()
        .map(|(pattern, count)| PatternView {
            pattern: pattern.to_string(),
            count: *count,
        })
        .collect();

    let score = impact_score(
        &container_issues,
        &event_patterns,
        error_events,
        warning_events,
        &status_transitions,
        events.len(),
    );

    ChangeSummary {
        resource_id: uid,
        kind,
        namespace,
        name,
        change_count,
        event_count: events.len(),
        error_events,
        warning_events,
        status_transitions,
        container_issues,
        event_patterns,
        impact_score: score,
    }
}
