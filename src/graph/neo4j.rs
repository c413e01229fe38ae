//! Bolt/Cypher backend.
//!
//! Property maps are flattened onto node/relationship properties; `labels`
//! and edge `properties` are stored as JSON strings since the property model
//! does not allow nested maps.

use async_trait::async_trait;
use neo4rs::{ConfigBuilder, Graph, query};
use serde::Deserialize;
use tracing::debug;

use super::{
    EdgeRecord, EdgeType, EventNode, GraphError, GraphStore, Params, QueryResult, ResourceNode,
};
use crate::graph::MutationStats;

/// Connection settings for the Bolt endpoint.
#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

pub struct Neo4jStore {
    graph: Graph,
}

impl std::fmt::Debug for Neo4jStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jStore").finish_non_exhaustive()
    }
}

impl Neo4jStore {
    /// Dials the graph store. Fails fast so startup can exit non-zero when
    /// the store is unreachable.
    pub async fn connect(config: &Neo4jConfig) -> Result<Self, GraphError> {
        let graph_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .db(config.database.as_str())
            .build()
            .map_err(|e| GraphError::Connection {
                message: e.to_string(),
            })?;
        let graph = Graph::connect(graph_config)
            .await
            .map_err(|e| GraphError::Connection {
                message: e.to_string(),
            })?;
        debug!(uri = %config.uri, db = %config.database, "connected to graph store");
        Ok(Self { graph })
    }

    fn query_error(e: neo4rs::Error) -> GraphError {
        GraphError::Query {
            message: e.to_string(),
        }
    }

    fn apply_params(mut q: neo4rs::Query, params: &Params) -> neo4rs::Query {
        for (key, value) in params {
            q = match value {
                serde_json::Value::String(s) => q.param(key, s.clone()),
                serde_json::Value::Bool(b) => q.param(key, *b),
                serde_json::Value::Number(n) if n.is_i64() => {
                    q.param(key, n.as_i64().expect("checked is_i64"))
                }
                serde_json::Value::Number(n) => q.param(key, n.as_f64().unwrap_or(0.0)),
                serde_json::Value::Null => q.param(key, ""),
                // Nested values travel as JSON strings.
                other => q.param(key, other.to_string()),
            };
        }
        q
    }

    async fn run(&self, cypher: &str, params: Params) -> Result<(), GraphError> {
        let q = Self::apply_params(query(cypher), &params);
        self.graph.run(q).await.map_err(Self::query_error)
    }

    async fn fetch(&self, cypher: &str, params: Params) -> Result<Vec<serde_json::Value>, GraphError> {
        let q = Self::apply_params(query(cypher), &params);
        let mut stream = self.graph.execute(q).await.map_err(Self::query_error)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(Self::query_error)? {
            let value = row
                .to::<serde_json::Value>()
                .map_err(|e| GraphError::Query {
                    message: e.to_string(),
                })?;
            rows.push(value);
        }
        Ok(rows)
    }
}

fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredResource {
    uid: String,
    kind: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    namespace: String,
    name: String,
    #[serde(default)]
    resource_version: String,
    #[serde(default)]
    labels_json: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    first_seen: i64,
    #[serde(default)]
    last_seen: i64,
}

impl From<StoredResource> for ResourceNode {
    fn from(stored: StoredResource) -> Self {
        ResourceNode {
            uid: stored.uid,
            kind: stored.kind,
            group: stored.group,
            namespace: stored.namespace,
            name: stored.name,
            resource_version: stored.resource_version,
            labels: serde_json::from_str(&stored.labels_json).unwrap_or_default(),
            deleted: stored.deleted,
            first_seen_ns: stored.first_seen,
            last_seen_ns: stored.last_seen,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEvent {
    event_id: String,
    resource_uid: String,
    timestamp: i64,
    event_type: spectre_event::EventType,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    messages_json: String,
}

impl From<StoredEvent> for EventNode {
    fn from(stored: StoredEvent) -> Self {
        EventNode {
            event_id: stored.event_id,
            resource_uid: stored.resource_uid,
            timestamp_ns: stored.timestamp,
            event_type: stored.event_type,
            summary: stored.summary,
            messages: serde_json::from_str(&stored.messages_json).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEdge {
    edge_type: String,
    from_uid: String,
    #[serde(default)]
    to_uid: String,
    #[serde(default)]
    semantic_key: String,
    #[serde(default)]
    observed_at: i64,
    #[serde(default)]
    last_observed_at: i64,
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    properties_json: String,
}

fn edge_type_from_label(label: &str) -> Option<EdgeType> {
    [
        EdgeType::Owns,
        EdgeType::Manages,
        EdgeType::ScheduledOn,
        EdgeType::Selects,
        EdgeType::ReferencesSpec,
        EdgeType::Mounts,
        EdgeType::UsesServiceAccount,
        EdgeType::BindsRole,
        EdgeType::GrantsTo,
        EdgeType::Precedes,
        EdgeType::Causes,
        EdgeType::TriggeredBy,
        EdgeType::ObservedOn,
    ]
    .into_iter()
    .find(|t| t.as_str() == label)
}

impl StoredEdge {
    fn into_record(self) -> Option<EdgeRecord> {
        Some(EdgeRecord {
            edge_type: edge_type_from_label(&self.edge_type)?,
            from_uid: self.from_uid,
            to_uid: self.to_uid,
            semantic_key: self.semantic_key,
            observed_at_ns: self.observed_at,
            last_observed_at_ns: self.last_observed_at,
            stale: self.stale,
            properties: serde_json::from_str(&self.properties_json).unwrap_or_default(),
        })
    }
}

const RETURN_RESOURCE: &str = "RETURN r.uid AS uid, r.kind AS kind, r.group AS group, \
     r.namespace AS namespace, r.name AS name, r.resourceVersion AS resourceVersion, \
     r.labelsJson AS labelsJson, r.deleted AS deleted, r.firstSeen AS firstSeen, \
     r.lastSeen AS lastSeen";

const RETURN_EDGE: &str = "RETURN type(e) AS edgeType, a.uid AS fromUid, b.uid AS toUid, \
     e.semanticKey AS semanticKey, e.observedAt AS observedAt, \
     e.lastObservedAt AS lastObservedAt, e.stale AS stale, \
     e.propertiesJson AS propertiesJson";

const RETURN_EVENT: &str = "RETURN ev.eventId AS eventId, ev.resourceUid AS resourceUid, \
     ev.timestamp AS timestamp, ev.eventType AS eventType, ev.summary AS summary, \
     ev.messagesJson AS messagesJson";

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn ping(&self) -> Result<(), GraphError> {
        self.fetch("RETURN 1 AS ok", Params::new()).await.map(|_| ())
    }

    async fn execute(&self, cypher: &str, parameters: Params) -> Result<QueryResult, GraphError> {
        let rows = self.fetch(cypher, parameters).await?;
        Ok(QueryResult {
            rows,
            stats: MutationStats::default(),
        })
    }

    async fn upsert_resource(&self, node: &ResourceNode) -> Result<(), GraphError> {
        self.run(
            "MERGE (r:Resource {uid: $uid}) \
             ON CREATE SET r.firstSeen = $firstSeen \
             SET r.kind = $kind, r.group = $group, r.namespace = $namespace, \
                 r.name = $name, r.resourceVersion = $resourceVersion, \
                 r.labelsJson = $labelsJson, r.deleted = $deleted, \
                 r.lastSeen = $lastSeen",
            params(&[
                ("uid", node.uid.clone().into()),
                ("kind", node.kind.clone().into()),
                ("group", node.group.clone().into()),
                ("namespace", node.namespace.clone().into()),
                ("name", node.name.clone().into()),
                ("resourceVersion", node.resource_version.clone().into()),
                (
                    "labelsJson",
                    serde_json::to_string(&node.labels).unwrap_or_default().into(),
                ),
                ("deleted", node.deleted.into()),
                ("firstSeen", node.first_seen_ns.into()),
                ("lastSeen", node.last_seen_ns.into()),
            ]),
        )
        .await
    }

    async fn mark_deleted(&self, uid: &str, at_ns: i64) -> Result<(), GraphError> {
        self.run(
            "MATCH (r:Resource {uid: $uid}) \
             SET r.deleted = true, \
                 r.lastSeen = CASE WHEN r.lastSeen < $at THEN $at ELSE r.lastSeen END",
            params(&[("uid", uid.into()), ("at", at_ns.into())]),
        )
        .await?;
        self.run(
            "MATCH (r:Resource {uid: $uid})-[e]-() SET e.stale = true",
            params(&[("uid", uid.into())]),
        )
        .await
    }

    async fn get_resource(&self, uid: &str) -> Result<Option<ResourceNode>, GraphError> {
        let rows = self
            .fetch(
                &format!("MATCH (r:Resource {{uid: $uid}}) {RETURN_RESOURCE}"),
                params(&[("uid", uid.into())]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|v| serde_json::from_value::<StoredResource>(v).ok())
            .map(ResourceNode::from))
    }

    async fn find_by_name(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceNode>, GraphError> {
        let rows = self
            .fetch(
                &format!(
                    "MATCH (r:Resource {{kind: $kind, namespace: $namespace, name: $name}}) \
                     {RETURN_RESOURCE} \
                     ORDER BY r.deleted ASC, r.lastSeen DESC LIMIT 1"
                ),
                params(&[
                    ("kind", kind.into()),
                    ("namespace", namespace.into()),
                    ("name", name.into()),
                ]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|v| serde_json::from_value::<StoredResource>(v).ok())
            .map(ResourceNode::from))
    }

    async fn resources_by_kind(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<ResourceNode>, GraphError> {
        let mut cypher = String::from("MATCH (r:Resource {kind: $kind}) WHERE true");
        let mut p = params(&[("kind", kind.into())]);
        if let Some(ns) = namespace {
            cypher.push_str(" AND r.namespace = $namespace");
            p.insert("namespace".into(), ns.into());
        }
        if let Some(n) = name {
            cypher.push_str(" AND r.name = $name");
            p.insert("name".into(), n.into());
        }
        cypher.push(' ');
        cypher.push_str(RETURN_RESOURCE);
        cypher.push_str(" ORDER BY r.namespace, r.name, r.uid");

        let rows = self.fetch(&cypher, p).await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<StoredResource>(v).ok())
            .map(ResourceNode::from)
            .collect())
    }

    async fn all_resources(&self) -> Result<Vec<ResourceNode>, GraphError> {
        let rows = self
            .fetch(
                &format!("MATCH (r:Resource) {RETURN_RESOURCE} ORDER BY r.uid"),
                Params::new(),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<StoredResource>(v).ok())
            .map(ResourceNode::from)
            .collect())
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> Result<(), GraphError> {
        // Relationship types cannot be parameterised; the label set is
        // closed, so formatting it in is safe.
        let cypher = format!(
            "MERGE (a {{uid: $fromUid}}) \
             MERGE (b {{uid: $toUid}}) \
             MERGE (a)-[e:{} {{semanticKey: $semanticKey}}]->(b) \
             ON CREATE SET e.observedAt = $observedAt \
             SET e.lastObservedAt = CASE \
                     WHEN coalesce(e.lastObservedAt, 0) > $lastObservedAt \
                     THEN e.lastObservedAt ELSE $lastObservedAt END, \
                 e.stale = false, e.propertiesJson = $propertiesJson",
            edge.edge_type.as_str()
        );
        self.run(
            &cypher,
            params(&[
                ("fromUid", edge.from_uid.clone().into()),
                ("toUid", edge.to_uid.clone().into()),
                ("semanticKey", edge.semantic_key.clone().into()),
                ("observedAt", edge.observed_at_ns.into()),
                ("lastObservedAt", edge.last_observed_at_ns.into()),
                (
                    "propertiesJson",
                    serde_json::to_string(&edge.properties)
                        .unwrap_or_default()
                        .into(),
                ),
            ]),
        )
        .await
    }

    async fn edges_from(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError> {
        let rows = self
            .fetch(
                &format!("MATCH (a {{uid: $uid}})-[e]->(b) {RETURN_EDGE}"),
                params(&[("uid", uid.into())]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<StoredEdge>(v).ok())
            .filter_map(StoredEdge::into_record)
            .collect())
    }

    async fn edges_to(&self, uid: &str) -> Result<Vec<EdgeRecord>, GraphError> {
        let rows = self
            .fetch(
                &format!("MATCH (a)-[e]->(b {{uid: $uid}}) {RETURN_EDGE}"),
                params(&[("uid", uid.into())]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<StoredEdge>(v).ok())
            .filter_map(StoredEdge::into_record)
            .collect())
    }

    async fn mark_edges_stale(
        &self,
        from_uid: &str,
        older_than_ns: i64,
    ) -> Result<usize, GraphError> {
        let rows = self
            .fetch(
                "MATCH (a {uid: $uid})-[e]->() \
                 WHERE e.stale = false AND e.lastObservedAt < $cutoff \
                 SET e.stale = true \
                 RETURN count(e) AS marked",
                params(&[("uid", from_uid.into()), ("cutoff", older_than_ns.into())]),
            )
            .await?;
        Ok(count_from_rows(&rows, "marked"))
    }

    async fn prune_stale_edges(&self, older_than_ns: i64) -> Result<usize, GraphError> {
        let rows = self
            .fetch(
                "MATCH ()-[e]->() \
                 WHERE e.stale = true AND e.lastObservedAt < $cutoff \
                 DELETE e \
                 RETURN count(e) AS pruned",
                params(&[("cutoff", older_than_ns.into())]),
            )
            .await?;
        Ok(count_from_rows(&rows, "pruned"))
    }

    async fn dangling_edges(&self) -> Result<Vec<EdgeRecord>, GraphError> {
        let rows = self
            .fetch(
                &format!("MATCH (a)-[e]->(b {{uid: ''}}) {RETURN_EDGE}"),
                Params::new(),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<StoredEdge>(v).ok())
            .filter_map(StoredEdge::into_record)
            .collect())
    }

    async fn insert_event(&self, event: &EventNode) -> Result<(), GraphError> {
        self.run(
            "MERGE (ev:ChangeEvent {eventId: $eventId}) \
             SET ev.resourceUid = $resourceUid, ev.timestamp = $timestamp, \
                 ev.eventType = $eventType, ev.summary = $summary, \
                 ev.messagesJson = $messagesJson \
             WITH ev \
             MATCH (r:Resource {uid: $resourceUid}) \
             MERGE (ev)-[o:OBSERVED_ON {semanticKey: ''}]->(r) \
             ON CREATE SET o.observedAt = $timestamp \
             SET o.lastObservedAt = $timestamp, o.stale = false",
            params(&[
                ("eventId", event.event_id.clone().into()),
                ("resourceUid", event.resource_uid.clone().into()),
                ("timestamp", event.timestamp_ns.into()),
                ("eventType", event.event_type.as_str().into()),
                ("summary", event.summary.clone().into()),
                (
                    "messagesJson",
                    serde_json::to_string(&event.messages)
                        .unwrap_or_default()
                        .into(),
                ),
            ]),
        )
        .await
    }

    async fn recent_events(&self, uid: &str, since_ns: i64) -> Result<Vec<EventNode>, GraphError> {
        let rows = self
            .fetch(
                &format!(
                    "MATCH (ev:ChangeEvent {{resourceUid: $uid}}) \
                     WHERE ev.timestamp >= $since \
                     {RETURN_EVENT} ORDER BY ev.timestamp, ev.eventId"
                ),
                params(&[("uid", uid.into()), ("since", since_ns.into())]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<StoredEvent>(v).ok())
            .map(EventNode::from)
            .collect())
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<EventNode>, GraphError> {
        let rows = self
            .fetch(
                &format!("MATCH (ev:ChangeEvent {{eventId: $eventId}}) {RETURN_EVENT}"),
                params(&[("eventId", event_id.into())]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|v| serde_json::from_value::<StoredEvent>(v).ok())
            .map(EventNode::from))
    }

    async fn delete_subgraph(&self, uid: &str) -> Result<(), GraphError> {
        self.run(
            "MATCH (r:Resource {uid: $uid}) \
             OPTIONAL MATCH (ev:ChangeEvent {resourceUid: $uid}) \
             DETACH DELETE r, ev",
            params(&[("uid", uid.into())]),
        )
        .await
    }
}

fn count_from_rows(rows: &[serde_json::Value], field: &str) -> usize {
    rows.first()
        .and_then(|row| row.get(field))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize
}
