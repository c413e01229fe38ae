use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

use crate::resource::ResourceRef;

/// What happened to the resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

/// Errors that make a [`ChangeEvent`] unacceptable at the pipeline boundary.
#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("event {id} has no resource uid"))]
    MissingUid { id: u64 },

    #[snafu(display("event {id} has no resource kind"))]
    MissingKind { id: u64 },

    #[snafu(display("event {id} has no resource name"))]
    MissingName { id: u64 },

    #[snafu(display("event {id} has no resource version"))]
    MissingResourceVersion { id: u64 },

    #[snafu(display("event {id} has non-positive timestamp {timestamp}"))]
    BadTimestamp { id: u64, timestamp: i64 },
}

/// One observed create/update/delete of a Kubernetes resource.
///
/// `(resource.uid, resource.resource_version)` uniquely identifies an event;
/// the pipeline must not re-emit the same pair. `timestamp_ns` is strictly
/// monotone per resource uid, which the watcher enforces at translation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Session-monotonic id assigned by the watcher.
    pub id: u64,
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub resource: ResourceRef,
    /// The serialized resource manifest at the time of the event.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ChangeEvent {
    /// Checks the id/time invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure!(
            !self.resource.uid.is_empty(),
            MissingUidSnafu { id: self.id }
        );
        ensure!(
            !self.resource.kind.is_empty(),
            MissingKindSnafu { id: self.id }
        );
        ensure!(
            !self.resource.name.is_empty(),
            MissingNameSnafu { id: self.id }
        );
        ensure!(
            !self.resource.resource_version.is_empty(),
            MissingResourceVersionSnafu { id: self.id }
        );
        ensure!(
            self.timestamp_ns > 0,
            BadTimestampSnafu {
                id: self.id,
                timestamp: self.timestamp_ns
            }
        );
        Ok(())
    }

    /// The `(uid, resourceVersion)` pair that deduplicates the stream.
    pub fn dedup_key(&self) -> (String, String) {
        (
            self.resource.uid.clone(),
            self.resource.resource_version.clone(),
        )
    }
}

/// Allocates session-monotonic event ids.
#[derive(Debug, Default)]
pub struct EventIdAllocator {
    next: AtomicU64,
}

impl EventIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
