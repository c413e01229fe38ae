//! The canonical change-event model.
//!
//! Everything that flows through Spectre is a [`ChangeEvent`]: one observed
//! create, update, or delete of a Kubernetes resource, stamped with a
//! session-monotonic id and a per-resource-monotonic timestamp. The watcher
//! produces them, the event store persists them, and the sync pipeline
//! projects them into the graph.

#![deny(clippy::all)]

mod event;
mod resource;
mod time;

pub use self::{
    event::{ChangeEvent, EventIdAllocator, EventType, ValidationError},
    resource::ResourceRef,
    time::{TimestampNs, normalize_api_timestamp, normalize_failure_timestamp, to_rfc3339},
};
