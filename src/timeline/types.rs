//! Response shapes served to the external RPC transport.
//!
//! Every timestamp travels in both numeric (nanosecond) and RFC 3339 textual
//! form.

use serde::Serialize;
use spectre_event::to_rfc3339;

use crate::analysis::ResourceStatus;

/// Numeric + textual rendering of one instant.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    pub timestamp_ns: i64,
    pub timestamp: String,
}

impl From<i64> for Timestamp {
    fn from(timestamp_ns: i64) -> Self {
        Self {
            timestamp_ns,
            timestamp: to_rfc3339(timestamp_ns),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentView {
    pub start: Timestamp,
    pub end: Timestamp,
    pub status: ResourceStatus,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    pub id: u64,
    pub at: Timestamp,
    #[serde(rename = "type")]
    pub event_type: String,
    pub summary: String,
    /// Status message, truncated to head + "…" + tail when long.
    pub message: String,
}

/// Raw manifest captured at an Error/Warning transition.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub at: Timestamp,
    pub status: ResourceStatus,
    pub manifest: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub resource_id: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub current_status: ResourceStatus,
    pub current_message: String,
    pub timeline_start: Timestamp,
    pub timeline_end: Timestamp,
    pub status_segments: Vec<SegmentView>,
    pub events: Vec<EventView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<SnapshotView>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionView {
    pub at: Timestamp,
    pub from: ResourceStatus,
    pub to: ResourceStatus,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternView {
    pub pattern: String,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub resource_id: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub change_count: usize,
    pub event_count: usize,
    pub error_events: usize,
    pub warning_events: usize,
    pub status_transitions: Vec<TransitionView>,
    pub container_issues: Vec<String>,
    pub event_patterns: Vec<PatternView>,
    pub impact_score: f64,
}

/// Truncates long messages to `head + "…" + tail`; counts elsewhere are
/// reported verbatim.
pub fn truncate_message(message: &str, keep: usize) -> String {
    let chars: Vec<char> = message.chars().collect();
    if chars.len() <= keep * 2 + 1 {
        return message.to_string();
    }
    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(truncate_message("hello", 256), "hello");
    }

    #[test]
    fn long_messages_keep_head_and_tail() {
        let long = "a".repeat(300) + &"b".repeat(300);
        let truncated = truncate_message(&long, 256);
        assert_eq!(truncated.chars().count(), 256 * 2 + 1);
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('b'));
        assert!(truncated.contains('…'));
    }

    #[test]
    fn timestamps_carry_both_forms() {
        let ts = Timestamp::from(1_609_459_200_000_000_000);
        assert_eq!(ts.timestamp_ns, 1_609_459_200_000_000_000);
        assert_eq!(ts.timestamp, "2021-01-01T00:00:00.000Z");
    }
}
