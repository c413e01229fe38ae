use chrono::{DateTime, SecondsFormat, Utc};

/// Nanoseconds since the Unix epoch.
pub type TimestampNs = i64;

const MILLIS_CUTOVER: i64 = 10_000_000_000; // > 10^10 means milliseconds
const NANOS_CUTOVER: i64 = 1_000_000_000_000; // > 10^12 means nanoseconds

/// Normalises a request timestamp that may be Unix seconds or milliseconds
/// into nanoseconds. Values above 10^10 are interpreted as milliseconds.
pub fn normalize_api_timestamp(value: i64) -> TimestampNs {
    if value > MILLIS_CUTOVER {
        value * 1_000_000
    } else {
        value * 1_000_000_000
    }
}

/// Normalises a failure timestamp that may be Unix seconds or nanoseconds.
pub fn normalize_failure_timestamp(value: i64) -> TimestampNs {
    if value > NANOS_CUTOVER { value } else { value * 1_000_000_000 }
}

/// RFC 3339 rendering for response payloads, which carry both the numeric
/// and the textual form of every timestamp.
pub fn to_rfc3339(timestamp_ns: TimestampNs) -> String {
    DateTime::<Utc>::from_timestamp_nanos(timestamp_ns)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
