//! Length-delimited JSON framing of events inside a block.

use snafu::{ResultExt, Snafu, ensure};
use spectre_event::ChangeEvent;

#[derive(Debug, Snafu)]
pub enum RecordError {
    #[snafu(display("failed to serialize event: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("failed to deserialize event at offset {offset}: {source}"))]
    Deserialize {
        offset: usize,
        source: serde_json::Error,
    },

    #[snafu(display("truncated record at offset {offset}"))]
    TruncatedRecord { offset: usize },
}

/// Appends `event` to `buf` as a `u32`-LE-length-delimited JSON document and
/// returns the number of bytes appended.
pub fn encode_event(buf: &mut Vec<u8>, event: &ChangeEvent) -> Result<usize, RecordError> {
    let payload = serde_json::to_vec(event).context(SerializeSnafu)?;
    let len = payload.len() as u32;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(4 + payload.len())
}

/// Decodes every event from an uncompressed block buffer.
pub fn decode_events(buf: &[u8]) -> Result<Vec<ChangeEvent>, RecordError> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        ensure!(offset + 4 <= buf.len(), TruncatedRecordSnafu { offset });
        let len =
            u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("sliced to 4 bytes"))
                as usize;
        offset += 4;
        ensure!(offset + len <= buf.len(), TruncatedRecordSnafu { offset });
        let event: ChangeEvent =
            serde_json::from_slice(&buf[offset..offset + len]).context(DeserializeSnafu { offset })?;
        events.push(event);
        offset += len;
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use spectre_event::{EventType, ResourceRef};

    use super::*;

    fn event(id: u64) -> ChangeEvent {
        ChangeEvent {
            id,
            timestamp_ns: 1_700_000_000_000_000_000 + id as i64,
            event_type: EventType::Create,
            resource: ResourceRef {
                version: "v1".into(),
                kind: "Pod".into(),
                namespace: "default".into(),
                name: format!("pod-{id}"),
                uid: format!("uid-{id}"),
                resource_version: id.to_string(),
                ..Default::default()
            },
            data: serde_json::json!({ "spec": { "nodeName": "node-a" } }),
        }
    }

    #[test]
    fn events_round_trip_byte_for_byte() {
        let mut buf = Vec::new();
        let inputs: Vec<_> = (0..10).map(event).collect();
        for e in &inputs {
            encode_event(&mut buf, e).unwrap();
        }
        let outputs = decode_events(&buf).unwrap();
        similar_asserts::assert_eq!(inputs, outputs);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut buf = Vec::new();
        encode_event(&mut buf, &event(1)).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            decode_events(&buf),
            Err(RecordError::TruncatedRecord { .. })
        ));
    }
}
