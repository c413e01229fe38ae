//! Block accumulation, sealing, and compression.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use spectre_event::ChangeEvent;

use crate::record::{self, RecordError};

/// Compression algorithm applied to sealed blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "gzip" => Some(Compression::Gzip),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum BlockError {
    #[snafu(display("failed to encode event into block: {source}"))]
    Encode { source: RecordError },

    #[snafu(display("failed to decode events from block {block_id}: {source}"))]
    Decode { block_id: u32, source: RecordError },

    #[snafu(display("compression failed: {source}"))]
    Compress { source: std::io::Error },

    #[snafu(display("decompression of block {block_id} failed: {source}"))]
    Decompress {
        block_id: u32,
        source: std::io::Error,
    },
}

/// Metadata describing one sealed block, stored in the index section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub id: u32,
    /// Byte offset of the compressed block within the file.
    pub offset: u64,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub event_count: u32,
    pub min_timestamp_ns: i64,
    pub max_timestamp_ns: i64,
    pub kinds: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl BlockMeta {
    /// Whether the block's time range overlaps `[start_ns, end_ns]`.
    pub fn overlaps(&self, start_ns: i64, end_ns: i64) -> bool {
        self.min_timestamp_ns <= end_ns && self.max_timestamp_ns >= start_ns
    }
}

/// Accumulates events for the current (unsealed) block.
#[derive(Debug)]
pub struct BlockBuilder {
    id: u32,
    buf: Vec<u8>,
    event_count: u32,
    min_timestamp_ns: i64,
    max_timestamp_ns: i64,
    kinds: BTreeSet<String>,
    namespaces: BTreeSet<String>,
    groups: BTreeSet<String>,
}

impl BlockBuilder {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            buf: Vec::new(),
            event_count: 0,
            min_timestamp_ns: i64::MAX,
            max_timestamp_ns: i64::MIN,
            kinds: BTreeSet::new(),
            namespaces: BTreeSet::new(),
            groups: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn uncompressed_len(&self) -> usize {
        self.buf.len()
    }

    /// The raw length-delimited records accumulated so far. Lets the writer
    /// serve reads over the not-yet-sealed tail of the open hour.
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn push(&mut self, event: &ChangeEvent) -> Result<(), BlockError> {
        record::encode_event(&mut self.buf, event).context(EncodeSnafu)?;
        self.event_count += 1;
        self.min_timestamp_ns = self.min_timestamp_ns.min(event.timestamp_ns);
        self.max_timestamp_ns = self.max_timestamp_ns.max(event.timestamp_ns);
        self.kinds.insert(event.resource.kind.clone());
        if !event.resource.namespace.is_empty() {
            self.namespaces.insert(event.resource.namespace.clone());
        }
        let group = if event.resource.group.is_empty() {
            "core".to_string()
        } else {
            event.resource.group.clone()
        };
        self.groups.insert(group);
        Ok(())
    }

    /// Compresses the accumulated events and produces the block bytes plus
    /// their metadata. `offset` is where the caller will write the block.
    pub fn seal(
        self,
        offset: u64,
        compression: Compression,
    ) -> Result<(Vec<u8>, BlockMeta), BlockError> {
        let compressed = compress(&self.buf, compression)?;
        let meta = BlockMeta {
            id: self.id,
            offset,
            compressed_len: compressed.len() as u32,
            uncompressed_len: self.buf.len() as u32,
            event_count: self.event_count,
            min_timestamp_ns: self.min_timestamp_ns,
            max_timestamp_ns: self.max_timestamp_ns,
            kinds: self.kinds,
            namespaces: self.namespaces,
            groups: self.groups,
        };
        Ok((compressed, meta))
    }
}

fn compress(buf: &[u8], compression: Compression) -> Result<Vec<u8>, BlockError> {
    match compression {
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(buf).context(CompressSnafu)?;
            encoder.finish().context(CompressSnafu)
        }
        Compression::Zstd => zstd::stream::encode_all(buf, 0).context(CompressSnafu),
    }
}

/// Decompresses a block and decodes its events.
pub fn decode_block(
    block_id: u32,
    compressed: &[u8],
    compression: Compression,
) -> Result<Vec<ChangeEvent>, BlockError> {
    let uncompressed = match compression {
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(compressed);
            let mut buf = Vec::new();
            decoder
                .read_to_end(&mut buf)
                .context(DecompressSnafu { block_id })?;
            buf
        }
        Compression::Zstd => {
            zstd::stream::decode_all(compressed).context(DecompressSnafu { block_id })?
        }
    };
    record::decode_events(&uncompressed).context(DecodeSnafu { block_id })
}

#[cfg(test)]
mod tests {
    use spectre_event::{EventType, ResourceRef};

    use super::*;

    fn event(kind: &str, ns: &str, ts: i64) -> ChangeEvent {
        ChangeEvent {
            id: 1,
            timestamp_ns: ts,
            event_type: EventType::Update,
            resource: ResourceRef {
                version: "v1".into(),
                kind: kind.into(),
                namespace: ns.into(),
                name: "x".into(),
                uid: "u".into(),
                resource_version: "1".into(),
                ..Default::default()
            },
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn sealed_block_round_trips_under_both_codecs() {
        for compression in [Compression::Gzip, Compression::Zstd] {
            let mut builder = BlockBuilder::new(0);
            builder.push(&event("Pod", "default", 10)).unwrap();
            builder.push(&event("Node", "", 20)).unwrap();
            let (bytes, meta) = builder.seal(77, compression).unwrap();

            assert_eq!(meta.event_count, 2);
            assert_eq!(meta.min_timestamp_ns, 10);
            assert_eq!(meta.max_timestamp_ns, 20);
            assert!(meta.kinds.contains("Pod") && meta.kinds.contains("Node"));
            assert!(meta.namespaces.contains("default"));
            assert_eq!(meta.compressed_len as usize, bytes.len());

            let events = decode_block(0, &bytes, compression).unwrap();
            assert_eq!(events.len(), 2);
        }
    }

    #[test]
    fn cluster_scoped_resources_do_not_pollute_the_namespace_set() {
        let mut builder = BlockBuilder::new(0);
        builder.push(&event("Node", "", 10)).unwrap();
        let (_, meta) = builder.seal(77, Compression::Gzip).unwrap();
        assert!(meta.namespaces.is_empty());
        assert!(meta.groups.contains("core"));
    }

    #[test]
    fn time_overlap_check() {
        let mut builder = BlockBuilder::new(0);
        builder.push(&event("Pod", "default", 100)).unwrap();
        builder.push(&event("Pod", "default", 200)).unwrap();
        let (_, meta) = builder.seal(77, Compression::Gzip).unwrap();
        assert!(meta.overlaps(150, 250));
        assert!(meta.overlaps(200, 200));
        assert!(!meta.overlaps(201, 300));
        assert!(!meta.overlaps(0, 99));
    }
}
