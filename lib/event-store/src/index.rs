//! The JSON index section appended before the footer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use spectre_event::{ChangeEvent, EventType};

use crate::block::BlockMeta;

#[derive(Debug, Snafu)]
pub enum IndexError {
    #[snafu(display("failed to serialize index section: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("failed to deserialize index section: {source}"))]
    Deserialize { source: serde_json::Error },
}

/// Inverted index from filter terms to the blocks containing them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvertedIndex {
    pub kinds: BTreeMap<String, Vec<u32>>,
    pub namespaces: BTreeMap<String, Vec<u32>>,
    pub groups: BTreeMap<String, Vec<u32>>,
}

impl InvertedIndex {
    pub fn from_blocks(blocks: &[BlockMeta]) -> Self {
        let mut index = InvertedIndex::default();
        for block in blocks {
            for kind in &block.kinds {
                index.kinds.entry(kind.clone()).or_default().push(block.id);
            }
            for ns in &block.namespaces {
                index.namespaces.entry(ns.clone()).or_default().push(block.id);
            }
            for group in &block.groups {
                index.groups.entry(group.clone()).or_default().push(block.id);
            }
        }
        index
    }
}

/// Aggregate statistics over the file, also used for file-level pruning.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub event_count: u64,
    pub block_count: u32,
    pub min_timestamp_ns: i64,
    pub max_timestamp_ns: i64,
    pub create_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
}

impl Statistics {
    pub fn record(&mut self, event: &ChangeEvent) {
        if self.event_count == 0 {
            self.min_timestamp_ns = event.timestamp_ns;
            self.max_timestamp_ns = event.timestamp_ns;
        } else {
            self.min_timestamp_ns = self.min_timestamp_ns.min(event.timestamp_ns);
            self.max_timestamp_ns = self.max_timestamp_ns.max(event.timestamp_ns);
        }
        self.event_count += 1;
        match event.event_type {
            EventType::Create => self.create_count += 1,
            EventType::Update => self.update_count += 1,
            EventType::Delete => self.delete_count += 1,
        }
    }
}

/// The last observed event for one resource key within the file. Recorded at
/// finalisation so a point-in-time view never has to scan predecessor files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResourceState {
    pub uid: String,
    pub last_event_type: EventType,
    pub timestamp_ns: i64,
    pub data: serde_json::Value,
}

/// The full index section, JSON-serialised for forward compatibility.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSection {
    pub format_version: String,
    pub block_metadata: Vec<BlockMeta>,
    pub inverted_index: InvertedIndex,
    pub statistics: Statistics,
    pub final_resource_states: BTreeMap<String, FinalResourceState>,
}

impl IndexSection {
    pub fn new(
        block_metadata: Vec<BlockMeta>,
        statistics: Statistics,
        final_resource_states: BTreeMap<String, FinalResourceState>,
    ) -> Self {
        let inverted_index = InvertedIndex::from_blocks(&block_metadata);
        IndexSection {
            format_version: crate::format::FORMAT_VERSION.to_string(),
            block_metadata,
            inverted_index,
            statistics,
            final_resource_states,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        serde_json::to_vec(self).context(SerializeSnafu)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        serde_json::from_slice(bytes).context(DeserializeSnafu)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn block(id: u32, kinds: &[&str], namespaces: &[&str]) -> BlockMeta {
        BlockMeta {
            id,
            offset: 0,
            compressed_len: 0,
            uncompressed_len: 0,
            event_count: 0,
            min_timestamp_ns: 0,
            max_timestamp_ns: 0,
            kinds: kinds.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            namespaces: namespaces
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>(),
            groups: BTreeSet::new(),
        }
    }

    #[test]
    fn inverted_index_maps_terms_to_block_ids() {
        let blocks = vec![
            block(0, &["Pod"], &["default"]),
            block(1, &["Pod", "Node"], &[]),
            block(2, &["Deployment"], &["kube-system"]),
        ];
        let index = InvertedIndex::from_blocks(&blocks);
        assert_eq!(index.kinds["Pod"], vec![0, 1]);
        assert_eq!(index.kinds["Deployment"], vec![2]);
        assert_eq!(index.namespaces["default"], vec![0]);
    }

    #[test]
    fn index_section_round_trips_through_json() {
        let section = IndexSection::new(
            vec![block(0, &["Pod"], &["default"])],
            Statistics::default(),
            BTreeMap::new(),
        );
        let bytes = section.to_bytes().unwrap();
        let parsed = IndexSection::from_bytes(&bytes).unwrap();
        similar_asserts::assert_eq!(section, parsed);
    }
}
