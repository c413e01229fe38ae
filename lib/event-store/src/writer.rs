//! The single-owner writer for one hour file.

use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use spectre_event::ChangeEvent;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, trace};

use crate::{
    block::{BlockBuilder, BlockError, BlockMeta, Compression},
    config::StoreConfig,
    format::{self, FileFooter, FileHeader, HEADER_LEN},
    index::{FinalResourceState, IndexError, IndexSection, Statistics},
};

/// Error that occurred during calls to [`HourWriter`].
#[derive(Debug, Snafu)]
pub enum WriteError {
    /// A general I/O error occurred.
    #[snafu(display("write I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The block being sealed could not be encoded or compressed.
    #[snafu(display("failed to seal block: {source}"))]
    SealBlock { source: BlockError },

    /// The index section could not be serialized.
    #[snafu(display("failed to build index section: {source}"))]
    BuildIndex { source: IndexError },

    /// An existing file could not be reopened for append, usually because it
    /// is missing a valid footer. The caller quarantines it.
    #[snafu(display("cannot reopen for append: {source}"))]
    Reopen { source: crate::reader::ReadError },
}

/// Writes one hour file: header, then blocks as they seal, then (on close)
/// the index section and footer.
///
/// Writes are serialised by ownership; there is exactly one `HourWriter` per
/// open hour file.
#[derive(Debug)]
pub struct HourWriter {
    path: PathBuf,
    file: File,
    /// End of the sealed-block region, where the next block (or the index)
    /// goes.
    offset: u64,
    compression: Compression,
    checksums: bool,
    block_size_limit: usize,
    current: BlockBuilder,
    next_block_id: u32,
    blocks: Vec<BlockMeta>,
    statistics: Statistics,
    final_states: BTreeMap<String, FinalResourceState>,
    /// `(uid, resourceVersion)` pairs already written this session, so the
    /// same observation is never persisted twice.
    seen: HashSet<(String, String)>,
}

impl HourWriter {
    /// Creates a fresh hour file at `path`, writing its header.
    pub async fn create(
        path: &Path,
        config: &StoreConfig,
        created_ns: u64,
    ) -> Result<Self, WriteError> {
        let header = FileHeader {
            created_ns,
            compression: config.compression,
            block_size_limit: config.block_size_limit as i32,
            checksums: config.checksums,
        };

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(path)
            .await
            .context(IoSnafu { path })?;
        file.write_all(&header.encode())
            .await
            .context(IoSnafu { path })?;

        debug!(path = %path.display(), "created hour file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset: HEADER_LEN as u64,
            compression: config.compression,
            checksums: config.checksums,
            block_size_limit: config.block_size_limit,
            current: BlockBuilder::new(0),
            next_block_id: 1,
            blocks: Vec::new(),
            statistics: Statistics::default(),
            final_states: BTreeMap::new(),
            seen: HashSet::new(),
        })
    }

    /// Reopens an existing, complete hour file for append.
    ///
    /// The index section and footer are truncated away and writing continues
    /// after the last sealed block; a fresh index and footer are emitted on
    /// close. Fails with a framing error when the file has no valid footer,
    /// in which case the caller quarantines it.
    pub async fn reopen(path: &Path, config: &StoreConfig) -> Result<Self, WriteError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .context(IoSnafu { path })?;

        let len = file.metadata().await.context(IoSnafu { path })?.len();
        let (header, footer, index) = crate::reader::read_frames(&mut file, len, path)
            .await
            .context(ReopenSnafu)?;

        // Drop the index + footer; the block region is now the end of file.
        file.set_len(footer.index_offset as u64)
            .await
            .context(IoSnafu { path })?;
        file.seek(SeekFrom::End(0)).await.context(IoSnafu { path })?;

        let next_block_id = index
            .block_metadata
            .iter()
            .map(|b| b.id + 1)
            .max()
            .unwrap_or(0);

        debug!(
            path = %path.display(),
            blocks = index.block_metadata.len(),
            events = index.statistics.event_count,
            "reopened hour file for append"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset: footer.index_offset as u64,
            compression: header.compression,
            checksums: header.checksums,
            block_size_limit: config.block_size_limit,
            current: BlockBuilder::new(next_block_id),
            next_block_id: next_block_id + 1,
            blocks: index.block_metadata,
            statistics: index.statistics,
            final_states: index.final_resource_states,
            seen: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event. Returns `false` when the `(uid, resourceVersion)`
    /// pair was already written this session and the event was dropped as a
    /// duplicate.
    pub async fn write_event(&mut self, event: &ChangeEvent) -> Result<bool, WriteError> {
        let key = event.dedup_key();
        if !self.seen.insert(key) {
            trace!(
                uid = %event.resource.uid,
                resource_version = %event.resource.resource_version,
                "dropping duplicate event"
            );
            return Ok(false);
        }

        self.current.push(event).context(SealBlockSnafu)?;
        self.statistics.record(event);

        let state = self
            .final_states
            .entry(event.resource.resource_key())
            .or_insert_with(|| FinalResourceState {
                uid: event.resource.uid.clone(),
                last_event_type: event.event_type,
                timestamp_ns: event.timestamp_ns,
                data: event.data.clone(),
            });
        if event.timestamp_ns >= state.timestamp_ns {
            *state = FinalResourceState {
                uid: event.resource.uid.clone(),
                last_event_type: event.event_type,
                timestamp_ns: event.timestamp_ns,
                data: event.data.clone(),
            };
        }

        if self.current.uncompressed_len() >= self.block_size_limit {
            self.seal_current().await?;
        }

        Ok(true)
    }

    async fn seal_current(&mut self) -> Result<(), WriteError> {
        if self.current.is_empty() {
            return Ok(());
        }
        let id = self.next_block_id;
        let builder = std::mem::replace(&mut self.current, BlockBuilder::new(id));
        self.next_block_id += 1;

        let (bytes, meta) = builder
            .seal(self.offset, self.compression)
            .context(SealBlockSnafu)?;
        self.file
            .write_all(&bytes)
            .await
            .context(IoSnafu { path: &self.path })?;

        trace!(
            block = meta.id,
            events = meta.event_count,
            compressed = meta.compressed_len,
            "sealed block"
        );

        self.offset += bytes.len() as u64;
        self.blocks.push(meta);
        Ok(())
    }

    /// Events currently in this open file (sealed blocks plus the unsealed
    /// tail) that fall within `[start_ns, end_ns]` and match `filter`.
    ///
    /// Queries must see the open hour too, not just finalised files.
    pub async fn query(
        &mut self,
        start_ns: i64,
        end_ns: i64,
        filter: &crate::reader::EventFilter,
    ) -> Result<(Vec<ChangeEvent>, crate::reader::QueryStats), WriteError> {
        use tokio::io::AsyncReadExt;

        let mut stats = crate::reader::QueryStats {
            files_scanned: 1,
            total_blocks: self.blocks.len(),
            ..Default::default()
        };
        let mut events = Vec::new();

        let metas = self.blocks.clone();
        for meta in &metas {
            if !meta.overlaps(start_ns, end_ns) {
                stats.blocks_skipped += 1;
                continue;
            }
            stats.blocks_read += 1;

            let mut buf = vec![0u8; meta.compressed_len as usize];
            self.file
                .seek(SeekFrom::Start(meta.offset))
                .await
                .context(IoSnafu { path: &self.path })?;
            self.file
                .read_exact(&mut buf)
                .await
                .context(IoSnafu { path: &self.path })?;
            // Restore the append position before any further writes.
            self.file
                .seek(SeekFrom::Start(self.offset))
                .await
                .context(IoSnafu { path: &self.path })?;

            let decoded = crate::block::decode_block(meta.id, &buf, self.compression)
                .context(SealBlockSnafu)?;
            for event in decoded {
                stats.events_scanned += 1;
                if event.timestamp_ns >= start_ns
                    && event.timestamp_ns <= end_ns
                    && filter.matches(&event)
                {
                    events.push(event);
                }
            }
        }

        let tail = crate::record::decode_events(self.current.buffered())
            .map_err(|source| WriteError::SealBlock {
                source: BlockError::Decode {
                    block_id: self.current.id(),
                    source,
                },
            })?;
        for event in tail {
            stats.events_scanned += 1;
            if event.timestamp_ns >= start_ns
                && event.timestamp_ns <= end_ns
                && filter.matches(&event)
            {
                events.push(event);
            }
        }

        Ok((events, stats))
    }

    /// Final-resource-state view of this open file.
    pub fn final_states(&self) -> &BTreeMap<String, FinalResourceState> {
        &self.final_states
    }

    /// Seals the trailing block, writes the index section and footer, and
    /// syncs the file. The file is complete once this returns.
    pub async fn close(mut self) -> Result<PathBuf, WriteError> {
        self.seal_current().await?;

        let index = IndexSection::new(
            std::mem::take(&mut self.blocks),
            std::mem::take(&mut self.statistics),
            std::mem::take(&mut self.final_states),
        );
        let index_bytes = index.to_bytes().context(BuildIndexSnafu)?;

        let checksum = if self.checksums {
            format::index_checksum(&index_bytes)
        } else {
            String::new()
        };
        let footer = FileFooter {
            index_offset: self.offset as i64,
            index_length: index_bytes.len() as i32,
            checksum,
        };

        self.file
            .write_all(&index_bytes)
            .await
            .context(IoSnafu { path: &self.path })?;
        self.file
            .write_all(&footer.encode())
            .await
            .context(IoSnafu { path: &self.path })?;
        self.file
            .flush()
            .await
            .context(IoSnafu { path: &self.path })?;
        self.file
            .sync_all()
            .await
            .context(IoSnafu { path: &self.path })?;

        debug!(
            path = %self.path.display(),
            blocks = index.block_metadata.len(),
            events = index.statistics.event_count,
            "finalised hour file"
        );

        Ok(self.path)
    }
}

