//! Footer-driven, index-pruned reads over hour files.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use spectre_event::ChangeEvent;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::trace;

use crate::{
    block::{self, BlockError, BlockMeta},
    format::{FOOTER_LEN, FileFooter, FileHeader, FormatError, HEADER_LEN},
    index::{IndexError, IndexSection},
};

/// Error that occurred while reading a single hour file.
#[derive(Debug, Snafu)]
pub enum ReadError {
    #[snafu(display("read I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("invalid framing in {}: {source}", path.display()))]
    Frame { path: PathBuf, source: FormatError },

    #[snafu(display("invalid index section in {}: {source}", path.display()))]
    Index { path: PathBuf, source: IndexError },

    #[snafu(display("unreadable block in {}: {source}", path.display()))]
    Block { path: PathBuf, source: BlockError },
}

/// Resource filters applied to a time-range query. An absent field is a
/// wildcard; present fields are AND-combined.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub group: Option<String>,
}

impl EventFilter {
    pub fn is_wildcard(&self) -> bool {
        self.kind.is_none() && self.namespace.is_none() && self.group.is_none()
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(kind) = &self.kind
            && &event.resource.kind != kind
        {
            return false;
        }
        if let Some(namespace) = &self.namespace
            && &event.resource.namespace != namespace
        {
            return false;
        }
        if let Some(group) = &self.group {
            let event_group = if event.resource.group.is_empty() {
                "core"
            } else {
                &event.resource.group
            };
            if event_group != group {
                return false;
            }
        }
        true
    }
}

/// Counters describing how selective a query was.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub total_blocks: usize,
    pub blocks_skipped: usize,
    pub blocks_read: usize,
    pub events_scanned: usize,
}

impl QueryStats {
    pub fn merge(&mut self, other: QueryStats) {
        self.files_scanned += other.files_scanned;
        self.files_skipped += other.files_skipped;
        self.total_blocks += other.total_blocks;
        self.blocks_skipped += other.blocks_skipped;
        self.blocks_read += other.blocks_read;
        self.events_scanned += other.events_scanned;
    }
}

/// Reads and validates the fixed frames of a complete hour file.
pub(crate) async fn read_frames(
    file: &mut File,
    len: u64,
    path: &Path,
) -> Result<(FileHeader, FileFooter, IndexSection), ReadError> {
    if len < (HEADER_LEN + FOOTER_LEN) as u64 {
        return Err(ReadError::Frame {
            path: path.to_path_buf(),
            source: FormatError::Truncated {
                section: "file",
                len: len as usize,
            },
        });
    }

    let mut header_buf = vec![0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0)).await.context(IoSnafu { path })?;
    file.read_exact(&mut header_buf)
        .await
        .context(IoSnafu { path })?;
    let header = FileHeader::decode(&header_buf).context(FrameSnafu { path })?;

    let mut footer_buf = vec![0u8; FOOTER_LEN];
    file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))
        .await
        .context(IoSnafu { path })?;
    file.read_exact(&mut footer_buf)
        .await
        .context(IoSnafu { path })?;
    let footer = FileFooter::decode(&footer_buf).context(FrameSnafu { path })?;

    let index_len = footer.index_length as u64;
    let index_offset = footer.index_offset as u64;
    if index_offset < HEADER_LEN as u64 || index_offset + index_len + FOOTER_LEN as u64 > len {
        return Err(ReadError::Frame {
            path: path.to_path_buf(),
            source: FormatError::Truncated {
                section: "index",
                len: len as usize,
            },
        });
    }

    let mut index_buf = vec![0u8; footer.index_length as usize];
    file.seek(SeekFrom::Start(index_offset))
        .await
        .context(IoSnafu { path })?;
    file.read_exact(&mut index_buf)
        .await
        .context(IoSnafu { path })?;

    if header.checksums {
        footer
            .verify_checksum(&index_buf)
            .context(FrameSnafu { path })?;
    }
    let index = IndexSection::from_bytes(&index_buf).context(IndexSnafu { path })?;

    Ok((header, footer, index))
}

/// One open, complete hour file.
#[derive(Debug)]
pub struct HourReader {
    path: PathBuf,
    file: File,
    header: FileHeader,
    index: IndexSection,
}

impl HourReader {
    pub async fn open(path: &Path) -> Result<Self, ReadError> {
        let mut file = File::open(path).await.context(IoSnafu { path })?;
        let len = file.metadata().await.context(IoSnafu { path })?.len();
        let (header, _footer, index) = read_frames(&mut file, len, path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            index,
        })
    }

    pub fn index(&self) -> &IndexSection {
        &self.index
    }

    /// Block ids that can possibly satisfy `filter`, from the inverted
    /// index. `None` means "all blocks" (no term filter present).
    fn candidate_blocks(&self, filter: &EventFilter) -> Option<BTreeSet<u32>> {
        let mut candidates: Option<BTreeSet<u32>> = None;

        let mut intersect = |ids: Option<&Vec<u32>>| {
            let ids: BTreeSet<u32> = ids.map(|v| v.iter().copied().collect()).unwrap_or_default();
            candidates = Some(match candidates.take() {
                None => ids,
                Some(existing) => existing.intersection(&ids).copied().collect(),
            });
        };

        if let Some(kind) = &filter.kind {
            intersect(self.index.inverted_index.kinds.get(kind));
        }
        if let Some(namespace) = &filter.namespace {
            intersect(self.index.inverted_index.namespaces.get(namespace));
        }
        if let Some(group) = &filter.group {
            intersect(self.index.inverted_index.groups.get(group));
        }

        candidates
    }

    async fn read_block(&mut self, meta: &BlockMeta) -> Result<Vec<ChangeEvent>, ReadError> {
        let mut buf = vec![0u8; meta.compressed_len as usize];
        self.file
            .seek(SeekFrom::Start(meta.offset))
            .await
            .context(IoSnafu { path: &self.path })?;
        self.file
            .read_exact(&mut buf)
            .await
            .context(IoSnafu { path: &self.path })?;
        block::decode_block(meta.id, &buf, self.header.compression)
            .context(BlockSnafu { path: &self.path })
    }

    /// Events within `[start_ns, end_ns]` matching `filter`, in file order.
    ///
    /// Blocks are pruned first by the inverted index, then by their time
    /// range, without decompression; surviving blocks get a per-event pass.
    pub async fn query(
        &mut self,
        start_ns: i64,
        end_ns: i64,
        filter: &EventFilter,
    ) -> Result<(Vec<ChangeEvent>, QueryStats), ReadError> {
        let candidates = self.candidate_blocks(filter);
        let metas: Vec<BlockMeta> = self.index.block_metadata.clone();

        let mut stats = QueryStats {
            files_scanned: 1,
            total_blocks: metas.len(),
            ..Default::default()
        };
        let mut events = Vec::new();

        for meta in &metas {
            let term_match = candidates
                .as_ref()
                .map(|set| set.contains(&meta.id))
                .unwrap_or(true);
            if !term_match || !meta.overlaps(start_ns, end_ns) {
                stats.blocks_skipped += 1;
                continue;
            }

            stats.blocks_read += 1;
            for event in self.read_block(meta).await? {
                stats.events_scanned += 1;
                if event.timestamp_ns >= start_ns
                    && event.timestamp_ns <= end_ns
                    && filter.matches(&event)
                {
                    events.push(event);
                }
            }
        }

        trace!(
            path = %self.path.display(),
            blocks_read = stats.blocks_read,
            blocks_skipped = stats.blocks_skipped,
            matched = events.len(),
            "queried hour file"
        );

        Ok((events, stats))
    }

    /// Every event in the file, in file order. Used by export.
    pub async fn read_all(&mut self) -> Result<Vec<ChangeEvent>, ReadError> {
        let metas: Vec<BlockMeta> = self.index.block_metadata.clone();
        let mut events = Vec::new();
        for meta in &metas {
            events.extend(self.read_block(meta).await?);
        }
        Ok(events)
    }
}
