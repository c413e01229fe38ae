//! The public storage facade: hour rollover, file discovery, cross-file
//! queries, and startup recovery.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use snafu::{ResultExt, Snafu};
use spectre_event::ChangeEvent;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::StoreConfig,
    format::FILE_EXTENSION,
    index::FinalResourceState,
    reader::{EventFilter, HourReader, QueryStats, ReadError},
    writer::{HourWriter, WriteError},
};

pub const HOUR_NS: i64 = 3_600 * 1_000_000_000;

/// Error that occurred during calls to [`EventStore`].
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("cannot create data directory {}: {source}", path.display()))]
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot scan data directory {}: {source}", path.display()))]
    ScanDataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("write failed: {source}"))]
    Write { source: WriteError },

    #[snafu(display("read failed: {source}"))]
    Read { source: ReadError },

    #[snafu(display("cannot quarantine {}: {source}", path.display()))]
    Quarantine {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Start of the UTC hour containing `timestamp_ns`.
pub fn hour_start_ns(timestamp_ns: i64) -> i64 {
    timestamp_ns - timestamp_ns.rem_euclid(HOUR_NS)
}

/// File name for the hour starting at `hour_ns`, e.g.
/// `events-20260801-14.rpk`.
pub fn hour_file_name(hour_ns: i64) -> String {
    let when = DateTime::<Utc>::from_timestamp_nanos(hour_ns);
    format!("events-{}.{FILE_EXTENSION}", when.format("%Y%m%d-%H"))
}

#[derive(Debug)]
struct OpenHour {
    hour_ns: i64,
    writer: HourWriter,
}

#[derive(Debug)]
struct Inner {
    config: StoreConfig,
    open: Mutex<Option<OpenHour>>,
}

/// The event store. Cheap to clone; writes are serialised internally on the
/// single open hour file, reads open their own descriptors.
#[derive(Clone, Debug)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl EventStore {
    /// Opens the store, creating the data directory if needed and
    /// quarantining any hour file left without a footer by a crash.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(config.data_dir())
            .await
            .context(CreateDataDirSnafu {
                path: config.data_dir(),
            })?;

        let store = Self {
            inner: Arc::new(Inner {
                config,
                open: Mutex::new(None),
            }),
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Scans the data directory and renames footer-less files to
    /// `*.incomplete.<now>` so they are excluded from reads until operator
    /// action.
    async fn recover(&self) -> Result<(), StoreError> {
        for path in self.hour_files().await? {
            match HourReader::open(&path).await {
                Ok(_) => {}
                Err(error) => {
                    let suffix = match &error {
                        ReadError::Frame { .. } | ReadError::Io { .. } => "incomplete",
                        ReadError::Index { .. } | ReadError::Block { .. } => "corrupted",
                    };
                    let quarantined = quarantine_path(&path, suffix);
                    warn!(
                        path = %path.display(),
                        quarantined = %quarantined.display(),
                        %error,
                        "quarantining unreadable hour file"
                    );
                    tokio::fs::rename(&path, &quarantined)
                        .await
                        .context(QuarantineSnafu { path })?;
                }
            }
        }
        Ok(())
    }

    /// Complete hour files currently on disk, sorted by name (i.e. by hour).
    async fn hour_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.inner.config.data_dir().to_path_buf();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(ScanDataDirSnafu { path: &dir })?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ScanDataDirSnafu { path: &dir })?
        {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("events-") && name.ends_with(&format!(".{FILE_EXTENSION}")) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Appends one event to the hour file its timestamp falls into. Crossing
    /// an hour boundary finalises the previous file and opens the next.
    ///
    /// Returns `false` when the event was dropped as a `(uid,
    /// resourceVersion)` duplicate.
    pub async fn write_event(&self, event: &ChangeEvent) -> Result<bool, StoreError> {
        let hour_ns = hour_start_ns(event.timestamp_ns);
        let mut open = self.inner.open.lock().await;

        let crossed_boundary = open.as_ref().is_some_and(|current| current.hour_ns != hour_ns);
        if crossed_boundary {
            let OpenHour { writer, .. } = open.take().expect("checked above");
            let path = writer.close().await.context(WriteSnafu)?;
            info!(path = %path.display(), "rolled over hour file");
        }

        if open.is_none() {
            let writer = self.open_writer(hour_ns).await?;
            *open = Some(OpenHour { hour_ns, writer });
        }

        let current = open.as_mut().expect("writer opened above");
        current.writer.write_event(event).await.context(WriteSnafu)
    }

    async fn open_writer(&self, hour_ns: i64) -> Result<HourWriter, StoreError> {
        let path = self
            .inner
            .config
            .data_dir()
            .join(hour_file_name(hour_ns));
        let created_ns = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0) as u64;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            match HourWriter::reopen(&path, &self.inner.config).await {
                Ok(writer) => return Ok(writer),
                Err(error) => {
                    let quarantined = quarantine_path(&path, "incomplete");
                    warn!(
                        path = %path.display(),
                        quarantined = %quarantined.display(),
                        %error,
                        "existing hour file not reopenable, quarantining"
                    );
                    tokio::fs::rename(&path, &quarantined)
                        .await
                        .context(QuarantineSnafu { path: &path })?;
                }
            }
        }

        HourWriter::create(&path, &self.inner.config, created_ns)
            .await
            .context(WriteSnafu)
    }

    /// Finalises the open hour file, if any. Called on shutdown.
    pub async fn close(&self) -> Result<(), StoreError> {
        let mut open = self.inner.open.lock().await;
        if let Some(OpenHour { writer, .. }) = open.take() {
            let path = writer.close().await.context(WriteSnafu)?;
            debug!(path = %path.display(), "closed hour file on shutdown");
        }
        Ok(())
    }

    /// Events within `[start_ns, end_ns]` matching `filter`, across all
    /// complete hour files and the open hour, sorted by `(timestamp, id)` and
    /// deduplicated by `(uid, resourceVersion)`.
    ///
    /// Unreadable files are skipped with a warning; a single bad file never
    /// aborts the query.
    pub async fn query(
        &self,
        start_ns: i64,
        end_ns: i64,
        filter: &EventFilter,
    ) -> Result<(Vec<ChangeEvent>, QueryStats), StoreError> {
        let mut events: Vec<ChangeEvent> = Vec::new();
        let mut stats = QueryStats::default();

        let open_path = {
            let mut open = self.inner.open.lock().await;
            match open.as_mut() {
                Some(current) => {
                    let (open_events, open_stats) = current
                        .writer
                        .query(start_ns, end_ns, filter)
                        .await
                        .context(WriteSnafu)?;
                    events.extend(open_events);
                    stats.merge(open_stats);
                    Some(current.writer.path().to_path_buf())
                }
                None => None,
            }
        };

        for path in self.hour_files().await? {
            if Some(&path) == open_path.as_ref() {
                continue;
            }
            let mut reader = match HourReader::open(&path).await {
                Ok(reader) => reader,
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable hour file");
                    continue;
                }
            };

            let file_stats = &reader.index().statistics;
            if file_stats.event_count > 0
                && (file_stats.min_timestamp_ns > end_ns || file_stats.max_timestamp_ns < start_ns)
            {
                stats.files_skipped += 1;
                continue;
            }

            match reader.query(start_ns, end_ns, filter).await {
                Ok((file_events, file_stats)) => {
                    events.extend(file_events);
                    stats.merge(file_stats);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping hour file mid-query");
                }
            }
        }

        events.sort_by(|a, b| (a.timestamp_ns, a.id).cmp(&(b.timestamp_ns, b.id)));

        let mut seen = HashSet::new();
        events.retain(|e| seen.insert(e.dedup_key()));

        Ok((events, stats))
    }

    /// Streaming variant of [`query`](Self::query); yields events in
    /// timestamp order.
    pub fn query_stream(
        &self,
        start_ns: i64,
        end_ns: i64,
        filter: EventFilter,
    ) -> BoxStream<'static, Result<ChangeEvent, StoreError>> {
        let store = self.clone();
        Box::pin(async_stream::try_stream! {
            let (events, _stats) = store.query(start_ns, end_ns, &filter).await?;
            for event in events {
                yield event;
            }
        })
    }

    /// Point-in-time view at `at_ns`: per resource key, the latest final
    /// state recorded at or before that instant, across hour files and the
    /// open hour.
    pub async fn final_states(
        &self,
        at_ns: i64,
    ) -> Result<BTreeMap<String, FinalResourceState>, StoreError> {
        let mut merged: BTreeMap<String, FinalResourceState> = BTreeMap::new();

        let mut apply = |key: &String, state: &FinalResourceState| {
            if state.timestamp_ns > at_ns {
                return;
            }
            match merged.get(key) {
                Some(existing) if existing.timestamp_ns >= state.timestamp_ns => {}
                _ => {
                    merged.insert(key.clone(), state.clone());
                }
            }
        };

        let open_path = {
            let open = self.inner.open.lock().await;
            if let Some(current) = open.as_ref() {
                for (key, state) in current.writer.final_states() {
                    apply(key, state);
                }
                Some(current.writer.path().to_path_buf())
            } else {
                None
            }
        };

        for path in self.hour_files().await? {
            if Some(&path) == open_path.as_ref() {
                continue;
            }
            let reader = match HourReader::open(&path).await {
                Ok(reader) => reader,
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable hour file");
                    continue;
                }
            };
            for (key, state) in &reader.index().final_resource_states {
                apply(key, state);
            }
        }

        Ok(merged)
    }

    /// Every stored event in `[start_ns, end_ns]`, unfiltered. Used by the
    /// export subcommand.
    pub async fn export(
        &self,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let (events, _stats) = self
            .query(start_ns, end_ns, &EventFilter::default())
            .await?;
        Ok(events)
    }

    /// Writes a batch of events (hour files are created as needed). Used by
    /// the import subcommand. Returns the number of events written, not
    /// counting duplicates.
    pub async fn import(&self, events: &[ChangeEvent]) -> Result<usize, StoreError> {
        let mut written = 0;
        for event in events {
            if self.write_event(event).await? {
                written += 1;
            }
        }
        self.close().await?;
        Ok(written)
    }
}

fn quarantine_path(path: &Path, suffix: &str) -> PathBuf {
    let now = Utc::now().timestamp();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}.{now}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_start_truncates_to_the_hour() {
        let ts = 1_700_000_123_456_789_000;
        let start = hour_start_ns(ts);
        assert_eq!(start % HOUR_NS, 0);
        assert!(start <= ts && ts - start < HOUR_NS);
    }

    #[test]
    fn hour_file_names_are_utc() {
        // 2021-01-01T05:00:00Z
        let hour = 1_609_477_200 * 1_000_000_000;
        assert_eq!(hour_file_name(hour), "events-20210101-05.rpk");
    }
}
