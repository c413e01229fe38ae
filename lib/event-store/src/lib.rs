//! Hourly, block-compressed, footer-indexed event log.
//!
//! Each UTC hour of change events lives in its own `events-YYYYMMDD-HH.rpk`
//! file:
//!
//! ```text
//! [ FixedHeader 77B ]
//! [ Compressed Block 0 ]
//!    ...
//! [ Compressed Block N-1 ]
//! [ JSON Index Section ]
//! [ FixedFooter 324B ]
//! ```
//!
//! Blocks hold length-delimited JSON events and are sealed when their
//! uncompressed size would exceed the configured limit. The index section
//! carries per-block metadata, an inverted index over kinds/namespaces/groups,
//! and the last observed state of every resource in the file, so point-in-time
//! reconstruction never has to scan predecessor files.
//!
//! Writers are single-owner per hour file. Readers locate the index through
//! the footer and skip any block whose time range or term sets cannot match
//! the query, without decompressing it. A file that is missing its footer
//! (writer crash) is quarantined with an `.incomplete.<ts>` suffix and never
//! aborts a query.

#![deny(clippy::all)]
#![allow(clippy::type_complexity)]

mod block;
mod config;
mod format;
mod index;
mod reader;
mod record;
mod retention;
mod store;
mod writer;

pub use self::{
    block::{BlockError, BlockMeta, Compression},
    config::{BuildError, StoreConfig, StoreConfigBuilder},
    format::{FILE_EXTENSION, FormatError},
    index::{FinalResourceState, IndexError, IndexSection, Statistics},
    reader::{EventFilter, QueryStats, ReadError},
    record::RecordError,
    retention::{RetentionSweeper, sweep_once},
    store::{EventStore, StoreError, hour_file_name, hour_start_ns},
    writer::WriteError,
};
