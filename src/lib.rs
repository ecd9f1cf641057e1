//! Append-only-file persistence engine for an in-memory key/value store.
//!
//! Every state-mutating command is durably recorded so that after a crash
//! or clean shutdown the full dataset can be reconstructed by replaying the
//! log. The log is not one file but an ordered collection of segments
//! tracked by an on-disk manifest:
//!
//! - a **base** segment: a snapshot-equivalent checkpoint produced by the
//!   last rewrite (textual command stream or, via a pluggable codec, a
//!   binary snapshot);
//! - **incremental** segments: textual command logs appended after the
//!   base;
//! - **history** segments: superseded files awaiting background deletion.
//!
//! ## Architecture
//!
//! - [`manifest::Manifest`]: the ordered on-disk view of the segments,
//!   mutated copy-on-write and swapped in only after a durable persist.
//! - [`writer::AofWriter`]: buffers propagated commands, flushes to the
//!   tail segment, and schedules fsyncs per [`config::FsyncPolicy`]
//!   without ever blocking on a background sync.
//! - [`loader`]: replays a manifest into a [`dataset::ReplaySink`] on
//!   startup, tolerating a torn tail and upgrading pre-manifest
//!   single-file logs in place.
//! - [`serializer`]: emits the minimal command sequence that rebuilds each
//!   value, batching bulk insertions.
//! - [`rewrite::Rewriter`]: collapses the log into a fresh base on a
//!   background thread while the writer keeps appending, with exponential
//!   back-off on repeated failures.
//! - [`bio::BioPool`]: the background worker executing fsync,
//!   fsync-and-close, and unlink jobs, publishing the durable offset.
//!
//! [`aof::Aof`] ties these together for one data directory.
//!
//! ## Threading
//!
//! `Aof` is single-owner state driven from the embedding store's event
//! loop. Background work (fsyncs, unlinks, the rewrite dump) runs on
//! dedicated named threads; handoff is by job queue and ownership
//! transfer, with atomics for the few shared status words.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod aof;
pub mod bio;
pub mod config;
pub mod dataset;
pub mod error;
pub mod framing;
pub mod fs;
pub mod loader;
pub mod manifest;
pub mod rewrite;
pub mod serializer;
pub mod test_support;
pub mod writer;

pub use aof::{Aof, AofStatus};
pub use bio::{BioPool, DurableOffset};
pub use config::{AofConfig, FsyncPolicy};
pub use dataset::{
    DatasetSnapshot, ExtensionRegistry, MemoryStore, Record, ReplaySink, SnapshotCodec,
    SnapshotSource, Value,
};
pub use error::{AofError, AofResult};
pub use fs::Layout;
pub use loader::LoadOutcome;
pub use manifest::{Manifest, SegmentInfo, SegmentKind};
pub use rewrite::{RewriteLimiter, Rewriter};
pub use writer::{AofWriter, WriterState};

/// Milliseconds since the Unix epoch, saturating at zero on a clock set
/// before 1970.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::ZERO)
        .as_millis() as u64
}
