//! The top-level handle: one `Aof` owns the manifest, the writer, the
//! background pool, and the rewrite controller for a single data
//! directory.
//!
//! The embedding store drives it from its event loop: propagate mutating
//! commands through [`Aof::feed_command`], call [`Aof::flush`] before
//! acknowledging clients, and [`Aof::on_tick`] periodically for fsync
//! scheduling, rewrite completion, and automatic rewrite triggering.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bio::{BioPool, DurableOffset};
use crate::config::AofConfig;
use crate::dataset::{ExtensionRegistry, ReplaySink, SnapshotCodec, SnapshotSource};
use crate::error::{AofError, AofResult};
use crate::fs::Layout;
use crate::loader::{self, LoadOutcome};
use crate::manifest::Manifest;
use crate::rewrite::Rewriter;
use crate::serializer::dump_snapshot;
use crate::writer::{AofWriter, WriterState};

/// Point-in-time view of the subsystem, for operator surfaces.
#[derive(Debug, Clone)]
pub struct AofStatus {
    pub state: WriterState,
    /// Bytes appended to the log so far.
    pub pending_offset: u64,
    /// Bytes known to be durably synced; never ahead of `pending_offset`.
    pub durable_offset: u64,
    pub buffered_bytes: usize,
    pub last_write_ok: bool,
    pub bio_fsync_ok: bool,
    pub delayed_fsyncs: u64,
    pub rewrite_in_progress: bool,
    pub rewrite_scheduled: bool,
    pub last_rewrite_ok: bool,
    pub consecutive_rewrite_failures: u32,
    pub last_rewrite_duration_ms: Option<u64>,
    /// Total size of live segments (base + incrementals).
    pub current_size: u64,
    pub base_size: u64,
}

/// Append-only-file persistence engine for one data directory.
///
/// One writer per data directory is assumed; `Aof` is single-owner state
/// and all methods take `&mut self`. The only concurrency inside is the
/// background I/O pool and the rewrite dump thread, both owned here.
pub struct Aof {
    config: AofConfig,
    layout: Layout,
    manifest: Manifest,
    writer: AofWriter,
    bio: BioPool,
    rewriter: Rewriter,
    durable: Arc<DurableOffset>,
    codec: Option<Arc<dyn SnapshotCodec>>,
    extensions: Arc<ExtensionRegistry>,
}

impl Aof {
    /// Opens the engine against the configured data directory, loading the
    /// manifest if one exists. No segment is replayed yet; call
    /// [`Aof::load`] next.
    pub fn open(config: AofConfig) -> AofResult<Self> {
        let config = config.normalized()?;
        let layout = Layout::new(&config);
        let manifest = Manifest::load_from_disk(&layout)?;
        let durable = DurableOffset::new();
        let bio = BioPool::new(durable.clone());
        Ok(Self {
            config,
            layout,
            manifest,
            writer: AofWriter::new(),
            bio,
            rewriter: Rewriter::new(),
            durable,
            codec: None,
            extensions: Arc::new(ExtensionRegistry::new()),
        })
    }

    /// Registers the binary snapshot codec used for snapshot-encoded base
    /// segments (both loading them and, with `snapshot_preamble` set,
    /// producing them).
    pub fn with_snapshot_codec(mut self, codec: Arc<dyn SnapshotCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Registers rewrite callbacks for extension value types.
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }

    pub fn config(&self) -> &AofConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Replays the log into `sink`, running the legacy single-file upgrade
    /// first when applicable.
    pub fn load(&mut self, sink: &mut dyn ReplaySink) -> AofResult<LoadOutcome> {
        let outcome = loader::load_from_disk(
            &self.config,
            &self.layout,
            &mut self.manifest,
            sink,
            self.codec.as_deref(),
        )?;
        // The first automatic rewrite compares growth against the base as
        // it was at load time.
        self.rewriter.set_base_size(self.manifest.base_size());
        Ok(outcome)
    }

    /// Starts appending on process start: force-creates a base for an
    /// empty manifest, opens the tail incremental, persists the manifest.
    pub fn start_on_boot(&mut self, source: &dyn SnapshotSource, now_ms: u64) -> AofResult<()> {
        if self.writer.is_active() {
            return Err(AofError::invalid_state("the writer is already active"));
        }
        self.layout.ensure()?;

        if self.manifest.is_empty() {
            let base_name = self
                .manifest
                .new_base_name(&self.layout, self.config.snapshot_preamble);
            self.write_base_file(source, &base_name, now_ms)?;
            info!(base = %base_name, "created base segment on start");
        }

        self.writer
            .open_on_start(&self.layout, &mut self.manifest, now_ms)?;
        self.manifest.refresh_sizes(&self.layout)?;
        self.rewriter.set_base_size(self.manifest.live_size());
        Ok(())
    }

    /// Enables appending at runtime. The writer enters the wait state and
    /// a rewrite is kicked off; it flips to `On` when that rewrite lands.
    pub fn enable(&mut self, source: &dyn SnapshotSource, now_ms: u64) -> AofResult<()> {
        if self.writer.is_active() {
            return Err(AofError::invalid_state("the writer is already active"));
        }
        self.writer.set_state(WriterState::WaitRewrite);
        if !self.bio.fsync_status_ok() {
            warn!("reopening the log; ignoring the previous background fsync error");
            self.bio.clear_fsync_error();
        }
        self.writer.reset_error_flags();

        if let Err(err) = self.begin_rewrite(source, true, now_ms) {
            self.writer.set_state(WriterState::Off);
            return Err(err);
        }
        Ok(())
    }

    /// Disables appending: aborts any running rewrite, flushes and closes
    /// the tail.
    pub fn disable(&mut self, now_ms: u64) {
        self.rewriter.kill(
            &self.config,
            &self.layout,
            &mut self.manifest,
            &mut self.writer,
            &self.bio,
            now_ms,
        );
        self.writer
            .stop(&self.config, &mut self.manifest, &self.bio, now_ms);
        self.rewriter.clear_schedule();
        self.durable.reset();
    }

    /// Records one state-mutating command against database `db`.
    pub fn feed_command(&mut self, db: u32, argv: &[impl AsRef<[u8]>], now_ms: u64) {
        let rewrite_active = self.rewriter.in_progress();
        self.writer
            .feed_command(&self.config, db, argv, rewrite_active, now_ms);
    }

    /// Flushes buffered commands per the fsync policy. Call with
    /// `force=false` from the event loop; `force=true` bypasses the
    /// fsync-in-progress postponement.
    pub fn flush(&mut self, force: bool, now_ms: u64) {
        let rewrite_active = self.rewriter.in_progress();
        self.writer.flush(
            &self.config,
            &mut self.manifest,
            &self.bio,
            force,
            rewrite_active,
            now_ms,
        );
    }

    /// Periodic housekeeping: flush scheduling, rewrite completion
    /// handling, deferred and automatic rewrite triggering.
    pub fn on_tick(&mut self, source: &dyn SnapshotSource, now_ms: u64) {
        self.flush(false, now_ms);

        if self.rewriter.in_progress() {
            self.rewriter.poll(
                &self.config,
                &self.layout,
                &mut self.manifest,
                &mut self.writer,
                &self.bio,
                now_ms,
            );
            return;
        }

        if !self.writer.is_active() {
            return;
        }
        if self.rewriter.scheduled() || self.growth_triggered() {
            match self.begin_rewrite(source, false, now_ms) {
                Ok(()) => {}
                Err(AofError::RewriteRejected(_)) => {
                    // Rate-limited; the next tick will ask again.
                }
                Err(err) => warn!(error = %err, "automatic rewrite failed to start"),
            }
        }
    }

    /// Manually triggers a background rewrite, bypassing the rate limiter.
    /// With one already running, the next is scheduled instead.
    pub fn rewrite(&mut self, source: &dyn SnapshotSource, now_ms: u64) -> AofResult<()> {
        if self.rewriter.in_progress() {
            self.rewriter.schedule();
            self.rewriter.reset_failures();
            info!("background rewrite scheduled to run once the current one finishes");
            return Ok(());
        }
        self.begin_rewrite(source, true, now_ms)
    }

    /// Aborts a running rewrite without counting a failure.
    pub fn abort_rewrite(&mut self, now_ms: u64) {
        self.rewriter.kill(
            &self.config,
            &self.layout,
            &mut self.manifest,
            &mut self.writer,
            &self.bio,
            now_ms,
        );
    }

    /// Blocks until background fsyncs submitted so far have completed.
    pub fn drain_fsyncs(&self) {
        self.bio.drain();
    }

    /// Durable replication offset: bytes of the log known to be fsynced.
    pub fn durable_offset(&self) -> u64 {
        self.durable.get()
    }

    pub fn rewrite_in_progress(&self) -> bool {
        self.rewriter.in_progress()
    }

    pub fn status(&self) -> AofStatus {
        AofStatus {
            state: self.writer.state(),
            pending_offset: self.writer.pending_repl_offset(),
            durable_offset: self.durable.get(),
            buffered_bytes: self.writer.buffered_bytes(),
            last_write_ok: self.writer.last_write_ok(),
            bio_fsync_ok: self.bio.fsync_status_ok(),
            delayed_fsyncs: self.writer.delayed_fsyncs(),
            rewrite_in_progress: self.rewriter.in_progress(),
            rewrite_scheduled: self.rewriter.scheduled(),
            last_rewrite_ok: self.rewriter.last_status_ok(),
            consecutive_rewrite_failures: self.rewriter.consecutive_failures(),
            last_rewrite_duration_ms: self.rewriter.last_rewrite_duration_ms(),
            current_size: self.manifest.live_size(),
            base_size: self.manifest.base_size(),
        }
    }

    fn begin_rewrite(
        &mut self,
        source: &dyn SnapshotSource,
        force: bool,
        now_ms: u64,
    ) -> AofResult<()> {
        let snapshot = source.freeze();
        self.rewriter.begin(
            &self.config,
            &self.layout,
            &mut self.manifest,
            &mut self.writer,
            &self.bio,
            snapshot,
            self.codec.clone(),
            self.extensions.clone(),
            force,
            now_ms,
        )
    }

    /// Growth check for the automatic rewrite trigger: total live size
    /// exceeds the floor and has grown past the configured percentage of
    /// the size at the last rewrite.
    fn growth_triggered(&self) -> bool {
        if self.config.rewrite_percentage == 0 || self.writer.state() != WriterState::On {
            return false;
        }
        let current = self.manifest.live_size();
        if current < self.config.rewrite_min_size {
            return false;
        }
        let base = self.rewriter.base_size().max(1);
        let growth = (current.saturating_mul(100) / base).saturating_sub(100);
        growth >= self.config.rewrite_percentage
    }

    /// Synchronously writes a base segment reflecting `source` at its
    /// final manifest name, via a scratch file and an atomic rename.
    fn write_base_file(
        &mut self,
        source: &dyn SnapshotSource,
        base_name: &str,
        now_ms: u64,
    ) -> AofResult<()> {
        use crate::fs::{open_truncate, TempFileGuard};

        let scratch = self
            .layout
            .segment_path(&Layout::temp_rewrite_name(u64::from(std::process::id())));
        let guard = TempFileGuard::new(scratch.clone());
        let file = open_truncate(&scratch)?;
        if self.config.snapshot_preamble {
            let codec = self.codec.as_ref().ok_or_else(|| {
                AofError::Snapshot(
                    "snapshot preamble is enabled but no codec is registered".to_string(),
                )
            })?;
            let mut out = std::io::BufWriter::new(&file);
            codec.encode(&source.freeze(), &mut out)?;
            std::io::Write::flush(&mut out)?;
            drop(out);
        } else {
            // Without an abort token the dump can only complete or error.
            let _ = dump_snapshot(&source.freeze(), &file, now_ms / 1000, &self.extensions, None)?;
        }
        file.sync_data()?;
        drop(file);
        std::fs::rename(&scratch, self.layout.segment_path(base_name))?;
        guard.disarm();
        Ok(())
    }
}

impl Drop for Aof {
    fn drop(&mut self) {
        if self.rewriter.in_progress() {
            self.rewriter.kill(
                &self.config,
                &self.layout,
                &mut self.manifest,
                &mut self.writer,
                &self.bio,
                crate::now_millis(),
            );
        }
    }
}
