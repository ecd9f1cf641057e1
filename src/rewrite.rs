//! Background rewrite: collapse base + incrementals into a fresh minimal
//! base while the writer keeps appending to a new tail.
//!
//! The rewrite "child" is a dedicated thread consuming an owned dataset
//! snapshot frozen at start; the process-fork protocol of the original
//! design maps onto it one-to-one. The thread writes its scratch file,
//! renames it to the `-bg-` name, and reports a verdict over a channel. The
//! owning thread commits on success: stage a manifest copy, rename the
//! temp base (and, when the writer was waiting for its first rewrite, the
//! temporary incremental) into place, reclassify superseded segments as
//! history, persist, and only then swap the live manifest.
//!
//! Repeated failures engage an exponential back-off so a persistently
//! failing rewrite cannot litter the directory with fresh incrementals
//! every tick.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, TryRecvError};
use tracing::{error, info, warn};

use crate::bio::BioPool;
use crate::config::AofConfig;
use crate::dataset::{DatasetSnapshot, ExtensionRegistry, SnapshotCodec};
use crate::error::{AofError, AofResult};
use crate::fs::{open_truncate, Layout};
use crate::manifest::Manifest;
use crate::serializer::{dump_snapshot, DumpOutcome};
use crate::writer::{AofWriter, WriterState};

/// Consecutive failures before the limiter engages.
const REWRITE_LIMIT_THRESHOLD: u32 = 3;

/// Back-off delay cap, in minutes.
const REWRITE_LIMIT_MAX_MINUTES: u64 = 60;

/// Exponential back-off on consecutive rewrite failures.
///
/// Below the threshold nothing is limited. From the threshold on, each
/// consultation after the previous window expired doubles the delay, up to
/// one hour. Any success resets everything. Manual rewrites bypass the
/// limiter entirely.
#[derive(Debug, Default)]
pub struct RewriteLimiter {
    consecutive_failures: u32,
    next_delay_minutes: u64,
    next_allowed_ms: u64,
}

impl RewriteLimiter {
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.next_delay_minutes = 0;
        self.next_allowed_ms = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether an automatic rewrite is currently limited.
    pub fn limited(&mut self, now_ms: u64) -> bool {
        if self.consecutive_failures < REWRITE_LIMIT_THRESHOLD {
            self.next_delay_minutes = 0;
            self.next_allowed_ms = 0;
            return false;
        }
        if self.next_allowed_ms != 0 {
            if now_ms < self.next_allowed_ms {
                return true;
            }
            self.next_allowed_ms = 0;
            return false;
        }
        self.next_delay_minutes = if self.next_delay_minutes == 0 {
            1
        } else {
            (self.next_delay_minutes * 2).min(REWRITE_LIMIT_MAX_MINUTES)
        };
        self.next_allowed_ms = now_ms + self.next_delay_minutes * 60_000;
        warn!(
            delay_minutes = self.next_delay_minutes,
            "background rewrite has repeatedly failed; delaying the next automatic attempt"
        );
        true
    }
}

/// How the dump thread ended.
#[derive(Debug)]
enum RewriteVerdict {
    Success,
    Failed(String),
    Aborted,
}

struct RewriteJob {
    id: u64,
    rx: Receiver<RewriteVerdict>,
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    writer_was_wait: bool,
    start_ms: u64,
}

/// Orchestrates background rewrites and owns their failure accounting.
pub struct Rewriter {
    job: Option<RewriteJob>,
    scheduled: bool,
    limiter: RewriteLimiter,
    last_status_ok: bool,
    next_job_id: u64,
    last_rewrite_duration_ms: Option<u64>,
    /// Total log size right after the last successful rewrite (or initial
    /// load); the growth trigger compares against it.
    rewrite_base_size: u64,
    fsynced_reploff_pending: u64,
}

impl Rewriter {
    pub fn new() -> Self {
        Self {
            job: None,
            scheduled: false,
            limiter: RewriteLimiter::default(),
            last_status_ok: true,
            next_job_id: 0,
            last_rewrite_duration_ms: None,
            rewrite_base_size: 0,
            fsynced_reploff_pending: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.job.is_some()
    }

    pub fn scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn schedule(&mut self) {
        self.scheduled = true;
    }

    pub fn clear_schedule(&mut self) {
        self.scheduled = false;
    }

    pub fn last_status_ok(&self) -> bool {
        self.last_status_ok
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.limiter.consecutive_failures()
    }

    /// Manual triggers reset the failure count so they run immediately.
    pub fn reset_failures(&mut self) {
        self.limiter.reset();
    }

    pub fn last_rewrite_duration_ms(&self) -> Option<u64> {
        self.last_rewrite_duration_ms
    }

    pub fn base_size(&self) -> u64 {
        self.rewrite_base_size
    }

    pub fn set_base_size(&mut self, size: u64) {
        self.rewrite_base_size = size;
    }

    /// Starts a background rewrite.
    ///
    /// Prechecks, then pins the writer to a fresh tail, stabilizes the
    /// durable-offset watermark, and hands the frozen snapshot to the dump
    /// thread. `force` bypasses the rate limiter (manual trigger).
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &mut self,
        config: &AofConfig,
        layout: &Layout,
        manifest: &mut Manifest,
        writer: &mut AofWriter,
        bio: &BioPool,
        snapshot: DatasetSnapshot,
        codec: Option<Arc<dyn SnapshotCodec>>,
        extensions: Arc<ExtensionRegistry>,
        force: bool,
        now_ms: u64,
    ) -> AofResult<()> {
        if self.job.is_some() {
            return Err(AofError::RewriteRejected(
                "a background rewrite is already in progress".to_string(),
            ));
        }
        if !force && self.limiter.limited(now_ms) {
            return Err(AofError::RewriteRejected(
                "rewrites are rate-limited after repeated failures".to_string(),
            ));
        }
        layout.ensure()?;

        // Pin the writer to a new tail; everything before it is frozen and
        // belongs to the rewrite's input set.
        writer.force_select();
        writer.flush(config, manifest, bio, true, false, now_ms);
        writer.open_new_incr_for_append(layout, manifest, bio, now_ms)?;

        let writer_was_wait = writer.state() == WriterState::WaitRewrite;
        if writer_was_wait {
            // Settle in-flight fsyncs so the pending watermark cannot be
            // moved by jobs belonging to the previous log identity.
            bio.drain();
            self.fsynced_reploff_pending = writer.pending_repl_offset();
            bio.durable().reset();
        }
        writer.rearm_fsync_skip_warning();

        self.next_job_id += 1;
        let id = self.next_job_id;
        let abort = Arc::new(AtomicBool::new(false));
        let (verdict_tx, verdict_rx) = bounded(1);
        let scratch = layout.segment_path(&Layout::temp_rewrite_name(id));
        let done = layout.segment_path(&Layout::temp_rewrite_done_name(id));
        let thread_abort = abort.clone();
        let snapshot_preamble = config.snapshot_preamble;
        let now_sec = now_ms / 1000;

        let handle = thread::Builder::new()
            .name("aof-rewrite".to_string())
            .spawn(move || {
                let verdict = run_dump(
                    snapshot,
                    scratch,
                    done,
                    now_sec,
                    snapshot_preamble,
                    codec,
                    extensions,
                    thread_abort,
                );
                let _ = verdict_tx.send(verdict);
            })
            .map_err(|err| AofError::other(format!("can't spawn the rewrite thread: {err}")))?;

        info!(job = id, "background append-only file rewrite started");
        self.scheduled = false;
        self.job = Some(RewriteJob {
            id,
            rx: verdict_rx,
            abort,
            handle: Some(handle),
            writer_was_wait,
            start_ms: now_ms,
        });
        Ok(())
    }

    /// Checks whether the dump thread finished and, if so, runs the commit
    /// or failure protocol. Returns the rewrite result when one completed
    /// this call.
    pub fn poll(
        &mut self,
        config: &AofConfig,
        layout: &Layout,
        manifest: &mut Manifest,
        writer: &mut AofWriter,
        bio: &BioPool,
        now_ms: u64,
    ) -> Option<bool> {
        let verdict = {
            let job = self.job.as_ref()?;
            match job.rx.try_recv() {
                Ok(verdict) => verdict,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    RewriteVerdict::Failed("the rewrite worker vanished".to_string())
                }
            }
        };
        Some(self.finish(verdict, config, layout, manifest, writer, bio, now_ms))
    }

    /// Aborts a running rewrite and waits for the worker to acknowledge.
    /// A clean abort is not counted as a failure.
    pub fn kill(
        &mut self,
        config: &AofConfig,
        layout: &Layout,
        manifest: &mut Manifest,
        writer: &mut AofWriter,
        bio: &BioPool,
        now_ms: u64,
    ) {
        let verdict = {
            let Some(job) = self.job.as_ref() else {
                return;
            };
            info!(job = job.id, "killing the running rewrite worker");
            job.abort.store(true, Ordering::Release);
            job.rx
                .recv()
                .unwrap_or_else(|_| RewriteVerdict::Aborted)
        };
        self.finish(verdict, config, layout, manifest, writer, bio, now_ms);
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        verdict: RewriteVerdict,
        config: &AofConfig,
        layout: &Layout,
        manifest: &mut Manifest,
        writer: &mut AofWriter,
        bio: &BioPool,
        now_ms: u64,
    ) -> bool {
        let Some(mut job) = self.job.take() else {
            return false;
        };
        if let Some(handle) = job.handle.take() {
            let _ = handle.join();
        }
        self.last_rewrite_duration_ms = Some(now_ms.saturating_sub(job.start_ms));

        let succeeded = match verdict {
            RewriteVerdict::Success => {
                match self.install(&job, config, layout, manifest, writer, bio) {
                    Ok(()) => {
                        self.limiter.reset();
                        self.last_status_ok = true;
                        info!(job = job.id, "background rewrite finished successfully");
                        true
                    }
                    Err(err) => {
                        error!(job = job.id, error = %err, "rewrite landed but could not be installed");
                        self.limiter.record_failure();
                        self.last_status_ok = false;
                        false
                    }
                }
            }
            RewriteVerdict::Failed(reason) => {
                error!(job = job.id, reason = %reason, "background rewrite failed");
                self.limiter.record_failure();
                self.last_status_ok = false;
                false
            }
            RewriteVerdict::Aborted => {
                warn!(job = job.id, "background rewrite aborted");
                false
            }
        };

        // Scratch files of this job, whatever is left of them.
        let _ = fs::remove_file(layout.segment_path(&Layout::temp_rewrite_name(job.id)));
        let _ = fs::remove_file(layout.segment_path(&Layout::temp_rewrite_done_name(job.id)));

        if writer.state() == WriterState::WaitRewrite {
            // The rewrite that was supposed to switch the writer on did not
            // land: drop the bytes accumulated for it, delete the temporary
            // incremental, and try again.
            writer.discard_buffer();
            bio.submit_unlink(layout.segment_path(&layout.temp_incr_name()));
            self.scheduled = true;
        }
        succeeded
    }

    /// Parent-side commit after a successful dump. Any failure here leaves
    /// the live manifest untouched; renamed files are unlinked best-effort.
    fn install(
        &mut self,
        job: &RewriteJob,
        config: &AofConfig,
        layout: &Layout,
        manifest: &mut Manifest,
        writer: &mut AofWriter,
        bio: &BioPool,
    ) -> AofResult<()> {
        let done_path = layout.segment_path(&Layout::temp_rewrite_done_name(job.id));

        let mut staged = manifest.dup();
        let new_base = staged.new_base_name(layout, config.snapshot_preamble);
        let new_base_path = layout.segment_path(&new_base);
        fs::rename(&done_path, &new_base_path)?;
        info!(base = %new_base, "installed the rewritten base segment");

        let mut renamed_incr: Option<PathBuf> = None;
        if job.writer_was_wait {
            let temp_incr = layout.segment_path(&layout.temp_incr_name());
            let new_incr = staged.new_incr_name(layout);
            let new_incr_path = layout.segment_path(&new_incr);
            if let Err(err) = fs::rename(&temp_incr, &new_incr_path) {
                let _ = fs::remove_file(&new_base_path);
                return Err(err.into());
            }
            info!(incr = %new_incr, "installed the temporary incremental segment");
            renamed_incr = Some(new_incr_path);
        }

        staged.mark_rewritten_incrs_as_history(writer.has_tail());

        let commit = staged
            .refresh_sizes(layout)
            .and_then(|()| staged.persist(layout));
        if let Err(err) = commit {
            let _ = fs::remove_file(&new_base_path);
            if let Some(path) = renamed_incr {
                let _ = fs::remove_file(path);
            }
            return Err(err);
        }

        // Commit point: readers now see the new manifest.
        *manifest = staged;

        for info in manifest.take_history() {
            info!(segment = %info.name, "removing history segment in the background");
            bio.submit_unlink(layout.segment_path(&info.name));
        }
        // The history entries are gone from the active lists; losing this
        // persist only delays their disappearance from the manifest.
        if let Err(err) = manifest.persist(layout) {
            warn!(error = %err, "could not persist the manifest after history deletion");
        }

        if job.writer_was_wait {
            writer.set_state(WriterState::On);
            manifest.set_tail_size(writer.last_incr_size);
            bio.durable().advance(self.fsynced_reploff_pending);
        }
        self.rewrite_base_size = manifest.live_size();
        Ok(())
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the dump thread: serialize the snapshot to the scratch file,
/// make it durable, then rename it to the done name the parent installs.
#[allow(clippy::too_many_arguments)]
fn run_dump(
    snapshot: DatasetSnapshot,
    scratch: PathBuf,
    done: PathBuf,
    now_sec: u64,
    snapshot_preamble: bool,
    codec: Option<Arc<dyn SnapshotCodec>>,
    extensions: Arc<ExtensionRegistry>,
    abort: Arc<AtomicBool>,
) -> RewriteVerdict {
    let result = (|| -> AofResult<DumpOutcome> {
        let file = open_truncate(&scratch)?;
        let outcome = if snapshot_preamble {
            let codec = codec.ok_or_else(|| {
                AofError::Snapshot(
                    "snapshot preamble is enabled but no codec is registered".to_string(),
                )
            })?;
            let mut out = BufWriter::new(&file);
            codec.encode(&snapshot, &mut out)?;
            out.flush()?;
            drop(out);
            DumpOutcome::Completed
        } else {
            dump_snapshot(&snapshot, &file, now_sec, &extensions, Some(abort.as_ref()))?
        };
        if outcome == DumpOutcome::Completed {
            file.sync_data()?;
        }
        drop(file);
        if outcome == DumpOutcome::Completed {
            fs::rename(&scratch, &done)?;
        }
        Ok(outcome)
    })();

    match result {
        Ok(DumpOutcome::Completed) => RewriteVerdict::Success,
        Ok(DumpOutcome::Aborted) => {
            let _ = fs::remove_file(&scratch);
            RewriteVerdict::Aborted
        }
        Err(err) => {
            let _ = fs::remove_file(&scratch);
            RewriteVerdict::Failed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_engages_on_the_third_failure() {
        let mut limiter = RewriteLimiter::default();
        let now = 1_000_000;

        limiter.record_failure();
        assert!(!limiter.limited(now));
        limiter.record_failure();
        assert!(!limiter.limited(now));

        // Third failure: one minute.
        limiter.record_failure();
        assert!(limiter.limited(now));
        assert!(limiter.limited(now + 59_000));
        assert!(!limiter.limited(now + 61_000));

        // Fourth failure: two minutes.
        limiter.record_failure();
        let now = now + 61_000;
        assert!(limiter.limited(now));
        assert!(limiter.limited(now + 119_000));
        assert!(!limiter.limited(now + 121_000));
    }

    #[test]
    fn limiter_delay_caps_at_sixty_minutes() {
        let mut limiter = RewriteLimiter::default();
        for _ in 0..REWRITE_LIMIT_THRESHOLD {
            limiter.record_failure();
        }
        let mut now = 0u64;
        let mut last_delay = 0u64;
        for _ in 0..10 {
            assert!(limiter.limited(now));
            let delay = limiter.next_delay_minutes;
            assert!(delay >= last_delay);
            assert!(delay <= REWRITE_LIMIT_MAX_MINUTES);
            last_delay = delay;
            now += delay * 60_000 + 1;
            assert!(!limiter.limited(now));
            limiter.record_failure();
        }
        assert_eq!(last_delay, REWRITE_LIMIT_MAX_MINUTES);
    }

    #[test]
    fn limiter_resets_on_success() {
        let mut limiter = RewriteLimiter::default();
        for _ in 0..5 {
            limiter.record_failure();
        }
        assert!(limiter.limited(0));
        limiter.reset();
        assert!(!limiter.limited(0));
        assert_eq!(limiter.consecutive_failures(), 0);
    }
}
