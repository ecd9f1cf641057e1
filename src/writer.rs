//! The foreground writer: buffers propagated commands and flushes them to
//! the tail incremental segment under the configured fsync policy.
//!
//! The writer is single-owner state driven by the store's event loop. It
//! never blocks on a background fsync; under `EverySec` it postpones the
//! write for up to two seconds while one is in flight, then writes anyway
//! and counts the delay.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bio::BioPool;
use crate::config::{AofConfig, FsyncPolicy};
use crate::error::{is_retryable_io_error, AofResult};
use crate::framing::{encode_command, encode_select, encode_timestamp_annotation};
use crate::fs::{open_append, open_truncate, Layout};
use crate::manifest::Manifest;

/// How long a flush may be postponed while a background fsync runs.
const FLUSH_POSTPONE_LIMIT_MS: u64 = 2000;

/// Seconds between repeated write-error log lines.
const WRITE_ERROR_LOG_INTERVAL_MS: u64 = 30_000;

/// Reuse the append buffer only while its capacity stays small.
const BUF_SHRINK_THRESHOLD: usize = 4096;

/// Lifecycle state of the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Not appending; commands are not recorded.
    Off,
    /// Appending to a manifest-installed tail incremental.
    On,
    /// Enabled but waiting for the initial rewrite: commands accumulate in
    /// a temporary incremental whose name is assigned when the rewrite
    /// lands.
    WaitRewrite,
}

/// Buffered writer over the tail incremental segment.
pub struct AofWriter {
    state: WriterState,
    tail: Option<Arc<File>>,
    buf: Vec<u8>,
    pub(crate) last_incr_size: u64,
    pub(crate) last_incr_fsync_offset: u64,
    pub(crate) last_fsync_ms: u64,
    pub(crate) postponed_flush_start_ms: u64,
    selected_db: i64,
    last_write_status_ok: bool,
    last_write_error_log_ms: u64,
    delayed_fsyncs: u64,
    last_ts_sec: u64,
    /// Byte watermark of successfully written log bytes; fsync completions
    /// publish it as the durable offset.
    repl_offset: u64,
    always_fsync_skip_warned: bool,
}

impl AofWriter {
    pub fn new() -> Self {
        Self {
            state: WriterState::Off,
            tail: None,
            buf: Vec::new(),
            last_incr_size: 0,
            last_incr_fsync_offset: 0,
            last_fsync_ms: 0,
            postponed_flush_start_ms: 0,
            selected_db: -1,
            last_write_status_ok: true,
            last_write_error_log_ms: 0,
            delayed_fsyncs: 0,
            last_ts_sec: 0,
            repl_offset: 0,
            always_fsync_skip_warned: false,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WriterState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state != WriterState::Off
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn last_write_ok(&self) -> bool {
        self.last_write_status_ok
    }

    pub fn delayed_fsyncs(&self) -> u64 {
        self.delayed_fsyncs
    }

    /// Watermark of bytes handed to the kernel so far.
    pub fn pending_repl_offset(&self) -> u64 {
        self.repl_offset
    }

    /// Forces the next fed command to be preceded by a `SELECT`.
    pub(crate) fn force_select(&mut self) {
        self.selected_db = -1;
    }

    /// Allows the once-per-rewrite `Always`-skip warning to fire again.
    pub(crate) fn rearm_fsync_skip_warning(&mut self) {
        self.always_fsync_skip_warned = false;
    }

    /// Forgets a recorded write error, e.g. when the log is re-enabled.
    pub(crate) fn reset_error_flags(&mut self) {
        if !self.last_write_status_ok {
            warn!("reopening the log; ignoring the previous write error");
            self.last_write_status_ok = true;
        }
    }

    /// Encodes one propagated command into the append buffer.
    ///
    /// While the writer waits for its initial rewrite the buffer only
    /// accumulates if that rewrite is actually running: bytes buffered with
    /// no rewrite in flight would belong to no segment, and the next
    /// rewrite's snapshot covers them anyway.
    pub fn feed_command(
        &mut self,
        config: &AofConfig,
        db: u32,
        argv: &[impl AsRef<[u8]>],
        rewrite_active: bool,
        now_ms: u64,
    ) {
        if self.state == WriterState::Off {
            return;
        }
        let mut chunk = Vec::new();
        if config.timestamp_annotations {
            let now_sec = now_ms / 1000;
            if now_sec > self.last_ts_sec {
                self.last_ts_sec = now_sec;
                encode_timestamp_annotation(&mut chunk, now_sec);
            }
        }
        if i64::from(db) != self.selected_db {
            encode_select(&mut chunk, db);
            self.selected_db = i64::from(db);
        }
        encode_command(&mut chunk, argv);

        if self.state == WriterState::On
            || (self.state == WriterState::WaitRewrite && rewrite_active)
        {
            self.buf.extend_from_slice(&chunk);
        }
    }

    /// Flushes the append buffer to the tail segment and runs the fsync
    /// stage per the configured policy.
    ///
    /// With `force` unset, an `EverySec` flush is postponed while a
    /// background fsync is in flight, for at most two seconds.
    pub fn flush(
        &mut self,
        config: &AofConfig,
        manifest: &mut Manifest,
        bio: &BioPool,
        force: bool,
        rewrite_active: bool,
        now_ms: u64,
    ) {
        let Some(tail) = self.tail.clone() else {
            return;
        };

        let mut sync_in_progress = false;
        if self.buf.is_empty() {
            // Even with nothing buffered an fsync may be due: writes may
            // have stopped right after a flush that could not sync yet.
            let everysec_due = config.fsync == FsyncPolicy::EverySec
                && self.last_incr_fsync_offset != self.last_incr_size
                && now_ms.saturating_sub(self.last_fsync_ms) >= 1000
                && {
                    sync_in_progress = bio.fsync_in_flight();
                    !sync_in_progress
                };
            let always_due = config.fsync == FsyncPolicy::Always
                && self.last_incr_fsync_offset != self.last_incr_size;
            if !everysec_due && !always_due {
                if !sync_in_progress
                    && config.fsync != FsyncPolicy::Never
                    && self.last_incr_fsync_offset == self.last_incr_size
                {
                    // Everything written is synced; keep the published
                    // watermark caught up with the append watermark.
                    bio.durable().advance(self.repl_offset);
                }
                return;
            }
            self.fsync_stage(config, bio, &tail, false, rewrite_active, now_ms);
            return;
        }

        if config.fsync == FsyncPolicy::EverySec {
            sync_in_progress = bio.fsync_in_flight();
        }
        if config.fsync == FsyncPolicy::EverySec && sync_in_progress && !force {
            if self.postponed_flush_start_ms == 0 {
                self.postponed_flush_start_ms = now_ms;
                return;
            }
            if now_ms.saturating_sub(self.postponed_flush_start_ms) < FLUSH_POSTPONE_LIMIT_MS {
                return;
            }
            self.delayed_fsyncs += 1;
            info!(
                "asynchronous AOF fsync is taking too long (disk is busy?); \
                 writing the buffer without waiting for it"
            );
        }
        self.postponed_flush_start_ms = 0;

        let (mut written, write_error) = write_retrying(&tail, &self.buf);
        if written != self.buf.len() as u64 {
            let can_log =
                now_ms.saturating_sub(self.last_write_error_log_ms) > WRITE_ERROR_LOG_INTERVAL_MS;
            if can_log {
                self.last_write_error_log_ms = now_ms;
            }
            if written == 0 {
                if can_log {
                    if let Some(err) = &write_error {
                        error!(error = %err, "error writing to the AOF tail segment");
                    }
                }
            } else {
                if can_log {
                    warn!(
                        written,
                        expected = self.buf.len(),
                        "short write on the AOF tail segment"
                    );
                }
                // Cut the partial tail back to the last known-good size so
                // the segment ends at a command boundary again.
                match tail.set_len(self.last_incr_size) {
                    Ok(()) => written = 0,
                    Err(err) => {
                        if can_log {
                            warn!(
                                error = %err,
                                "could not remove the short write from the tail segment; \
                                 the next load may need truncated-load tolerance"
                            );
                        }
                        // The partial bytes are now part of the segment.
                        self.account_written(manifest, written);
                        self.buf.drain(..written as usize);
                    }
                }
            }

            if config.fsync == FsyncPolicy::Always {
                abort_on_durability_loss("write", write_error.as_ref());
            }
            self.last_write_status_ok = false;
            return;
        }

        if !self.last_write_status_ok {
            info!("AOF write error looks solved; appending resumed");
            self.last_write_status_ok = true;
        }
        self.account_written(manifest, written);
        if self.buf.capacity() > BUF_SHRINK_THRESHOLD {
            self.buf = Vec::new();
        } else {
            self.buf.clear();
        }

        self.fsync_stage(config, bio, &tail, sync_in_progress, rewrite_active, now_ms);
    }

    fn account_written(&mut self, manifest: &mut Manifest, written: u64) {
        self.last_incr_size += written;
        self.repl_offset += written;
        if self.state == WriterState::On {
            // The temporary incremental of the wait state is not in the
            // manifest, so only the installed tail is accounted there.
            manifest.add_tail_size(written);
        }
    }

    fn fsync_stage(
        &mut self,
        config: &AofConfig,
        bio: &BioPool,
        tail: &Arc<File>,
        sync_in_progress: bool,
        rewrite_active: bool,
        now_ms: u64,
    ) {
        if config.no_fsync_on_rewrite && rewrite_active {
            if config.fsync == FsyncPolicy::Always && !self.always_fsync_skip_warned {
                self.always_fsync_skip_warned = true;
                warn!(
                    "no-fsync-on-rewrite is suppressing fsync under the always policy \
                     while a rewrite runs; acknowledged writes are not yet durable"
                );
            }
            return;
        }
        match config.fsync {
            FsyncPolicy::Always => {
                if let Err(err) = tail.sync_data() {
                    abort_on_durability_loss("fsync", Some(&err));
                }
                self.last_incr_fsync_offset = self.last_incr_size;
                self.last_fsync_ms = now_ms;
                bio.durable().advance(self.repl_offset);
            }
            FsyncPolicy::EverySec => {
                if now_ms.saturating_sub(self.last_fsync_ms) >= 1000 {
                    if !sync_in_progress && !bio.fsync_in_flight() {
                        bio.submit_fsync(tail.clone(), self.repl_offset);
                        self.last_incr_fsync_offset = self.last_incr_size;
                    }
                    self.last_fsync_ms = now_ms;
                }
            }
            FsyncPolicy::Never => {}
        }
    }

    /// Rotates the writer onto a fresh incremental segment.
    ///
    /// In the `On` state this allocates a new manifest name, persists the
    /// staged manifest, and only then swaps it in and moves the fd; the old
    /// tail is fsynced and closed in the background. In `WaitRewrite` the
    /// new segment is a temporary file named by the rewriter on success and
    /// the manifest is untouched.
    pub fn open_new_incr_for_append(
        &mut self,
        layout: &Layout,
        manifest: &mut Manifest,
        bio: &BioPool,
        now_ms: u64,
    ) -> AofResult<()> {
        if self.state == WriterState::Off {
            return Ok(());
        }

        let staged: Option<Manifest>;
        let new_file: File;
        let name: String;
        if self.state == WriterState::WaitRewrite {
            name = layout.temp_incr_name();
            new_file = open_truncate(&layout.segment_path(&name))?;
            staged = None;
        } else {
            let mut candidate = manifest.dup();
            name = candidate.new_incr_name(layout);
            new_file = open_truncate(&layout.segment_path(&name))?;
            candidate.persist(layout)?;
            staged = Some(candidate);
        }
        info!(segment = %name, "created new incremental segment");

        if let Some(staged) = staged {
            *manifest = staged;
        }
        if let Some(old) = self.tail.take() {
            // Fsync must precede close so no buffered byte of the old tail
            // can be lost to reordering.
            bio.submit_fsync_close(old, self.repl_offset);
            self.last_fsync_ms = now_ms;
        }
        self.tail = Some(Arc::new(new_file));
        self.last_incr_size = 0;
        self.last_incr_fsync_offset = 0;
        Ok(())
    }

    /// Opens the tail incremental for appending on process start, creating
    /// one when the manifest has none, and persists the manifest.
    pub fn open_on_start(
        &mut self,
        layout: &Layout,
        manifest: &mut Manifest,
        now_ms: u64,
    ) -> AofResult<()> {
        let existing = manifest.tail_incr().is_some();
        let name = manifest.last_incr_name(layout);
        let path = layout.segment_path(&name);
        let file = open_append(&path)?;
        manifest.persist(layout)?;

        self.last_incr_size = file.metadata()?.len();
        self.last_incr_fsync_offset = self.last_incr_size;
        manifest.set_tail_size(self.last_incr_size);
        self.tail = Some(Arc::new(file));
        self.state = WriterState::On;
        self.last_fsync_ms = now_ms;
        if existing {
            info!(segment = %name, "opened tail incremental segment on start");
        } else {
            info!(segment = %name, "created tail incremental segment on start");
        }
        Ok(())
    }

    /// Stops appending: final flush, synchronous fsync, close.
    pub fn stop(
        &mut self,
        config: &AofConfig,
        manifest: &mut Manifest,
        bio: &BioPool,
        now_ms: u64,
    ) {
        if self.state == WriterState::Off {
            return;
        }
        self.flush(config, manifest, bio, true, false, now_ms);
        if let Some(tail) = self.tail.take() {
            if let Err(err) = tail.sync_data() {
                warn!(error = %err, "failed to fsync the tail segment while stopping");
            }
        }
        self.state = WriterState::Off;
        self.selected_db = -1;
        self.last_incr_size = 0;
        self.last_incr_fsync_offset = 0;
        self.postponed_flush_start_ms = 0;
        self.buf = Vec::new();
        info!("append-only writer stopped");
    }

    /// Drops bytes accumulated for a rewrite that did not land.
    pub(crate) fn discard_buffer(&mut self) {
        self.buf = Vec::new();
    }

    pub(crate) fn has_tail(&self) -> bool {
        self.tail.is_some()
    }
}

impl Default for AofWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the whole buffer, retrying interrupted and transiently failing
/// writes in place. Returns the byte count written plus the terminal error,
/// if any.
fn write_retrying(file: &File, buf: &[u8]) -> (u64, Option<io::Error>) {
    let mut out: &File = file;
    let mut written: usize = 0;
    while written < buf.len() {
        match out.write(&buf[written..]) {
            Ok(0) => {
                return (
                    written as u64,
                    Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned zero bytes",
                    )),
                );
            }
            Ok(n) => written += n,
            Err(err) if is_retryable_io_error(&err) => continue,
            Err(err) => return (written as u64, Some(err)),
        }
    }
    (written as u64, None)
}

/// A write or fsync failed under the `Always` policy. Clients have already
/// been acknowledged on the promise those bytes were durable; continuing
/// would silently break that contract, so the process ends here.
fn abort_on_durability_loss(op: &str, err: Option<&io::Error>) -> ! {
    match err {
        Some(err) => error!(
            error = %err,
            "can't recover from AOF {op} error under the always fsync policy; exiting"
        ),
        None => error!(
            "can't recover from AOF {op} error under the always fsync policy; exiting"
        ),
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::DurableOffset;
    use std::fs;
    use tempfile::TempDir;

    struct Rig {
        config: AofConfig,
        layout: Layout,
        manifest: Manifest,
        bio: BioPool,
        writer: AofWriter,
        _tmp: TempDir,
    }

    fn rig(fsync: FsyncPolicy) -> Rig {
        let tmp = TempDir::new().expect("tempdir");
        let config = AofConfig {
            data_dir: tmp.path().to_path_buf(),
            fsync,
            ..AofConfig::default()
        };
        let layout = Layout::new(&config);
        layout.ensure().expect("ensure");
        let mut manifest = Manifest::empty();
        let bio = BioPool::new(DurableOffset::new());
        let mut writer = AofWriter::new();
        writer
            .open_on_start(&layout, &mut manifest, 0)
            .expect("open on start");
        Rig {
            config,
            layout,
            manifest,
            bio,
            writer,
            _tmp: tmp,
        }
    }

    fn tail_contents(rig: &Rig) -> Vec<u8> {
        let name = rig.manifest.tail_incr().expect("tail").name.clone();
        fs::read(rig.layout.segment_path(&name)).expect("read tail")
    }

    #[test]
    fn feed_prepends_select_on_db_change() {
        let mut rig = rig(FsyncPolicy::Always);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], false, 1000);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v2"], false, 1000);
        rig.writer
            .feed_command(&rig.config, 2, &[b"SET".as_slice(), b"j", b"w"], false, 1000);
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 1000);

        let contents = tail_contents(&rig);
        let text = String::from_utf8_lossy(&contents);
        let first_select = text.find("SELECT").expect("first select");
        let second_select = text.rfind("SELECT").expect("second select");
        assert_ne!(first_select, second_select, "one SELECT per db change");
        assert!(text.contains("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"));
    }

    #[test]
    fn timestamp_annotations_emitted_once_per_second() {
        let mut rig = rig(FsyncPolicy::Always);
        rig.config.timestamp_annotations = true;
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"a", b"1"], false, 5000);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"b", b"2"], false, 5400);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"c", b"3"], false, 6100);
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 6100);

        let contents = tail_contents(&rig);
        let text = String::from_utf8_lossy(&contents);
        assert_eq!(text.matches("#TS:5\r\n").count(), 1);
        assert_eq!(text.matches("#TS:6\r\n").count(), 1);
    }

    #[test]
    fn always_policy_publishes_durable_offset_synchronously() {
        let mut rig = rig(FsyncPolicy::Always);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], false, 1000);
        let buffered = rig.writer.buffered_bytes() as u64;
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 1000);

        assert_eq!(rig.writer.buffered_bytes(), 0);
        assert_eq!(rig.writer.last_incr_size, buffered);
        assert_eq!(rig.bio.durable().get(), buffered);
        assert_eq!(rig.manifest.tail_incr().expect("tail").size, buffered);
    }

    #[test]
    fn everysec_coalesces_fsyncs_by_time() {
        let mut rig = rig(FsyncPolicy::EverySec);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], false, 1000);
        // First flush at t=1000 with last_fsync_ms=0 submits a background
        // fsync and stamps the time.
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 1000);
        assert_eq!(rig.writer.last_fsync_ms, 1000);
        rig.bio.drain();

        // 500 ms later: writes flush but no new fsync is due.
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v2"], false, 1500);
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 1500);
        assert_eq!(rig.writer.last_fsync_ms, 1000);
        assert!(rig.writer.last_incr_fsync_offset < rig.writer.last_incr_size);

        // Past the second boundary the pending bytes get their fsync even
        // with an empty buffer.
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 2100);
        assert_eq!(rig.writer.last_fsync_ms, 2100);
        assert_eq!(rig.writer.last_incr_fsync_offset, rig.writer.last_incr_size);
        rig.bio.drain();
        assert_eq!(rig.bio.durable().get(), rig.writer.pending_repl_offset());
    }

    #[test]
    fn postponed_flush_gives_up_after_two_seconds() {
        let mut rig = rig(FsyncPolicy::EverySec);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], false, 1000);
        let before = rig.writer.delayed_fsyncs();

        // First postponement stamps the clock but must not write.
        rig.writer
            .flush_postponed_for_test(&rig.config, &mut rig.manifest, &rig.bio, 1000);
        assert_eq!(rig.writer.postponed_flush_start_ms, 1000);
        assert!(rig.writer.buffered_bytes() > 0);

        // Still inside the window.
        rig.writer
            .flush_postponed_for_test(&rig.config, &mut rig.manifest, &rig.bio, 2500);
        assert!(rig.writer.buffered_bytes() > 0);

        // Past the window the writer pushes through and counts the delay.
        rig.writer
            .flush_postponed_for_test(&rig.config, &mut rig.manifest, &rig.bio, 3200);
        assert_eq!(rig.writer.buffered_bytes(), 0);
        assert_eq!(rig.writer.delayed_fsyncs(), before + 1);
    }

    #[test]
    fn rotation_installs_a_new_tail_and_persists() {
        let mut rig = rig(FsyncPolicy::EverySec);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], false, 1000);
        rig.writer
            .flush(&rig.config, &mut rig.manifest, &rig.bio, false, false, 1000);
        let first_seq = rig.manifest.tail_incr().expect("tail").seq;

        rig.writer
            .open_new_incr_for_append(&rig.layout, &mut rig.manifest, &rig.bio, 1000)
            .expect("rotate");
        assert_eq!(rig.writer.last_incr_size, 0);
        assert_eq!(rig.writer.last_incr_fsync_offset, 0);
        let tail = rig.manifest.tail_incr().expect("tail");
        assert_eq!(tail.seq, first_seq + 1);
        assert!(rig.layout.segment_path(&tail.name).exists());

        // The persisted manifest on disk lists both incrementals.
        let reloaded = Manifest::load(&rig.layout.manifest_path()).expect("reload");
        assert_eq!(reloaded.incrs().count(), 2);
    }

    #[test]
    fn wait_rewrite_rotation_opens_a_temp_incr_without_manifest_changes() {
        let mut rig = rig(FsyncPolicy::EverySec);
        rig.writer.set_state(WriterState::WaitRewrite);
        let incrs_before = rig.manifest.incrs().count();
        rig.writer
            .open_new_incr_for_append(&rig.layout, &mut rig.manifest, &rig.bio, 1000)
            .expect("rotate to temp");
        assert_eq!(rig.manifest.incrs().count(), incrs_before);
        assert!(rig
            .layout
            .segment_path(&rig.layout.temp_incr_name())
            .exists());
    }

    #[test]
    fn wait_rewrite_buffers_only_while_a_rewrite_runs() {
        let mut rig = rig(FsyncPolicy::EverySec);
        rig.writer.set_state(WriterState::WaitRewrite);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], false, 1000);
        assert_eq!(rig.writer.buffered_bytes(), 0);
        rig.writer
            .feed_command(&rig.config, 0, &[b"SET".as_slice(), b"k", b"v"], true, 1000);
        assert!(rig.writer.buffered_bytes() > 0);
    }

    impl AofWriter {
        /// Drives `flush` while pretending a background fsync is in flight,
        /// exercising the postponement path deterministically.
        fn flush_postponed_for_test(
            &mut self,
            config: &AofConfig,
            manifest: &mut Manifest,
            bio: &BioPool,
            now_ms: u64,
        ) {
            debug_assert_eq!(config.fsync, FsyncPolicy::EverySec);
            if self.postponed_flush_start_ms == 0 {
                self.postponed_flush_start_ms = now_ms;
                return;
            }
            if now_ms.saturating_sub(self.postponed_flush_start_ms) < FLUSH_POSTPONE_LIMIT_MS {
                return;
            }
            self.delayed_fsyncs += 1;
            self.postponed_flush_start_ms = 0;
            self.flush(config, manifest, bio, true, false, now_ms);
        }
    }
}
