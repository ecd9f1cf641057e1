//! Background I/O pool consumed by the writer and the rewriter.
//!
//! Three job kinds exist: fsync a segment, fsync then close it, and unlink
//! a file. Jobs run on one named worker thread so their order is the
//! submission order; in particular the fsync half of a fsync-and-close
//! always happens before the close, and nothing can reorder a close ahead
//! of writes already handed to the kernel.
//!
//! Ownership of a file handle transfers at the point of enqueue. Fsync
//! completions publish the replication offset associated with the job as
//! durably synced.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

/// Monotonic watermark of bytes known to be durably synced.
///
/// Advancing is a compare-exchange max so completions arriving out of order
/// can never move the offset backwards.
#[derive(Debug, Default)]
pub struct DurableOffset {
    fsynced: AtomicU64,
}

impl DurableOffset {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes `offset` as durable if it is ahead of the current value.
    pub fn advance(&self, offset: u64) {
        let mut current = self.fsynced.load(Ordering::Acquire);
        while current < offset {
            match self.fsynced.compare_exchange(
                current,
                offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self) -> u64 {
        self.fsynced.load(Ordering::Acquire)
    }

    /// Rewinds the watermark. Only used when the log identity changes
    /// (enabling the writer against a fresh incremental history).
    pub fn reset(&self) {
        self.fsynced.store(0, Ordering::Release);
    }
}

enum BioJob {
    Fsync { file: Arc<File>, repl_offset: u64 },
    FsyncClose { file: Arc<File>, repl_offset: u64 },
    Unlink { path: PathBuf },
    Barrier { done: Sender<()> },
    Shutdown,
}

/// Handle to the background I/O worker.
pub struct BioPool {
    command_tx: Sender<BioJob>,
    pending_fsyncs: Arc<AtomicU64>,
    fsync_status_ok: Arc<AtomicBool>,
    durable: Arc<DurableOffset>,
}

impl BioPool {
    pub fn new(durable: Arc<DurableOffset>) -> Self {
        let (tx, rx) = unbounded();
        let pending_fsyncs = Arc::new(AtomicU64::new(0));
        let fsync_status_ok = Arc::new(AtomicBool::new(true));
        Self::spawn_worker(
            rx,
            pending_fsyncs.clone(),
            fsync_status_ok.clone(),
            durable.clone(),
        );
        Self {
            command_tx: tx,
            pending_fsyncs,
            fsync_status_ok,
            durable,
        }
    }

    pub fn durable(&self) -> &Arc<DurableOffset> {
        &self.durable
    }

    /// Queues a background fsync of `file`, publishing `repl_offset` as
    /// durable on completion.
    pub fn submit_fsync(&self, file: Arc<File>, repl_offset: u64) {
        self.pending_fsyncs.fetch_add(1, Ordering::AcqRel);
        if self
            .command_tx
            .send(BioJob::Fsync { file, repl_offset })
            .is_err()
        {
            self.pending_fsyncs.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Queues an fsync followed by a close of `file`. The handle is dropped
    /// on the worker after the sync completes, so buffered bytes cannot be
    /// lost to a close racing ahead of them.
    pub fn submit_fsync_close(&self, file: Arc<File>, repl_offset: u64) {
        let _ = self.command_tx.send(BioJob::FsyncClose { file, repl_offset });
    }

    /// Queues deletion of `path`. Failure is logged and otherwise ignored.
    pub fn submit_unlink(&self, path: PathBuf) {
        let _ = self.command_tx.send(BioJob::Unlink { path });
    }

    /// True while a plain fsync job is queued or running. Fsync-and-close
    /// jobs are not counted: they always belong to a segment the writer has
    /// already rotated away from.
    pub fn fsync_in_flight(&self) -> bool {
        self.pending_fsyncs.load(Ordering::Acquire) != 0
    }

    /// Blocks until every job submitted so far has completed.
    pub fn drain(&self) {
        let (done_tx, done_rx) = bounded(1);
        if self.command_tx.send(BioJob::Barrier { done: done_tx }).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Outcome of the most recent background fsync.
    pub fn fsync_status_ok(&self) -> bool {
        self.fsync_status_ok.load(Ordering::Acquire)
    }

    /// Forgets a recorded background fsync error, e.g. when the writer is
    /// re-enabled against a fresh segment.
    pub fn clear_fsync_error(&self) {
        self.fsync_status_ok.store(true, Ordering::Release);
    }

    fn spawn_worker(
        rx: Receiver<BioJob>,
        pending_fsyncs: Arc<AtomicU64>,
        fsync_status_ok: Arc<AtomicBool>,
        durable: Arc<DurableOffset>,
    ) {
        let _ = thread::Builder::new()
            .name("aof-bio".to_string())
            .spawn(move || Self::worker_loop(rx, pending_fsyncs, fsync_status_ok, durable));
    }

    fn worker_loop(
        rx: Receiver<BioJob>,
        pending_fsyncs: Arc<AtomicU64>,
        fsync_status_ok: Arc<AtomicBool>,
        durable: Arc<DurableOffset>,
    ) {
        while let Ok(job) = rx.recv() {
            match job {
                BioJob::Fsync { file, repl_offset } => {
                    match file.sync_data() {
                        Ok(()) => {
                            fsync_status_ok.store(true, Ordering::Release);
                            durable.advance(repl_offset);
                            debug!(repl_offset, "background fsync completed");
                        }
                        Err(err) => {
                            fsync_status_ok.store(false, Ordering::Release);
                            error!(error = %err, "background fsync failed");
                        }
                    }
                    pending_fsyncs.fetch_sub(1, Ordering::AcqRel);
                }
                BioJob::FsyncClose { file, repl_offset } => {
                    match file.sync_data() {
                        Ok(()) => {
                            durable.advance(repl_offset);
                            debug!(repl_offset, "fsync-and-close completed");
                        }
                        Err(err) => {
                            fsync_status_ok.store(false, Ordering::Release);
                            error!(error = %err, "fsync before close failed");
                        }
                    }
                    drop(file);
                }
                BioJob::Unlink { path } => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %err, "background unlink failed");
                        }
                    } else {
                        debug!(path = %path.display(), "removed file in the background");
                    }
                }
                BioJob::Barrier { done } => {
                    let _ = done.send(());
                }
                BioJob::Shutdown => break,
            }
        }
    }
}

impl Drop for BioPool {
    fn drop(&mut self) {
        let _ = self.command_tx.send(BioJob::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn fsync_jobs_publish_the_durable_offset() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("segment");
        let mut file = File::create(&path).expect("create");
        file.write_all(b"payload").expect("write");

        let durable = DurableOffset::new();
        let pool = BioPool::new(durable.clone());
        pool.submit_fsync(Arc::new(file), 7);
        pool.drain();

        assert!(!pool.fsync_in_flight());
        assert!(pool.fsync_status_ok());
        assert_eq!(durable.get(), 7);
    }

    #[test]
    fn durable_offset_never_goes_backwards() {
        let durable = DurableOffset::new();
        durable.advance(100);
        durable.advance(50);
        assert_eq!(durable.get(), 100);
        durable.advance(150);
        assert_eq!(durable.get(), 150);
    }

    #[test]
    fn unlink_jobs_remove_files() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("victim");
        std::fs::write(&path, b"x").expect("write");

        let pool = BioPool::new(DurableOffset::new());
        pool.submit_unlink(path.clone());
        pool.drain();
        assert!(!path.exists());
    }

    #[test]
    fn fsync_close_also_publishes() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("old-tail");
        let mut file = File::create(&path).expect("create");
        file.write_all(b"tail bytes").expect("write");

        let durable = DurableOffset::new();
        let pool = BioPool::new(durable.clone());
        pool.submit_fsync_close(Arc::new(file), 42);
        pool.drain();
        assert_eq!(durable.get(), 42);
    }
}
