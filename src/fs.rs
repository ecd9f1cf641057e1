//! Directory layout and file naming for the AOF subsystem.
//!
//! All segment and manifest files live inside a dedicated subdirectory of
//! the data directory. Every name is derived from the configured basename so
//! that several logical stores can share a parent directory without
//! colliding.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::AofConfig;
use crate::error::AofResult;

pub const BASE_FILE_SUFFIX: &str = ".base";
pub const INCR_FILE_SUFFIX: &str = ".incr";
pub const AOF_FORMAT_SUFFIX: &str = ".aof";
pub const SNAPSHOT_FORMAT_SUFFIX: &str = ".rdb";
pub const MANIFEST_NAME_SUFFIX: &str = ".manifest";
pub const TEMP_FILE_NAME_PREFIX: &str = "temp-";

/// Resolved location of the AOF directory plus every name derivation rule.
#[derive(Debug, Clone)]
pub struct Layout {
    dir: PathBuf,
    legacy_path: PathBuf,
    basename: String,
}

impl Layout {
    pub fn new(config: &AofConfig) -> Self {
        Self {
            dir: config.data_dir.join(&config.dirname),
            legacy_path: config.data_dir.join(&config.basename),
            basename: config.basename.clone(),
        }
    }

    /// Creates the AOF directory if missing.
    pub fn ensure(&self) -> AofResult<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Location of the pre-directory single-file log, if one exists.
    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    pub fn manifest_name(&self) -> String {
        format!("{}{MANIFEST_NAME_SUFFIX}", self.basename)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(self.manifest_name())
    }

    pub fn temp_manifest_path(&self) -> PathBuf {
        self.dir
            .join(format!("{TEMP_FILE_NAME_PREFIX}{}", self.manifest_name()))
    }

    /// `<basename>.<seq>.base.aof` or `.rdb` depending on the encoding.
    pub fn base_file_name(&self, seq: u64, snapshot_format: bool) -> String {
        let format_suffix = if snapshot_format {
            SNAPSHOT_FORMAT_SUFFIX
        } else {
            AOF_FORMAT_SUFFIX
        };
        format!(
            "{}.{seq}{BASE_FILE_SUFFIX}{format_suffix}",
            self.basename
        )
    }

    /// `<basename>.<seq>.incr.aof`.
    pub fn incr_file_name(&self, seq: u64) -> String {
        format!(
            "{}.{seq}{INCR_FILE_SUFFIX}{AOF_FORMAT_SUFFIX}",
            self.basename
        )
    }

    /// Name of the temporary incremental segment used while a rewrite has
    /// the writer pinned in the wait state.
    pub fn temp_incr_name(&self) -> String {
        format!("{TEMP_FILE_NAME_PREFIX}{}{INCR_FILE_SUFFIX}", self.basename)
    }

    /// Scratch output of a running rewrite job.
    pub fn temp_rewrite_name(job_id: u64) -> String {
        format!("{TEMP_FILE_NAME_PREFIX}rewriteaof-{job_id}{AOF_FORMAT_SUFFIX}")
    }

    /// Finished rewrite output awaiting installation as the new base.
    pub fn temp_rewrite_done_name(job_id: u64) -> String {
        format!("{TEMP_FILE_NAME_PREFIX}rewriteaof-bg-{job_id}{AOF_FORMAT_SUFFIX}")
    }

    /// Absolute path of a segment identified by its basename-only name.
    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Size of a segment file, or `None` when it does not exist.
    pub fn segment_size(&self, name: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.segment_path(name)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Fsync the directory containing `path` so a rename inside it survives a
/// crash. No-op on platforms without directory fsync semantics.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let handle = File::open(dir)?;
    handle.sync_all()
}

/// Writes `src` durably over `dst`: fsync the source file, rename it into
/// place, then fsync the parent directory. The rename is the commit point.
pub fn durable_rename(src: &Path, dst: &Path) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(src)?;
    file.sync_data()?;
    drop(file);
    fs::rename(src, dst)?;
    fsync_dir(dst)
}

/// Opens a segment for appending, creating it when missing.
pub fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Opens a fresh segment for writing, truncating any stale leftover.
pub fn open_truncate(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Deletes a scratch file on drop unless the caller disarms it after the
/// file has been renamed or otherwise taken over.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file now has a new owner; do not delete it.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
