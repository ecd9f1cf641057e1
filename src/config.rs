use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AofError, AofResult};

/// Default growth percentage that triggers an automatic rewrite.
const DEFAULT_REWRITE_PERCENTAGE: u64 = 100;

/// Default minimum log size before automatic rewrites are considered (64 MiB).
///
/// Below this size a rewrite buys little and the churn of manifest updates
/// dominates, so automatic triggering waits for the log to become worth
/// collapsing.
const DEFAULT_REWRITE_MIN_SIZE: u64 = 64 * 1024 * 1024;

/// When to fsync appended bytes to stable storage.
///
/// `Always` fsyncs before the caller regains control, `EverySec` coalesces
/// fsyncs onto a background worker roughly once per second, and `Never`
/// leaves flushing entirely to the operating system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// Fsync after every flushed write. Strongest guarantee, slowest.
    Always,
    /// Fsync at most once per second via the background pool.
    #[default]
    EverySec,
    /// Never fsync explicitly; the OS decides when data hits the platter.
    Never,
}

/// Configuration of the append-only-file subsystem.
///
/// The struct is plain data: construct it, adjust fields, then pass it
/// through [`AofConfig::normalized`] which validates the invariants the
/// rest of the crate relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AofConfig {
    /// Data directory under which the AOF directory is created.
    pub data_dir: PathBuf,
    /// Name of the dedicated AOF subdirectory inside `data_dir`.
    pub dirname: String,
    /// Stem used for every segment and manifest file name.
    pub basename: String,
    /// Durability policy applied by the writer's flush path.
    pub fsync: FsyncPolicy,
    /// Tolerate a truncated tail segment on load by cutting it back to the
    /// last well-formed command instead of refusing to start.
    pub load_truncated: bool,
    /// Emit `#TS:<epoch>` annotations when the wall-clock second advances.
    pub timestamp_annotations: bool,
    /// Skip the fsync stage entirely while a rewrite is running.
    ///
    /// This also applies under [`FsyncPolicy::Always`], weakening its
    /// guarantee for the duration of the rewrite: acknowledged writes may sit
    /// unsynced in the page cache until the rewrite finishes. The skip is
    /// logged once per rewrite when it suppresses an `Always` fsync.
    pub no_fsync_on_rewrite: bool,
    /// Growth percentage over the size at the last rewrite that triggers an
    /// automatic rewrite. Zero disables automatic triggering.
    pub rewrite_percentage: u64,
    /// Minimum total log size before automatic rewrites are considered.
    pub rewrite_min_size: u64,
    /// Encode the base segment with the registered snapshot codec instead of
    /// the textual command format.
    pub snapshot_preamble: bool,
    /// Number of databases commands may target.
    pub databases: u32,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            dirname: "appendonlydir".to_string(),
            basename: "appendonly.aof".to_string(),
            fsync: FsyncPolicy::default(),
            load_truncated: true,
            timestamp_annotations: false,
            no_fsync_on_rewrite: false,
            rewrite_percentage: DEFAULT_REWRITE_PERCENTAGE,
            rewrite_min_size: DEFAULT_REWRITE_MIN_SIZE,
            snapshot_preamble: false,
            databases: 16,
        }
    }
}

impl AofConfig {
    /// Validates the configuration and returns it unchanged on success.
    ///
    /// File name components must be bare names: anything containing a path
    /// separator would escape the AOF directory and break the manifest's
    /// basename-only contract.
    pub fn normalized(self) -> AofResult<Self> {
        if self.dirname.is_empty() || !is_base_name(&self.dirname) {
            return Err(AofError::invalid_config(format!(
                "dirname must be a bare directory name, got {:?}",
                self.dirname
            )));
        }
        if self.basename.is_empty() || !is_base_name(&self.basename) {
            return Err(AofError::invalid_config(format!(
                "basename must be a bare file name, got {:?}",
                self.basename
            )));
        }
        if self.databases == 0 {
            return Err(AofError::invalid_config("databases must be at least 1"));
        }
        Ok(self)
    }
}

/// True when `name` contains no path separators.
pub(crate) fn is_base_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\')
}
