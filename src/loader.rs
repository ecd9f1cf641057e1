//! Startup replay: reconstructs the dataset by replaying the manifest's
//! base and incremental segments, in order, into a [`ReplaySink`].
//!
//! Replay is strict about content and lenient about endings: an unknown
//! command or malformed bytes in the middle of the log are fatal, while a
//! torn tail on the final segment can be truncated back to the last
//! well-formed command boundary when `load_truncated` is enabled.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read};

use tracing::{error, info, warn};

use crate::config::AofConfig;
use crate::dataset::{ReplaySink, SnapshotCodec, SNAPSHOT_MAGIC};
use crate::error::AofResult;
use crate::framing::{CommandReader, FrameError};
use crate::fs::{fsync_dir, Layout};
use crate::manifest::Manifest;

/// Aggregate result of replaying the whole manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Every segment replayed cleanly.
    Ok,
    /// The final segment was cut back to its last command boundary.
    Truncated,
    /// Segments exist but contain no data.
    Empty,
    /// The manifest references no live segments.
    NotExist,
    /// A referenced segment could not be opened.
    OpenError,
    /// Replay failed; the dataset cannot be trusted. Startup should stop
    /// and point the operator at the log.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Ok,
    Truncated,
    Empty,
    NotExist,
    OpenError,
    Failed,
}

/// Replays all live segments of `manifest` into `sink`.
///
/// Runs the legacy single-file upgrade first when applicable, so a data
/// directory written by the pre-manifest layout loads transparently.
pub fn load_from_disk(
    config: &AofConfig,
    layout: &Layout,
    manifest: &mut Manifest,
    sink: &mut dyn ReplaySink,
    codec: Option<&dyn SnapshotCodec>,
) -> AofResult<LoadOutcome> {
    upgrade_legacy_if_needed(layout, manifest)?;

    if manifest.is_empty() {
        return Ok(LoadOutcome::NotExist);
    }

    if let Err(err) = manifest.refresh_sizes(layout) {
        error!(error = %err, "manifest references files missing from disk");
        return Ok(LoadOutcome::Failed);
    }
    if manifest.live_size() == 0 {
        return Ok(LoadOutcome::Empty);
    }

    let total = manifest.live_count();
    let mut loaded = 0usize;
    let mut truncated_tail = false;

    if let Some(base) = manifest.base() {
        loaded += 1;
        let last_file = loaded == total;
        let outcome = load_single_segment(
            layout,
            &base.name,
            sink,
            codec,
            config.load_truncated,
            last_file,
        );
        match outcome {
            FileOutcome::Ok | FileOutcome::Empty => {
                info!(segment = %base.name, "dataset loaded from base segment");
            }
            FileOutcome::Truncated if last_file => truncated_tail = true,
            FileOutcome::Truncated => {
                error!(segment = %base.name, "a truncated segment is not the last segment");
                return Ok(LoadOutcome::Failed);
            }
            FileOutcome::NotExist | FileOutcome::Failed => return Ok(LoadOutcome::Failed),
            FileOutcome::OpenError => return Ok(LoadOutcome::OpenError),
        }
    }

    let incr_names: Vec<String> = manifest.incrs().map(|info| info.name.clone()).collect();
    for name in incr_names {
        loaded += 1;
        let last_file = loaded == total;
        let outcome = load_single_segment(
            layout,
            &name,
            sink,
            codec,
            config.load_truncated,
            last_file,
        );
        match outcome {
            FileOutcome::Ok | FileOutcome::Empty => {
                info!(segment = %name, "dataset loaded from incremental segment");
            }
            FileOutcome::Truncated if last_file => truncated_tail = true,
            FileOutcome::Truncated => {
                error!(segment = %name, "a truncated segment is not the last segment");
                return Ok(LoadOutcome::Failed);
            }
            FileOutcome::NotExist | FileOutcome::Failed => return Ok(LoadOutcome::Failed),
            FileOutcome::OpenError => return Ok(LoadOutcome::OpenError),
        }
    }

    // Truncation may have shrunk the tail; keep the accounting honest.
    if truncated_tail {
        if let Err(err) = manifest.refresh_sizes(layout) {
            error!(error = %err, "failed to restat segments after truncation");
            return Ok(LoadOutcome::Failed);
        }
        return Ok(LoadOutcome::Truncated);
    }
    Ok(LoadOutcome::Ok)
}

/// Migrates a pre-manifest single-file log into the AOF directory.
///
/// The steps are ordered so that a crash at any point leaves a state this
/// function recognizes and resumes on the next start: create the directory,
/// persist a manifest describing the legacy file as base seq 1, then move
/// the file in. Returns whether a migration ran.
pub fn upgrade_legacy_if_needed(layout: &Layout, manifest: &mut Manifest) -> AofResult<bool> {
    let legacy = layout.legacy_path();
    if !legacy.exists() {
        return Ok(false);
    }

    let dir_missing = !layout.dir().exists();
    let manifest_points_at_legacy = manifest
        .base()
        .map(|base| base.name == layout.basename())
        .unwrap_or(false)
        && manifest.incrs().count() == 0
        && layout.segment_size(layout.basename())?.is_none();
    if !dir_missing && !manifest.is_empty() && !manifest_points_at_legacy {
        return Ok(false);
    }

    info!(
        legacy = %legacy.display(),
        dir = %layout.dir().display(),
        "migrating single-file log into the append-only directory"
    );
    layout.ensure()?;
    manifest.install_legacy_base(layout.basename().to_string());
    manifest.persist(layout)?;

    let target = layout.segment_path(layout.basename());
    fs::rename(legacy, &target)?;
    fsync_dir(&target)?;
    info!("single-file log migration finished");
    Ok(true)
}

fn load_single_segment(
    layout: &Layout,
    name: &str,
    sink: &mut dyn ReplaySink,
    codec: Option<&dyn SnapshotCodec>,
    load_truncated: bool,
    last_file: bool,
) -> FileOutcome {
    let path = layout.segment_path(name);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            error!(segment = %name, "segment vanished while loading");
            return FileOutcome::NotExist;
        }
        Err(err) => {
            error!(segment = %name, error = %err, "can't open segment for reading");
            return FileOutcome::OpenError;
        }
    };
    let size = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(err) => {
            error!(segment = %name, error = %err, "can't stat segment");
            return FileOutcome::OpenError;
        }
    };
    if size == 0 {
        return FileOutcome::Empty;
    }

    let mut reader = BufReader::new(file);
    let mut prefix = [0u8; SNAPSHOT_MAGIC.len()];
    let mut prefix_len = 0usize;
    while prefix_len < prefix.len() {
        match reader.read(&mut prefix[prefix_len..]) {
            Ok(0) => break,
            Ok(n) => prefix_len += n,
            Err(err) => {
                error!(segment = %name, error = %err, "read error while probing segment");
                return FileOutcome::Failed;
            }
        }
    }

    // Stitch the probed bytes back in front of the remaining stream.
    let mut stream = io::Cursor::new(prefix[..prefix_len].to_vec()).chain(reader);
    let mut commands_offset = 0u64;
    if prefix_len == prefix.len() && prefix == *SNAPSHOT_MAGIC {
        let Some(codec) = codec else {
            error!(
                segment = %name,
                "segment is snapshot-encoded but no snapshot codec is registered"
            );
            return FileOutcome::Failed;
        };
        info!(segment = %name, "reading snapshot preamble");
        match codec.decode(&mut stream, sink) {
            Ok(consumed) => commands_offset = consumed,
            Err(err) => {
                error!(segment = %name, error = %err, "snapshot decode failed");
                return FileOutcome::Failed;
            }
        }
    }

    replay_commands(
        &path,
        name,
        CommandReader::with_offset(stream, commands_offset),
        sink,
        load_truncated,
        last_file,
    )
}

fn replay_commands<R: BufRead>(
    path: &std::path::Path,
    name: &str,
    mut reader: CommandReader<R>,
    sink: &mut dyn ReplaySink,
    load_truncated: bool,
    last_file: bool,
) -> FileOutcome {
    let mut valid_up_to = reader.offset();
    let mut valid_before_multi = 0u64;
    let mut in_multi = false;
    // Commands inside an open MULTI are withheld from the sink until the
    // EXEC arrives; a transaction torn by EOF must not half-apply.
    let mut queued: Vec<Vec<Vec<u8>>> = Vec::new();

    loop {
        match reader.next_command() {
            Ok(Some(argv)) => {
                let command = command_name(&argv);
                match command.as_str() {
                    "MULTI" => {
                        valid_before_multi = valid_up_to;
                        in_multi = true;
                        queued.clear();
                    }
                    "EXEC" if in_multi => {
                        for queued_argv in queued.drain(..) {
                            if let Err(err) = sink.apply(&queued_argv) {
                                error!(segment = %name, error = %err, "replay failed");
                                return FileOutcome::Failed;
                            }
                        }
                        in_multi = false;
                    }
                    _ if in_multi => queued.push(argv),
                    _ => {
                        if let Err(err) = sink.apply(&argv) {
                            error!(segment = %name, error = %err, "replay failed");
                            return FileOutcome::Failed;
                        }
                    }
                }
                valid_up_to = reader.offset();
            }
            Ok(None) => {
                if in_multi {
                    warn!(
                        segment = %name,
                        "reverting an incomplete transaction at the end of the segment"
                    );
                    return handle_truncation(
                        path,
                        name,
                        valid_before_multi,
                        load_truncated,
                    );
                }
                return FileOutcome::Ok;
            }
            Err(FrameError::Truncated) => {
                let rewind_to = if in_multi { valid_before_multi } else { valid_up_to };
                return handle_truncation(path, name, rewind_to, load_truncated);
            }
            Err(FrameError::Malformed(reason)) => {
                // Garbage at the very tail of the final segment is treated
                // like a torn write: recover the clean prefix when the
                // operator opted into truncated loads.
                if load_truncated && last_file {
                    warn!(
                        segment = %name,
                        reason = %reason,
                        "malformed bytes at the segment tail; recovering the clean prefix"
                    );
                    let rewind_to = if in_multi { valid_before_multi } else { valid_up_to };
                    return handle_truncation(path, name, rewind_to, load_truncated);
                }
                error!(segment = %name, reason = %reason, "bad segment format");
                return FileOutcome::Failed;
            }
            Err(FrameError::Io(err)) => {
                error!(segment = %name, error = %err, "unrecoverable read error");
                return FileOutcome::Failed;
            }
        }
    }
}

fn handle_truncation(
    path: &std::path::Path,
    name: &str,
    valid_up_to: u64,
    load_truncated: bool,
) -> FileOutcome {
    if !load_truncated {
        error!(
            segment = %name,
            "unexpected end of segment; enable truncated-load tolerance or repair the file"
        );
        return FileOutcome::Failed;
    }
    warn!(segment = %name, offset = valid_up_to, "truncating segment to its last valid command");
    let truncate_result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(valid_up_to));
    match truncate_result {
        Ok(()) => {
            warn!(segment = %name, "segment loaded anyway thanks to truncated-load tolerance");
            FileOutcome::Truncated
        }
        Err(err) => {
            error!(segment = %name, error = %err, "error truncating the segment");
            FileOutcome::Failed
        }
    }
}

fn command_name(argv: &[Vec<u8>]) -> String {
    argv.first()
        .map(|name| {
            name.iter()
                .map(|b| (*b as char).to_ascii_uppercase())
                .collect()
        })
        .unwrap_or_default()
}
