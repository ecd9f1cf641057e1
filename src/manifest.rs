//! The on-disk manifest: an ordered view of the segments that make up the
//! log.
//!
//! The manifest is a short UTF-8 text file, one segment per line:
//!
//! ```text
//! file appendonly.aof.1.base.aof seq 1 type b
//! file appendonly.aof.2.incr.aof seq 2 type h
//! file appendonly.aof.3.incr.aof seq 3 type i
//! ```
//!
//! Lines carry key/value token pairs so future keys can be added without
//! breaking old parsers; unknown keys are ignored. Loading is strict in the
//! other direction: any malformed line aborts startup, because a manifest we
//! cannot fully trust describes files we must not replay.
//!
//! Mutations follow a copy-on-write discipline. Callers [`Manifest::dup`] the
//! live manifest, stage changes on the copy, [`Manifest::persist`] it, and
//! only then replace the live value. A failed persist leaves the previous
//! manifest untouched on disk and in memory.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::config::is_base_name;
use crate::error::{AofError, AofResult};
use crate::fs::{durable_rename, open_truncate, Layout, TempFileGuard};

/// Longest accepted manifest line, terminator included.
const MANIFEST_MAX_LINE: usize = 1024;

const KEY_FILE_NAME: &str = "file";
const KEY_FILE_SEQ: &str = "seq";
const KEY_FILE_TYPE: &str = "type";

/// Role of a segment within the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Snapshot-equivalent checkpoint produced by the last rewrite.
    Base,
    /// Textual command log appended after the base.
    Incr,
    /// Superseded segment awaiting deletion.
    Hist,
}

impl SegmentKind {
    pub fn as_char(self) -> char {
        match self {
            SegmentKind::Base => 'b',
            SegmentKind::Hist => 'h',
            SegmentKind::Incr => 'i',
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "b" => Some(SegmentKind::Base),
            "h" => Some(SegmentKind::Hist),
            "i" => Some(SegmentKind::Incr),
            _ => None,
        }
    }
}

/// Immutable record identifying one on-disk segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Basename-only file name; never contains path separators.
    pub name: String,
    /// Monotonic sequence number, per kind, starting at 1.
    pub seq: u64,
    pub kind: SegmentKind,
    /// On-disk size accounting maintained in memory; not serialized.
    pub size: u64,
}

/// Ordered collection of one optional base, history, and incremental
/// segments, plus the sequence counters names are allocated from.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    base: Option<SegmentInfo>,
    history: VecDeque<SegmentInfo>,
    incrs: VecDeque<SegmentInfo>,
    curr_base_seq: u64,
    curr_incr_seq: u64,
    dirty: bool,
}

impl Manifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the manifest for `layout`, returning an empty manifest when the
    /// directory or the manifest file does not exist yet.
    pub fn load_from_disk(layout: &Layout) -> AofResult<Self> {
        let path = layout.manifest_path();
        if !path.exists() {
            debug!(path = %path.display(), "no manifest on disk, starting empty");
            return Ok(Self::empty());
        }
        Self::load(&path)
    }

    /// Strictly parses the manifest at `path`. Any malformed line is fatal.
    pub fn load(path: &Path) -> AofResult<Self> {
        let raw = fs::read(path)?;
        let text = String::from_utf8(raw)
            .map_err(|_| AofError::manifest("manifest is not valid UTF-8"))?;

        let mut manifest = Self::empty();
        let mut max_incr_seq = 0u64;
        let mut line_num = 0usize;

        for line in text.split_inclusive('\n') {
            line_num += 1;
            if line.len() > MANIFEST_MAX_LINE {
                return Err(line_error(line_num, "manifest line is too long"));
            }
            if !line.ends_with('\n') {
                return Err(line_error(line_num, "manifest line is unterminated"));
            }
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if line.is_empty() {
                return Err(line_error(line_num, "invalid manifest line format"));
            }

            let tokens = split_tokens(line)
                .map_err(|reason| line_error(line_num, &reason))?;
            if tokens.len() < 6 || tokens.len() % 2 != 0 {
                return Err(line_error(line_num, "invalid manifest line format"));
            }

            let mut name: Option<String> = None;
            let mut seq: Option<u64> = None;
            let mut kind: Option<SegmentKind> = None;
            for pair in tokens.chunks(2) {
                match pair[0].to_ascii_lowercase().as_str() {
                    KEY_FILE_NAME => {
                        if !is_base_name(&pair[1]) {
                            return Err(line_error(
                                line_num,
                                "segment file name must not contain path separators",
                            ));
                        }
                        name = Some(pair[1].clone());
                    }
                    KEY_FILE_SEQ => {
                        let value: u64 = pair[1].parse().map_err(|_| {
                            line_error(line_num, "segment sequence is not a number")
                        })?;
                        if value == 0 {
                            return Err(line_error(
                                line_num,
                                "segment sequence numbers start at 1",
                            ));
                        }
                        seq = Some(value);
                    }
                    KEY_FILE_TYPE => {
                        kind = Some(SegmentKind::from_token(&pair[1]).ok_or_else(|| {
                            line_error(line_num, "unknown segment type")
                        })?);
                    }
                    // Unknown keys are skipped for forward compatibility.
                    _ => {}
                }
            }

            let (Some(name), Some(seq), Some(kind)) = (name, seq, kind) else {
                return Err(line_error(line_num, "invalid manifest line format"));
            };
            let info = SegmentInfo {
                name,
                seq,
                kind,
                size: 0,
            };

            match kind {
                SegmentKind::Base => {
                    if manifest.base.is_some() {
                        return Err(line_error(line_num, "duplicate base segment"));
                    }
                    manifest.curr_base_seq = info.seq;
                    manifest.base = Some(info);
                }
                SegmentKind::Hist => manifest.history.push_back(info),
                SegmentKind::Incr => {
                    if info.seq <= max_incr_seq {
                        return Err(line_error(
                            line_num,
                            "found a non-monotonic sequence number",
                        ));
                    }
                    max_incr_seq = info.seq;
                    manifest.curr_incr_seq = info.seq;
                    manifest.incrs.push_back(info);
                }
            }
        }

        if line_num == 0 {
            return Err(AofError::manifest("found an empty manifest"));
        }
        Ok(manifest)
    }

    /// Serializes the manifest: base first, then history, then incrementals.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut emit = |info: &SegmentInfo| {
            out.push_str(&format!(
                "{KEY_FILE_NAME} {} {KEY_FILE_SEQ} {} {KEY_FILE_TYPE} {}\n",
                format_name(&info.name),
                info.seq,
                info.kind.as_char()
            ));
        };
        if let Some(base) = &self.base {
            emit(base);
        }
        for info in &self.history {
            emit(info);
        }
        for info in &self.incrs {
            emit(info);
        }
        out
    }

    /// Durably writes the manifest: temp file in the same directory, fsync,
    /// rename over the target, fsync the directory. A failure at any step
    /// leaves the previous on-disk manifest intact.
    pub fn persist(&mut self, layout: &Layout) -> AofResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if crate::test_support::take_manifest_persist_failure() {
            return Err(crate::test_support::injected_persist_error());
        }
        let tmp = layout.temp_manifest_path();
        let guard = TempFileGuard::new(tmp.clone());
        let mut file = open_truncate(&tmp)?;
        file.write_all(self.encode().as_bytes())?;
        file.sync_data()?;
        drop(file);
        durable_rename(&tmp, &layout.manifest_path())?;
        guard.disarm();
        self.dirty = false;
        debug!(path = %layout.manifest_path().display(), "persisted manifest");
        Ok(())
    }

    /// Deep copy used to stage modifications that are committed only by
    /// replacing the live manifest after a successful persist.
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Allocates the next base name, demoting any existing base to history.
    pub fn new_base_name(&mut self, layout: &Layout, snapshot_format: bool) -> String {
        if let Some(mut old) = self.base.take() {
            old.kind = SegmentKind::Hist;
            self.history.push_front(old);
        }
        self.curr_base_seq += 1;
        let info = SegmentInfo {
            name: layout.base_file_name(self.curr_base_seq, snapshot_format),
            seq: self.curr_base_seq,
            kind: SegmentKind::Base,
            size: 0,
        };
        let name = info.name.clone();
        self.base = Some(info);
        self.dirty = true;
        name
    }

    /// Allocates and appends the next incremental segment name.
    pub fn new_incr_name(&mut self, layout: &Layout) -> String {
        self.curr_incr_seq += 1;
        let info = SegmentInfo {
            name: layout.incr_file_name(self.curr_incr_seq),
            seq: self.curr_incr_seq,
            kind: SegmentKind::Incr,
            size: 0,
        };
        let name = info.name.clone();
        self.incrs.push_back(info);
        self.dirty = true;
        name
    }

    /// Name of the tail incremental segment, creating one if the list is
    /// empty.
    pub fn last_incr_name(&mut self, layout: &Layout) -> String {
        match self.incrs.back() {
            Some(info) => info.name.clone(),
            None => self.new_incr_name(layout),
        }
    }

    /// Moves every incremental except the tail (when `keep_tail` is set,
    /// i.e. the writer is appending to it) into the history list.
    pub fn mark_rewritten_incrs_as_history(&mut self, keep_tail: bool) {
        if self.incrs.is_empty() {
            return;
        }
        let tail = if keep_tail { self.incrs.pop_back() } else { None };
        let mut moved = false;
        while let Some(mut info) = self.incrs.pop_back() {
            info.kind = SegmentKind::Hist;
            self.history.push_front(info);
            moved = true;
        }
        if let Some(tail) = tail {
            self.incrs.push_back(tail);
        }
        if moved {
            self.dirty = true;
        }
    }

    /// Installs the pre-directory single-file log as base seq 1 during the
    /// legacy upgrade.
    pub fn install_legacy_base(&mut self, name: String) {
        self.base = Some(SegmentInfo {
            name,
            seq: 1,
            kind: SegmentKind::Base,
            size: 0,
        });
        self.curr_base_seq = 1;
        self.dirty = true;
    }

    /// Drains the history list for background deletion.
    pub fn take_history(&mut self) -> Vec<SegmentInfo> {
        if self.history.is_empty() {
            return Vec::new();
        }
        self.dirty = true;
        self.history.drain(..).collect()
    }

    /// Re-stats every live (base + incremental) segment. A referenced file
    /// missing from disk is an error: the manifest is lying about the log.
    pub fn refresh_sizes(&mut self, layout: &Layout) -> AofResult<()> {
        if let Some(base) = &mut self.base {
            base.size = stat_referenced(layout, &base.name)?;
        }
        for info in &mut self.incrs {
            info.size = stat_referenced(layout, &info.name)?;
        }
        Ok(())
    }

    pub fn base(&self) -> Option<&SegmentInfo> {
        self.base.as_ref()
    }

    pub fn incrs(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.incrs.iter()
    }

    pub fn history(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.history.iter()
    }

    pub fn tail_incr(&self) -> Option<&SegmentInfo> {
        self.incrs.back()
    }

    /// Advances the in-memory size accounting of the tail incremental.
    pub fn add_tail_size(&mut self, delta: u64) {
        if let Some(tail) = self.incrs.back_mut() {
            tail.size += delta;
        }
    }

    /// Resets the tail incremental size after a truncate recovery.
    pub fn set_tail_size(&mut self, size: u64) {
        if let Some(tail) = self.incrs.back_mut() {
            tail.size = size;
        }
    }

    /// True when the manifest references no live segments at all.
    pub fn is_empty(&self) -> bool {
        self.base.is_none() && self.incrs.is_empty()
    }

    /// Number of live segments (base + incrementals).
    pub fn live_count(&self) -> usize {
        usize::from(self.base.is_some()) + self.incrs.len()
    }

    /// Total size of live segments from the in-memory accounting.
    pub fn live_size(&self) -> u64 {
        self.base_size() + self.incrs.iter().map(|info| info.size).sum::<u64>()
    }

    pub fn base_size(&self) -> u64 {
        self.base.as_ref().map(|info| info.size).unwrap_or(0)
    }

    pub fn curr_base_seq(&self) -> u64 {
        self.curr_base_seq
    }

    pub fn curr_incr_seq(&self) -> u64 {
        self.curr_incr_seq
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn stat_referenced(layout: &Layout, name: &str) -> AofResult<u64> {
    match layout.segment_size(name)? {
        Some(size) => Ok(size),
        None => Err(AofError::manifest(format!(
            "segment {name} is referenced by the manifest but missing on disk"
        ))),
    }
}

fn line_error(line_num: usize, reason: &str) -> AofError {
    AofError::manifest(format!("line {line_num}: {reason}"))
}

/// True when a file name needs the quoted representation in the manifest.
fn needs_quoting(name: &str) -> bool {
    name.bytes()
        .any(|b| b <= b' ' || b == b'"' || b == b'\'' || b == b'\\' || b >= 0x7f)
}

/// Renders a file name as a manifest token, quoting when required.
fn format_name(name: &str) -> String {
    if !needs_quoting(name) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for byte in name.bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push('"');
    out
}

/// Splits a manifest line into tokens, honoring double-quoted tokens with
/// backslash escapes and single-quoted verbatim tokens.
fn split_tokens(line: &str) -> Result<Vec<String>, String> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let mut token = Vec::new();
        match bytes[i] {
            b'"' => {
                i += 1;
                let mut closed = false;
                while i < bytes.len() {
                    match bytes[i] {
                        b'\\' if i + 1 < bytes.len() => {
                            i += 1;
                            match bytes[i] {
                                b'n' => token.push(b'\n'),
                                b'r' => token.push(b'\r'),
                                b't' => token.push(b'\t'),
                                b'x' if i + 2 < bytes.len() => {
                                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                                        .map_err(|_| "invalid hex escape".to_string())?;
                                    let value = u8::from_str_radix(hex, 16)
                                        .map_err(|_| "invalid hex escape".to_string())?;
                                    token.push(value);
                                    i += 2;
                                }
                                other => token.push(other),
                            }
                            i += 1;
                        }
                        b'"' => {
                            i += 1;
                            closed = true;
                            break;
                        }
                        other => {
                            token.push(other);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err("unterminated quoted token".to_string());
                }
                if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    return Err("closing quote must be followed by whitespace".to_string());
                }
            }
            b'\'' => {
                i += 1;
                let mut closed = false;
                while i < bytes.len() {
                    match bytes[i] {
                        b'\\' if i + 1 < bytes.len() && bytes[i + 1] == b'\'' => {
                            token.push(b'\'');
                            i += 2;
                        }
                        b'\'' => {
                            i += 1;
                            closed = true;
                            break;
                        }
                        other => {
                            token.push(other);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err("unterminated quoted token".to_string());
                }
                if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    return Err("closing quote must be followed by whitespace".to_string());
                }
            }
            _ => {
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    token.push(bytes[i]);
                    i += 1;
                }
            }
        }
        let token = String::from_utf8(token)
            .map_err(|_| "token is not valid UTF-8".to_string())?;
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AofConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn layout_at(dir: &TempDir) -> Layout {
        let config = AofConfig {
            data_dir: dir.path().to_path_buf(),
            ..AofConfig::default()
        };
        let layout = Layout::new(&config);
        layout.ensure().expect("layout ensure");
        layout
    }

    fn write_manifest(layout: &Layout, contents: &str) -> PathBuf {
        let path = layout.manifest_path();
        fs::write(&path, contents).expect("write manifest");
        path
    }

    #[test]
    fn round_trips_through_encode_and_load() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        manifest.new_base_name(&layout, false);
        manifest.new_incr_name(&layout);
        manifest.new_incr_name(&layout);
        manifest.mark_rewritten_incrs_as_history(true);

        let path = write_manifest(&layout, &manifest.encode());
        let loaded = Manifest::load(&path).expect("load");
        assert_eq!(loaded.encode(), manifest.encode());
        assert_eq!(loaded.curr_base_seq(), 1);
        assert_eq!(loaded.curr_incr_seq(), 2);
        assert_eq!(loaded.history().count(), 1);
        assert_eq!(loaded.tail_incr().expect("tail").seq, 2);
    }

    #[test]
    fn rejects_non_monotonic_incr_sequences() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);
        let path = write_manifest(
            &layout,
            "file x.1.base.aof seq 1 type b\n\
             file x.2.incr.aof seq 2 type i\n\
             file x.1.incr.aof seq 1 type i\n",
        );
        let err = Manifest::load(&path).expect_err("must reject");
        assert!(err.to_string().contains("non-monotonic sequence"));
    }

    #[test]
    fn rejects_duplicate_base() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);
        let path = write_manifest(
            &layout,
            "file x.1.base.aof seq 1 type b\nfile x.2.base.aof seq 2 type b\n",
        );
        let err = Manifest::load(&path).expect_err("must reject");
        assert!(err.to_string().contains("duplicate base"));
    }

    #[test]
    fn rejects_zero_sequence() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);
        let path = write_manifest(&layout, "file x.0.incr.aof seq 0 type i\n");
        let err = Manifest::load(&path).expect_err("must reject");
        assert!(err.to_string().contains("start at 1"));
    }

    #[test]
    fn rejects_path_separators_unknown_types_and_short_lines() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let path = write_manifest(&layout, "file ../evil.aof seq 1 type i\n");
        assert!(Manifest::load(&path).is_err());

        let path = write_manifest(&layout, "file x.aof seq 1 type z\n");
        assert!(Manifest::load(&path).is_err());

        let path = write_manifest(&layout, "file x.aof seq 1\n");
        assert!(Manifest::load(&path).is_err());

        let path = write_manifest(&layout, "");
        assert!(Manifest::load(&path).is_err());
    }

    #[test]
    fn rejects_oversized_lines_and_tolerates_comments() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let long_name = "x".repeat(MANIFEST_MAX_LINE + 1);
        let path = write_manifest(&layout, &format!("file {long_name} seq 1 type i\n"));
        assert!(Manifest::load(&path).is_err());

        let path = write_manifest(
            &layout,
            "# produced by ember-aof\nfile x.1.incr.aof seq 1 type i\n",
        );
        let manifest = Manifest::load(&path).expect("comments are skipped");
        assert_eq!(manifest.incrs().count(), 1);
    }

    #[test]
    fn ignores_unknown_keys_for_forward_compat() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);
        let path = write_manifest(
            &layout,
            "file x.1.incr.aof seq 1 type i epoch 99\n",
        );
        let manifest = Manifest::load(&path).expect("unknown keys skipped");
        assert_eq!(manifest.tail_incr().expect("tail").seq, 1);
    }

    #[test]
    fn quoted_names_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        manifest.install_legacy_base("odd name\t.aof".to_string());
        let encoded = manifest.encode();
        assert!(encoded.contains('"'));

        let path = write_manifest(&layout, &encoded);
        let loaded = Manifest::load(&path).expect("load quoted");
        assert_eq!(loaded.base().expect("base").name, "odd name\t.aof");
    }

    #[test]
    fn persist_writes_atomically_and_clears_dirty() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        manifest.new_incr_name(&layout);
        assert!(manifest.is_dirty());
        manifest.persist(&layout).expect("persist");
        assert!(!manifest.is_dirty());
        assert!(layout.manifest_path().exists());
        assert!(!layout.temp_manifest_path().exists());

        let loaded = Manifest::load(&layout.manifest_path()).expect("reload");
        assert_eq!(loaded.curr_incr_seq(), 1);
    }

    #[test]
    fn new_base_demotes_previous_base_to_history() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        let first = manifest.new_base_name(&layout, false);
        let second = manifest.new_base_name(&layout, true);
        assert_ne!(first, second);
        assert_eq!(manifest.curr_base_seq(), 2);
        assert_eq!(manifest.base().expect("base").name, second);
        let hist: Vec<_> = manifest.history().collect();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].name, first);
        assert_eq!(hist[0].kind, SegmentKind::Hist);
    }

    #[test]
    fn mark_rewritten_keeps_only_the_tail() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        manifest.new_incr_name(&layout);
        manifest.new_incr_name(&layout);
        manifest.new_incr_name(&layout);
        manifest.mark_rewritten_incrs_as_history(true);
        assert_eq!(manifest.incrs().count(), 1);
        assert_eq!(manifest.tail_incr().expect("tail").seq, 3);
        assert_eq!(manifest.history().count(), 2);

        manifest.mark_rewritten_incrs_as_history(false);
        assert_eq!(manifest.incrs().count(), 0);
        assert_eq!(manifest.history().count(), 3);
    }

    #[test]
    fn last_incr_name_creates_on_demand() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        let created = manifest.last_incr_name(&layout);
        assert_eq!(created, layout.incr_file_name(1));
        let again = manifest.last_incr_name(&layout);
        assert_eq!(created, again);
        assert_eq!(manifest.incrs().count(), 1);
    }

    #[test]
    fn sequence_counters_never_decrease() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout_at(&tmp);

        let mut manifest = Manifest::empty();
        let mut last_base = 0;
        let mut last_incr = 0;
        for _ in 0..5 {
            manifest.new_base_name(&layout, false);
            manifest.new_incr_name(&layout);
            assert!(manifest.curr_base_seq() > last_base);
            assert!(manifest.curr_incr_seq() > last_incr);
            last_base = manifest.curr_base_seq();
            last_incr = manifest.curr_incr_seq();
            manifest.mark_rewritten_incrs_as_history(true);
        }
    }
}
