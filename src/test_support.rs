//! Fixtures and fault-injection hooks shared by unit and integration
//! tests. Nothing here runs in production paths unless a test arms it.

use std::cell::Cell;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AofConfig;
use crate::dataset::{DatasetSnapshot, ReplaySink, SnapshotCodec, Value, SNAPSHOT_MAGIC};
use crate::error::{AofError, AofResult};
use crate::fs::Layout;

static NEXT_LAYOUT_ID: AtomicU64 = AtomicU64::new(0);

/// A scratch data directory plus the config/layout pair pointing at it.
/// The directory is removed on drop.
pub struct TestLayout {
    pub config: AofConfig,
    pub layout: Layout,
    root: PathBuf,
}

impl TestLayout {
    pub fn new() -> Self {
        let root = std::env::temp_dir().join(format!(
            "ember-aof-test-{}-{}",
            std::process::id(),
            NEXT_LAYOUT_ID.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&root).expect("create test data dir");
        let config = AofConfig {
            data_dir: root.clone(),
            ..AofConfig::default()
        };
        let layout = Layout::new(&config);
        layout.ensure().expect("create aof dir");
        Self {
            config,
            layout,
            root,
        }
    }
}

impl Default for TestLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestLayout {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// Writes raw bytes as a segment file inside the layout directory.
pub fn write_segment(layout: &Layout, name: &str, bytes: &[u8]) {
    fs::write(layout.segment_path(name), bytes).expect("write segment");
}

thread_local! {
    static MANIFEST_PERSIST_FAILURES: Cell<u32> = const { Cell::new(0) };
}

/// Arms the next `count` manifest persists on this thread to fail with an
/// injected I/O error.
pub fn inject_manifest_persist_failures(count: u32) {
    MANIFEST_PERSIST_FAILURES.with(|cell| cell.set(count));
}

/// Consumed by `Manifest::persist`; true when a failure should be injected.
pub(crate) fn take_manifest_persist_failure() -> bool {
    MANIFEST_PERSIST_FAILURES.with(|cell| {
        let remaining = cell.get();
        if remaining > 0 {
            cell.set(remaining - 1);
            true
        } else {
            false
        }
    })
}

pub(crate) fn injected_persist_error() -> AofError {
    AofError::Io(io::Error::other("injected manifest persist failure"))
}

/// Minimal binary snapshot codec used to exercise the snapshot-preamble
/// paths. Supports string values only: `REDIS` magic, an entry count, then
/// `(db, key, value)` tuples with little-endian length prefixes.
pub struct LengthPrefixedSnapshot;

impl SnapshotCodec for LengthPrefixedSnapshot {
    fn encode(&self, snapshot: &DatasetSnapshot, out: &mut dyn Write) -> AofResult<()> {
        let mut entries: Vec<(u32, &[u8], &[u8])> = Vec::new();
        for db in &snapshot.dbs {
            for (key, record) in &db.entries {
                match &record.value {
                    Value::Str(value) => entries.push((db.index, key, value)),
                    _ => {
                        return Err(AofError::Snapshot(
                            "the test codec supports only string values".to_string(),
                        ))
                    }
                }
            }
        }
        out.write_all(SNAPSHOT_MAGIC)?;
        out.write_all(&(entries.len() as u32).to_le_bytes())?;
        for (db, key, value) in entries {
            out.write_all(&db.to_le_bytes())?;
            out.write_all(&(key.len() as u64).to_le_bytes())?;
            out.write_all(key)?;
            out.write_all(&(value.len() as u64).to_le_bytes())?;
            out.write_all(value)?;
        }
        Ok(())
    }

    fn decode(&self, input: &mut dyn BufRead, sink: &mut dyn ReplaySink) -> AofResult<u64> {
        let mut consumed = 0u64;
        let mut magic = [0u8; 5];
        read_exact_counted(input, &mut magic, &mut consumed)?;
        if magic != *SNAPSHOT_MAGIC {
            return Err(AofError::Snapshot("bad snapshot magic".to_string()));
        }
        let mut count_buf = [0u8; 4];
        read_exact_counted(input, &mut count_buf, &mut consumed)?;
        let count = u32::from_le_bytes(count_buf);

        let mut current_db: Option<u32> = None;
        for _ in 0..count {
            let mut db_buf = [0u8; 4];
            read_exact_counted(input, &mut db_buf, &mut consumed)?;
            let db = u32::from_le_bytes(db_buf);

            let mut len_buf = [0u8; 8];
            read_exact_counted(input, &mut len_buf, &mut consumed)?;
            let mut key = vec![0u8; u64::from_le_bytes(len_buf) as usize];
            read_exact_counted(input, &mut key, &mut consumed)?;

            read_exact_counted(input, &mut len_buf, &mut consumed)?;
            let mut value = vec![0u8; u64::from_le_bytes(len_buf) as usize];
            read_exact_counted(input, &mut value, &mut consumed)?;

            if current_db != Some(db) {
                sink.apply(&[b"SELECT".to_vec(), db.to_string().into_bytes()])?;
                current_db = Some(db);
            }
            sink.apply(&[b"SET".to_vec(), key, value])?;
        }
        Ok(consumed)
    }
}

fn read_exact_counted(
    input: &mut dyn BufRead,
    buf: &mut [u8],
    consumed: &mut u64,
) -> AofResult<()> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = input.read(&mut buf[read..])?;
        if n == 0 {
            return Err(AofError::Snapshot("snapshot ends early".to_string()));
        }
        read += n;
    }
    *consumed += read as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{MemoryStore, Record, SnapshotSource};
    use std::io::BufReader;

    #[test]
    fn test_codec_round_trips_strings() {
        let mut store = MemoryStore::new(16);
        store.put(0, b"a".to_vec(), Record::plain(Value::Str(b"1".to_vec())));
        store.put(5, b"b".to_vec(), Record::plain(Value::Str(b"2".to_vec())));

        let codec = LengthPrefixedSnapshot;
        let mut bytes = Vec::new();
        codec.encode(&store.freeze(), &mut bytes).expect("encode");
        assert!(bytes.starts_with(SNAPSHOT_MAGIC));

        let mut reloaded = MemoryStore::new(16);
        let consumed = codec
            .decode(&mut BufReader::new(bytes.as_slice()), &mut reloaded)
            .expect("decode");
        assert_eq!(consumed, bytes.len() as u64);
        assert_eq!(reloaded.freeze(), store.freeze());
    }

    #[test]
    fn persist_failure_injection_is_consumed() {
        inject_manifest_persist_failures(2);
        assert!(take_manifest_persist_failure());
        assert!(take_manifest_persist_failure());
        assert!(!take_manifest_persist_failure());
    }
}
