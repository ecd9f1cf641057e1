//! Rewrite serializer: for every value in a frozen dataset snapshot, emit
//! the minimal command sequence that reconstructs it.
//!
//! Bulk insertions are batched at most [`REWRITE_ITEMS_PER_CMD`] items per
//! command so no single command grows an unbounded argument vector. The
//! dump periodically flushes, fsyncs and drops its page-cache footprint so
//! a long rewrite does not balloon dirty memory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::dataset::{
    DatasetSnapshot, ExtensionRegistry, HashField, Record, StreamValue, Value,
};
use crate::error::{AofError, AofResult};
use crate::framing::{encode_command, encode_select, encode_timestamp_annotation};
use crate::now_millis;

/// Maximum items folded into one variadic command.
pub const REWRITE_ITEMS_PER_CMD: usize = 64;

/// Flush, fsync and release page cache every this many output bytes.
const AUTOSYNC_BYTES: u64 = 32 * 1024 * 1024;

/// Progress is considered every this many keys, gated to one report per
/// second of wall clock.
const PROGRESS_KEY_INTERVAL: u64 = 1024;

/// How a dump run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    Completed,
    /// The abort token was raised; the output is incomplete and must be
    /// discarded by the caller.
    Aborted,
}

/// Serializes `snapshot` into `file` as a textual base segment.
///
/// The output starts with a timestamp annotation and a `SELECT 0`, so even
/// an empty dataset produces a loadable file that reconstructs an empty
/// store.
pub fn dump_snapshot(
    snapshot: &DatasetSnapshot,
    file: &File,
    now_unix_sec: u64,
    extensions: &ExtensionRegistry,
    abort: Option<&AtomicBool>,
) -> AofResult<DumpOutcome> {
    let mut dump = Dump {
        out: BufWriter::new(file),
        file,
        extensions,
        abort,
        scratch: Vec::new(),
        bytes_since_sync: 0,
        keys_emitted: 0,
        last_progress_ms: now_millis(),
    };

    let mut preamble = Vec::new();
    encode_timestamp_annotation(&mut preamble, now_unix_sec);
    encode_select(&mut preamble, 0);
    dump.write_raw(&preamble)?;

    let mut current_db = 0u32;
    for db in &snapshot.dbs {
        if db.entries.is_empty() {
            continue;
        }
        if db.index != current_db {
            let mut select = Vec::new();
            encode_select(&mut select, db.index);
            dump.write_raw(&select)?;
            current_db = db.index;
        }
        for (key, record) in &db.entries {
            if dump.aborted() {
                return Ok(DumpOutcome::Aborted);
            }
            dump.emit_record(key, record)?;
            dump.after_key()?;
        }
    }
    dump.out.flush()?;
    Ok(DumpOutcome::Completed)
}

struct Dump<'a> {
    out: BufWriter<&'a File>,
    file: &'a File,
    extensions: &'a ExtensionRegistry,
    abort: Option<&'a AtomicBool>,
    scratch: Vec<u8>,
    bytes_since_sync: u64,
    keys_emitted: u64,
    last_progress_ms: u64,
}

impl<'a> Dump<'a> {
    fn aborted(&self) -> bool {
        self.abort
            .map(|token| token.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> AofResult<()> {
        self.out.write_all(bytes)?;
        self.bytes_since_sync += bytes.len() as u64;
        Ok(())
    }

    fn emit(&mut self, argv: &[&[u8]]) -> AofResult<()> {
        self.scratch.clear();
        encode_command(&mut self.scratch, argv);
        self.out.write_all(&self.scratch)?;
        self.bytes_since_sync += self.scratch.len() as u64;
        Ok(())
    }

    fn emit_record(&mut self, key: &[u8], record: &Record) -> AofResult<()> {
        match &record.value {
            Value::Str(value) => self.emit(&[b"SET", key, value])?,
            Value::List(items) => self.emit_batched(b"RPUSH", key, items)?,
            Value::Set(members) => self.emit_batched(b"SADD", key, members)?,
            Value::SortedSet(pairs) => self.emit_sorted_set(key, pairs)?,
            Value::Hash(fields) => self.emit_hash(key, fields)?,
            Value::Stream(stream) => self.emit_stream(key, stream)?,
            Value::Extension { type_name, payload } => {
                let extensions = self.extensions;
                let mut sink = |argv: &[&[u8]]| self.emit(argv);
                extensions.emit(type_name, key, payload, &mut sink)?;
            }
        }
        if let Some(at_ms) = record.expire_at_ms {
            let at_ms = at_ms.to_string();
            self.emit(&[b"PEXPIREAT", key, at_ms.as_bytes()])?;
        }
        Ok(())
    }

    fn emit_batched(&mut self, cmd: &[u8], key: &[u8], items: &[Vec<u8>]) -> AofResult<()> {
        for chunk in items.chunks(REWRITE_ITEMS_PER_CMD) {
            let mut argv: Vec<&[u8]> = Vec::with_capacity(2 + chunk.len());
            argv.push(cmd);
            argv.push(key);
            argv.extend(chunk.iter().map(|item| item.as_slice()));
            self.emit(&argv)?;
        }
        Ok(())
    }

    fn emit_sorted_set(&mut self, key: &[u8], pairs: &[(f64, Vec<u8>)]) -> AofResult<()> {
        for chunk in pairs.chunks(REWRITE_ITEMS_PER_CMD) {
            let scores: Vec<String> =
                chunk.iter().map(|(score, _)| format_score(*score)).collect();
            let mut argv: Vec<&[u8]> = Vec::with_capacity(2 + chunk.len() * 2);
            argv.push(b"ZADD");
            argv.push(key);
            for ((_, member), score) in chunk.iter().zip(scores.iter()) {
                argv.push(score.as_bytes());
                argv.push(member.as_slice());
            }
            self.emit(&argv)?;
        }
        Ok(())
    }

    fn emit_hash(&mut self, key: &[u8], fields: &[HashField]) -> AofResult<()> {
        let any_field_ttl = fields.iter().any(|f| f.expire_at_ms.is_some());
        if !any_field_ttl {
            for chunk in fields.chunks(REWRITE_ITEMS_PER_CMD) {
                let mut argv: Vec<&[u8]> = Vec::with_capacity(2 + chunk.len() * 2);
                argv.push(b"HMSET");
                argv.push(key);
                for field in chunk {
                    argv.push(field.field.as_slice());
                    argv.push(field.value.as_slice());
                }
                self.emit(&argv)?;
            }
            return Ok(());
        }
        // With field-level expirations every field is emitted on its own so
        // the HPEXPIREAT can follow its HMSET immediately.
        for field in fields {
            self.emit(&[b"HMSET", key, &field.field, &field.value])?;
            if let Some(at_ms) = field.expire_at_ms {
                let at_ms = at_ms.to_string();
                self.emit(&[
                    b"HPEXPIREAT",
                    key,
                    at_ms.as_bytes(),
                    b"FIELDS",
                    b"1",
                    &field.field,
                ])?;
            }
        }
        Ok(())
    }

    fn emit_stream(&mut self, key: &[u8], stream: &StreamValue) -> AofResult<()> {
        if !stream.entries.is_empty() {
            for entry in &stream.entries {
                let id = entry.id.to_string();
                let mut argv: Vec<&[u8]> =
                    Vec::with_capacity(3 + entry.fields.len() * 2);
                argv.push(b"XADD");
                argv.push(key);
                argv.push(id.as_bytes());
                for (field, value) in &entry.fields {
                    argv.push(field.as_slice());
                    argv.push(value.as_slice());
                }
                self.emit(&argv)?;
            }
        } else {
            // MAXLEN 0 inserts and immediately trims a dummy entry, leaving
            // an empty stream whose identity the XSETID below fixes up.
            self.emit(&[b"XADD", key, b"MAXLEN", b"0", b"0-1", b"x", b"y"])?;
        }

        let last_id = stream.last_id.to_string();
        let entries_added = stream.entries_added.to_string();
        let max_deleted = stream.max_deleted_id.to_string();
        self.emit(&[
            b"XSETID",
            key,
            last_id.as_bytes(),
            b"ENTRIESADDED",
            entries_added.as_bytes(),
            b"MAXDELETEDID",
            max_deleted.as_bytes(),
        ])?;

        for group in &stream.groups {
            let group_last = group.last_id.to_string();
            let entries_read = group.entries_read.to_string();
            self.emit(&[
                b"XGROUP",
                b"CREATE",
                key,
                &group.name,
                group_last.as_bytes(),
                b"ENTRIESREAD",
                entries_read.as_bytes(),
            ])?;
            for consumer in &group.consumers {
                if consumer.pending.is_empty() {
                    self.emit(&[b"XGROUP", b"CREATECONSUMER", key, &group.name, &consumer.name])?;
                    continue;
                }
                for pending in &consumer.pending {
                    let id = pending.id.to_string();
                    let time = pending.delivery_time_ms.to_string();
                    let retry = pending.delivery_count.to_string();
                    self.emit(&[
                        b"XCLAIM",
                        key,
                        &group.name,
                        &consumer.name,
                        b"0",
                        id.as_bytes(),
                        b"TIME",
                        time.as_bytes(),
                        b"RETRYCOUNT",
                        retry.as_bytes(),
                        b"JUSTID",
                        b"FORCE",
                    ])?;
                }
            }
        }
        Ok(())
    }

    /// Bookkeeping between keys: progress reporting and the incremental
    /// sync that also hints the kernel to drop written pages.
    fn after_key(&mut self) -> AofResult<()> {
        self.keys_emitted += 1;
        if self.keys_emitted % PROGRESS_KEY_INTERVAL == 0 {
            let now = now_millis();
            if now.saturating_sub(self.last_progress_ms) >= 1000 {
                self.last_progress_ms = now;
                debug!(keys = self.keys_emitted, "rewrite serialization progress");
            }
        }
        if self.bytes_since_sync >= AUTOSYNC_BYTES {
            self.out.flush()?;
            self.file.sync_data()?;
            release_page_cache(self.file);
            self.bytes_since_sync = 0;
        }
        Ok(())
    }
}

/// Shortest representation that parses back to the identical double.
fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// Best-effort hint that the kernel may drop the written pages, limiting
/// the cache footprint of a large dump. Failure only costs memory.
#[cfg(unix)]
fn release_page_cache(file: &File) {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if rc != 0 {
        debug!(code = rc, "posix_fadvise(DONTNEED) was not accepted");
    }
}

#[cfg(not(unix))]
fn release_page_cache(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{
        MemoryStore, PendingEntry, ReplaySink, SnapshotSource, StreamConsumer, StreamEntry,
        StreamGroup, StreamId,
    };
    use crate::framing::CommandReader;
    use std::io::{BufReader, Seek, SeekFrom};
    use tempfile::tempfile;

    fn dump_to_bytes(store: &MemoryStore) -> Vec<u8> {
        let file = tempfile().expect("tempfile");
        let outcome = dump_snapshot(
            &store.freeze(),
            &file,
            1700000000,
            &ExtensionRegistry::new(),
            None,
        )
        .expect("dump");
        assert_eq!(outcome, DumpOutcome::Completed);
        let mut file = file;
        file.seek(SeekFrom::Start(0)).expect("seek");
        let mut bytes = Vec::new();
        use std::io::Read;
        file.read_to_end(&mut bytes).expect("read");
        bytes
    }

    fn replay_into_store(bytes: &[u8], databases: u32) -> MemoryStore {
        let mut store = MemoryStore::new(databases);
        let mut reader = CommandReader::new(BufReader::new(bytes));
        while let Some(argv) = reader.next_command().expect("well-formed dump") {
            store.apply(&argv).expect("replayable command");
        }
        store
    }

    #[test]
    fn empty_dataset_dumps_annotation_and_select_only() {
        let store = MemoryStore::new(16);
        let bytes = dump_to_bytes(&store);
        assert_eq!(
            bytes,
            b"#TS:1700000000\r\n*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n"
        );
        let reloaded = replay_into_store(&bytes, 16);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn hash_field_expiration_bytes_are_exact() {
        let mut store = MemoryStore::new(16);
        store.put(
            0,
            b"h".to_vec(),
            Record::plain(Value::Hash(vec![HashField {
                field: b"f".to_vec(),
                value: b"v".to_vec(),
                expire_at_ms: Some(1234567890),
            }])),
        );
        let bytes = dump_to_bytes(&store);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("*4\r\n$5\r\nHMSET\r\n$1\r\nh\r\n$1\r\nf\r\n$1\r\nv\r\n"));
        assert!(text.contains(
            "*6\r\n$10\r\nHPEXPIREAT\r\n$1\r\nh\r\n$10\r\n1234567890\r\n$6\r\nFIELDS\r\n$1\r\n1\r\n$1\r\nf\r\n"
        ));
    }

    #[test]
    fn bulk_values_are_batched() {
        let mut store = MemoryStore::new(16);
        let items: Vec<Vec<u8>> = (0..150).map(|i| format!("item-{i}").into_bytes()).collect();
        store.put(0, b"list".to_vec(), Record::plain(Value::List(items)));
        let bytes = dump_to_bytes(&store);
        let text = String::from_utf8_lossy(&bytes);
        // 150 items at 64 per command is three RPUSH commands.
        assert_eq!(text.matches("RPUSH").count(), 3);

        let reloaded = replay_into_store(&bytes, 16);
        assert_eq!(reloaded.lrange(0, b"list").len(), 150);
    }

    #[test]
    fn round_trip_preserves_all_value_types() {
        let mut store = MemoryStore::new(16);
        store.put(
            0,
            b"s".to_vec(),
            Record {
                value: Value::Str(b"hello".to_vec()),
                expire_at_ms: Some(33177117420000),
            },
        );
        store.put(
            0,
            b"l".to_vec(),
            Record::plain(Value::List(vec![b"a".to_vec(), b"b".to_vec()])),
        );
        store.put(
            0,
            b"set".to_vec(),
            Record::plain(Value::Set(vec![b"m1".to_vec(), b"m2".to_vec()])),
        );
        store.put(
            0,
            b"z".to_vec(),
            Record::plain(Value::SortedSet(vec![
                (1.5, b"one".to_vec()),
                (-0.25, b"neg".to_vec()),
                (f64::INFINITY, b"inf".to_vec()),
            ])),
        );
        store.put(
            3,
            b"h".to_vec(),
            Record::plain(Value::Hash(vec![
                HashField {
                    field: b"f1".to_vec(),
                    value: b"v1".to_vec(),
                    expire_at_ms: None,
                },
                HashField {
                    field: b"f2".to_vec(),
                    value: b"v2".to_vec(),
                    expire_at_ms: Some(33177117420000),
                },
            ])),
        );
        store.put(
            3,
            b"st".to_vec(),
            Record::plain(Value::Stream(StreamValue {
                entries: vec![StreamEntry {
                    id: StreamId::new(100, 1),
                    fields: vec![(b"a".to_vec(), b"1".to_vec())],
                }],
                last_id: StreamId::new(100, 1),
                max_deleted_id: StreamId::ZERO,
                entries_added: 1,
                groups: vec![StreamGroup {
                    name: b"grp".to_vec(),
                    last_id: StreamId::new(100, 1),
                    entries_read: 1,
                    consumers: vec![
                        StreamConsumer {
                            name: b"idle".to_vec(),
                            pending: vec![],
                        },
                        StreamConsumer {
                            name: b"busy".to_vec(),
                            pending: vec![PendingEntry {
                                id: StreamId::new(100, 1),
                                delivery_time_ms: 5000,
                                delivery_count: 2,
                            }],
                        },
                    ],
                }],
            })),
        );

        let bytes = dump_to_bytes(&store);
        let reloaded = replay_into_store(&bytes, 16);
        assert_eq!(reloaded.freeze(), store.freeze());
    }

    #[test]
    fn idempotent_across_a_second_round_trip() {
        let mut store = MemoryStore::new(16);
        store.put(
            0,
            b"z".to_vec(),
            Record::plain(Value::SortedSet(vec![(0.1, b"m".to_vec())])),
        );
        store.put(
            1,
            b"l".to_vec(),
            Record::plain(Value::List(vec![b"x".to_vec()])),
        );
        let once = replay_into_store(&dump_to_bytes(&store), 16);
        let twice = replay_into_store(&dump_to_bytes(&once), 16);
        assert_eq!(once.freeze(), twice.freeze());
    }

    #[test]
    fn empty_stream_uses_the_maxlen_zero_form() {
        let mut store = MemoryStore::new(16);
        store.put(
            0,
            b"st".to_vec(),
            Record::plain(Value::Stream(StreamValue {
                entries: vec![],
                last_id: StreamId::new(7, 7),
                max_deleted_id: StreamId::new(7, 7),
                entries_added: 9,
                groups: vec![],
            })),
        );
        let bytes = dump_to_bytes(&store);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("MAXLEN"));

        let reloaded = replay_into_store(&bytes, 16);
        let stream = reloaded.stream(0, b"st").expect("stream");
        assert!(stream.entries.is_empty());
        assert_eq!(stream.last_id, StreamId::new(7, 7));
        assert_eq!(stream.entries_added, 9);
    }

    #[test]
    fn abort_token_stops_the_dump() {
        let mut store = MemoryStore::new(16);
        for i in 0..10 {
            store.put(
                0,
                format!("k{i}").into_bytes(),
                Record::plain(Value::Str(b"v".to_vec())),
            );
        }
        let token = AtomicBool::new(true);
        let file = tempfile().expect("tempfile");
        let outcome = dump_snapshot(
            &store.freeze(),
            &file,
            0,
            &ExtensionRegistry::new(),
            Some(&token),
        )
        .expect("dump returns");
        assert_eq!(outcome, DumpOutcome::Aborted);
    }

    #[test]
    fn extension_values_delegate_to_their_callback() {
        let registry = ExtensionRegistry::new();
        registry.register("counter", |key, payload, out| {
            out(&[b"SET", key, payload])
        });
        let mut store = MemoryStore::new(16);
        store.put(
            0,
            b"ext".to_vec(),
            Record::plain(Value::Extension {
                type_name: "counter".to_string(),
                payload: b"41".to_vec(),
            }),
        );

        let file = tempfile().expect("tempfile");
        dump_snapshot(&store.freeze(), &file, 0, &registry, None).expect("dump");
        let mut file = file;
        file.seek(SeekFrom::Start(0)).expect("seek");
        let mut bytes = Vec::new();
        use std::io::Read;
        file.read_to_end(&mut bytes).expect("read");
        let reloaded = replay_into_store(&bytes, 16);
        assert_eq!(reloaded.get(0, b"ext"), Some(b"41".as_slice()));

        // An unregistered type is an error, not silent data loss.
        let mut store = MemoryStore::new(16);
        store.put(
            0,
            b"ext".to_vec(),
            Record::plain(Value::Extension {
                type_name: "mystery".to_string(),
                payload: vec![],
            }),
        );
        let file = tempfile().expect("tempfile");
        assert!(dump_snapshot(&store.freeze(), &file, 0, &ExtensionRegistry::new(), None).is_err());
    }
}
