//! Value model and dataset interfaces consumed by the serializer and the
//! loader.
//!
//! The persistence engine never owns the live dataset. It consumes two
//! narrow interfaces: [`SnapshotSource`] hands the rewriter a frozen
//! [`DatasetSnapshot`] to serialize, and [`ReplaySink`] receives decoded
//! command vectors during load. [`MemoryStore`] is the reference
//! implementation of both, used by the test suite and as a template for
//! embedders wiring in their own store.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, Write};

use parking_lot::RwLock;

use crate::error::{AofError, AofResult};

pub type Bytes = Vec<u8>;

/// Five-byte magic marking a binary snapshot-encoded base segment.
pub const SNAPSHOT_MAGIC: &[u8; 5] = b"REDIS";

/// Stream entry identifier, ordered by (ms, seq).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parses the canonical `<ms>-<seq>` form.
    pub fn parse(text: &str) -> Option<Self> {
        let (ms, seq) = text.split_once('-')?;
        Some(Self {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
}

/// One not-yet-acknowledged delivery owned by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: StreamId,
    pub delivery_time_ms: u64,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConsumer {
    pub name: Bytes,
    pub pending: Vec<PendingEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamGroup {
    pub name: Bytes,
    pub last_id: StreamId,
    pub entries_read: u64,
    pub consumers: Vec<StreamConsumer>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamValue {
    pub entries: Vec<StreamEntry>,
    pub last_id: StreamId,
    pub max_deleted_id: StreamId,
    pub entries_added: u64,
    pub groups: Vec<StreamGroup>,
}

/// Hash field with an optional field-level expiration.
#[derive(Debug, Clone, PartialEq)]
pub struct HashField {
    pub field: Bytes,
    pub value: Bytes,
    pub expire_at_ms: Option<u64>,
}

/// The value types the serializer knows how to reconstruct.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    SortedSet(Vec<(f64, Bytes)>),
    Hash(Vec<HashField>),
    Stream(StreamValue),
    /// Value owned by an extension type; reconstruction is delegated to the
    /// callback its registrar supplied.
    Extension { type_name: String, payload: Bytes },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub value: Value,
    pub expire_at_ms: Option<u64>,
}

impl Record {
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            expire_at_ms: None,
        }
    }
}

/// Frozen view of one database: index plus entries in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbSnapshot {
    pub index: u32,
    pub entries: Vec<(Bytes, Record)>,
}

/// Frozen view of the whole dataset at one logical version. Only non-empty
/// databases appear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetSnapshot {
    pub dbs: Vec<DbSnapshot>,
}

impl DatasetSnapshot {
    pub fn key_count(&self) -> u64 {
        self.dbs.iter().map(|db| db.entries.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.dbs.iter().all(|db| db.entries.is_empty())
    }
}

/// Produces a frozen dataset view for the rewriter. Implementations must
/// guarantee the returned snapshot does not change under subsequent writes.
pub trait SnapshotSource {
    fn freeze(&self) -> DatasetSnapshot;
}

/// Receives decoded command vectors during replay.
///
/// The sink is the loader's synthetic client: it must never block and its
/// replies are discarded, so `apply` only reports success or a fatal replay
/// error. A command the sink does not recognize must surface as
/// [`AofError::UnknownCommand`].
pub trait ReplaySink {
    fn apply(&mut self, argv: &[Bytes]) -> AofResult<()>;
}

/// Binary snapshot encoder/decoder for base segments.
///
/// `encode` must begin its output with [`SNAPSHOT_MAGIC`]. `decode` consumes
/// the snapshot portion (magic included) and returns the byte count it read,
/// leaving the reader positioned at any appended command tail.
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, snapshot: &DatasetSnapshot, out: &mut dyn Write) -> AofResult<()>;
    fn decode(&self, input: &mut dyn BufRead, sink: &mut dyn ReplaySink) -> AofResult<u64>;
}

/// Emission callback for one extension type: receives the key, the payload,
/// and a sink accepting reconstruction command vectors.
pub type ExtensionEmitFn =
    dyn Fn(&[u8], &[u8], &mut dyn FnMut(&[&[u8]]) -> AofResult<()>) -> AofResult<()> + Send + Sync;

/// Registry mapping extension type names to their rewrite callbacks.
///
/// The registry is shared with rewrite dump threads, and registrars may
/// show up after the engine is already running, so it is internally
/// synchronized.
#[derive(Default)]
pub struct ExtensionRegistry {
    emitters: RwLock<BTreeMap<String, Box<ExtensionEmitFn>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, type_name: &str, emit: F)
    where
        F: Fn(&[u8], &[u8], &mut dyn FnMut(&[&[u8]]) -> AofResult<()>) -> AofResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.emitters
            .write()
            .insert(type_name.to_string(), Box::new(emit));
    }

    pub fn emit(
        &self,
        type_name: &str,
        key: &[u8],
        payload: &[u8],
        out: &mut dyn FnMut(&[&[u8]]) -> AofResult<()>,
    ) -> AofResult<()> {
        let emitters = self.emitters.read();
        let emitter = emitters.get(type_name).ok_or_else(|| {
            AofError::invalid_state(format!(
                "no rewrite callback registered for extension type '{type_name}'"
            ))
        })?;
        emitter(key, payload, out)
    }
}

/// Reference in-memory store implementing both dataset interfaces.
///
/// Keys live in per-database ordered maps so snapshots and reads are
/// deterministic. Write commands cover exactly the vocabulary the
/// serializer emits, plus the handful used by callers feeding the log
/// directly (`INCR`, `MULTI`/`EXEC` as no-ops).
#[derive(Debug, Clone)]
pub struct MemoryStore {
    dbs: Vec<BTreeMap<Bytes, Record>>,
    selected: usize,
}

impl MemoryStore {
    pub fn new(databases: u32) -> Self {
        Self {
            dbs: vec![BTreeMap::new(); databases as usize],
            selected: 0,
        }
    }

    pub fn database_count(&self) -> u32 {
        self.dbs.len() as u32
    }

    /// Inserts a record directly, bypassing the command layer. Used to build
    /// datasets for serialization tests.
    pub fn put(&mut self, db: u32, key: impl Into<Bytes>, record: Record) {
        self.dbs[db as usize].insert(key.into(), record);
    }

    pub fn record(&self, db: u32, key: &[u8]) -> Option<&Record> {
        self.dbs[db as usize].get(key)
    }

    pub fn key_count(&self, db: u32) -> usize {
        self.dbs[db as usize].len()
    }

    pub fn is_empty(&self) -> bool {
        self.dbs.iter().all(|db| db.is_empty())
    }

    pub fn get(&self, db: u32, key: &[u8]) -> Option<&[u8]> {
        match self.record(db, key)?.value {
            Value::Str(ref bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    pub fn lrange(&self, db: u32, key: &[u8]) -> Vec<Bytes> {
        match self.record(db, key) {
            Some(Record {
                value: Value::List(items),
                ..
            }) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Members in sorted order, independent of insertion order.
    pub fn smembers(&self, db: u32, key: &[u8]) -> Vec<Bytes> {
        match self.record(db, key) {
            Some(Record {
                value: Value::Set(members),
                ..
            }) => {
                let mut sorted = members.clone();
                sorted.sort();
                sorted
            }
            _ => Vec::new(),
        }
    }

    /// `(member, score)` pairs ordered by score, then member.
    pub fn zrange_with_scores(&self, db: u32, key: &[u8]) -> Vec<(Bytes, f64)> {
        match self.record(db, key) {
            Some(Record {
                value: Value::SortedSet(pairs),
                ..
            }) => {
                let mut out: Vec<(Bytes, f64)> = pairs
                    .iter()
                    .map(|(score, member)| (member.clone(), *score))
                    .collect();
                out.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                out
            }
            _ => Vec::new(),
        }
    }

    /// `(field, value)` pairs in field order.
    pub fn hgetall(&self, db: u32, key: &[u8]) -> Vec<(Bytes, Bytes)> {
        match self.record(db, key) {
            Some(Record {
                value: Value::Hash(fields),
                ..
            }) => {
                let mut out: Vec<(Bytes, Bytes)> = fields
                    .iter()
                    .map(|f| (f.field.clone(), f.value.clone()))
                    .collect();
                out.sort();
                out
            }
            _ => Vec::new(),
        }
    }

    pub fn hpexpiretime(&self, db: u32, key: &[u8], field: &[u8]) -> Option<u64> {
        match self.record(db, key) {
            Some(Record {
                value: Value::Hash(fields),
                ..
            }) => fields
                .iter()
                .find(|f| f.field == field)
                .and_then(|f| f.expire_at_ms),
            _ => None,
        }
    }

    pub fn pexpiretime(&self, db: u32, key: &[u8]) -> Option<u64> {
        self.record(db, key)?.expire_at_ms
    }

    pub fn xrange(&self, db: u32, key: &[u8]) -> Vec<StreamEntry> {
        match self.record(db, key) {
            Some(Record {
                value: Value::Stream(stream),
                ..
            }) => stream.entries.clone(),
            _ => Vec::new(),
        }
    }

    pub fn stream(&self, db: u32, key: &[u8]) -> Option<&StreamValue> {
        match self.record(db, key) {
            Some(Record {
                value: Value::Stream(stream),
                ..
            }) => Some(stream),
            _ => None,
        }
    }

    fn db_mut(&mut self) -> &mut BTreeMap<Bytes, Record> {
        &mut self.dbs[self.selected]
    }

    fn stream_entry_mut(&mut self, key: &[u8]) -> &mut StreamValue {
        let record = self
            .db_mut()
            .entry(key.to_vec())
            .or_insert_with(|| Record::plain(Value::Stream(StreamValue::default())));
        if !matches!(record.value, Value::Stream(_)) {
            record.value = Value::Stream(StreamValue::default());
        }
        match record.value {
            Value::Stream(ref mut stream) => stream,
            _ => unreachable!("value was just normalized to a stream"),
        }
    }

    fn apply_xadd(&mut self, argv: &[Bytes]) -> AofResult<()> {
        let key = &argv[1];
        let mut i = 2;
        let mut maxlen: Option<u64> = None;
        if argv.get(i).map(|a| ascii_upper(a)) == Some("MAXLEN".to_string()) {
            let bound = argv
                .get(i + 1)
                .ok_or_else(|| arity_error("XADD"))?;
            maxlen = Some(parse_u64(bound, "XADD MAXLEN")?);
            i += 2;
        }
        let id = parse_stream_id(argv.get(i).ok_or_else(|| arity_error("XADD"))?)?;
        i += 1;
        let rest = &argv[i..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return Err(arity_error("XADD"));
        }
        let fields: Vec<(Bytes, Bytes)> = rest
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        let key = key.clone();
        let stream = self.stream_entry_mut(&key);
        stream.entries.push(StreamEntry { id, fields });
        stream.entries_added += 1;
        if id > stream.last_id {
            stream.last_id = id;
        }
        if let Some(maxlen) = maxlen {
            while stream.entries.len() as u64 > maxlen {
                stream.entries.remove(0);
            }
        }
        Ok(())
    }

    fn apply_xsetid(&mut self, argv: &[Bytes]) -> AofResult<()> {
        let key = argv[1].clone();
        let last_id = parse_stream_id(&argv[2])?;
        let mut entries_added = None;
        let mut max_deleted = None;
        let mut i = 3;
        while i < argv.len() {
            match ascii_upper(&argv[i]).as_str() {
                "ENTRIESADDED" => {
                    let value = argv.get(i + 1).ok_or_else(|| arity_error("XSETID"))?;
                    entries_added = Some(parse_u64(value, "XSETID ENTRIESADDED")?);
                    i += 2;
                }
                "MAXDELETEDID" => {
                    let value = argv.get(i + 1).ok_or_else(|| arity_error("XSETID"))?;
                    max_deleted = Some(parse_stream_id(value)?);
                    i += 2;
                }
                _ => return Err(arity_error("XSETID")),
            }
        }
        let stream = self.stream_entry_mut(&key);
        stream.last_id = last_id;
        if let Some(added) = entries_added {
            stream.entries_added = added;
        }
        if let Some(max_deleted) = max_deleted {
            stream.max_deleted_id = max_deleted;
        }
        Ok(())
    }

    fn apply_xgroup(&mut self, argv: &[Bytes]) -> AofResult<()> {
        match ascii_upper(&argv[1]).as_str() {
            "CREATE" => {
                if argv.len() < 5 {
                    return Err(arity_error("XGROUP CREATE"));
                }
                let key = argv[2].clone();
                let group_name = argv[3].clone();
                let explicit_last = std::str::from_utf8(&argv[4]).ok().map(str::to_string);
                let mut entries_read = 0;
                let mut i = 5;
                while i < argv.len() {
                    match ascii_upper(&argv[i]).as_str() {
                        "ENTRIESREAD" => {
                            let value =
                                argv.get(i + 1).ok_or_else(|| arity_error("XGROUP CREATE"))?;
                            entries_read = parse_u64(value, "XGROUP ENTRIESREAD")?;
                            i += 2;
                        }
                        _ => return Err(arity_error("XGROUP CREATE")),
                    }
                }
                let stream = self.stream_entry_mut(&key);
                let last_id = match explicit_last.as_deref() {
                    Some("$") => stream.last_id,
                    Some(text) => parse_stream_id_str(text)?,
                    None => return Err(arity_error("XGROUP CREATE")),
                };
                if !stream.groups.iter().any(|g| g.name == group_name) {
                    stream.groups.push(StreamGroup {
                        name: group_name,
                        last_id,
                        entries_read,
                        consumers: Vec::new(),
                    });
                }
                Ok(())
            }
            other => Err(AofError::other(format!(
                "unsupported XGROUP subcommand '{other}' during replay"
            ))),
        }
    }

    fn apply_xclaim(&mut self, argv: &[Bytes]) -> AofResult<()> {
        if argv.len() < 6 {
            return Err(arity_error("XCLAIM"));
        }
        let key = argv[1].clone();
        let group_name = argv[2].clone();
        let consumer_name = argv[3].clone();
        let id = parse_stream_id(&argv[5])?;
        let mut delivery_time_ms = 0;
        let mut delivery_count = 1;
        let mut i = 6;
        while i < argv.len() {
            match ascii_upper(&argv[i]).as_str() {
                "TIME" => {
                    let value = argv.get(i + 1).ok_or_else(|| arity_error("XCLAIM"))?;
                    delivery_time_ms = parse_u64(value, "XCLAIM TIME")?;
                    i += 2;
                }
                "RETRYCOUNT" => {
                    let value = argv.get(i + 1).ok_or_else(|| arity_error("XCLAIM"))?;
                    delivery_count = parse_u64(value, "XCLAIM RETRYCOUNT")?;
                    i += 2;
                }
                "JUSTID" | "FORCE" => i += 1,
                _ => return Err(arity_error("XCLAIM")),
            }
        }
        let stream = self.stream_entry_mut(&key);
        let group = stream
            .groups
            .iter_mut()
            .find(|g| g.name == group_name)
            .ok_or_else(|| {
                AofError::other("XCLAIM during replay references a missing group")
            })?;
        let consumer = match group.consumers.iter_mut().position(|c| c.name == consumer_name) {
            Some(pos) => &mut group.consumers[pos],
            None => {
                group.consumers.push(StreamConsumer {
                    name: consumer_name,
                    pending: Vec::new(),
                });
                group.consumers.last_mut().expect("just pushed")
            }
        };
        consumer.pending.push(PendingEntry {
            id,
            delivery_time_ms,
            delivery_count,
        });
        Ok(())
    }
}

impl SnapshotSource for MemoryStore {
    fn freeze(&self) -> DatasetSnapshot {
        let mut dbs = Vec::new();
        for (index, db) in self.dbs.iter().enumerate() {
            if db.is_empty() {
                continue;
            }
            dbs.push(DbSnapshot {
                index: index as u32,
                entries: db
                    .iter()
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect(),
            });
        }
        DatasetSnapshot { dbs }
    }
}

impl ReplaySink for MemoryStore {
    fn apply(&mut self, argv: &[Bytes]) -> AofResult<()> {
        if argv.is_empty() {
            return Err(AofError::other("empty command vector"));
        }
        let name = ascii_upper(&argv[0]);
        match name.as_str() {
            "SELECT" => {
                if argv.len() != 2 {
                    return Err(arity_error("SELECT"));
                }
                let index = parse_u64(&argv[1], "SELECT")? as usize;
                if index >= self.dbs.len() {
                    return Err(AofError::other(format!(
                        "SELECT {index} is out of range ({} databases)",
                        self.dbs.len()
                    )));
                }
                self.selected = index;
                Ok(())
            }
            "SET" => {
                if argv.len() != 3 {
                    return Err(arity_error("SET"));
                }
                let key = argv[1].clone();
                let value = argv[2].clone();
                self.db_mut().insert(key, Record::plain(Value::Str(value)));
                Ok(())
            }
            "INCR" => {
                if argv.len() != 2 {
                    return Err(arity_error("INCR"));
                }
                let key = argv[1].clone();
                let current = match self.db_mut().get(&key) {
                    Some(Record {
                        value: Value::Str(bytes),
                        ..
                    }) => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| AofError::other("INCR on a non-integer value"))?,
                    Some(_) => return Err(AofError::other("INCR on a non-string value")),
                    None => 0,
                };
                let next = current + 1;
                self.db_mut()
                    .insert(key, Record::plain(Value::Str(next.to_string().into_bytes())));
                Ok(())
            }
            "RPUSH" => {
                if argv.len() < 3 {
                    return Err(arity_error("RPUSH"));
                }
                let key = argv[1].clone();
                let record = self
                    .db_mut()
                    .entry(key)
                    .or_insert_with(|| Record::plain(Value::List(Vec::new())));
                match record.value {
                    Value::List(ref mut items) => {
                        items.extend(argv[2..].iter().cloned());
                        Ok(())
                    }
                    _ => Err(AofError::other("RPUSH on a non-list value")),
                }
            }
            "SADD" => {
                if argv.len() < 3 {
                    return Err(arity_error("SADD"));
                }
                let key = argv[1].clone();
                let record = self
                    .db_mut()
                    .entry(key)
                    .or_insert_with(|| Record::plain(Value::Set(Vec::new())));
                match record.value {
                    Value::Set(ref mut members) => {
                        for member in &argv[2..] {
                            if !members.contains(member) {
                                members.push(member.clone());
                            }
                        }
                        Ok(())
                    }
                    _ => Err(AofError::other("SADD on a non-set value")),
                }
            }
            "ZADD" => {
                if argv.len() < 4 || argv.len() % 2 != 0 {
                    return Err(arity_error("ZADD"));
                }
                let key = argv[1].clone();
                let record = self
                    .db_mut()
                    .entry(key)
                    .or_insert_with(|| Record::plain(Value::SortedSet(Vec::new())));
                match record.value {
                    Value::SortedSet(ref mut pairs) => {
                        for pair in argv[2..].chunks(2) {
                            let score = parse_f64(&pair[0])?;
                            let member = pair[1].clone();
                            match pairs.iter_mut().find(|(_, m)| *m == member) {
                                Some(existing) => existing.0 = score,
                                None => pairs.push((score, member)),
                            }
                        }
                        Ok(())
                    }
                    _ => Err(AofError::other("ZADD on a non-sorted-set value")),
                }
            }
            "HMSET" | "HSET" => {
                if argv.len() < 4 || argv.len() % 2 != 0 {
                    return Err(arity_error("HMSET"));
                }
                let key = argv[1].clone();
                let record = self
                    .db_mut()
                    .entry(key)
                    .or_insert_with(|| Record::plain(Value::Hash(Vec::new())));
                match record.value {
                    Value::Hash(ref mut fields) => {
                        for pair in argv[2..].chunks(2) {
                            match fields.iter_mut().find(|f| f.field == pair[0]) {
                                Some(existing) => existing.value = pair[1].clone(),
                                None => fields.push(HashField {
                                    field: pair[0].clone(),
                                    value: pair[1].clone(),
                                    expire_at_ms: None,
                                }),
                            }
                        }
                        Ok(())
                    }
                    _ => Err(AofError::other("HMSET on a non-hash value")),
                }
            }
            "HPEXPIREAT" => {
                // HPEXPIREAT <key> <unix-ms> FIELDS <numfields> <field...>
                if argv.len() < 6 || ascii_upper(&argv[3]) != "FIELDS" {
                    return Err(arity_error("HPEXPIREAT"));
                }
                let key = argv[1].clone();
                let at_ms = parse_u64(&argv[2], "HPEXPIREAT")?;
                let numfields = parse_u64(&argv[4], "HPEXPIREAT FIELDS")? as usize;
                if argv.len() != 5 + numfields {
                    return Err(arity_error("HPEXPIREAT"));
                }
                let record = self
                    .db_mut()
                    .get_mut(&key)
                    .ok_or_else(|| AofError::other("HPEXPIREAT on a missing key"))?;
                match record.value {
                    Value::Hash(ref mut fields) => {
                        for wanted in &argv[5..] {
                            if let Some(field) =
                                fields.iter_mut().find(|f| f.field == *wanted)
                            {
                                field.expire_at_ms = Some(at_ms);
                            }
                        }
                        Ok(())
                    }
                    _ => Err(AofError::other("HPEXPIREAT on a non-hash value")),
                }
            }
            "PEXPIREAT" => {
                if argv.len() != 3 {
                    return Err(arity_error("PEXPIREAT"));
                }
                let key = argv[1].clone();
                let at_ms = parse_u64(&argv[2], "PEXPIREAT")?;
                if let Some(record) = self.db_mut().get_mut(&key) {
                    record.expire_at_ms = Some(at_ms);
                }
                Ok(())
            }
            "XADD" => {
                if argv.len() < 5 {
                    return Err(arity_error("XADD"));
                }
                self.apply_xadd(argv)
            }
            "XSETID" => {
                if argv.len() < 3 {
                    return Err(arity_error("XSETID"));
                }
                self.apply_xsetid(argv)
            }
            "XGROUP" => {
                if argv.len() < 4 {
                    return Err(arity_error("XGROUP"));
                }
                if ascii_upper(&argv[1]) == "CREATECONSUMER" {
                    if argv.len() != 5 {
                        return Err(arity_error("XGROUP CREATECONSUMER"));
                    }
                    let key = argv[2].clone();
                    let group_name = argv[3].clone();
                    let consumer_name = argv[4].clone();
                    let stream = self.stream_entry_mut(&key);
                    let group = stream
                        .groups
                        .iter_mut()
                        .find(|g| g.name == group_name)
                        .ok_or_else(|| {
                            AofError::other(
                                "XGROUP CREATECONSUMER during replay references a missing group",
                            )
                        })?;
                    if !group.consumers.iter().any(|c| c.name == consumer_name) {
                        group.consumers.push(StreamConsumer {
                            name: consumer_name,
                            pending: Vec::new(),
                        });
                    }
                    return Ok(());
                }
                self.apply_xgroup(argv)
            }
            "XCLAIM" => self.apply_xclaim(argv),
            "MULTI" | "EXEC" => Ok(()),
            other => Err(AofError::UnknownCommand(other.to_string())),
        }
    }
}

fn ascii_upper(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| (*b as char).to_ascii_uppercase())
        .collect()
}

fn arity_error(command: &str) -> AofError {
    AofError::other(format!("wrong number of arguments for '{command}'"))
}

fn parse_u64(bytes: &[u8], context: &str) -> AofResult<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AofError::other(format!("{context}: expected an unsigned integer")))
}

fn parse_f64(bytes: &[u8]) -> AofResult<f64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AofError::other("expected a floating point score"))
}

fn parse_stream_id(bytes: &[u8]) -> AofResult<StreamId> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| AofError::other("stream id is not valid UTF-8"))?;
    parse_stream_id_str(text)
}

fn parse_stream_id_str(text: &str) -> AofResult<StreamId> {
    StreamId::parse(text)
        .ok_or_else(|| AofError::other(format!("bad stream id '{text}'")))
}
