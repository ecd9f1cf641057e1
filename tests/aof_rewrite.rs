//! Rewrite failure paths: aborts, repeated failures, the rate limiter, and
//! parent-side install failures after a successful dump.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use ember_aof::dataset::{ExtensionRegistry, Record, SnapshotSource, Value};
use ember_aof::test_support::inject_manifest_persist_failures;
use ember_aof::{
    AofConfig, AofError, AofWriter, BioPool, DurableOffset, FsyncPolicy, Layout, Manifest,
    MemoryStore, Rewriter,
};

struct Rig {
    config: AofConfig,
    layout: Layout,
    manifest: Manifest,
    writer: AofWriter,
    bio: BioPool,
    rewriter: Rewriter,
    extensions: Arc<ExtensionRegistry>,
    _tmp: TempDir,
}

fn rig(registry: ExtensionRegistry) -> Rig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let tmp = TempDir::new().expect("tempdir");
    let config = AofConfig {
        data_dir: tmp.path().to_path_buf(),
        fsync: FsyncPolicy::EverySec,
        ..AofConfig::default()
    };
    let layout = Layout::new(&config);
    layout.ensure().expect("ensure");
    let mut manifest = Manifest::empty();
    let mut writer = AofWriter::new();
    writer
        .open_on_start(&layout, &mut manifest, 0)
        .expect("open writer");
    Rig {
        config,
        layout,
        manifest,
        bio: BioPool::new(DurableOffset::new()),
        writer,
        rewriter: Rewriter::new(),
        extensions: Arc::new(registry),
        _tmp: tmp,
    }
}

fn begin(rig: &mut Rig, snapshot: &MemoryStore, force: bool, now: u64) -> Result<(), AofError> {
    rig.rewriter.begin(
        &rig.config,
        &rig.layout,
        &mut rig.manifest,
        &mut rig.writer,
        &rig.bio,
        snapshot.freeze(),
        None,
        rig.extensions.clone(),
        force,
        now,
    )
}

fn wait_verdict(rig: &mut Rig, now: u64) -> bool {
    for _ in 0..2000 {
        if let Some(result) = rig.rewriter.poll(
            &rig.config,
            &rig.layout,
            &mut rig.manifest,
            &mut rig.writer,
            &rig.bio,
            now,
        ) {
            return result;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("rewrite verdict never arrived");
}

fn failing_registry() -> ExtensionRegistry {
    let registry = ExtensionRegistry::new();
    registry.register("boom", |_key, _payload, _out| {
        Err(AofError::other("injected dump failure"))
    });
    registry
}

fn failing_store() -> MemoryStore {
    let mut store = MemoryStore::new(16);
    store.put(
        0,
        b"doomed".to_vec(),
        Record::plain(Value::Extension {
            type_name: "boom".to_string(),
            payload: vec![],
        }),
    );
    store
}

#[test]
fn aborted_rewrite_changes_nothing_and_counts_no_failure() {
    let registry = ExtensionRegistry::new();
    registry.register("slow", |key, _payload, out| {
        std::thread::sleep(Duration::from_millis(100));
        out(&[b"SET", key, b"x"])
    });
    let mut r = rig(registry);

    let mut store = MemoryStore::new(16);
    for i in 0..30 {
        store.put(
            0,
            format!("slow:{i:02}").into_bytes(),
            Record::plain(Value::Extension {
                type_name: "slow".to_string(),
                payload: vec![],
            }),
        );
    }

    begin(&mut r, &store, true, 1_000).expect("begin");
    let staged_view = r.manifest.encode();
    std::thread::sleep(Duration::from_millis(120));

    r.rewriter.kill(
        &r.config,
        &r.layout,
        &mut r.manifest,
        &mut r.writer,
        &r.bio,
        2_000,
    );

    assert!(!r.rewriter.in_progress());
    assert_eq!(r.rewriter.consecutive_failures(), 0);
    assert!(r.rewriter.last_status_ok());
    assert!(r.manifest.base().is_none());
    assert_eq!(r.manifest.encode(), staged_view);

    // No rewrite temporaries survive the abort.
    let leftovers: Vec<_> = std::fs::read_dir(r.layout.dir())
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("rewriteaof"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
}

#[test]
fn rate_limiter_engages_on_the_third_failure_and_manual_bypasses() {
    let mut r = rig(failing_registry());
    let store = failing_store();
    let now = 1_000_000;

    // Two failures: still no limiting.
    for expected in 1..=2 {
        begin(&mut r, &store, true, now).expect("begin");
        assert!(!wait_verdict(&mut r, now));
        assert_eq!(r.rewriter.consecutive_failures(), expected);
    }

    // The third attempt is allowed to start automatically, and fails.
    begin(&mut r, &store, false, now).expect("third attempt starts");
    assert!(!wait_verdict(&mut r, now));
    assert_eq!(r.rewriter.consecutive_failures(), 3);
    assert!(!r.rewriter.last_status_ok());

    // From now on automatic attempts are limited, manual ones are not.
    let err = begin(&mut r, &store, false, now).expect_err("limited");
    assert!(matches!(err, AofError::RewriteRejected(_)));
    begin(&mut r, &store, true, now).expect("manual bypasses the limiter");
    assert!(!wait_verdict(&mut r, now));
    assert_eq!(r.rewriter.consecutive_failures(), 4);

    // The one-minute window expires and the automatic path opens again.
    let later = now + 2 * 60_000 + 1;
    let _ = r.rewriter.begin(
        &r.config,
        &r.layout,
        &mut r.manifest,
        &mut r.writer,
        &r.bio,
        store.freeze(),
        None,
        r.extensions.clone(),
        false,
        later,
    );
    // Whether this attempt was admitted depends on the accumulated delay;
    // what matters is that a success resets everything.
    if r.rewriter.in_progress() {
        wait_verdict(&mut r, later);
    }
    let clean = MemoryStore::new(16);
    begin(&mut r, &clean, true, later).expect("clean rewrite");
    assert!(wait_verdict(&mut r, later));
    assert_eq!(r.rewriter.consecutive_failures(), 0);
    assert!(r.rewriter.last_status_ok());
}

#[test]
fn install_failure_after_successful_dump_leaves_the_live_manifest() {
    let mut r = rig(ExtensionRegistry::new());
    let mut store = MemoryStore::new(16);
    store.put(
        0,
        b"k".to_vec(),
        Record::plain(Value::Str(b"v".to_vec())),
    );

    begin(&mut r, &store, true, 1_000).expect("begin");
    // The dump will succeed; fail the manifest persist of the install.
    inject_manifest_persist_failures(1);
    assert!(!wait_verdict(&mut r, 2_000));

    assert_eq!(r.rewriter.consecutive_failures(), 1);
    assert!(!r.rewriter.last_status_ok());
    // Live manifest untouched: still no base.
    assert!(r.manifest.base().is_none());
    // The orphan base file was unlinked best-effort.
    let orphans: Vec<_> = std::fs::read_dir(r.layout.dir())
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".base."))
        .collect();
    assert!(orphans.is_empty(), "orphan base files: {orphans:?}");

    // The next attempt succeeds and installs.
    begin(&mut r, &store, true, 3_000).expect("retry");
    assert!(wait_verdict(&mut r, 4_000));
    assert!(r.manifest.base().is_some());
    assert_eq!(r.rewriter.consecutive_failures(), 0);
}

#[test]
fn successful_rewrite_reports_duration_and_resets_base_size() {
    let mut r = rig(ExtensionRegistry::new());
    let mut store = MemoryStore::new(16);
    for i in 0..100 {
        store.put(
            0,
            format!("k{i}").into_bytes(),
            Record::plain(Value::Str(b"value".to_vec())),
        );
    }

    begin(&mut r, &store, true, 10_000).expect("begin");
    assert!(wait_verdict(&mut r, 12_500));
    assert_eq!(r.rewriter.last_rewrite_duration_ms(), Some(2_500));
    assert!(r.rewriter.base_size() > 0);
    assert_eq!(r.rewriter.base_size(), r.manifest.live_size());
}
