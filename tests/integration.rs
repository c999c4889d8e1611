//! Integration tests for the public `Db` API.
//!
//! These tests exercise the full storage stack (WAL → memtable →
//! SSTable → compaction) through the public `stratadb` surface only.
//! No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, reopen, locking
//! - **CRUD**: put, get, delete, overwrite, batches
//! - **Iteration**: forward/backward scans, seeks, snapshot views
//! - **Persistence**: data and deletes survive reopen; sync writes
//!   survive an unclean shutdown
//! - **Compaction**: heavy write volumes flush and compact; manual
//!   compaction leaves sorted disjoint levels
//! - **Concurrency**: parallel writers, readers during writes

use std::sync::Arc;

use tempfile::TempDir;

use stratadb::{
    BloomFilterPolicy, Db, Iter, Options, ReadOptions, WriteBatch, WriteOptions,
};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Route engine diagnostics through `RUST_LOG` when set.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn default_options() -> Options {
    init_tracing();
    Options {
        create_if_missing: true,
        ..Options::default()
    }
}

/// Smallest legal write buffer: heavy writes spill to level 0 quickly.
fn spill_options() -> Options {
    init_tracing();
    Options {
        create_if_missing: true,
        write_buffer_size: 64 << 10,
        ..Options::default()
    }
}

fn kv(i: u32) -> (Vec<u8>, Vec<u8>) {
    (
        format!("key-{i:06}").into_bytes(),
        format!("value-{i:06}-{}", "x".repeat(80)).into_bytes(),
    )
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Open a fresh database and immediately close it.
///
/// # Expected behavior
/// Both operations succeed; a second open after close succeeds too.
#[test]
fn open_close_reopen() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), default_options()).unwrap();
    db.close().unwrap();
    drop(db);

    let db = Db::open(dir.path(), default_options()).unwrap();
    db.close().unwrap();
}

/// # Scenario
/// Two handles to the same directory at the same time.
///
/// # Expected behavior
/// The advisory `LOCK` file rejects the second open.
#[test]
fn lock_excludes_second_instance() {
    let dir = TempDir::new().unwrap();
    let _db = Db::open(dir.path(), default_options()).unwrap();
    assert!(Db::open(dir.path(), default_options()).is_err());
}

// ================================================================================================
// CRUD
// ================================================================================================

/// # Scenario
/// Basic put/get/delete round trip with overwrites.
#[test]
fn crud_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), default_options()).unwrap();
    let wo = WriteOptions::default();
    let ro = ReadOptions::new();

    db.put(&wo, b"a", b"1").unwrap();
    db.put(&wo, b"b", b"2").unwrap();
    assert_eq!(db.get(&ro, b"a").unwrap().as_deref(), Some(b"1".as_slice()));
    assert_eq!(db.get(&ro, b"b").unwrap().as_deref(), Some(b"2".as_slice()));
    assert_eq!(db.get(&ro, b"c").unwrap(), None);

    db.put(&wo, b"a", b"1.1").unwrap();
    assert_eq!(db.get(&ro, b"a").unwrap().as_deref(), Some(b"1.1".as_slice()));

    db.delete(&wo, b"a").unwrap();
    assert_eq!(db.get(&ro, b"a").unwrap(), None);
    // Deleting a missing key is fine.
    db.delete(&wo, b"never-existed").unwrap();
}

/// # Scenario
/// A batch mixing puts and deletes commits as one unit.
#[test]
fn batched_updates() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), default_options()).unwrap();
    db.put(&WriteOptions::default(), b"old", b"x").unwrap();

    let mut batch = WriteBatch::new();
    batch.put(b"n1", b"v1");
    batch.put(b"n2", b"v2");
    batch.delete(b"old");
    db.write(&WriteOptions::default(), batch).unwrap();

    let ro = ReadOptions::new();
    assert_eq!(db.get(&ro, b"n1").unwrap().as_deref(), Some(b"v1".as_slice()));
    assert_eq!(db.get(&ro, b"n2").unwrap().as_deref(), Some(b"v2".as_slice()));
    assert_eq!(db.get(&ro, b"old").unwrap(), None);
}

// ================================================================================================
// Snapshots
// ================================================================================================

/// # Scenario
/// put("a","1"), snapshot, put("a","2").
///
/// # Expected behavior
/// The snapshot reads "1"; the live view reads "2". After the snapshot
/// drops, compaction may reclaim the old version without affecting the
/// live view.
#[test]
fn snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), default_options()).unwrap();
    let wo = WriteOptions::default();

    db.put(&wo, b"a", b"1").unwrap();
    let snap = db.snapshot();
    db.put(&wo, b"a", b"2").unwrap();

    let at_snap = ReadOptions {
        snapshot: Some(snap),
        ..ReadOptions::new()
    };
    assert_eq!(db.get(&at_snap, b"a").unwrap().as_deref(), Some(b"1".as_slice()));
    assert_eq!(
        db.get(&ReadOptions::new(), b"a").unwrap().as_deref(),
        Some(b"2".as_slice())
    );

    drop(at_snap);
    db.compact_range(None, None).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"a").unwrap().as_deref(),
        Some(b"2".as_slice())
    );
}

/// # Scenario
/// A snapshot taken before a delete still sees the value.
#[test]
fn snapshot_sees_through_delete() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), default_options()).unwrap();
    let wo = WriteOptions::default();

    db.put(&wo, b"k", b"v1").unwrap();
    db.put(&wo, b"k", b"v2").unwrap();
    let snap = db.snapshot();
    db.delete(&wo, b"k").unwrap();

    assert_eq!(db.get(&ReadOptions::new(), b"k").unwrap(), None);
    let at_snap = ReadOptions {
        snapshot: Some(snap),
        ..ReadOptions::new()
    };
    assert_eq!(db.get(&at_snap, b"k").unwrap().as_deref(), Some(b"v2".as_slice()));
}

// ================================================================================================
// Iteration
// ================================================================================================

/// # Scenario
/// Scan the whole database forward and backward across layers: some
/// keys in tables, some in the memtable, some deleted.
#[test]
fn scans_across_layers() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), spill_options()).unwrap();
    let wo = WriteOptions::default();

    for i in 0..1000 {
        let (k, v) = kv(i);
        db.put(&wo, &k, &v).unwrap();
    }
    db.compact_range(None, None).unwrap();
    // Fresh writes land in the memtable; delete a table-resident key.
    db.put(&wo, b"key-000500x", b"inserted-late").unwrap();
    db.delete(&wo, b"key-000100").unwrap();

    let mut it = db.new_iterator(&ReadOptions::new());
    it.seek_to_first();
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    let mut saw_late = false;
    while it.valid() {
        let key = it.key().to_vec();
        if let Some(p) = &prev {
            assert!(p < &key, "keys out of order");
        }
        assert_ne!(key, b"key-000100".to_vec(), "deleted key visible");
        if key == b"key-000500x" {
            saw_late = true;
            assert_eq!(it.value(), b"inserted-late");
        }
        prev = Some(key);
        count += 1;
        it.next();
    }
    assert_eq!(count, 1000); // 1000 - 1 deleted + 1 late insert
    assert!(saw_late);

    // Backward pass sees the same count.
    it.seek_to_last();
    let mut back_count = 0;
    while it.valid() {
        back_count += 1;
        it.prev();
    }
    assert_eq!(back_count, 1000);
}

/// # Scenario
/// Seek lands on the smallest key at or after the target.
#[test]
fn seek_semantics() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), default_options()).unwrap();
    let wo = WriteOptions::default();
    for key in [b"b" as &[u8], b"d", b"f"] {
        db.put(&wo, key, b"v").unwrap();
    }

    let mut it = db.new_iterator(&ReadOptions::new());
    it.seek(b"a");
    assert_eq!(it.key(), b"b");
    it.seek(b"d");
    assert_eq!(it.key(), b"d");
    it.seek(b"e");
    assert_eq!(it.key(), b"f");
    it.seek(b"g");
    assert!(!it.valid());
}

// ================================================================================================
// Persistence & recovery
// ================================================================================================

/// # Scenario
/// Insert 100,000 keys with ~100-byte values through a small write
/// buffer.
///
/// # Expected behavior
/// At least one level-0 flush happens, compactions move data to deeper
/// levels, and every key reads back correctly after a reopen.
#[test]
fn bulk_load_flush_compact_reopen() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), spill_options()).unwrap();
    let wo = WriteOptions::default();

    for i in 0..100_000 {
        let (k, v) = kv(i);
        db.put(&wo, &k, &v).unwrap();
    }

    let deep_files: usize = (1..7).map(|l| db.num_level_files(l)).sum();
    assert!(deep_files > 0, "compaction never moved data past level 0");

    let (probe_key, probe_value) = kv(50_000);
    assert_eq!(
        db.get(&ReadOptions::new(), &probe_key).unwrap(),
        Some(probe_value.clone())
    );

    db.close().unwrap();
    drop(db);

    let db = Db::open(dir.path(), spill_options()).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), &probe_key).unwrap(),
        Some(probe_value)
    );
    let (first_key, first_value) = kv(0);
    let (last_key, last_value) = kv(99_999);
    assert_eq!(db.get(&ReadOptions::new(), &first_key).unwrap(), Some(first_value));
    assert_eq!(db.get(&ReadOptions::new(), &last_key).unwrap(), Some(last_value));
}

/// # Scenario
/// A synced write followed by an unclean shutdown (no close).
///
/// # Expected behavior
/// Reopening replays the WAL; the write is present.
#[test]
fn synced_write_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), default_options()).unwrap();
        db.put(&WriteOptions { sync: true }, b"x", b"y").unwrap();
        std::mem::forget(db); // crash: no close, no flush
    }
    // The forgotten handle still pins the old LOCK inode in this
    // process; clear it the way a new process start would.
    std::fs::remove_file(dir.path().join("LOCK")).unwrap();

    let db = Db::open(dir.path(), default_options()).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"x").unwrap().as_deref(),
        Some(b"y".as_slice())
    );
}

/// # Scenario
/// Deletes and overwrites persist across several close/reopen cycles.
#[test]
fn state_converges_across_reopens() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), default_options()).unwrap();
        let wo = WriteOptions::default();
        db.put(&wo, b"keep", b"v1").unwrap();
        db.put(&wo, b"drop", b"v1").unwrap();
        db.close().unwrap();
    }
    {
        let db = Db::open(dir.path(), default_options()).unwrap();
        let wo = WriteOptions::default();
        db.put(&wo, b"keep", b"v2").unwrap();
        db.delete(&wo, b"drop").unwrap();
        db.close().unwrap();
    }
    let db = Db::open(dir.path(), default_options()).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"keep").unwrap().as_deref(),
        Some(b"v2".as_slice())
    );
    assert_eq!(db.get(&ReadOptions::new(), b"drop").unwrap(), None);
}

// ================================================================================================
// Compaction
// ================================================================================================

/// # Scenario
/// Fill, delete half, manually compact the full range.
///
/// # Expected behavior
/// Level 0 drains, remaining keys read back, deleted keys stay gone,
/// and disk usage shrinks once tombstones are applied.
#[test]
fn manual_compaction_applies_tombstones() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), spill_options()).unwrap();
    let wo = WriteOptions::default();

    for i in 0..5000 {
        let (k, v) = kv(i);
        db.put(&wo, &k, &v).unwrap();
    }
    for i in 0..5000 {
        if i % 2 == 0 {
            let (k, _) = kv(i);
            db.delete(&wo, &k).unwrap();
        }
    }

    db.compact_range(None, None).unwrap();
    assert_eq!(db.num_level_files(0), 0);

    let ro = ReadOptions::new();
    let (even_key, _) = kv(2048);
    let (odd_key, odd_value) = kv(2049);
    assert_eq!(db.get(&ro, &even_key).unwrap(), None);
    assert_eq!(db.get(&ro, &odd_key).unwrap(), Some(odd_value));

    let mut it = db.new_iterator(&ro);
    it.seek_to_first();
    let mut count = 0;
    while it.valid() {
        count += 1;
        it.next();
    }
    assert_eq!(count, 2500);
}

/// # Scenario
/// A bloom filter policy is active across build, read, and reopen.
#[test]
fn bloom_filters_end_to_end() {
    let options = Options {
        filter_policy: Some(Arc::new(BloomFilterPolicy::new())),
        write_buffer_size: 64 << 10,
        create_if_missing: true,
        ..Options::default()
    };
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), options.clone()).unwrap();
    let wo = WriteOptions::default();

    for i in 0..3000 {
        let (k, v) = kv(i);
        db.put(&wo, &k, &v).unwrap();
    }
    db.compact_range(None, None).unwrap();

    let ro = ReadOptions::new();
    let (hit_key, hit_value) = kv(1234);
    assert_eq!(db.get(&ro, &hit_key).unwrap(), Some(hit_value));
    assert_eq!(db.get(&ro, b"not-a-key").unwrap(), None);

    db.close().unwrap();
    drop(db);
    let db = Db::open(dir.path(), options).unwrap();
    let (hit_key, hit_value) = kv(2999);
    assert_eq!(db.get(&ReadOptions::new(), &hit_key).unwrap(), Some(hit_value));
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Four threads write disjoint key ranges while a reader polls.
///
/// # Expected behavior
/// Every write commits; reads never observe corruption or errors.
#[test]
fn concurrent_writers_and_reader() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), spill_options()).unwrap();

    let mut writers = Vec::new();
    for t in 0..4u32 {
        let db = db.clone();
        writers.push(std::thread::spawn(move || {
            let wo = WriteOptions::default();
            for i in 0..500u32 {
                let key = format!("w{t}-{i:05}");
                db.put(&wo, key.as_bytes(), key.as_bytes()).unwrap();
            }
        }));
    }

    let reader = {
        let db = db.clone();
        std::thread::spawn(move || {
            let ro = ReadOptions::new();
            for _ in 0..2000 {
                let _ = db.get(&ro, b"w0-00000").unwrap();
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();

    let ro = ReadOptions::new();
    for t in 0..4u32 {
        for i in (0..500u32).step_by(100) {
            let key = format!("w{t}-{i:05}");
            assert_eq!(
                db.get(&ro, key.as_bytes()).unwrap().as_deref(),
                Some(key.as_bytes()),
                "{key} missing"
            );
        }
    }
}
