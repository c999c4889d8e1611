use std::sync::Arc;

use tempfile::TempDir;

use crate::dbformat::{InternalKey, MAX_SEQUENCE_NUMBER, ParsedInternalKey, ValueType};
use crate::env::Env;
use crate::filter::BloomFilterPolicy;
use crate::iterator::Iter;
use crate::options::{Options, ReadOptions};
use crate::status::Status;

use super::builder::TableBuilder;
use super::table_cache::TableCache;
use super::Table;

struct TableFixture {
    dir: TempDir,
    options: Options,
}

impl TableFixture {
    fn new(options: Options) -> TableFixture {
        TableFixture {
            dir: TempDir::new().unwrap(),
            options,
        }
    }

    fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("000007.ldb")
    }

    /// Build a table of `(user_key, value)` pairs, one version each.
    fn build(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> u64 {
        let file = self.options.env.new_writable_file(&self.path()).unwrap();
        let mut builder = TableBuilder::new(self.options.clone(), file);
        for (i, (key, value)) in entries.iter().enumerate() {
            let ikey = InternalKey::new(key, (i + 1) as u64, ValueType::Value);
            builder.add(ikey.encoded(), value).unwrap();
        }
        let (count, size) = builder.finish().unwrap();
        assert_eq!(count, entries.len() as u64);
        size
    }

    fn open(&self, size: u64) -> Arc<Table> {
        let file = self
            .options
            .env
            .new_random_access_file(&self.path())
            .unwrap();
        Arc::new(Table::open(self.options.clone(), file, size).unwrap())
    }
}

fn sorted_entries(n: u32, value_len: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| {
            (
                format!("key-{i:06}").into_bytes(),
                vec![(i % 251) as u8; value_len],
            )
        })
        .collect()
}

fn seek_key(user_key: &[u8]) -> Vec<u8> {
    InternalKey::new(user_key, MAX_SEQUENCE_NUMBER, ValueType::Value)
        .encoded()
        .to_vec()
}

#[test]
fn empty_table_round_trip() {
    let fx = TableFixture::new(Options::default());
    let size = fx.build(&[]);
    let table = fx.open(size);

    let mut it = Table::iter(&table, &ReadOptions::new());
    it.seek_to_first();
    assert!(!it.valid());
    assert!(it.status().is_ok());
}

#[test]
fn build_and_scan_multi_block_table() {
    // Small blocks force many data blocks and index entries.
    let options = Options {
        block_size: 1024,
        ..Options::default()
    };
    let fx = TableFixture::new(options);
    let entries = sorted_entries(2000, 40);
    let size = fx.build(&entries);
    let table = fx.open(size);

    let mut it = Table::iter(&table, &ReadOptions::new());
    it.seek_to_first();
    for (key, value) in &entries {
        assert!(it.valid(), "iterator died early at {key:?}");
        let parsed = ParsedInternalKey::parse(it.key()).unwrap();
        assert_eq!(&parsed.user_key, key);
        assert_eq!(it.value(), value.as_slice());
        it.next();
    }
    assert!(!it.valid());
    assert!(it.status().is_ok());
}

#[test]
fn seek_positions_on_lower_bound() {
    let options = Options {
        block_size: 1024,
        ..Options::default()
    };
    let fx = TableFixture::new(options);
    let entries = sorted_entries(500, 20);
    let size = fx.build(&entries);
    let table = fx.open(size);

    let mut it = Table::iter(&table, &ReadOptions::new());
    it.seek(&seek_key(b"key-000250"));
    assert!(it.valid());
    assert_eq!(
        ParsedInternalKey::parse(it.key()).unwrap().user_key,
        b"key-000250"
    );

    // Between two keys: lands on the next one.
    it.seek(&seek_key(b"key-000250x"));
    assert_eq!(
        ParsedInternalKey::parse(it.key()).unwrap().user_key,
        b"key-000251"
    );

    it.seek(&seek_key(b"key-999999"));
    assert!(!it.valid());
}

#[test]
fn reverse_scan() {
    let options = Options {
        block_size: 512,
        ..Options::default()
    };
    let fx = TableFixture::new(options);
    let entries = sorted_entries(300, 10);
    let size = fx.build(&entries);
    let table = fx.open(size);

    let mut it = Table::iter(&table, &ReadOptions::new());
    it.seek_to_last();
    for (key, _) in entries.iter().rev() {
        assert!(it.valid());
        assert_eq!(&ParsedInternalKey::parse(it.key()).unwrap().user_key, key);
        it.prev();
    }
    assert!(!it.valid());
}

#[test]
fn internal_get_finds_entries() {
    let fx = TableFixture::new(Options::default());
    let entries = sorted_entries(100, 16);
    let size = fx.build(&entries);
    let table = fx.open(size);

    let found = table
        .internal_get(&ReadOptions::new(), &seek_key(b"key-000042"))
        .unwrap();
    let (key, value) = found.expect("key should be found");
    assert_eq!(ParsedInternalKey::parse(&key).unwrap().user_key, b"key-000042");
    assert_eq!(value, entries[42].1);
}

#[test]
fn filter_policy_round_trips_through_file() {
    let options = Options {
        filter_policy: Some(Arc::new(BloomFilterPolicy::new())),
        block_size: 1024,
        ..Options::default()
    };
    let fx = TableFixture::new(options);
    let entries = sorted_entries(1000, 20);
    let size = fx.build(&entries);
    let table = fx.open(size);

    // Every present key must be found despite the filter.
    for probe in [b"key-000000".as_slice(), b"key-000500", b"key-000999"] {
        let found = table
            .internal_get(&ReadOptions::new(), &seek_key(probe))
            .unwrap();
        assert!(found.is_some(), "missing {probe:?}");
    }
}

#[test]
fn block_cache_serves_repeat_reads() {
    let options = Options::default();
    let fx = TableFixture::new(options.clone());
    let entries = sorted_entries(100, 16);
    let size = fx.build(&entries);
    let table = fx.open(size);

    assert_eq!(options.block_cache.total_charge(), 0);
    table
        .internal_get(&ReadOptions::new(), &seek_key(b"key-000001"))
        .unwrap();
    let after_first = options.block_cache.total_charge();
    assert!(after_first > 0, "block should be cached");

    table
        .internal_get(&ReadOptions::new(), &seek_key(b"key-000002"))
        .unwrap();
    // Same (only) block: no growth.
    assert_eq!(options.block_cache.total_charge(), after_first);
}

#[test]
fn corrupt_footer_rejected() {
    let fx = TableFixture::new(Options::default());
    let size = fx.build(&sorted_entries(10, 8));

    // Stomp the magic.
    let path = fx.path();
    let mut data = std::fs::read(&path).unwrap();
    let len = data.len();
    data[len - 1] ^= 0xff;
    std::fs::write(&path, &data).unwrap();

    let file = fx.options.env.new_random_access_file(&path).unwrap();
    match Table::open(fx.options.clone(), file, size) {
        Err(Status::InvalidArgument(_)) | Err(Status::Corruption(_)) => {}
        Ok(_) => panic!("expected corruption error, got Ok(_)"),
        Err(e) => panic!("expected corruption error, got {e:?}"),
    }
}

#[test]
fn corrupt_data_block_detected_with_checksums() {
    let options = Options {
        block_size: 1024,
        ..Options::default()
    };
    let fx = TableFixture::new(options.clone());
    let entries = sorted_entries(500, 30);
    let size = fx.build(&entries);

    // Flip a byte early in the file (inside the first data block).
    let path = fx.path();
    let mut data = std::fs::read(&path).unwrap();
    data[10] ^= 0xff;
    std::fs::write(&path, &data).unwrap();

    let table = fx.open(size);
    let ro = ReadOptions {
        verify_checksums: true,
        ..ReadOptions::new()
    };
    let result = table.internal_get(&ro, &seek_key(b"key-000000"));
    assert!(result.is_err(), "checksum verification should fail");
}

#[test]
fn table_cache_open_get_evict() {
    let options = Options::default();
    let fx = TableFixture::new(options.clone());
    let entries = sorted_entries(50, 10);
    let size = fx.build(&entries);

    let cache = TableCache::new(fx.dir.path().to_path_buf(), options, 100);
    let found = cache
        .get(&ReadOptions::new(), 7, size, &seek_key(b"key-000007"))
        .unwrap();
    assert!(found.is_some());

    cache.evict(7);
    // Reopens transparently after eviction.
    let mut it = cache.iter(&ReadOptions::new(), 7, size);
    it.seek_to_first();
    assert!(it.valid());

    // Unknown file surfaces the error through the iterator status.
    let mut missing = cache.iter(&ReadOptions::new(), 999, 4096);
    missing.seek_to_first();
    assert!(!missing.valid());
    assert!(missing.status().is_err());
}

#[test]
fn zero_length_keys_and_values_survive() {
    let fx = TableFixture::new(Options::default());
    let entries = vec![
        (b"".to_vec(), b"empty-key-value".to_vec()),
        (b"k".to_vec(), b"".to_vec()),
    ];
    let size = fx.build(&entries);
    let table = fx.open(size);

    let mut it = Table::iter(&table, &ReadOptions::new());
    it.seek_to_first();
    assert!(it.valid());
    assert_eq!(ParsedInternalKey::parse(it.key()).unwrap().user_key, b"");
    assert_eq!(it.value(), b"empty-key-value");
    it.next();
    assert_eq!(ParsedInternalKey::parse(it.key()).unwrap().user_key, b"k");
    assert_eq!(it.value(), b"");
}
