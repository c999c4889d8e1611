use std::sync::Arc;

use crate::comparator::BytewiseComparator;
use crate::dbformat::{
    InternalKeyComparator, LookupKey, MAX_SEQUENCE_NUMBER, ParsedInternalKey, ValueType,
};
use crate::iterator::Iter;
use crate::memtable::{MemTable, MemTableGet};

fn memtable() -> MemTable {
    MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
}

#[test]
fn empty_memtable() {
    let mem = memtable();
    assert_eq!(mem.get(&LookupKey::new(b"missing", 100)), MemTableGet::NotFound);
    let mut it = mem.iter();
    it.seek_to_first();
    assert!(!it.valid());
}

#[test]
fn add_then_get() {
    let mem = memtable();
    mem.add(1, ValueType::Value, b"a", b"1");
    mem.add(2, ValueType::Value, b"b", b"2");

    assert_eq!(
        mem.get(&LookupKey::new(b"a", MAX_SEQUENCE_NUMBER)),
        MemTableGet::Found(b"1".to_vec())
    );
    assert_eq!(
        mem.get(&LookupKey::new(b"b", MAX_SEQUENCE_NUMBER)),
        MemTableGet::Found(b"2".to_vec())
    );
    assert_eq!(
        mem.get(&LookupKey::new(b"c", MAX_SEQUENCE_NUMBER)),
        MemTableGet::NotFound
    );
}

#[test]
fn newer_version_shadows_older() {
    let mem = memtable();
    mem.add(1, ValueType::Value, b"k", b"v1");
    mem.add(2, ValueType::Value, b"k", b"v2");

    assert_eq!(
        mem.get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER)),
        MemTableGet::Found(b"v2".to_vec())
    );
    // A snapshot at sequence 1 still sees the old value.
    assert_eq!(mem.get(&LookupKey::new(b"k", 1)), MemTableGet::Found(b"v1".to_vec()));
}

#[test]
fn deletion_reports_deleted_not_notfound() {
    let mem = memtable();
    mem.add(1, ValueType::Value, b"k", b"v");
    mem.add(2, ValueType::Deletion, b"k", b"");

    assert_eq!(mem.get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER)), MemTableGet::Deleted);
    assert_eq!(mem.get(&LookupKey::new(b"k", 1)), MemTableGet::Found(b"v".to_vec()));
}

#[test]
fn snapshot_below_all_versions_sees_nothing() {
    let mem = memtable();
    mem.add(5, ValueType::Value, b"k", b"v");
    assert_eq!(mem.get(&LookupKey::new(b"k", 4)), MemTableGet::NotFound);
}

#[test]
fn empty_keys_and_values() {
    let mem = memtable();
    mem.add(1, ValueType::Value, b"", b"empty-key");
    mem.add(2, ValueType::Value, b"empty-value", b"");

    assert_eq!(
        mem.get(&LookupKey::new(b"", MAX_SEQUENCE_NUMBER)),
        MemTableGet::Found(b"empty-key".to_vec())
    );
    assert_eq!(
        mem.get(&LookupKey::new(b"empty-value", MAX_SEQUENCE_NUMBER)),
        MemTableGet::Found(b"".to_vec())
    );
}

#[test]
fn iterator_yields_internal_keys_in_order() {
    let mem = memtable();
    mem.add(3, ValueType::Value, b"b", b"vb");
    mem.add(1, ValueType::Value, b"a", b"va1");
    mem.add(2, ValueType::Value, b"a", b"va2");

    let mut it = mem.iter();
    it.seek_to_first();

    // "a" newest first, then older "a", then "b".
    let mut seen = Vec::new();
    while it.valid() {
        let parsed = ParsedInternalKey::parse(it.key()).unwrap();
        seen.push((parsed.user_key, parsed.sequence, it.value().to_vec()));
        it.next();
    }
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), 2, b"va2".to_vec()),
            (b"a".to_vec(), 1, b"va1".to_vec()),
            (b"b".to_vec(), 3, b"vb".to_vec()),
        ]
    );
}

#[test]
fn iterator_seek_and_reverse() {
    let mem = memtable();
    for (i, key) in [b"a", b"c", b"e"].iter().enumerate() {
        mem.add(i as u64 + 1, ValueType::Value, *key, b"v");
    }

    let mut it = mem.iter();
    it.seek(&crate::dbformat::InternalKey::new(b"b", MAX_SEQUENCE_NUMBER, ValueType::Value)
        .encoded()
        .to_vec());
    assert!(it.valid());
    assert_eq!(ParsedInternalKey::parse(it.key()).unwrap().user_key, b"c");

    it.seek_to_last();
    assert_eq!(ParsedInternalKey::parse(it.key()).unwrap().user_key, b"e");
    it.prev();
    assert_eq!(ParsedInternalKey::parse(it.key()).unwrap().user_key, b"c");
}

#[test]
fn memory_usage_grows() {
    let mem = memtable();
    let before = mem.approximate_memory_usage();
    for i in 0..100u32 {
        mem.add(i as u64 + 1, ValueType::Value, format!("key-{i}").as_bytes(), &[0u8; 128]);
    }
    assert!(mem.approximate_memory_usage() > before);
    assert!(mem.approximate_memory_usage() >= 100 * 128);
}
