//! In-memory write buffer over an ordered skiplist.
//!
//! The memtable absorbs every committed write before it reaches an
//! SSTable. Entries are encoded once into arena storage as
//!
//! ```text
//! [varint32 (klen + 8)][user_key][fixed64 tag][varint32 vlen][value]
//! ```
//!
//! and indexed by the internal-key order, so a seek to
//! `(key, snapshot)` lands on the newest visible version.
//!
//! # Invariants
//!
//! - A memtable only grows; a full memtable is rotated to "immutable"
//!   and replaced, never modified in place.
//! - Memory accounting is the arena's, so rotation triggers on real
//!   allocation, not logical payload size.
//!
//! # Concurrency
//!
//! One writer (the front of the write queue), any number of readers;
//! see [`skiplist`] for the publication protocol.

pub mod arena;
pub mod skiplist;

#[cfg(test)]
mod tests;

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use tracing::trace;

use crate::comparator::Comparator;
use crate::dbformat::{
    InternalKeyComparator, LookupKey, SequenceNumber, ValueType, extract_user_key,
    unpack_sequence_and_type,
};
use crate::encoding::{decode_fixed64, get_length_prefixed_slice, put_fixed64, put_varint32};
use crate::iterator::Iter;
use crate::status::Result;
use arena::Arena;
use skiplist::{KeyComparator, SkipList, SkipListIter};

// ------------------------------------------------------------------------------------------------
// Entry comparator
// ------------------------------------------------------------------------------------------------

/// Orders encoded memtable entries by their internal-key prefix.
#[derive(Clone)]
struct EntryComparator {
    icmp: InternalKeyComparator,
}

impl KeyComparator for EntryComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
        // Entries are produced by MemTable::add; the prefix is always
        // well-formed. An empty fallback orders first, harmlessly.
        let ka = get_length_prefixed_slice(a).map(|(k, _)| k).unwrap_or(&[]);
        let kb = get_length_prefixed_slice(b).map(|(k, _)| k).unwrap_or(&[]);
        self.icmp.compare(ka, kb)
    }
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// Outcome of a memtable point lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum MemTableGet {
    /// Key present with this value.
    Found(Vec<u8>),
    /// Key shadowed by a tombstone; stop probing older layers.
    Deleted,
    /// Key absent from this memtable.
    NotFound,
}

/// Ordered in-memory buffer of internal-key → value entries.
pub struct MemTable {
    icmp: InternalKeyComparator,
    arena: Arc<Arena>,
    table: Arc<SkipList<EntryComparator>>,
}

impl MemTable {
    /// An empty memtable ordered by `icmp`.
    pub fn new(icmp: InternalKeyComparator) -> MemTable {
        let arena = Arc::new(Arena::new());
        let table = Arc::new(SkipList::new(
            EntryComparator { icmp: icmp.clone() },
            Arc::clone(&arena),
        ));
        MemTable { icmp, arena, table }
    }

    /// Bytes of arena memory backing this memtable.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Insert an entry. Typically called via `WriteBatch::insert_into`.
    ///
    /// The caller must be the single serialized writer.
    pub fn add(&self, seq: SequenceNumber, t: ValueType, key: &[u8], value: &[u8]) {
        let internal_key_len = key.len() + 8;
        let mut buf =
            Vec::with_capacity(5 + internal_key_len + 5 + value.len());
        put_varint32(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(key);
        put_fixed64(&mut buf, crate::dbformat::pack_sequence_and_type(seq, t));
        put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);

        trace!(seq, value_type = ?t, klen = key.len(), vlen = value.len(), "memtable add");
        self.table.insert(&buf);
    }

    /// Look up the newest entry visible to `key`'s snapshot.
    pub fn get(&self, key: &LookupKey) -> MemTableGet {
        let mut iter = SkipListIter::new(Arc::clone(&self.table));
        iter.seek(key.memtable_key());
        if !iter.valid() {
            return MemTableGet::NotFound;
        }

        // The seek landed on the first entry >= (user_key, seq). It may
        // belong to a different user key entirely.
        let entry = iter.key();
        let Some((internal_key, key_end)) = get_length_prefixed_slice(entry) else {
            return MemTableGet::NotFound;
        };
        let user_key = extract_user_key(internal_key);
        if self
            .icmp
            .user_comparator()
            .compare(user_key, key.user_key())
            != CmpOrdering::Equal
        {
            return MemTableGet::NotFound;
        }

        let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
        match unpack_sequence_and_type(tag).1 {
            t if t == ValueType::Value as u8 => {
                let value = get_length_prefixed_slice(&entry[key_end..])
                    .map(|(v, _)| v.to_vec())
                    .unwrap_or_default();
                MemTableGet::Found(value)
            }
            _ => MemTableGet::Deleted,
        }
    }

    /// A cursor over the memtable's internal keys. The iterator owns a
    /// reference to the table, so it may outlive this borrow.
    pub fn iter(&self) -> MemTableIter {
        MemTableIter {
            iter: SkipListIter::new(Arc::clone(&self.table)),
            scratch: Vec::new(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// [`Iter`] over a memtable; keys are internal keys.
pub struct MemTableIter {
    iter: SkipListIter<EntryComparator>,
    /// Seek targets must be re-framed with the entry length prefix.
    scratch: Vec<u8>,
}

impl MemTableIter {
    fn current_entry(&self) -> &[u8] {
        debug_assert!(self.iter.valid());
        self.iter.key()
    }
}

impl Iter for MemTableIter {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.iter.seek(&self.scratch);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        get_length_prefixed_slice(self.current_entry())
            .map(|(k, _)| k)
            .unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        let entry = self.current_entry();
        let Some((_, key_end)) = get_length_prefixed_slice(entry) else {
            return &[];
        };
        get_length_prefixed_slice(&entry[key_end..])
            .map(|(v, _)| v)
            .unwrap_or(&[])
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
