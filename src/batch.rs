//! Atomic batches of updates.
//!
//! A [`WriteBatch`] accumulates puts and deletes and commits them as
//! one unit: the whole batch gets one contiguous range of sequence
//! numbers, one log record, and one memtable application. The encoded
//! representation doubles as the WAL payload:
//!
//! ```text
//! rep := sequence(fixed64) count(fixed32) record*
//! record := Value(1)    key(slice) value(slice)
//!         | Deletion(0) key(slice)
//! ```
//!
//! Group commit concatenates batches by appending their record bodies
//! and summing their counts.

use crate::dbformat::{SequenceNumber, ValueType};
use crate::encoding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_fixed32, put_fixed64,
    put_length_prefixed_slice,
};
use crate::memtable::MemTable;
use crate::status::{Result, Status};

/// Bytes of sequence + count before the records.
pub(crate) const BATCH_HEADER_SIZE: usize = 12;

/// Receiver for the entries of a batch, in insertion order.
pub trait BatchHandler {
    /// A put of `key` → `value`.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// A delete of `key`.
    fn delete(&mut self, key: &[u8]);
}

/// An ordered set of updates applied atomically.
#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> WriteBatch {
        let mut rep = Vec::with_capacity(BATCH_HEADER_SIZE);
        rep.resize(BATCH_HEADER_SIZE, 0);
        WriteBatch { rep }
    }

    /// Record a put of `key` → `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Record a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Drop every buffered update.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Bytes this batch will occupy in the log.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Whether the batch holds no updates.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Replay the updates into `handler` in insertion order.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<()> {
        if self.rep.len() < BATCH_HEADER_SIZE {
            return Err(Status::corruption("malformed WriteBatch (too small)"));
        }
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0u32;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match tag {
                t if t == ValueType::Value as u8 => {
                    let (key, n) = get_length_prefixed_slice(input)
                        .ok_or_else(|| Status::corruption("bad WriteBatch put key"))?;
                    let (value, m) = get_length_prefixed_slice(&input[n..])
                        .ok_or_else(|| Status::corruption("bad WriteBatch put value"))?;
                    handler.put(key, value);
                    input = &input[n + m..];
                }
                t if t == ValueType::Deletion as u8 => {
                    let (key, n) = get_length_prefixed_slice(input)
                        .ok_or_else(|| Status::corruption("bad WriteBatch delete key"))?;
                    handler.delete(key);
                    input = &input[n..];
                }
                other => {
                    return Err(Status::corruption(format!(
                        "unknown WriteBatch tag {other}"
                    )));
                }
            }
            found += 1;
        }
        if found != self.count() {
            return Err(Status::corruption("WriteBatch has wrong count"));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal plumbing for the write path
    // --------------------------------------------------------------------------------------------

    /// Number of updates in the batch.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..])
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Sequence number of the first update.
    pub(crate) fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep)
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// The full encoded representation (the WAL payload).
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Adopt `contents` as the batch representation (WAL replay).
    pub(crate) fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(Status::corruption("malformed WriteBatch (too small)"));
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        Ok(())
    }

    /// Append `other`'s updates after this batch's.
    pub(crate) fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Apply every update to `mem`, consuming one sequence number per
    /// update starting at this batch's sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        struct Inserter<'a> {
            sequence: SequenceNumber,
            mem: &'a MemTable,
        }
        impl BatchHandler for Inserter<'_> {
            fn put(&mut self, key: &[u8], value: &[u8]) {
                self.mem.add(self.sequence, ValueType::Value, key, value);
                self.sequence += 1;
            }
            fn delete(&mut self, key: &[u8]) {
                self.mem.add(self.sequence, ValueType::Deletion, key, &[]);
                self.sequence += 1;
            }
        }
        let mut inserter = Inserter {
            sequence: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

impl Default for WriteBatch {
    fn default() -> WriteBatch {
        WriteBatch::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::comparator::BytewiseComparator;
    use crate::dbformat::{InternalKeyComparator, LookupKey, MAX_SEQUENCE_NUMBER};
    use crate::memtable::MemTableGet;

    #[derive(Default)]
    struct Recording {
        ops: Vec<String>,
    }

    impl BatchHandler for Recording {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.ops.push(format!(
                "put({},{})",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
        }
        fn delete(&mut self, key: &[u8]) {
            self.ops.push(format!("del({})", String::from_utf8_lossy(key)));
        }
    }

    fn replay(batch: &WriteBatch) -> Vec<String> {
        let mut rec = Recording::default();
        batch.iterate(&mut rec).unwrap();
        rec.ops
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.approximate_size(), BATCH_HEADER_SIZE);
        assert!(replay(&batch).is_empty());
    }

    #[test]
    fn updates_replay_in_insertion_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        assert_eq!(batch.count(), 3);
        assert_eq!(replay(&batch), vec!["put(a,1)", "del(b)", "put(c,3)"]);
    }

    #[test]
    fn clear_resets() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.clear();
        assert!(batch.is_empty());
        assert!(replay(&batch).is_empty());
    }

    #[test]
    fn append_concatenates() {
        let mut a = WriteBatch::new();
        a.put(b"x", b"1");
        let mut b = WriteBatch::new();
        b.delete(b"y");
        b.put(b"z", b"2");
        a.append(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(replay(&a), vec!["put(x,1)", "del(y)", "put(z,2)"]);
    }

    #[test]
    fn insert_into_memtable_assigns_sequences() {
        let mem = MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)));
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        batch.delete(b"k1");
        batch.set_sequence(100);
        batch.insert_into(&mem).unwrap();

        // k1: deleted at 102, valued at 100.
        assert_eq!(
            mem.get(&LookupKey::new(b"k1", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Deleted
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k1", 101)),
            MemTableGet::Found(b"v1".to_vec())
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k2", MAX_SEQUENCE_NUMBER)),
            MemTableGet::Found(b"v2".to_vec())
        );
    }

    #[test]
    fn contents_round_trip() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(77);
        batch.put(b"key", b"value");

        let mut copy = WriteBatch::new();
        copy.set_contents(batch.contents()).unwrap();
        assert_eq!(copy.sequence(), 77);
        assert_eq!(copy.count(), 1);
        assert_eq!(replay(&copy), vec!["put(key,value)"]);
    }

    #[test]
    fn corrupt_contents_detected() {
        let mut batch = WriteBatch::new();
        assert!(batch.set_contents(&[1, 2, 3]).is_err());

        batch.put(b"a", b"1");
        // Lie about the count.
        batch.set_count(5);
        let mut rec = Recording::default();
        assert!(batch.iterate(&mut rec).is_err());
    }

    #[test]
    fn empty_keys_and_values_allowed() {
        let mut batch = WriteBatch::new();
        batch.put(b"", b"");
        batch.delete(b"");
        assert_eq!(replay(&batch), vec!["put(,)", "del()"]);
    }
}
