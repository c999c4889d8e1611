//! Internal key format and engine-wide layout constants.
//!
//! Every entry the engine stores is keyed by an **internal key**: the
//! user key followed by an 8-byte little-endian tag packing a 56-bit
//! sequence number with a one-byte value type. Internal keys order by
//! user key ascending, then sequence **descending**, then type
//! descending, so the newest version of a key sorts first and a seek to
//! `(key, snapshot)` lands on the newest entry visible at that snapshot.
//!
//! ```text
//! internal_key = user_key ‖ fixed64_le((sequence << 8) | type)
//! ```
//!
//! The tag is always fixed-width; nothing in this file is varint-encoded.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::encoding::{decode_fixed64, get_length_prefixed_slice, put_fixed64, put_varint32};
use crate::status::{Result, Status};

// ------------------------------------------------------------------------------------------------
// Level layout constants
// ------------------------------------------------------------------------------------------------

/// Number of on-disk levels.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a size compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which each write is delayed by 1 ms.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stall entirely.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be pushed to when it does
/// not overlap the levels in between.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

// ------------------------------------------------------------------------------------------------
// Sequence numbers and value types
// ------------------------------------------------------------------------------------------------

/// Global write ordinal; 56 usable bits, assigned at commit.
pub type SequenceNumber = u64;

/// Largest representable sequence number (56 bits).
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Discriminates live values from tombstones inside an internal key.
///
/// The numeric order matters: `Deletion < Value`, so for entries with
/// equal user key and sequence a `Value` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone marking the key deleted.
    Deletion = 0,
    /// Ordinary value entry.
    Value = 1,
}

/// The value type a seek key carries.
///
/// Since sequence numbers order descending within a user key and
/// `Value` sorts before `Deletion` at equal sequence, `Value` makes a
/// seek land at the first entry with sequence `<=` the lookup sequence.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Decode a tag's low byte, rejecting unknown discriminants.
    pub fn from_u8(v: u8) -> Result<ValueType> {
        match v {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(Status::corruption(format!("unknown value type {other}"))),
        }
    }
}

/// Pack a sequence number and value type into a tag.
#[inline]
pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// Split a tag back into sequence number and value type.
#[inline]
pub fn unpack_sequence_and_type(tag: u64) -> (SequenceNumber, u8) {
    (tag >> 8, (tag & 0xff) as u8)
}

// ------------------------------------------------------------------------------------------------
// Internal keys
// ------------------------------------------------------------------------------------------------

/// The user-key prefix of an encoded internal key.
#[inline]
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// Append `user_key ‖ tag` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, t: ValueType) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(seq, t));
}

/// A decoded view of an internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInternalKey {
    /// The user-visible key bytes.
    pub user_key: Vec<u8>,
    /// Commit ordinal of this entry.
    pub sequence: SequenceNumber,
    /// Value or tombstone.
    pub value_type: ValueType,
}

impl ParsedInternalKey {
    /// Decode an internal key, failing on short input or a bad type byte.
    pub fn parse(internal_key: &[u8]) -> Result<ParsedInternalKey> {
        if internal_key.len() < 8 {
            return Err(Status::corruption("internal key too short"));
        }
        let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
        let (sequence, type_byte) = unpack_sequence_and_type(tag);
        Ok(ParsedInternalKey {
            user_key: extract_user_key(internal_key).to_vec(),
            sequence,
            value_type: ValueType::from_u8(type_byte)?,
        })
    }
}

/// An owned, encoded internal key.
///
/// Empty means "unset"; the manifest codec relies on that for optional
/// fields.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    /// Build from parts.
    pub fn new(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> InternalKey {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut rep, user_key, seq, t);
        InternalKey { rep }
    }

    /// Adopt already-encoded bytes.
    pub fn decode_from(encoded: &[u8]) -> InternalKey {
        InternalKey {
            rep: encoded.to_vec(),
        }
    }

    /// The encoded byte string.
    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    /// The user-key prefix.
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    /// Whether this key has been assigned a value.
    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }

    /// Replace the contents with `other`'s encoding.
    pub fn clone_from_encoded(&mut self, encoded: &[u8]) {
        self.rep.clear();
        self.rep.extend_from_slice(encoded);
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ParsedInternalKey::parse(&self.rep) {
            Ok(parsed) => write!(
                f,
                "'{}' @ {} : {:?}",
                HexSlice(&parsed.user_key),
                parsed.sequence,
                parsed.value_type
            ),
            Err(_) => write!(f, "(bad){}", HexSlice(&self.rep)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Internal-key comparator
// ------------------------------------------------------------------------------------------------

/// Lifts a user comparator to encoded internal keys.
///
/// Order: user key ascending per the wrapped comparator, then tag
/// (sequence, type) **descending**, so newer entries sort first.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Wrap a user comparator.
    pub fn new(user_comparator: Arc<dyn Comparator>) -> InternalKeyComparator {
        InternalKeyComparator { user_comparator }
    }

    /// The wrapped user comparator.
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }

    /// Compare two [`InternalKey`]s.
    pub fn compare_internal_key(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encoded(), b.encoded())
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => {
                let tag_a = decode_fixed64(&a[a.len() - 8..]);
                let tag_b = decode_fixed64(&b[b.len() - 8..]);
                // Descending tag: larger (newer) sorts first.
                tag_b.cmp(&tag_a)
            }
            ord => ord,
        }
    }

    fn name(&self) -> &'static str {
        "stratadb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Shorten the user-key part; if it actually shrank, re-tag with
        // the maximal tag so the separator sorts before equal user keys.
        let user_start = extract_user_key(start).to_vec();
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.clone();
        self.user_comparator
            .find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(&user_start, &tmp) == Ordering::Less
        {
            let mut shortened = tmp;
            put_fixed64(
                &mut shortened,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert!(self.compare(start, &shortened) == Ordering::Less);
            debug_assert!(self.compare(&shortened, limit) == Ordering::Less);
            *start = shortened;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key).to_vec();
        let mut tmp = user_key.clone();
        self.user_comparator.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(&user_key, &tmp) == Ordering::Less
        {
            let mut shortened = tmp;
            put_fixed64(
                &mut shortened,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert!(self.compare(key, &shortened) == Ordering::Less);
            *key = shortened;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Lookup keys
// ------------------------------------------------------------------------------------------------

/// A point-lookup key, encoded once and sliced three ways.
///
/// Layout: `[varint32 (ulen + 8)][user_key][tag]`. The full buffer is a
/// memtable key, the suffix after the length prefix is an internal key,
/// and the middle is the user key.
pub struct LookupKey {
    rep: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    /// Build a lookup key for `user_key` at snapshot `seq`.
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> LookupKey {
        let mut rep = Vec::with_capacity(user_key.len() + 13);
        put_varint32(&mut rep, (user_key.len() + 8) as u32);
        let key_start = rep.len();
        rep.extend_from_slice(user_key);
        put_fixed64(&mut rep, pack_sequence_and_type(seq, VALUE_TYPE_FOR_SEEK));
        LookupKey { rep, key_start }
    }

    /// Key formatted for a memtable seek (with length prefix).
    pub fn memtable_key(&self) -> &[u8] {
        &self.rep
    }

    /// Key formatted for an SSTable seek (internal key).
    pub fn internal_key(&self) -> &[u8] {
        &self.rep[self.key_start..]
    }

    /// The bare user key.
    pub fn user_key(&self) -> &[u8] {
        &self.rep[self.key_start..self.rep.len() - 8]
    }
}

/// Decode the internal key out of a length-prefixed memtable entry.
pub fn memtable_entry_key(entry: &[u8]) -> &[u8] {
    match get_length_prefixed_slice(entry) {
        Some((key, _)) => key,
        // Memtable entries are produced by MemTable::add and always
        // carry a valid prefix; an empty slice fails every comparison.
        None => &[],
    }
}

// ------------------------------------------------------------------------------------------------
// Debug helper
// ------------------------------------------------------------------------------------------------

pub(crate) struct HexSlice<'a>(pub &'a [u8]);

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
