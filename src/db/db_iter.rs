//! User-facing database iterator.
//!
//! Wraps a merging iterator over the memtables and every level, and
//! collapses the multi-version internal-key stream into the user's
//! view: one entry per live user key, as of the iterator's sequence
//! number, with tombstoned and superseded versions hidden.
//!
//! Forward iteration reads entries in place; reverse iteration has to
//! buffer the chosen key/value while scanning older versions, because
//! versions of a key are encountered newest-first when walking
//! backwards from the key after it.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::dbformat::{
    ParsedInternalKey, SequenceNumber, VALUE_TYPE_FOR_SEEK, ValueType, append_internal_key,
    extract_user_key,
};
use crate::iterator::Iter;
use crate::memtable::MemTable;
use crate::status::{Result, Status};
use crate::version::Version;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Resources the iterator must keep alive while it exists: the pinned
/// version and both memtables feeding the merged stream.
pub(crate) struct IterPins {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    pub version: Arc<Version>,
}

/// Ordered cursor over the database's user keys and values.
pub struct DbIterator {
    ucmp: Arc<dyn Comparator>,
    iter: Box<dyn Iter>,
    /// Snapshot this iterator reads at.
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    /// Forward: the user key to skip older versions of.
    /// Reverse: the user key of the current entry.
    saved_key: Vec<u8>,
    /// Reverse only: the value of the current entry.
    saved_value: Vec<u8>,
    status: Option<Status>,
    _pins: IterPins,
}

impl DbIterator {
    pub(crate) fn new(
        ucmp: Arc<dyn Comparator>,
        iter: Box<dyn Iter>,
        sequence: SequenceNumber,
        pins: IterPins,
    ) -> DbIterator {
        DbIterator {
            ucmp,
            iter,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            _pins: pins,
        }
    }

    fn parse_key(&mut self) -> Option<ParsedInternalKey> {
        match ParsedInternalKey::parse(self.iter.key()) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                if self.status.is_none() {
                    self.status = Some(Status::corruption("corrupted internal key in iterator"));
                }
                None
            }
        }
    }

    /// Advance `iter` until it reaches a live entry visible at the
    /// snapshot. `skipping` hides every version of `saved_key`.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        while self.iter.valid() {
            if let Some(parsed) = self.parse_key()
                && parsed.sequence <= self.sequence
            {
                match parsed.value_type {
                    ValueType::Deletion => {
                        // Hide all older versions of this key.
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(&parsed.user_key);
                        skipping = true;
                    }
                    ValueType::Value => {
                        if skipping
                            && self.ucmp.compare(&parsed.user_key, &self.saved_key)
                                != Ordering::Greater
                        {
                            // Superseded by a newer entry already emitted
                            // or deleted.
                        } else {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                }
            }
            self.iter.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Retreat `iter` to the newest visible version of the largest user
    /// key smaller than `saved_key`, buffering it.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        if self.iter.valid() {
            loop {
                if let Some(parsed) = self.parse_key()
                    && parsed.sequence <= self.sequence
                {
                    if value_type != ValueType::Deletion
                        && self.ucmp.compare(&parsed.user_key, &self.saved_key) == Ordering::Less
                    {
                        // Crossed into the previous user key; the saved
                        // entry is the answer.
                        break;
                    }
                    value_type = parsed.value_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(&parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.iter.value());
                    }
                }
                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl Iter for DbIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.saved_key.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(
            &mut self.saved_key,
            target,
            self.sequence,
            VALUE_TYPE_FOR_SEEK,
        );
        let seek_target = std::mem::take(&mut self.saved_key);
        self.iter.seek(&seek_target);
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // iter is positioned just before saved_key's entries (or is
            // exhausted); move to the first entry at or after it.
            self.direction = Direction::Forward;
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the current user key.
        } else {
            // Remember the emitted key so older versions are skipped.
            let current = extract_user_key(self.iter.key()).to_vec();
            self.saved_key = current;
            self.iter.next();
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // iter is at the current entry; back up until we leave this
            // user key's versions entirely.
            debug_assert!(self.iter.valid());
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&self) -> Result<()> {
        if let Some(status) = &self.status {
            return Err(status.clone());
        }
        self.iter.status()
    }
}
