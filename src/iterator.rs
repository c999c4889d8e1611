//! The iterator capability and its compositions.
//!
//! Every cursor in the engine — memtable, block, table, level, whole
//! database — exposes the same small capability: positioned iteration
//! with bidirectional movement, seek, and a deferred status. Composite
//! iterators (two-level, merging) are built *from* other iterators
//! rather than subclassed, so the few concrete kinds compose freely.
//!
//! Invalid iterators have no key/value; callers must check `valid()`
//! first. Errors encountered while positioning park the iterator in the
//! invalid state and are reported by `status()`.

use std::cmp::Ordering;

use crate::comparator::Comparator;
use crate::dbformat::InternalKeyComparator;
use crate::status::{Result, Status};

// ------------------------------------------------------------------------------------------------
// Capability trait
// ------------------------------------------------------------------------------------------------

/// A positioned cursor over an ordered key/value sequence.
pub trait Iter {
    /// Whether the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// Position at the first entry; invalid when the source is empty.
    fn seek_to_first(&mut self);

    /// Position at the last entry; invalid when the source is empty.
    fn seek_to_last(&mut self);

    /// Position at the first entry with key `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Advance to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Retreat to the previous entry. Requires `valid()`.
    fn prev(&mut self);

    /// Key at the current entry. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// Value at the current entry. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// First error encountered, if any.
    fn status(&self) -> Result<()>;
}

// ------------------------------------------------------------------------------------------------
// Empty / error iterators
// ------------------------------------------------------------------------------------------------

/// An iterator over nothing, optionally carrying an error.
pub struct EmptyIter {
    status: Option<Status>,
}

impl EmptyIter {
    /// An empty iterator with OK status.
    pub fn new() -> EmptyIter {
        EmptyIter { status: None }
    }

    /// An empty iterator that reports `status`.
    pub fn with_status(status: Status) -> EmptyIter {
        EmptyIter {
            status: Some(status),
        }
    }
}

impl Default for EmptyIter {
    fn default() -> Self {
        Self::new()
    }
}

impl Iter for EmptyIter {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {
        unreachable!("next on invalid iterator")
    }
    fn prev(&mut self) {
        unreachable!("prev on invalid iterator")
    }
    fn key(&self) -> &[u8] {
        unreachable!("key on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        unreachable!("value on invalid iterator")
    }
    fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(s) => Err(s.clone()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Two-level iterator
// ------------------------------------------------------------------------------------------------

/// Materializes a data iterator from an index entry's value.
///
/// For an SSTable the value is an encoded block handle and the result
/// iterates that block; for a level the value is an encoded file number
/// and the result iterates that table.
pub type BlockFunction = Box<dyn Fn(&[u8]) -> Result<Box<dyn Iter>>>;

/// Walks an index iterator and, per index entry, the data iterator it
/// refers to.
///
/// Empty data blocks are skipped transparently in both directions.
pub struct TwoLevelIter {
    index_iter: Box<dyn Iter>,
    block_function: BlockFunction,
    data_iter: Option<Box<dyn Iter>>,
    /// Handle for which `data_iter` was materialized, to avoid
    /// rebuilding it when the index has not moved.
    data_block_handle: Vec<u8>,
    status: Option<Status>,
}

impl TwoLevelIter {
    /// Compose an index iterator with a data-iterator factory.
    pub fn new(index_iter: Box<dyn Iter>, block_function: BlockFunction) -> TwoLevelIter {
        TwoLevelIter {
            index_iter,
            block_function,
            data_iter: None,
            data_block_handle: Vec::new(),
            status: None,
        }
    }

    fn save_status(&mut self, result: Result<()>) {
        if self.status.is_none()
            && let Err(e) = result
        {
            self.status = Some(e);
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let handle = self.index_iter.value().to_vec();
        if self.data_iter.is_some() && handle == self.data_block_handle {
            // Already positioned inside this block.
            return;
        }
        match (self.block_function)(&handle) {
            Ok(iter) => {
                self.data_block_handle = handle;
                self.data_iter = Some(iter);
            }
            Err(e) => {
                self.save_status(Err(e));
                self.data_iter = None;
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(it) = self.data_iter.as_mut() {
                it.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(it) = self.data_iter.as_mut() {
                it.seek_to_last();
            }
        }
    }
}

impl Iter for TwoLevelIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(it) = self.data_iter.as_mut() {
            it.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(it) = self.data_iter.as_mut() {
            it.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid iterator").value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(it) = self.data_iter.as_ref() {
            it.status()?;
        }
        match &self.status {
            None => Ok(()),
            Some(s) => Err(s.clone()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Merging iterator
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges N child iterators into one ordered stream.
///
/// Ties between children are broken by child index, so callers must
/// order children newest-first when duplicate internal keys are
/// possible (they are not, within one database: sequence numbers make
/// internal keys unique).
pub struct MergingIter {
    cmp: InternalKeyComparator,
    children: Vec<Box<dyn Iter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIter {
    /// Merge `children` under the internal-key order.
    pub fn new(cmp: InternalKeyComparator, children: Vec<Box<dyn Iter>>) -> MergingIter {
        MergingIter {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for i in 0..self.children.len() {
            if !self.children[i].valid() {
                continue;
            }
            smallest = match smallest {
                None => Some(i),
                Some(s) => {
                    if self.cmp.compare(self.children[i].key(), self.children[s].key())
                        == Ordering::Less
                    {
                        Some(i)
                    } else {
                        Some(s)
                    }
                }
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for i in (0..self.children.len()).rev() {
            if !self.children[i].valid() {
                continue;
            }
            largest = match largest {
                None => Some(i),
                Some(l) => {
                    if self.cmp.compare(self.children[i].key(), self.children[l].key())
                        == Ordering::Greater
                    {
                        Some(i)
                    } else {
                        Some(l)
                    }
                }
            };
        }
        self.current = largest;
    }
}

impl Iter for MergingIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("valid iterator");

        // When switching from reverse iteration, every non-current child
        // sits at the entry *before* key(); move them all past it first.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                self.children[i].seek(&key);
                if self.children[i].valid()
                    && self.cmp.compare(&key, self.children[i].key()) == Ordering::Equal
                {
                    self.children[i].next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("valid iterator");

        // Mirror of next(): park every non-current child just before key().
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                self.children[i].seek(&key);
                if self.children[i].valid() {
                    // Child is at the first entry >= key(); step back once.
                    self.children[i].prev();
                } else {
                    // No entry >= key(); the child's last entry precedes it.
                    self.children[i].seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("valid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("valid iterator")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::dbformat::{InternalKey, ValueType};
    use std::sync::Arc;

    /// In-memory sorted iterator for composition tests. Entries must be
    /// pre-sorted under the internal-key order.
    struct VecIter {
        cmp: InternalKeyComparator,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIter {
        fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> VecIter {
            VecIter {
                cmp: icmp(),
                entries,
                pos: None,
            }
        }
    }

    impl Iter for VecIter {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }
        fn seek_to_first(&mut self) {
            self.pos = if self.entries.is_empty() { None } else { Some(0) };
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .iter()
                .position(|(k, _)| self.cmp.compare(k, target) != Ordering::Less);
        }
        fn next(&mut self) {
            let p = self.pos.unwrap() + 1;
            self.pos = if p < self.entries.len() { Some(p) } else { None };
        }
        fn prev(&mut self) {
            self.pos = self.pos.unwrap().checked_sub(1);
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    fn ik(user_key: &[u8], seq: u64) -> Vec<u8> {
        InternalKey::new(user_key, seq, ValueType::Value)
            .encoded()
            .to_vec()
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn merging_interleaves_in_order() {
        let a = VecIter::new(vec![
            (ik(b"a", 10), b"1".to_vec()),
            (ik(b"c", 10), b"3".to_vec()),
        ]);
        let b = VecIter::new(vec![
            (ik(b"b", 10), b"2".to_vec()),
            (ik(b"d", 10), b"4".to_vec()),
        ]);
        let mut merged = MergingIter::new(icmp(), vec![Box::new(a), Box::new(b)]);

        merged.seek_to_first();
        let mut seen = Vec::new();
        while merged.valid() {
            seen.push(merged.value().to_vec());
            merged.next();
        }
        assert_eq!(seen, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }

    #[test]
    fn merging_orders_same_user_key_by_sequence() {
        let newer = VecIter::new(vec![(ik(b"k", 20), b"new".to_vec())]);
        let older = VecIter::new(vec![(ik(b"k", 10), b"old".to_vec())]);
        let mut merged = MergingIter::new(icmp(), vec![Box::new(older), Box::new(newer)]);

        merged.seek_to_first();
        assert!(merged.valid());
        assert_eq!(merged.value(), b"new");
        merged.next();
        assert!(merged.valid());
        assert_eq!(merged.value(), b"old");
    }

    #[test]
    fn merging_reverse_iteration() {
        let a = VecIter::new(vec![
            (ik(b"a", 1), b"1".to_vec()),
            (ik(b"c", 1), b"3".to_vec()),
        ]);
        let b = VecIter::new(vec![(ik(b"b", 1), b"2".to_vec())]);
        let mut merged = MergingIter::new(icmp(), vec![Box::new(a), Box::new(b)]);

        merged.seek_to_last();
        let mut seen = Vec::new();
        while merged.valid() {
            seen.push(merged.value().to_vec());
            merged.prev();
        }
        assert_eq!(seen, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
    }

    #[test]
    fn merging_direction_switch() {
        let a = VecIter::new(vec![
            (ik(b"a", 1), b"1".to_vec()),
            (ik(b"c", 1), b"3".to_vec()),
        ]);
        let b = VecIter::new(vec![
            (ik(b"b", 1), b"2".to_vec()),
            (ik(b"d", 1), b"4".to_vec()),
        ]);
        let mut merged = MergingIter::new(icmp(), vec![Box::new(a), Box::new(b)]);

        merged.seek(&ik(b"b", crate::dbformat::MAX_SEQUENCE_NUMBER));
        assert_eq!(merged.value(), b"2");
        merged.next();
        assert_eq!(merged.value(), b"3");
        merged.prev();
        assert_eq!(merged.value(), b"2");
        merged.prev();
        assert_eq!(merged.value(), b"1");
    }

    #[test]
    fn empty_iter_reports_status() {
        let ok = EmptyIter::new();
        assert!(!ok.valid());
        assert!(ok.status().is_ok());

        let err = EmptyIter::with_status(Status::corruption("boom"));
        assert!(err.status().is_err());
    }
}
