//! Prefix-compressed sorted key/value blocks.
//!
//! The unit of storage inside a table file. Keys are delta-encoded
//! against their predecessor within a **restart group**; every
//! `block_restart_interval` entries the shared prefix resets to zero
//! and the entry's offset is recorded in the restart array, enabling
//! binary search.
//!
//! # Entry layout
//!
//! ```text
//! entry := varint32 shared_len
//!          varint32 non_shared_len
//!          varint32 value_len
//!          non_shared_key_bytes
//!          value_bytes
//! block := entry* restart_offset[fixed32]* num_restarts[fixed32]
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::encoding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::iterator::Iter;
use crate::status::{Result, Status};

const RESTART_ENTRY_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

/// Accumulates sorted entries into an encoded block.
pub struct BlockBuilder {
    block_restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    /// A builder emitting a restart point every `block_restart_interval`
    /// entries.
    pub fn new(block_restart_interval: usize) -> BlockBuilder {
        debug_assert!(block_restart_interval >= 1);
        BlockBuilder {
            block_restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Append an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.block_restart_interval);

        let mut shared = 0;
        if self.counter < self.block_restart_interval {
            // Shared prefix with the previous key.
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            // Restart compression.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Append the restart array and return the finished block bytes.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Bytes the finished block would occupy if finished now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * RESTART_ENTRY_SIZE + RESTART_ENTRY_SIZE
    }

    /// Whether no entry has been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear for reuse on the next block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// An immutable decoded block, shareable through the block cache.
pub struct Block {
    data: Vec<u8>,
    /// Offset of the restart array.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Validate and adopt encoded block `contents`.
    pub fn new(contents: Vec<u8>) -> Result<Block> {
        if contents.len() < RESTART_ENTRY_SIZE {
            return Err(Status::corruption("block too small for restart count"));
        }
        let num_restarts = decode_fixed32(&contents[contents.len() - RESTART_ENTRY_SIZE..]);
        let max_restarts = (contents.len() - RESTART_ENTRY_SIZE) / RESTART_ENTRY_SIZE;
        if num_restarts as usize > max_restarts {
            return Err(Status::corruption("block restart count out of range"));
        }
        let restart_offset =
            contents.len() - (1 + num_restarts as usize) * RESTART_ENTRY_SIZE;
        Ok(Block {
            data: contents,
            restart_offset,
            num_restarts,
        })
    }

    /// Total size of the decoded block, used as its cache charge.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        decode_fixed32(&self.data[self.restart_offset + RESTART_ENTRY_SIZE * index as usize..])
    }

}

/// Decode one entry header at `offset`.
///
/// Returns `(shared, non_shared, value_len, header_len)`.
fn decode_entry(data: &[u8], offset: usize) -> Option<(usize, usize, usize, usize)> {
    let slice = data.get(offset..)?;
    let (shared, n0) = get_varint32(slice)?;
    let (non_shared, n1) = get_varint32(&slice[n0..])?;
    let (value_len, n2) = get_varint32(&slice[n0 + n1..])?;
    let header_len = n0 + n1 + n2;
    if slice.len() < header_len + non_shared as usize + value_len as usize {
        return None;
    }
    Some((
        shared as usize,
        non_shared as usize,
        value_len as usize,
        header_len,
    ))
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Bidirectional cursor over a [`Block`].
pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` means invalid.
    current: usize,
    /// Restart group containing the current entry.
    restart_index: u32,
    /// Current key, rebuilt from prefix deltas.
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    status: Option<Status>,
}

impl BlockIter {
    /// A cursor over `block` under `cmp`; starts invalid.
    pub fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> BlockIter {
        let current = block.restart_offset;
        let restart_index = block.num_restarts;
        BlockIter {
            block,
            cmp,
            current,
            restart_index,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: None,
        }
    }

    fn data(&self) -> &[u8] {
        &self.block.data
    }

    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn corruption(&mut self) {
        self.status = Some(Status::corruption("bad entry in block"));
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_offset = 0;
        self.value_len = 0;
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_key starts from next_entry_offset; fake a
        // zero-length entry ending at the restart point.
        let offset = self.block.restart_point(index) as usize;
        self.value_offset = offset;
        self.value_len = 0;
    }

    /// Decode the entry at `next_entry_offset`; false at end of block.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            // No more entries.
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts;
            return false;
        }

        match decode_entry(self.data(), self.current) {
            None => {
                self.corruption();
                false
            }
            Some((shared, non_shared, value_len, header_len)) => {
                if self.key.len() < shared {
                    self.corruption();
                    return false;
                }
                let key_start = self.current + header_len;
                let non_shared_bytes =
                    self.data()[key_start..key_start + non_shared].to_vec();
                self.key.truncate(shared);
                self.key.extend_from_slice(&non_shared_bytes);
                self.value_offset = key_start + non_shared;
                self.value_len = value_len;
                while self.restart_index + 1 < self.block.num_restarts
                    && (self.block.restart_point(self.restart_index + 1) as usize) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
        }
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
            // Walk to the final entry.
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            return;
        }
        // Binary search over restart points for the last group whose
        // first key is < target.
        let mut left: u32 = 0;
        let mut right: u32 = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.block.restart_point(mid) as usize;
            let Some((shared, non_shared, _, header_len)) =
                decode_entry(self.data(), region_offset)
            else {
                self.corruption();
                return;
            };
            if shared != 0 {
                // Restart entries never share a prefix.
                self.corruption();
                return;
            }
            let key_start = region_offset + header_len;
            let mid_key = &self.data()[key_start..key_start + non_shared];
            if self.cmp.compare(mid_key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan within the group.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Back up to the restart group strictly before the current entry.
        while self.block.restart_point(self.restart_index) as usize >= original {
            if self.restart_index == 0 {
                // Already at the first entry.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {
            // Stop at the entry just before `original`.
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(s) => Err(s.clone()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build_block(entries: &[(&[u8], &[u8])], interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        Arc::new(Block::new(builder.finish().to_vec()).unwrap())
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn empty_block() {
        let block = build_block(&[], 16);
        let mut it = BlockIter::new(Arc::clone(&block), cmp());
        it.seek_to_first();
        assert!(!it.valid());
        it.seek_to_last();
        assert!(!it.valid());
        it.seek(b"anything");
        assert!(!it.valid());
        assert!(it.status().is_ok());
    }

    #[test]
    fn forward_scan_restores_full_keys() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100u32)
            .map(|i| (format!("key{i:05}").into_bytes(), format!("val{i}").into_bytes()))
            .collect();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();

        for interval in [1, 2, 16, 128] {
            let block = build_block(&refs, interval);
            let mut it = BlockIter::new(Arc::clone(&block), cmp());
            it.seek_to_first();
            for (k, v) in &entries {
                assert!(it.valid());
                assert_eq!(it.key(), k.as_slice());
                assert_eq!(it.value(), v.as_slice());
                it.next();
            }
            assert!(!it.valid());
        }
    }

    #[test]
    fn seek_hits_lower_bound() {
        let block = build_block(
            &[(b"apple", b"1"), (b"banana", b"2"), (b"cherry", b"3")],
            2,
        );
        let mut it = BlockIter::new(Arc::clone(&block), cmp());

        it.seek(b"banana");
        assert_eq!(it.key(), b"banana");

        it.seek(b"b");
        assert_eq!(it.key(), b"banana");

        it.seek(b"apple0");
        assert_eq!(it.key(), b"banana");

        it.seek(b"zebra");
        assert!(!it.valid());

        it.seek(b"");
        assert_eq!(it.key(), b"apple");
    }

    #[test]
    fn backward_scan() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..40u32)
            .map(|i| (format!("k{i:03}").into_bytes(), vec![i as u8]))
            .collect();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&refs, 4);

        let mut it = BlockIter::new(Arc::clone(&block), cmp());
        it.seek_to_last();
        for (k, v) in entries.iter().rev() {
            assert!(it.valid());
            assert_eq!(it.key(), k.as_slice());
            assert_eq!(it.value(), v.as_slice());
            it.prev();
        }
        assert!(!it.valid());
    }

    #[test]
    fn keys_differing_only_in_last_byte() {
        let block = build_block(&[(b"abcd1", b"x"), (b"abcd2", b"y"), (b"abcd3", b"z")], 16);
        let mut it = BlockIter::new(Arc::clone(&block), cmp());
        it.seek(b"abcd2");
        assert_eq!(it.key(), b"abcd2");
        assert_eq!(it.value(), b"y");
        it.prev();
        assert_eq!(it.key(), b"abcd1");
    }

    #[test]
    fn empty_keys_and_values() {
        let block = build_block(&[(b"", b""), (b"a", b"")], 16);
        let mut it = BlockIter::new(Arc::clone(&block), cmp());
        it.seek_to_first();
        assert_eq!(it.key(), b"");
        assert_eq!(it.value(), b"");
        it.next();
        assert_eq!(it.key(), b"a");
    }

    #[test]
    fn size_estimate_tracks_growth() {
        let mut builder = BlockBuilder::new(16);
        let empty_estimate = builder.current_size_estimate();
        builder.add(b"key", b"value");
        assert!(builder.current_size_estimate() > empty_estimate);
        let finished_len = builder.finish().len();
        assert_eq!(finished_len, builder.current_size_estimate());
    }

    #[test]
    fn corrupt_restart_count_rejected() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![0xff]).is_err());
        // Restart count claims more restarts than fit in the block.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&100u32.to_le_bytes());
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn builder_reset_reuses_cleanly() {
        let mut builder = BlockBuilder::new(4);
        builder.add(b"a", b"1");
        builder.finish();
        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"b", b"2");
        let block = Arc::new(Block::new(builder.finish().to_vec()).unwrap());
        let mut it = BlockIter::new(Arc::clone(&block), cmp());
        it.seek_to_first();
        assert_eq!(it.key(), b"b");
    }
}
