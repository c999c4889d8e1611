//! Per-table filter block: one filter per 2 KiB of file offset.
//!
//! As data blocks are flushed, the builder is told the file offset each
//! new block starts at; it emits one filter for every 2 KiB range of
//! offsets covered so far. At read time the offset of a data block
//! selects the filter to consult, so a table lookup touches exactly one
//! filter regardless of table size.
//!
//! # Layout
//!
//! ```text
//! [filter 0]
//! [filter 1]...
//! [offset of filter 0 : fixed32]
//! [offset of filter 1 : fixed32]...
//! [offset of offset array : fixed32]
//! [base lg : 1 byte]            // log2 of the offset range per filter
//! ```

use std::sync::Arc;

use crate::encoding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;

/// Generate a new filter every 2 KiB of file offset.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

/// Accumulates keys and emits the filter block at table finish.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened keys pending for the current filter.
    keys: Vec<u8>,
    /// Start offset of each pending key within `keys`.
    start: Vec<usize>,
    /// Encoded filters so far.
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    /// A builder creating filters with `policy`.
    pub fn new(policy: Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Note that a data block begins at `block_offset`; emits filters
    /// for every filter range the file has advanced past.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Register a key belonging to the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Emit the complete filter block.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.start.is_empty() {
            // No keys in this range: an empty filter.
            return;
        }

        self.start.push(self.keys.len());
        let keys: Vec<&[u8]> = self
            .start
            .windows(2)
            .map(|w| &self.keys[w[0]..w[1]])
            .collect();
        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Answers membership queries against a loaded filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Offset of the filter-offset array within `data`.
    offset_array_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Adopt a filter block; malformed contents degrade to "no filter".
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> FilterBlockReader {
        let mut reader = FilterBlockReader {
            policy,
            data: Vec::new(),
            offset_array_start: 0,
            num_filters: 0,
            base_lg: FILTER_BASE_LG,
        };
        let n = data.len();
        if n < 5 {
            // 1 byte base_lg + 4 bytes array offset
            return reader;
        }
        let base_lg = data[n - 1];
        let array_offset = decode_fixed32(&data[n - 5..]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.base_lg = base_lg;
        reader.offset_array_start = array_offset;
        reader.num_filters = (n - 5 - array_offset) / 4;
        reader.data = data;
        reader
    }

    /// Whether `key` may be present in the data block at `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range: treat as potential match.
            return true;
        }
        let start =
            decode_fixed32(&self.data[self.offset_array_start + index * 4..]) as usize;
        let limit =
            decode_fixed32(&self.data[self.offset_array_start + (index + 1) * 4..]) as usize;
        if start > limit || limit > self.offset_array_start {
            // Corrupt offsets: cannot exclude anything.
            return true;
        }
        if start == limit {
            // Empty filter covers no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new())
    }

    #[test]
    fn empty_builder_produces_decodable_block() {
        let block = FilterBlockBuilder::new(policy()).finish();
        let reader = FilterBlockReader::new(policy(), block);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn single_range() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");

        let reader = FilterBlockReader::new(policy(), builder.finish());
        // All offsets below 2 KiB share one filter.
        for offset in [100u64, 200, 300] {
            assert!(reader.key_may_match(offset, b"foo"));
            assert!(reader.key_may_match(offset, b"bar"));
            assert!(reader.key_may_match(offset, b"box"));
            assert!(reader.key_may_match(offset, b"hello"));
        }
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn multiple_ranges_are_independent() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"first");
        // Second filter range begins at 2 KiB.
        builder.start_block(3000);
        builder.add_key(b"second");
        // Range [4K, 6K) gets an empty filter; range [6K, 8K) holds "third".
        builder.start_block(7000);
        builder.add_key(b"third");

        let reader = FilterBlockReader::new(policy(), builder.finish());

        assert!(reader.key_may_match(0, b"first"));
        assert!(!reader.key_may_match(0, b"second"));

        assert!(reader.key_may_match(3000, b"second"));
        assert!(!reader.key_may_match(3000, b"first"));

        // The gap range has an empty filter: nothing matches.
        assert!(!reader.key_may_match(4500, b"first"));
        assert!(!reader.key_may_match(4500, b"third"));

        assert!(reader.key_may_match(7000, b"third"));
        assert!(!reader.key_may_match(7000, b"first"));
    }

    #[test]
    fn malformed_block_degrades_to_match_all() {
        let reader = FilterBlockReader::new(policy(), vec![1, 2, 3]);
        assert!(reader.key_may_match(0, b"anything"));

        let reader = FilterBlockReader::new(policy(), Vec::new());
        assert!(reader.key_may_match(12345, b"anything"));
    }
}
