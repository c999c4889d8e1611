//! Sorted String Table (SSTable) reading and writing.
//!
//! An SSTable is an immutable, sorted file of internal-key → value
//! entries, laid out as prefix-compressed data blocks followed by an
//! optional filter block, a meta-index block, an index block, and a
//! fixed footer:
//!
//! ```text
//! [data block 0][trailer]
//! [data block 1][trailer]
//! ...
//! [filter block][trailer]          (when a filter policy is configured)
//! [meta-index block][trailer]      {"filter.<policy>" → filter handle}
//! [index block][trailer]           separator key → data block handle
//! [footer: 48 bytes]               meta-index + index handles, magic
//! ```
//!
//! Every block trailer is a compression tag and a masked CRC over
//! `contents ‖ tag`. Index separators are shortened to the cheapest
//! string between adjacent blocks, so index blocks stay small.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableBuilder`](builder::TableBuilder), streaming
//!   construction in sorted order.
//! - [`block`] — block encoding and the restart-point iterator.
//! - [`filter_block`] — per-2-KiB-of-offset filters.
//! - [`format`] — footer, handles, trailer validation.
//! - [`table_cache`] — bounded cache of open tables.
//!
//! # Concurrency
//!
//! Tables are immutable after open; every read path is `&self` and
//! thread-safe. Decoded blocks are shared through the block cache as
//! `Arc`s, so eviction never invalidates an in-flight iterator.

pub mod block;
pub mod builder;
pub mod filter_block;
pub mod format;
pub mod table_cache;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::comparator::Comparator;
use crate::dbformat::{InternalKeyComparator, extract_user_key};
use crate::env::RandomAccessFile;
use crate::iterator::{Iter, TwoLevelIter};
use crate::options::{Options, ReadOptions};
use crate::status::{Result, Status};

use block::{Block, BlockIter};
use filter_block::FilterBlockReader;
use format::{BlockHandle, FOOTER_ENCODED_LENGTH, Footer, read_block};

/// An open, immutable table file.
pub struct Table {
    options: Options,
    /// Internal-key comparator shared with block iterators.
    cmp: Arc<dyn Comparator>,
    file: Box<dyn RandomAccessFile>,
    /// Partition of the shared block cache owned by this table.
    cache_id: u64,
    filter: Option<FilterBlockReader>,
    index_block: Arc<Block>,
}

impl Table {
    /// Open a table of `size` bytes backed by `file`.
    ///
    /// Reads and validates the footer, loads the index block, and — when
    /// a filter policy is configured — the filter block.
    pub fn open(options: Options, file: Box<dyn RandomAccessFile>, size: u64) -> Result<Table> {
        if (size as usize) < FOOTER_ENCODED_LENGTH {
            return Err(Status::corruption("file is too short to be a table"));
        }
        let footer_bytes = file.read(
            size - FOOTER_ENCODED_LENGTH as u64,
            FOOTER_ENCODED_LENGTH,
        )?;
        let footer = Footer::decode_from(&footer_bytes)?;

        let index_contents =
            read_block(file.as_ref(), options.paranoid_checks, &footer.index_handle)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let cache_id = options.block_cache.new_id();
        let cmp: Arc<dyn Comparator> =
            Arc::new(InternalKeyComparator::new(options.comparator.clone()));
        let mut table = Table {
            options,
            cmp,
            file,
            cache_id,
            filter: None,
            index_block,
        };
        table.read_meta(&footer);
        debug!(size, cache_id = table.cache_id, "table opened");
        Ok(table)
    }

    /// Load the filter block named in the meta-index, if any.
    ///
    /// Failures here lose only the filter optimization, never data, so
    /// they are logged and swallowed (unless paranoid checks escalate
    /// them at the block layer).
    fn read_meta(&mut self, footer: &Footer) {
        let Some(policy) = self.options.filter_policy.clone() else {
            return;
        };

        let meta_contents = match read_block(
            self.file.as_ref(),
            self.options.paranoid_checks,
            &footer.metaindex_handle,
        ) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "meta-index block unreadable; proceeding without filter");
                return;
            }
        };
        let Ok(meta_block) = Block::new(meta_contents) else {
            warn!("meta-index block malformed; proceeding without filter");
            return;
        };
        let meta_block = Arc::new(meta_block);

        let mut name = String::from("filter.");
        name.push_str(policy.name());
        let mut iter = BlockIter::new(Arc::clone(&meta_block), Arc::new(crate::comparator::BytewiseComparator));
        iter.seek(name.as_bytes());
        if !iter.valid() || iter.key() != name.as_bytes() {
            return;
        }

        let Ok((handle, _)) = BlockHandle::decode_from(iter.value()) else {
            warn!("filter handle malformed; proceeding without filter");
            return;
        };
        match read_block(self.file.as_ref(), self.options.paranoid_checks, &handle) {
            Ok(filter_contents) => {
                self.filter = Some(FilterBlockReader::new(policy, filter_contents));
            }
            Err(e) => {
                warn!(error = %e, "filter block unreadable; proceeding without filter");
            }
        }
    }

    /// Fetch the data block at `handle`, through the block cache.
    fn read_data_block(&self, ro: &ReadOptions, handle: &BlockHandle) -> Result<Arc<Block>> {
        let cache_key = (self.cache_id, handle.offset);
        if let Some(block) = self.options.block_cache.lookup(&cache_key) {
            return Ok(block);
        }

        let contents = read_block(
            self.file.as_ref(),
            ro.verify_checksums || self.options.paranoid_checks,
            handle,
        )?;
        let block = Arc::new(Block::new(contents)?);
        if ro.fill_cache {
            self.options
                .block_cache
                .insert(cache_key, Arc::clone(&block), block.size());
        }
        Ok(block)
    }

    /// Iterator over the data block referenced by an index entry value.
    pub(crate) fn block_iter(&self, ro: &ReadOptions, index_value: &[u8]) -> Result<Box<dyn Iter>> {
        let (handle, _) = BlockHandle::decode_from(index_value)?;
        let block = self.read_data_block(ro, &handle)?;
        Ok(Box::new(BlockIter::new(block, Arc::clone(&self.cmp))))
    }

    /// Two-level iterator over the whole table. The iterator keeps the
    /// table open through its shared handle.
    pub fn iter(table: &Arc<Table>, ro: &ReadOptions) -> Box<dyn Iter> {
        let index_iter = BlockIter::new(Arc::clone(&table.index_block), Arc::clone(&table.cmp));
        let table = Arc::clone(table);
        let ro = ro.clone();
        Box::new(TwoLevelIter::new(
            Box::new(index_iter),
            Box::new(move |index_value| table.block_iter(&ro, index_value)),
        ))
    }

    /// Point probe: the first entry with internal key `>= ikey` in the
    /// candidate block, or `None` when the filter or index excludes it.
    pub fn internal_get(
        &self,
        ro: &ReadOptions,
        ikey: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.cmp));
        index_iter.seek(ikey);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let index_value = index_iter.value().to_vec();
        if let Some(filter) = &self.filter {
            let (handle, _) = BlockHandle::decode_from(&index_value)?;
            if !filter.key_may_match(handle.offset, extract_user_key(ikey)) {
                // Filter says the key cannot be in this block.
                return Ok(None);
            }
        }

        let mut block_iter = self.block_iter(ro, &index_value)?;
        block_iter.seek(ikey);
        if block_iter.valid() {
            let result = (block_iter.key().to_vec(), block_iter.value().to_vec());
            block_iter.status()?;
            return Ok(Some(result));
        }
        block_iter.status()?;
        Ok(None)
    }
}
