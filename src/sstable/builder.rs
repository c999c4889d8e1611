//! Table builder: streams sorted entries into a complete table file.
//!
//! Keys must arrive in strictly increasing internal-key order. Data
//! blocks are cut when their estimated size reaches `block_size`; the
//! index entry for a finished block is **deferred** until the first key
//! of the next block is known, so the separator can be shortened to the
//! cheapest string in `[last_of_prev, first_of_next)`.
//!
//! File layout, in write order: data blocks, filter block, meta-index
//! block, index block, footer. Every block carries the 5-byte trailer
//! (compression tag + masked CRC).

use std::sync::Arc;

use tracing::debug;

use crate::comparator::Comparator;
use crate::crc;
use crate::dbformat::{InternalKeyComparator, extract_user_key};
use crate::encoding::put_fixed32;
use crate::env::WritableFile;
use crate::options::{CompressionType, Options};
use crate::status::{Result, Status};

use super::block::BlockBuilder;
use super::filter_block::FilterBlockBuilder;
use super::format::{BLOCK_TRAILER_SIZE, BlockHandle, Footer};

/// Streams sorted `(internal_key, value)` pairs into a table file.
pub struct TableBuilder {
    options: Options,
    icmp: InternalKeyComparator,
    file: Box<dyn WritableFile>,
    offset: u64,
    num_entries: u64,
    closed: bool,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    last_key: Vec<u8>,
    /// A data block was flushed but its index entry is still waiting
    /// for the next key (or finish) to pick the separator.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    status: Option<Status>,
}

impl TableBuilder {
    /// Start building into `file`.
    pub fn new(options: Options, file: Box<dyn WritableFile>) -> TableBuilder {
        let filter_block = options
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let restart_interval = options.block_restart_interval;
        TableBuilder {
            options,
            icmp,
            file,
            offset: 0,
            num_entries: 0,
            closed: false,
            data_block: BlockBuilder::new(restart_interval),
            // Index entries restart every time; they never share prefixes
            // profitably and must each be independently seekable.
            index_block: BlockBuilder::new(1),
            filter_block,
            last_key: Vec::new(),
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            status: None,
        }
    }

    /// Append an entry; `key` must exceed every key added before.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        self.ok()?;
        debug_assert!(
            self.num_entries == 0
                || self.icmp.compare(&self.last_key, key) == std::cmp::Ordering::Less,
            "keys added out of order"
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.icmp.find_shortest_separator(&mut self.last_key, key);
            self.index_block
                .add(&self.last_key, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }

        if let Some(filter) = self.filter_block.as_mut() {
            filter.add_key(extract_user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Cut the current data block, if non-empty.
    pub fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.closed);
        self.ok()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let handle = self.write_data_block()?;
        self.pending_handle = handle;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(filter) = self.filter_block.as_mut() {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Write meta blocks, index, and footer; the table is complete on
    /// return.
    pub fn finish(mut self) -> Result<(u64, u64)> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Filter block, uncompressed.
        let filter_handle = match self.filter_block.take() {
            Some(filter) => Some(self.write_raw_block(&filter.finish(), CompressionType::None)?),
            None => None,
        };

        // Meta-index block: {"filter.<policy>" → filter handle}.
        let mut meta_index_block = BlockBuilder::new(self.options.block_restart_interval);
        if let Some(handle) = filter_handle {
            let mut name = String::from("filter.");
            name.push_str(
                self.options
                    .filter_policy
                    .as_ref()
                    .map(|p| p.name())
                    .unwrap_or_default(),
            );
            meta_index_block.add(name.as_bytes(), &handle.encoded());
        }
        let metaindex_handle =
            self.write_block_contents(meta_index_block.finish().to_vec())?;

        // Index block, with the final block's deferred entry.
        if self.pending_index_entry {
            self.icmp.find_short_successor(&mut self.last_key);
            let last_key = std::mem::take(&mut self.last_key);
            self.index_block.add(&last_key, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block_contents(index_contents)?;

        // Footer.
        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        self.file.append(&encoded)?;
        self.offset += encoded.len() as u64;

        self.file.sync()?;
        self.file.close()?;

        debug!(
            entries = self.num_entries,
            bytes = self.offset,
            "table build finished"
        );
        Ok((self.num_entries, self.offset))
    }

    /// Discard the partially built table; the caller removes the file.
    pub fn abandon(mut self) {
        self.closed = true;
    }

    /// Entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn ok(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(s) => Err(s.clone()),
        }
    }

    fn write_data_block(&mut self) -> Result<BlockHandle> {
        let contents = self.data_block.finish().to_vec();
        self.data_block.reset();
        self.write_block_contents(contents)
    }

    /// Write a block with the configured compression.
    ///
    /// Snappy is accepted in options but no codec is bundled; blocks
    /// fall back to the uncompressed tag, as readers expect.
    fn write_block_contents(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        self.write_raw_block(&contents, CompressionType::None)
    }

    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            size: contents.len() as u64,
        };

        let result = (|| -> Result<()> {
            self.file.append(contents)?;
            let tag = compression as u8;
            let checksum = crc::mask(crc::extend(crc::value(contents), &[tag]));
            let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
            trailer.push(tag);
            put_fixed32(&mut trailer, checksum);
            self.file.append(&trailer)?;
            Ok(())
        })();

        if let Err(e) = result {
            self.status = Some(e.clone());
            return Err(e);
        }

        self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }
}
