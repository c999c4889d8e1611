//! Database, read, and write configuration.
//!
//! [`Options`] carries everything needed to open a database: the
//! pluggable collaborators (comparator, filter policy, environment,
//! block cache) and the tuning knobs with their clamped defaults.
//! [`ReadOptions`] and [`WriteOptions`] are cheap per-call structs.

use std::sync::Arc;

use crate::cache::ShardedCache;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::env::{Env, default_env};
use crate::filter::FilterPolicy;
use crate::snapshot::Snapshot;
use crate::sstable::block::Block;

/// Cache key for a decoded data block: `(cache_id, block_offset)`.
pub type BlockCacheKey = (u64, u64);

/// Cache of decoded data blocks, shared by every table of a database.
pub type BlockCache = ShardedCache<BlockCacheKey, Block>;

/// Block compression codecs recognized in the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// Store blocks verbatim.
    None = 0,
    /// Snappy tag. No codec is bundled, so the table builder falls back
    /// to storing blocks uncompressed; reading a block actually
    /// compressed with snappy reports `NotSupported`.
    Snappy = 1,
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// User-key ordering. Must match across every open of a database.
    pub comparator: Arc<dyn Comparator>,

    /// Create the database when none exists at the path.
    pub create_if_missing: bool,

    /// Fail when a database already exists at the path.
    pub error_if_exists: bool,

    /// Verify every block read; escalate any corruption to a fatal
    /// background error instead of skipping the damaged region.
    pub paranoid_checks: bool,

    /// Filesystem, scheduling, and clock services.
    pub env: Arc<dyn Env>,

    /// Memtable size that triggers rotation and flush.
    pub write_buffer_size: usize,

    /// Cap on open table files; the table cache keeps `max_open_files - 10`.
    pub max_open_files: usize,

    /// Cache of decoded data blocks.
    pub block_cache: Arc<BlockCache>,

    /// Target uncompressed size of a table data block.
    pub block_size: usize,

    /// Keys between prefix-compression restart points.
    pub block_restart_interval: usize,

    /// Target size of compaction output files.
    pub max_file_size: usize,

    /// Codec applied to table blocks.
    pub compression: CompressionType,

    /// On recovery, keep appending to the existing log and memtable
    /// instead of flushing and switching files.
    pub reuse_logs: bool,

    /// Filter policy consulted before reading data blocks; `None`
    /// disables filter blocks entirely.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            env: default_env(),
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache: Arc::new(ShardedCache::new(8 * 1024 * 1024)),
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::None,
            reuse_logs: false,
            filter_policy: None,
        }
    }
}

fn clip<T: Ord>(value: T, lo: T, hi: T) -> T {
    value.max(lo).min(hi)
}

impl Options {
    /// Copy of `self` with every knob forced into its legal range.
    pub(crate) fn sanitized(&self) -> Options {
        let mut opts = self.clone();
        opts.max_open_files = clip(opts.max_open_files, 64 + 10, 50_000);
        opts.write_buffer_size = clip(opts.write_buffer_size, 64 << 10, 1 << 30);
        opts.max_file_size = clip(opts.max_file_size, 1 << 20, 1 << 30);
        opts.block_size = clip(opts.block_size, 1 << 10, 4 << 20);
        opts.block_restart_interval = opts.block_restart_interval.max(1);
        opts
    }
}

/// Per-read configuration.
#[derive(Clone)]
pub struct ReadOptions {
    /// Checksum every block touched by this read.
    pub verify_checksums: bool,

    /// Insert blocks read on behalf of this call into the block cache.
    /// Turned off by compactions to avoid flushing the working set.
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the current state.
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    /// Defaults: no extra checksums, fill the cache, read latest state.
    pub fn new() -> ReadOptions {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl Default for ReadOptions {
    fn default() -> ReadOptions {
        ReadOptions::new()
    }
}

/// Per-write configuration.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Fsync the log before acknowledging the write. Without it a
    /// machine crash may lose the most recent writes, though the file
    /// stays internally consistent.
    pub sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = Options::default();
        assert!(!opts.create_if_missing);
        assert!(!opts.error_if_exists);
        assert!(!opts.paranoid_checks);
        assert_eq!(opts.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(opts.max_open_files, 1000);
        assert_eq!(opts.block_size, 4 * 1024);
        assert_eq!(opts.block_restart_interval, 16);
        assert_eq!(opts.max_file_size, 2 * 1024 * 1024);
        assert_eq!(opts.compression, CompressionType::None);
        assert!(!opts.reuse_logs);
        assert!(opts.filter_policy.is_none());
    }

    #[test]
    fn sanitize_clamps_extremes() {
        let mut opts = Options {
            max_open_files: 1,
            write_buffer_size: 1,
            block_size: 1,
            block_restart_interval: 0,
            ..Options::default()
        };
        let clamped = opts.sanitized();
        assert_eq!(clamped.max_open_files, 74);
        assert_eq!(clamped.write_buffer_size, 64 << 10);
        assert_eq!(clamped.block_size, 1 << 10);
        assert_eq!(clamped.block_restart_interval, 1);

        opts.max_open_files = 10_000_000;
        opts.block_size = usize::MAX;
        let clamped = opts.sanitized();
        assert_eq!(clamped.max_open_files, 50_000);
        assert_eq!(clamped.block_size, 4 << 20);
    }

    #[test]
    fn read_options_default_fill_cache() {
        assert!(ReadOptions::new().fill_cache);
        assert!(!ReadOptions::new().verify_checksums);
    }
}
