//! Filter policies for cheap negative point lookups.
//!
//! A [`FilterPolicy`] turns a set of keys into a compact byte blob and
//! answers approximate membership queries against such a blob. SSTables
//! store one blob per 2 KiB slice of file offset (see
//! [`crate::sstable::filter_block`]); a negative answer lets the read
//! path skip a data block entirely.
//!
//! [`BloomFilterPolicy`] is the shipped implementation, backed by the
//! `bloomfilter` crate. The serialized blob embeds the filter's sip keys,
//! so a blob written by one process checks identically after reopen.

use bloomfilter::Bloom;
use tracing::warn;

/// Approximate-membership capability consulted by table reads.
///
/// `name()` is persisted inside each table's meta-index block; a reader
/// only consults filters whose name matches its configured policy, so
/// renaming a policy safely invalidates old filters.
pub trait FilterPolicy: Send + Sync {
    /// Identity of this policy, stored with every filter block.
    fn name(&self) -> &'static str;

    /// Serialize a filter matching `keys` into `dst`.
    ///
    /// `keys` may contain duplicates. The output is appended to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Whether `key` may be present in the set `filter` was built from.
    ///
    /// Must return `true` for every key passed to `create_filter`; may
    /// return `true` for absent keys (false positive), never the
    /// reverse.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom-filter policy with a fixed false-positive target.
#[derive(Debug, Clone, Copy)]
pub struct BloomFilterPolicy {
    /// Target false-positive probability for each filter.
    fp_rate: f64,
}

impl BloomFilterPolicy {
    /// Default false-positive rate (~1%), a good space/selectivity
    /// trade-off for 4 KiB data blocks.
    pub const DEFAULT_FP_RATE: f64 = 0.01;

    /// Create a policy with the default false-positive rate.
    pub fn new() -> Self {
        Self {
            fp_rate: Self::DEFAULT_FP_RATE,
        }
    }

    /// Create a policy with a custom false-positive rate in `(0, 1)`.
    pub fn with_fp_rate(fp_rate: f64) -> Self {
        Self { fp_rate }
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "stratadb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let items = keys.len().max(1);
        let mut bloom: Bloom<[u8]> = match Bloom::new_for_fp_rate(items, self.fp_rate) {
            Ok(bloom) => bloom,
            Err(e) => {
                // An unbuildable filter degrades to "no filter": emit an
                // empty blob, which key_may_match treats as all-maybe.
                warn!(items, error = %e, "bloom filter construction failed");
                return;
            }
        };
        for key in keys {
            bloom.set(key);
        }
        dst.extend_from_slice(bloom.as_slice());
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.is_empty() {
            return true;
        }
        match Bloom::<[u8]>::from_slice(filter) {
            Ok(bloom) => bloom.check(key),
            // A corrupt filter cannot exclude anything.
            Err(_) => true,
        }
    }
}
