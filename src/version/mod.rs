//! Versions: immutable per-level file sets, and the machinery that
//! evolves them.
//!
//! A [`Version`] is a consistent snapshot of the database's table
//! files, seven levels deep. Level 0 files may overlap each other;
//! every level below is sorted and disjoint. Readers pin a version and
//! see exactly its files no matter what compactions do afterwards.
//!
//! The [`VersionSet`] owns the current version and the bookkeeping
//! around it: file-number allocation, the last committed sequence, the
//! per-level compaction pointers, and the **manifest** — an append-only
//! log of [`VersionEdit`]s from which the current version can be
//! rebuilt from scratch. Applying an edit happens in three steps so the
//! caller can drop its lock for the expensive middle one:
//!
//! 1. [`VersionSet::prepare_apply`] (under the DB mutex) — finalize the
//!    edit, build the successor version in memory, stage the manifest
//!    records.
//! 2. [`ManifestJob::write`] (lock released) — append to the manifest,
//!    fsync, and on first write create the manifest and repoint
//!    `CURRENT`.
//! 3. [`VersionSet::finish_apply`] (under the DB mutex) — install the
//!    new version, or roll back the staging on failure.
//!
//! Version lifetime uses reference counting: iterators and reads hold
//! `Arc<Version>`; the set tracks live versions through weak references
//! to enumerate the files that must not be deleted.

pub mod edit;


use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info};

use crate::comparator::Comparator;
use crate::dbformat::{
    InternalKey, InternalKeyComparator, LookupKey, MAX_MEM_COMPACT_LEVEL, MAX_SEQUENCE_NUMBER,
    NUM_LEVELS, SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK, extract_user_key,
    pack_sequence_and_type, unpack_sequence_and_type,
};
use crate::encoding::{decode_fixed64, put_fixed64};
use crate::env::{Env, SequentialFile as _, WritableFile as _};
use crate::filename::{current_file_name, descriptor_file_name, temp_file_name};
use crate::iterator::{Iter, MergingIter, TwoLevelIter};
use crate::options::{Options, ReadOptions};
use crate::sstable::table_cache::TableCache;
use crate::status::{Result, Status};
use crate::wal::{LogReader, LogWriter, Reporter};

pub use edit::{FileMetaData, VersionEdit};

// ------------------------------------------------------------------------------------------------
// Level sizing policy
// ------------------------------------------------------------------------------------------------

/// Level-0 file count that triggers a compaction (score 1.0).
pub const L0_COMPACTION_TRIGGER: usize = crate::dbformat::L0_COMPACTION_TRIGGER;

/// Size target for `level`, in bytes: 10 MiB at level 1, ×10 per level.
fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// A compaction stops adding grandparent overlap past this many bytes.
fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size as u64
}

/// Cap on the total size of an expanded compaction's inputs.
fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size as u64
}

fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// Outcome of a point lookup against one version.
#[derive(Debug, PartialEq, Eq)]
pub enum VersionGet {
    /// Found a live value.
    Found(Vec<u8>),
    /// Found a tombstone; the key is absent.
    Deleted,
    /// No entry for the key in any file of this version.
    NotFound,
}

/// Charge accrued against a file during a lookup that probed it
/// without resolving there.
pub type SeekCharge = Option<(Arc<FileMetaData>, usize)>;

/// An immutable snapshot of the table files, one list per level.
pub struct Version {
    icmp: InternalKeyComparator,
    /// Files per level, sorted by smallest key. Level-0 files may
    /// overlap one another; deeper levels are disjoint.
    files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
    /// Level whose size ratio most exceeds its target, and that ratio.
    compaction_level: usize,
    compaction_score: f64,
    /// File that exhausted its seek allowance, if any.
    seek_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    fn empty(icmp: InternalKeyComparator) -> Version {
        Version {
            icmp,
            files: Default::default(),
            compaction_level: 0,
            compaction_score: -1.0,
            seek_compact: Mutex::new(None),
        }
    }

    /// Files at `level`.
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Number of files at `level`.
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Point lookup through the version's files, newest layer first.
    ///
    /// Also reports the seek charge: when more than one file had to be
    /// probed, the first file probed is charged one seek.
    pub fn get(
        &self,
        ro: &ReadOptions,
        key: &LookupKey,
        table_cache: &TableCache,
    ) -> Result<(VersionGet, SeekCharge)> {
        let ikey = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator().clone();

        let mut charge: SeekCharge = None;
        let mut last_read: Option<(Arc<FileMetaData>, usize)> = None;

        // Level 0: all overlapping files, newest first.
        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));

        let mut probe = |file: &Arc<FileMetaData>,
                         level: usize,
                         charge: &mut SeekCharge,
                         last_read: &mut Option<(Arc<FileMetaData>, usize)>|
         -> Result<Option<VersionGet>> {
            if charge.is_none() && last_read.is_some() {
                // Second file probed: charge the first one.
                *charge = last_read.clone();
            }
            *last_read = Some((Arc::clone(file), level));

            let found = table_cache.get(ro, file.number, file.file_size, ikey)?;
            let Some((fkey, fvalue)) = found else {
                return Ok(None);
            };
            if fkey.len() < 8 {
                return Err(Status::corruption("bad entry key in table"));
            }
            if ucmp.compare(extract_user_key(&fkey), user_key) != Ordering::Equal {
                return Ok(None);
            }
            let (_, type_byte) = unpack_sequence_and_type(decode_fixed64(&fkey[fkey.len() - 8..]));
            if type_byte == ValueType::Value as u8 {
                Ok(Some(VersionGet::Found(fvalue)))
            } else {
                Ok(Some(VersionGet::Deleted))
            }
        };

        for file in level0 {
            if let Some(result) = probe(file, 0, &mut charge, &mut last_read)? {
                return Ok((result, charge));
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            // Binary search for the single candidate file.
            let index = find_file(&self.icmp, files, ikey);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if ucmp.compare(user_key, file.smallest.user_key()) == Ordering::Less {
                continue;
            }
            if let Some(result) = probe(file, level, &mut charge, &mut last_read)? {
                return Ok((result, charge));
            }
        }

        Ok((VersionGet::NotFound, charge))
    }

    /// Apply a seek charge; true when the file just became a
    /// compaction candidate and a compaction should be scheduled.
    pub fn update_stats(&self, charge: SeekCharge) -> bool {
        let Some((file, level)) = charge else {
            return false;
        };
        let remaining = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        if remaining > 0 {
            return false;
        }
        let mut seek_compact = self.seek_compact.lock().unwrap();
        if seek_compact.is_none() {
            debug!(file = file.number, level, "file exhausted its seek allowance");
            *seek_compact = Some((file, level));
            return true;
        }
        false
    }

    fn seek_compact_file(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.seek_compact.lock().unwrap().clone()
    }

    /// One iterator per concurrent read source: each level-0 file, and
    /// one concatenating iterator per deeper level.
    pub fn add_iterators(
        &self,
        ro: &ReadOptions,
        table_cache: &Arc<TableCache>,
        iters: &mut Vec<Box<dyn Iter>>,
    ) {
        for file in &self.files[0] {
            iters.push(table_cache.iter(ro, file.number, file.file_size));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(self.level_iter(ro, table_cache, level));
            }
        }
    }

    /// Concatenating iterator over the sorted, disjoint files of
    /// `level` (≥ 1).
    pub fn level_iter(
        &self,
        ro: &ReadOptions,
        table_cache: &Arc<TableCache>,
        level: usize,
    ) -> Box<dyn Iter> {
        new_concatenating_iter(
            self.icmp.clone(),
            self.files[level].clone(),
            Arc::clone(table_cache),
            ro.clone(),
        )
    }

    /// Whether any file at `level` overlaps `[smallest_user, largest_user]`.
    ///
    /// `None` bounds are unbounded on that side.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user,
            largest_user,
        )
    }

    /// Pick the level a fresh memtable flush covering
    /// `[smallest_user, largest_user]` can be placed at.
    ///
    /// Level 0 when it overlaps; otherwise pushed down while the next
    /// level is clear and the grandparent overlap stays modest.
    pub fn pick_level_for_memtable_output(
        &self,
        options: &Options,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            return level;
        }
        let start = InternalKey::new(smallest_user, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest_user, 0, ValueType::Deletion);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&overlaps) > max_grandparent_overlap_bytes(options) {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files at `level` overlapping `[begin, end]` in user-key
    /// space. For level 0 the range grows transitively, because its
    /// files may overlap one another.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator().clone();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();

            if user_begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                continue; // entirely before the range
            }
            if user_end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                continue; // entirely after the range
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // Level-0 files overlap each other: widen and restart.
                if user_begin
                    .as_deref()
                    .is_some_and(|b| ucmp.compare(file_start, b) == Ordering::Less)
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    i = 0;
                } else if user_end
                    .as_deref()
                    .is_some_and(|e| ucmp.compare(file_limit, e) == Ordering::Greater)
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }
}

/// Index of the first file whose largest key is `>= ikey`, or
/// `files.len()`.
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    ikey: &[u8],
) -> usize {
    let mut left = 0usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.encoded(), ikey) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn after_file(ucmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    user_key.is_some_and(|k| ucmp.compare(k, file.largest.user_key()) == Ordering::Greater)
}

fn before_file(ucmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    user_key.is_some_and(|k| ucmp.compare(k, file.smallest.user_key()) == Ordering::Less)
}

fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetaData>],
    smallest_user: Option<&[u8]>,
    largest_user: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator().clone();
    if !disjoint_sorted_files {
        // Possibly-overlapping files: check each one.
        return files
            .iter()
            .any(|f| !after_file(&ucmp, smallest_user, f) && !before_file(&ucmp, largest_user, f));
    }

    // Binary search over the sorted, disjoint file list.
    let index = match smallest_user {
        None => 0,
        Some(user_key) => {
            let mut small = Vec::with_capacity(user_key.len() + 8);
            small.extend_from_slice(user_key);
            put_fixed64(
                &mut small,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            find_file(icmp, files, &small)
        }
    };
    if index >= files.len() {
        return false;
    }
    !before_file(&ucmp, largest_user, &files[index])
}

// ------------------------------------------------------------------------------------------------
// Level concatenating iterator
// ------------------------------------------------------------------------------------------------

/// Iterator over a level's file list; keys are each file's largest key,
/// values encode `(file_number, file_size)` as two fixed64s.
struct LevelFileNumIter {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: [u8; 16],
}

impl LevelFileNumIter {
    fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> LevelFileNumIter {
        let index = files.len();
        LevelFileNumIter {
            icmp,
            files,
            index,
            value_buf: [0; 16],
        }
    }

    fn fill_value(&mut self) {
        if self.index < self.files.len() {
            let file = &self.files[self.index];
            self.value_buf[..8].copy_from_slice(&file.number.to_le_bytes());
            self.value_buf[8..].copy_from_slice(&file.file_size.to_le_bytes());
        }
    }
}

impl Iter for LevelFileNumIter {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() {
            0
        } else {
            self.files.len() - 1
        };
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
            self.fill_value();
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.files[self.index].largest.encoded()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.value_buf
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

/// Two-level iterator over a disjoint, sorted file list.
pub(crate) fn new_concatenating_iter(
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    table_cache: Arc<TableCache>,
    ro: ReadOptions,
) -> Box<dyn Iter> {
    let file_iter = LevelFileNumIter::new(icmp, files);
    Box::new(TwoLevelIter::new(
        Box::new(file_iter),
        Box::new(move |file_value: &[u8]| {
            if file_value.len() != 16 {
                return Err(Status::corruption("bad level file entry"));
            }
            let number = decode_fixed64(&file_value[..8]);
            let size = decode_fixed64(&file_value[8..]);
            Ok(table_cache.iter(&ro, number, size))
        }),
    ))
}

// ------------------------------------------------------------------------------------------------
// Version builder
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetaData>>,
}

/// Accumulates edits on top of a base version.
struct Builder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    levels: [LevelState; NUM_LEVELS],
}

impl Builder {
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Builder {
        Builder {
            icmp,
            base,
            levels: Default::default(),
        }
    }

    /// Fold one edit into the pending state.
    fn apply(&mut self, edit: &VersionEdit, compact_pointers: &mut [Vec<u8>; NUM_LEVELS]) {
        for (level, key) in &edit.compact_pointers {
            compact_pointers[*level] = key.encoded().to_vec();
        }
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for (level, file) in &edit.new_files {
            self.levels[*level].deleted.remove(&file.number);
            self.levels[*level].added.push(Arc::new(file.clone()));
        }
    }

    /// Produce the combined version.
    fn save_to(mut self) -> Version {
        let mut version = Version::empty(self.icmp.clone());
        let icmp = self.icmp.clone();
        let by_smallest = |a: &Arc<FileMetaData>, b: &Arc<FileMetaData>| {
            match icmp.compare_internal_key(&a.smallest, &b.smallest) {
                Ordering::Equal => a.number.cmp(&b.number),
                ord => ord,
            }
        };

        for level in 0..NUM_LEVELS {
            let state = std::mem::take(&mut self.levels[level]);
            let mut added = state.added;
            added.sort_by(&by_smallest);

            // Merge the sorted base files with the sorted additions,
            // dropping deletions.
            let mut merged: Vec<Arc<FileMetaData>> =
                Vec::with_capacity(self.base.files[level].len() + added.len());
            let mut base_iter = self.base.files[level].iter().peekable();
            for add in added {
                while let Some(&base_file) = base_iter.peek() {
                    if by_smallest(base_file, &add) == Ordering::Less {
                        Self::push_if_live(&mut merged, &state.deleted, Arc::clone(base_file));
                        base_iter.next();
                    } else {
                        break;
                    }
                }
                Self::push_if_live(&mut merged, &state.deleted, add);
            }
            for base_file in base_iter {
                Self::push_if_live(&mut merged, &state.deleted, Arc::clone(base_file));
            }

            if level > 0 {
                debug_assert!(
                    merged
                        .windows(2)
                        .all(|w| self.icmp.compare_internal_key(&w[0].largest, &w[1].smallest)
                            == Ordering::Less),
                    "overlapping files in level {level}"
                );
            }
            version.files[level] = merged;
        }
        version
    }

    fn push_if_live(
        merged: &mut Vec<Arc<FileMetaData>>,
        deleted: &HashSet<u64>,
        file: Arc<FileMetaData>,
    ) {
        if !deleted.contains(&file.number) {
            merged.push(file);
        }
    }
}

/// Precompute the level most in need of compaction.
fn finalize(version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            // File count, not bytes: level-0 reads touch every file, and
            // small write buffers must not trigger endless level-0 merges.
            version.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            total_file_size(&version.files[level]) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_score = score;
            best_level = level;
        }
    }
    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Owner of the current version and all version bookkeeping.
pub struct VersionSet {
    dbname: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    /// Log being written for the active memtable.
    log_number: u64,
    /// Log of the immutable memtable still being flushed; 0 when none.
    prev_log_number: u64,

    current: Arc<Version>,
    /// Every version that may still be pinned by a reader.
    live_versions: Vec<Weak<Version>>,

    /// Per-level key at which the next size compaction should start.
    compact_pointer: [Vec<u8>; NUM_LEVELS],

    /// Open manifest writer; `None` until the first apply (or after a
    /// failed manifest creation).
    descriptor_log: Option<LogWriter>,
}

impl VersionSet {
    /// An empty set starting from file number 2 (1 is the first
    /// manifest).
    pub fn new(
        dbname: PathBuf,
        options: Options,
        table_cache: Arc<TableCache>,
        icmp: InternalKeyComparator,
    ) -> VersionSet {
        let mut current = Version::empty(icmp.clone());
        finalize(&mut current);
        let current = Arc::new(current);
        VersionSet {
            dbname,
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            live_versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointer: Default::default(),
            descriptor_log: None,
        }
    }

    /// The live version.
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Highest committed sequence number.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Publish a new highest committed sequence.
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    /// Allocate a fresh, forever-unique file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Ensure `number` is never allocated again.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Put back an allocated-but-unused file number, when possible.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// Number of the manifest that will be (or is being) written.
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Log file number of the active memtable.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Log file number of the flushing memtable; 0 when none.
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    /// File count at `level` in the current version.
    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.files[level].len()
    }

    /// Total bytes at `level` in the current version.
    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current.files[level])
    }

    /// Whether the current version needs a compaction.
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.seek_compact_file().is_some()
    }

    /// File numbers referenced by any version a reader may still hold.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.live_versions.retain(|weak| weak.strong_count() > 0);
        let mut live = HashSet::new();
        for weak in &self.live_versions {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in &version.files[level] {
                        live.insert(file.number);
                    }
                }
            }
        }
        live
    }

    fn append_version(&mut self, version: Arc<Version>) {
        self.live_versions.retain(|weak| weak.strong_count() > 0);
        self.live_versions.push(Arc::downgrade(&version));
        self.current = version;
    }

    // --------------------------------------------------------------------------------------------
    // Applying edits
    // --------------------------------------------------------------------------------------------

    /// Step 1 of applying `edit`: finalize its fields, build the
    /// successor version, and stage the manifest records. Runs under
    /// the DB mutex; the returned job performs the file I/O without it.
    pub fn prepare_apply(&mut self, edit: &mut VersionEdit) -> ManifestJob {
        match edit.log_number {
            None => edit.set_log_number(self.log_number),
            Some(n) => {
                debug_assert!(n >= self.log_number);
                debug_assert!(n < self.next_file_number);
            }
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut builder = Builder::new(self.icmp.clone(), self.current());
        builder.apply(edit, &mut self.compact_pointer);
        let mut version = builder.save_to();
        finalize(&mut version);

        let create_manifest = if self.descriptor_log.is_none() {
            Some(self.manifest_file_number)
        } else {
            None
        };

        let mut records = Vec::new();
        if create_manifest.is_some() {
            // A fresh manifest starts with a snapshot of the full state.
            records.push(self.snapshot_record());
        }
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        records.push(record);

        ManifestJob {
            version: Arc::new(version),
            log: self.descriptor_log.take(),
            records,
            create_manifest,
            staged_log_number: edit.log_number.unwrap_or(self.log_number),
            staged_prev_log_number: edit.prev_log_number.unwrap_or(self.prev_log_number),
            env: self.options.env.clone(),
            dbname: self.dbname.clone(),
        }
    }

    /// Step 3: install the version built in step 1, or roll back.
    pub fn finish_apply(&mut self, mut job: ManifestJob, io_result: Result<()>) -> Result<()> {
        match io_result {
            Ok(()) => {
                self.descriptor_log = job.log.take();
                self.log_number = job.staged_log_number;
                self.prev_log_number = job.staged_prev_log_number;
                self.append_version(job.version);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "manifest write failed; edit discarded");
                if let Some(number) = job.create_manifest {
                    // Drop the half-created manifest; the next apply
                    // starts over from a fresh snapshot.
                    let _ = self
                        .options
                        .env
                        .delete_file(&descriptor_file_name(&self.dbname, number));
                    job.log = None;
                } else {
                    // Keep appending to the old manifest next time.
                    self.descriptor_log = job.log.take();
                }
                Err(e)
            }
        }
    }

    /// Convenience for single-threaded paths (open, recovery): all
    /// three steps back to back.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let mut job = self.prepare_apply(edit);
        let io_result = job.write();
        self.finish_apply(job, io_result)
    }

    /// The full current state as a single edit record.
    fn snapshot_record(&self) -> Vec<u8> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, InternalKey::decode_from(pointer));
            }
        }
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                edit.new_files.push((level, (**file).clone()));
            }
        }
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        record
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Rebuild the current version by replaying the manifest named by
    /// `CURRENT`. The next apply will start a fresh manifest.
    pub fn recover(&mut self) -> Result<()> {
        struct ManifestReporter {
            status: Arc<Mutex<Option<Status>>>,
        }
        impl Reporter for ManifestReporter {
            fn corruption(&mut self, bytes: usize, reason: &str) {
                let mut status = self.status.lock().unwrap();
                if status.is_none() {
                    *status = Some(Status::corruption(format!(
                        "manifest corruption: {reason} ({bytes} bytes)"
                    )));
                }
            }
        }

        let env = self.options.env.clone();

        // CURRENT names the live manifest, newline-terminated.
        let mut current_contents = Vec::new();
        {
            let mut file = env.new_sequential_file(&current_file_name(&self.dbname))?;
            let mut buf = [0u8; 512];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                current_contents.extend_from_slice(&buf[..n]);
            }
        }
        if current_contents.last() != Some(&b'\n') {
            return Err(Status::corruption("CURRENT file does not end with newline"));
        }
        current_contents.pop();
        let manifest_name = String::from_utf8(current_contents)
            .map_err(|_| Status::corruption("CURRENT file is not utf-8"))?;
        let manifest_path = self.dbname.join(&manifest_name);

        info!(manifest = %manifest_name, "recovering version state");
        let file = env.new_sequential_file(&manifest_path)?;

        let manifest_status: Arc<Mutex<Option<Status>>> = Arc::new(Mutex::new(None));
        let mut reader = LogReader::new(
            file,
            Some(Box::new(ManifestReporter {
                status: Arc::clone(&manifest_status),
            })),
            true,
        );

        let mut builder = Builder::new(self.icmp.clone(), self.current());
        let mut log_number: Option<u64> = None;
        let mut prev_log_number: Option<u64> = None;
        let mut next_file: Option<u64> = None;
        let mut last_sequence: Option<SequenceNumber> = None;
        let mut record = Vec::new();

        while reader.read_record(&mut record) {
            let edit = VersionEdit::decode_from(&record)?;
            if let Some(name) = &edit.comparator
                && name != self.icmp.user_comparator().name()
            {
                return Err(Status::InvalidArgument(format!(
                    "comparator mismatch: db uses {name}, options supply {}",
                    self.icmp.user_comparator().name()
                )));
            }
            builder.apply(&edit, &mut self.compact_pointer);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        if let Some(status) = manifest_status.lock().unwrap().take() {
            return Err(status);
        }

        let next_file =
            next_file.ok_or_else(|| Status::corruption("manifest has no next-file entry"))?;
        let log_number =
            log_number.ok_or_else(|| Status::corruption("manifest has no log-number entry"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Status::corruption("manifest has no last-sequence entry"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.save_to();
        finalize(&mut version);
        self.append_version(Arc::new(version));

        self.manifest_file_number = next_file;
        self.next_file_number = next_file + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        info!(
            next_file,
            last_sequence, log_number, prev_log_number, "version state recovered"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction selection
    // --------------------------------------------------------------------------------------------

    /// Choose the next compaction: size-driven when a level's score is
    /// ≥ 1, otherwise seek-driven when a file has exhausted its
    /// allowance. `None` when there is nothing to do.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let size_compaction = current.compaction_score >= 1.0;
        let seek_compaction = current.seek_compact_file();

        let mut compaction;
        if size_compaction {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            compaction = Compaction::new(&self.options, level);

            // Resume after the key where the previous compaction at
            // this level stopped; wrap to the first file.
            for file in &current.files[level] {
                if self.compact_pointer[level].is_empty()
                    || self
                        .icmp
                        .compare(file.largest.encoded(), &self.compact_pointer[level])
                        == Ordering::Greater
                {
                    compaction.inputs[0].push(Arc::clone(file));
                    break;
                }
            }
            if compaction.inputs[0].is_empty()
                && let Some(file) = current.files[level].first()
            {
                compaction.inputs[0].push(Arc::clone(file));
            }
        } else if let Some((file, level)) = seek_compaction {
            compaction = Compaction::new(&self.options, level);
            compaction.inputs[0].push(file);
        } else {
            return None;
        }

        compaction.input_version = Some(Arc::clone(&current));

        // Level-0 inputs may overlap each other: pull in every
        // overlapping level-0 file.
        if compaction.level == 0 {
            let (smallest, largest) = self.range(&compaction.inputs[0]);
            compaction.inputs[0] =
                current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Manual compaction of `level` over `[begin, end]`.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one huge manual compaction at sorted levels: trim the
        // input set to roughly one output file's worth.
        if level > 0 {
            let limit = self.options.max_file_size as u64;
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(&self.options, level);
        compaction.input_version = Some(current);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Smallest and largest internal keys spanned by `files`.
    fn range(&self, files: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if self.icmp.compare_internal_key(&file.smallest, &smallest) == Ordering::Less {
                smallest = file.smallest.clone();
            }
            if self.icmp.compare_internal_key(&file.largest, &largest) == Ordering::Greater {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn range2(
        &self,
        a: &[Arc<FileMetaData>],
        b: &[Arc<FileMetaData>],
    ) -> (InternalKey, InternalKey) {
        let mut all: Vec<Arc<FileMetaData>> = Vec::with_capacity(a.len() + b.len());
        all.extend(a.iter().cloned());
        all.extend(b.iter().cloned());
        self.range(&all)
    }

    /// Fill `inputs[1]` (and possibly grow `inputs[0]`) for a chosen
    /// level-`L` input set, plus the grandparent list.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let current = compaction
            .input_version
            .clone()
            .unwrap_or_else(|| self.current());
        let level = compaction.level;

        let (smallest, largest) = self.range(&compaction.inputs[0]);
        compaction.inputs[1] =
            current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        let (mut all_start, mut all_limit) =
            self.range2(&compaction.inputs[0], &compaction.inputs[1]);

        // Try growing the level-L set while the level-L+1 set stays
        // fixed; never grow the number of L+1 inputs.
        if !compaction.inputs[1].is_empty() {
            let expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = self.range(&expanded0);
                let expanded1 =
                    current.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                if expanded1.len() == compaction.inputs[1].len() {
                    debug!(
                        level,
                        before = compaction.inputs[0].len(),
                        after = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    let (s, l) = self.range2(&compaction.inputs[0], &compaction.inputs[1]);
                    all_start = s;
                    all_limit = l;
                }
            }
        }

        // Grandparents bound output-file spans.
        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // The next compaction at this level starts past this one.
        let (_, largest) = self.range(&compaction.inputs[0]);
        self.compact_pointer[level] = largest.encoded().to_vec();
        compaction
            .edit
            .set_compact_pointer(level, largest);
    }

    /// Merged iterator over every input of `compaction`, for the runner.
    pub fn make_input_iterator(&self, compaction: &Compaction) -> Box<dyn Iter> {
        // Compaction reads skip the block cache so a bulk merge does not
        // evict the read path's working set.
        let ro = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut iters: Vec<Box<dyn Iter>> = Vec::new();
        for which in 0..2 {
            if compaction.inputs[which].is_empty() {
                continue;
            }
            if compaction.level + which == 0 {
                for file in &compaction.inputs[which] {
                    iters.push(self.table_cache.iter(&ro, file.number, file.file_size));
                }
            } else {
                iters.push(new_concatenating_iter(
                    self.icmp.clone(),
                    compaction.inputs[which].clone(),
                    Arc::clone(&self.table_cache),
                    ro.clone(),
                ));
            }
        }
        Box::new(MergingIter::new(self.icmp.clone(), iters))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest job
// ------------------------------------------------------------------------------------------------

/// Staged manifest write; see [`VersionSet::prepare_apply`].
pub struct ManifestJob {
    pub(crate) version: Arc<Version>,
    log: Option<LogWriter>,
    records: Vec<Vec<u8>>,
    create_manifest: Option<u64>,
    staged_log_number: u64,
    staged_prev_log_number: u64,
    env: Arc<dyn Env>,
    dbname: PathBuf,
}

impl ManifestJob {
    /// Step 2: append the staged records to the manifest and fsync.
    /// On first write, create the manifest file and atomically point
    /// `CURRENT` at it. Call without holding the DB mutex.
    pub fn write(&mut self) -> Result<()> {
        if let Some(number) = self.create_manifest
            && self.log.is_none()
        {
            let path = descriptor_file_name(&self.dbname, number);
            let file = self.env.new_writable_file(&path)?;
            info!(manifest = number, "creating manifest");
            self.log = Some(LogWriter::new(file));
        }
        let log = self
            .log
            .as_mut()
            .ok_or_else(|| Status::corruption("manifest writer unavailable"))?;

        for record in &self.records {
            log.add_record(record)?;
        }
        log.sync()?;

        if let Some(number) = self.create_manifest {
            set_current_file(self.env.as_ref(), &self.dbname, number)?;
        }
        Ok(())
    }
}

/// Atomically point `CURRENT` at `MANIFEST-<manifest_number>`.
pub fn set_current_file(env: &dyn Env, dbname: &Path, manifest_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{manifest_number:06}\n");
    let tmp = temp_file_name(dbname, manifest_number);
    {
        let mut file = env.new_writable_file(&tmp)?;
        file.append(contents.as_bytes())?;
        file.sync()?;
        file.close()?;
    }
    match env.rename_file(&tmp, &current_file_name(dbname)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = env.delete_file(&tmp);
            Err(e)
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction
// ------------------------------------------------------------------------------------------------

/// A chosen compaction: inputs at `level` and `level + 1`, the edit
/// being accumulated, and the state for output-splitting decisions.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    input_version: Option<Arc<Version>>,
    edit: VersionEdit,
    /// `inputs[0]` at `level`, `inputs[1]` at `level + 1`.
    inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Level + 2 files used to bound each output file's future cost.
    grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    /// Bytes of grandparent overlap accumulated by the current output.
    overlapped_bytes: u64,
    /// Per-level scan positions for `is_base_level_for_key`.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    fn new(options: &Options, level: usize) -> Compaction {
        Compaction {
            level,
            max_output_file_size: options.max_file_size as u64,
            max_grandparent_overlap: max_grandparent_overlap_bytes(options),
            input_version: None,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// The level whose files are being compacted into `level + 1`.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Target size for output files.
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// Input file count on side `which` (0 = level, 1 = level + 1).
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// The `i`th input file on side `which`.
    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    /// The edit accumulating this compaction's result.
    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    /// Take the finished edit.
    pub fn take_edit(&mut self) -> VersionEdit {
        std::mem::take(&mut self.edit)
    }

    /// A single input file with no level+1 overlap and modest
    /// grandparent overlap moves down by metadata alone.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Record the deletion of every input file in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.remove_file(self.level + which, file.number);
            }
        }
    }

    /// Whether `user_key` cannot exist at any level below the
    /// compaction's output level, making its tombstone droppable.
    ///
    /// Keys must be presented in increasing order: the per-level scan
    /// pointers only move forward.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let Some(version) = self.input_version.clone() else {
            return false;
        };
        let ucmp = version.icmp.user_comparator().clone();
        for level in (self.level + 2)..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, file.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, file.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output file should be closed before writing
    /// `internal_key`, to bound how many grandparent files a future
    /// compaction of this output must merge with.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        let Some(version) = &self.input_version else {
            return false;
        };
        let icmp = &version.icmp;
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Release the pinned input version.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}
