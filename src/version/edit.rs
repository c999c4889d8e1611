//! Version edits: serialized diffs between adjacent versions.
//!
//! The manifest is an append-only log of these records; replaying them
//! from an empty state reproduces the exact file layout of the current
//! version. Fields are optional and tagged, so old readers skip nothing
//! and new fields can be added behind fresh tags.
//!
//! # Record grammar
//!
//! ```text
//! edit  := field*
//! field := varint32 tag payload
//! tag   := Comparator(1) | LogNumber(2) | NextFileNumber(3)
//!        | LastSequence(4) | CompactPointer(5) | DeletedFile(6)
//!        | NewFile(7) | PrevLogNumber(9)
//! ```
//!
//! Numbers are varint64, levels varint32, keys and names
//! length-prefixed slices.

use crate::dbformat::{InternalKey, SequenceNumber};
use crate::encoding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};
use crate::status::{Result, Status};

// Field tags. Tag 8 was used once for large value refs and stays dead.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

// ------------------------------------------------------------------------------------------------
// File metadata
// ------------------------------------------------------------------------------------------------

/// Descriptor of one on-disk table file.
#[derive(Debug)]
pub struct FileMetaData {
    /// Unique, forever-increasing file number.
    pub number: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key stored in the file.
    pub smallest: InternalKey,
    /// Largest internal key stored in the file.
    pub largest: InternalKey,
    /// Point lookups that may touch this file fruitlessly before it
    /// becomes a seek-compaction candidate. Decremented under the DB
    /// mutex; atomic so `Version`s stay immutable.
    pub allowed_seeks: std::sync::atomic::AtomicI64,
}

impl FileMetaData {
    /// A descriptor with the seek allowance derived from file size:
    /// one seek per 16 KiB, but no fewer than 100.
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed_seeks = (file_size / 16384).max(100) as i64;
        FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: std::sync::atomic::AtomicI64::new(allowed_seeks),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        FileMetaData {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: std::sync::atomic::AtomicI64::new(
                self.allowed_seeks.load(std::sync::atomic::Ordering::Relaxed),
            ),
        }
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        // The seek allowance is runtime bookkeeping, not identity.
        self.number == other.number
            && self.file_size == other.file_size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

impl Eq for FileMetaData {}

// ------------------------------------------------------------------------------------------------
// VersionEdit
// ------------------------------------------------------------------------------------------------

/// A diff between two adjacent versions.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VersionEdit {
    /// Comparator name, persisted once at creation and checked on open.
    pub comparator: Option<String>,
    /// Log file holding writes newer than this version's tables.
    pub log_number: Option<u64>,
    /// Log file of the previous memtable, still being flushed.
    pub prev_log_number: Option<u64>,
    /// Next file number to allocate.
    pub next_file_number: Option<u64>,
    /// Highest committed sequence number.
    pub last_sequence: Option<SequenceNumber>,
    /// Per-level keys where the next size compaction should start.
    pub compact_pointers: Vec<(usize, InternalKey)>,
    /// Files removed by this edit, as `(level, file_number)`.
    pub deleted_files: Vec<(usize, u64)>,
    /// Files added by this edit.
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    /// An empty edit.
    pub fn new() -> VersionEdit {
        VersionEdit::default()
    }

    /// Reset to the empty edit.
    pub fn clear(&mut self) {
        *self = VersionEdit::default();
    }

    /// Record the comparator name.
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    /// Record the live log file number.
    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    /// Record the previous (flushing) log file number.
    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    /// Record the next file number to allocate.
    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    /// Record the highest committed sequence.
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    /// Record where the next compaction at `level` should start.
    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Add a table file to `level`.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files
            .push((level, FileMetaData::new(number, file_size, smallest, largest)));
    }

    /// Remove table `number` from `level`.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    /// Append the serialized edit to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(comparator) = &self.comparator {
            put_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, comparator.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            put_varint32(dst, TAG_LOG_NUMBER);
            put_varint64(dst, log_number);
        }
        if let Some(prev_log_number) = self.prev_log_number {
            put_varint32(dst, TAG_PREV_LOG_NUMBER);
            put_varint64(dst, prev_log_number);
        }
        if let Some(next_file_number) = self.next_file_number {
            put_varint32(dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(dst, next_file_number);
        }
        if let Some(last_sequence) = self.last_sequence {
            put_varint32(dst, TAG_LAST_SEQUENCE);
            put_varint64(dst, last_sequence);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(dst, TAG_COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(dst, TAG_DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(dst, TAG_NEW_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, file.number);
            put_varint64(dst, file.file_size);
            put_length_prefixed_slice(dst, file.smallest.encoded());
            put_length_prefixed_slice(dst, file.largest.encoded());
        }
    }

    /// Decode an edit from `src`, which must hold exactly one record.
    pub fn decode_from(src: &[u8]) -> Result<VersionEdit> {
        let mut edit = VersionEdit::new();
        let mut input = src;

        fn read_varint32(input: &mut &[u8], what: &'static str) -> Result<u32> {
            let (v, n) = get_varint32(input)
                .ok_or_else(|| Status::corruption(format!("VersionEdit: bad {what}")))?;
            *input = &input[n..];
            Ok(v)
        }
        fn read_varint64(input: &mut &[u8], what: &'static str) -> Result<u64> {
            let (v, n) = get_varint64(input)
                .ok_or_else(|| Status::corruption(format!("VersionEdit: bad {what}")))?;
            *input = &input[n..];
            Ok(v)
        }
        fn read_slice<'a>(input: &mut &'a [u8], what: &'static str) -> Result<&'a [u8]> {
            let (v, n) = get_length_prefixed_slice(input)
                .ok_or_else(|| Status::corruption(format!("VersionEdit: bad {what}")))?;
            *input = &input[n..];
            Ok(v)
        }
        fn read_level(input: &mut &[u8]) -> Result<usize> {
            let level = read_varint32(input, "level")? as usize;
            if level >= crate::dbformat::NUM_LEVELS {
                return Err(Status::corruption("VersionEdit: level out of range"));
            }
            Ok(level)
        }

        while !input.is_empty() {
            let tag = read_varint32(&mut input, "tag")?;
            match tag {
                TAG_COMPARATOR => {
                    let name = read_slice(&mut input, "comparator name")?;
                    let name = std::str::from_utf8(name)
                        .map_err(|_| Status::corruption("VersionEdit: comparator not utf-8"))?;
                    edit.comparator = Some(name.to_string());
                }
                TAG_LOG_NUMBER => {
                    edit.log_number = Some(read_varint64(&mut input, "log number")?);
                }
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(read_varint64(&mut input, "prev log number")?);
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(read_varint64(&mut input, "next file number")?);
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(read_varint64(&mut input, "last sequence")?);
                }
                TAG_COMPACT_POINTER => {
                    let level = read_level(&mut input)?;
                    let key = read_slice(&mut input, "compaction pointer")?;
                    edit.compact_pointers
                        .push((level, InternalKey::decode_from(key)));
                }
                TAG_DELETED_FILE => {
                    let level = read_level(&mut input)?;
                    let number = read_varint64(&mut input, "deleted file")?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = read_level(&mut input)?;
                    let number = read_varint64(&mut input, "file number")?;
                    let file_size = read_varint64(&mut input, "file size")?;
                    let smallest = read_slice(&mut input, "smallest key")?;
                    let largest = read_slice(&mut input, "largest key")?;
                    edit.new_files.push((
                        level,
                        FileMetaData::new(
                            number,
                            file_size,
                            InternalKey::decode_from(smallest),
                            InternalKey::decode_from(largest),
                        ),
                    ));
                }
                other => {
                    return Err(Status::corruption(format!(
                        "VersionEdit: unknown tag {other}"
                    )));
                }
            }
        }

        Ok(edit)
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
