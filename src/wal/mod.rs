//! Write-ahead log: a framed, CRC-protected record stream.
//!
//! The log file is a sequence of 32 KiB blocks. Each block holds zero
//! or more **physical records**; a physical record never crosses a
//! block boundary. A logical record larger than the space left in a
//! block is split into `First`/`Middle`/`Last` fragments; one that fits
//! is written as a single `Full` fragment.
//!
//! # On-disk layout
//!
//! ```text
//! block := record* trailer?
//! record :=
//!   masked_crc32 (4 bytes, LE, over type byte ‖ payload)
//!   length       (2 bytes, LE)
//!   type         (1 byte: Full=1 First=2 Middle=3 Last=4)
//!   payload      (length bytes)
//! ```
//!
//! A block tail shorter than the 7-byte header is zero-filled and
//! skipped by readers.
//!
//! # Recovery semantics
//!
//! The reader verifies every checksum, reassembles fragments, and
//! reports corrupt regions to a [`Reporter`] instead of failing the
//! whole replay. A record torn by a crash at the tail of the log is
//! treated as a clean end of file — the write it belonged to was never
//! acknowledged.
//!
//! The same format carries both the data log and the manifest.


use tracing::{trace, warn};

use crate::crc;
use crate::encoding::decode_fixed32;
use crate::env::{SequentialFile, WritableFile};
use crate::status::Result;

/// Size of a log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Bytes of framing before each physical record.
pub const HEADER_SIZE: usize = 7;

/// Physical record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    /// Reserved for zero-filled block tails.
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Appends logical records to a log file.
pub struct LogWriter {
    dest: Box<dyn WritableFile>,
    /// Write offset within the current block.
    block_offset: usize,
}

impl LogWriter {
    /// Start a writer at the beginning of a fresh file.
    pub fn new(dest: Box<dyn WritableFile>) -> LogWriter {
        LogWriter {
            dest,
            block_offset: 0,
        }
    }

    /// Start a writer appending to a file that already holds
    /// `dest_length` bytes of well-formed log data.
    pub fn new_with_dest_length(dest: Box<dyn WritableFile>, dest_length: u64) -> LogWriter {
        LogWriter {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Append one logical record; an empty payload is legal.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header: zero-fill and open a new block.
                if leftover > 0 {
                    self.dest.append(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if left.is_empty() {
                return Ok(());
            }
        }
    }

    /// Push buffered data and fsync the file.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    /// Flush buffered data without fsync.
    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()
    }

    fn emit_physical_record(&mut self, t: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let type_byte = t as u8;
        let checksum = crc::mask(crc::extend(crc::value(&[type_byte]), payload));

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&checksum.to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = type_byte;

        self.dest.append(&header)?;
        self.dest.append(payload)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + payload.len();

        trace!(record_type = type_byte, len = payload.len(), "log fragment written");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Receives notice of corrupt or dropped log regions during replay.
pub trait Reporter {
    /// `bytes` were dropped because of `reason`.
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Result of reading one physical record.
enum Physical {
    Record(RecordType, Vec<u8>),
    Eof,
    Bad,
}

/// Reads logical records back from a log file.
pub struct LogReader {
    file: Box<dyn SequentialFile>,
    reporter: Option<Box<dyn Reporter>>,
    verify_checksums: bool,
    /// Unconsumed tail of the current block.
    buffer: Vec<u8>,
    pos: usize,
    /// The file yielded a short block; no more data follows.
    eof: bool,
}

impl LogReader {
    /// Read from `file`, optionally verifying checksums and reporting
    /// drops to `reporter`.
    pub fn new(
        file: Box<dyn SequentialFile>,
        reporter: Option<Box<dyn Reporter>>,
        verify_checksums: bool,
    ) -> LogReader {
        LogReader {
            file,
            reporter,
            verify_checksums,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Read the next logical record into `record`.
    ///
    /// Returns `false` at end of input. Corrupt regions are skipped and
    /// reported, not returned as errors.
    pub fn read_record(&mut self, record: &mut Vec<u8>) -> bool {
        record.clear();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record() {
                Physical::Record(RecordType::Full, payload) => {
                    if in_fragmented_record {
                        self.report(record.len(), "partial record without end");
                        record.clear();
                    }
                    *record = payload;
                    return true;
                }
                Physical::Record(RecordType::First, payload) => {
                    if in_fragmented_record {
                        self.report(record.len(), "partial record without end");
                        record.clear();
                    }
                    *record = payload;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordType::Middle, payload) => {
                    if !in_fragmented_record {
                        self.report(payload.len(), "missing start of fragmented record");
                    } else {
                        record.extend_from_slice(&payload);
                    }
                }
                Physical::Record(RecordType::Last, payload) => {
                    if !in_fragmented_record {
                        self.report(payload.len(), "missing start of fragmented record");
                    } else {
                        record.extend_from_slice(&payload);
                        return true;
                    }
                }
                Physical::Record(RecordType::Zero, _) => {
                    // Zero-type records only arise from padding misread
                    // as a record; read_physical_record filters them.
                    unreachable!("zero-type record escaped filtering");
                }
                Physical::Eof => {
                    if in_fragmented_record {
                        // The writer died mid-record; the unfinished
                        // logical record was never acknowledged.
                        warn!(
                            partial_len = record.len(),
                            "log ends inside a fragmented record"
                        );
                        record.clear();
                    }
                    return false;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(record.len(), "error in middle of record");
                        in_fragmented_record = false;
                        record.clear();
                    }
                }
            }
        }
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        warn!(bytes, reason, "log corruption");
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.corruption(bytes, reason);
        }
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.pos
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.available() < HEADER_SIZE {
                if !self.eof {
                    // Skip the zero-filled block tail and read a block.
                    self.buffer.clear();
                    self.pos = 0;
                    self.buffer.resize(BLOCK_SIZE, 0);
                    let mut filled = 0;
                    while filled < BLOCK_SIZE {
                        match self.file.read(&mut self.buffer[filled..]) {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(e) => {
                                self.report(BLOCK_SIZE, &format!("read error: {e}"));
                                self.buffer.clear();
                                self.eof = true;
                                return Physical::Eof;
                            }
                        }
                    }
                    self.buffer.truncate(filled);
                    if filled < BLOCK_SIZE {
                        self.eof = true;
                    }
                    continue;
                }
                // Truncated header at the tail: a torn write, not an error.
                self.buffer.clear();
                self.pos = 0;
                return Physical::Eof;
            }

            let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
            let expected_crc = crc::unmask(decode_fixed32(&header[..4]));
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if HEADER_SIZE + length > self.available() {
                let drop_size = self.available();
                self.buffer.clear();
                self.pos = 0;
                if !self.eof {
                    self.report(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // Torn tail record: the payload never made it to disk.
                return Physical::Eof;
            }

            if type_byte == RecordType::Zero as u8 && length == 0 {
                // Padding produced by a writer that zero-filled a block
                // tail; skip the rest of the block silently.
                self.buffer.clear();
                self.pos = 0;
                return Physical::Bad;
            }

            if type_byte > MAX_RECORD_TYPE {
                let drop_size = self.available();
                self.buffer.clear();
                self.pos = 0;
                self.report(drop_size, "unknown record type");
                return Physical::Bad;
            }

            let payload =
                self.buffer[self.pos + HEADER_SIZE..self.pos + HEADER_SIZE + length].to_vec();

            if self.verify_checksums {
                let actual = crc::extend(crc::value(&[type_byte]), &payload);
                if actual != expected_crc {
                    let drop_size = self.available();
                    self.buffer.clear();
                    self.pos = 0;
                    self.report(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let record_type = match type_byte {
                1 => RecordType::Full,
                2 => RecordType::First,
                3 => RecordType::Middle,
                4 => RecordType::Last,
                // Zero with nonzero length is corruption, caught above
                // for padding; report the remainder of the block.
                _ => {
                    let drop_size = self.available();
                    self.buffer.clear();
                    self.pos = 0;
                    self.report(drop_size, "zero-type record with payload");
                    return Physical::Bad;
                }
            };

            self.pos += HEADER_SIZE + length;
            return Physical::Record(record_type, payload);
        }
    }
}
