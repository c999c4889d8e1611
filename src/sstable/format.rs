//! Table file framing: block handles, the footer, and trailer checks.
//!
//! Every block in a table file is followed by a 5-byte trailer — a
//! one-byte compression tag and a masked CRC over `contents ‖ tag`.
//! The fixed 48-byte footer at the end of the file locates the
//! meta-index and index blocks and carries the format magic.

use crate::crc;
use crate::encoding::{
    MAX_VARINT64_LEN, decode_fixed64, get_varint64, put_fixed64, put_varint64,
};
use crate::env::RandomAccessFile;
use crate::options::CompressionType;
use crate::status::{Result, Status};

/// Magic number ending every table file.
pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// Compression tag byte + 4-byte masked CRC.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Encoded footer length: two maximal handles plus the magic.
pub const FOOTER_ENCODED_LENGTH: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

// ------------------------------------------------------------------------------------------------
// Block handle
// ------------------------------------------------------------------------------------------------

/// Location of a block within a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// Byte offset of the block's first byte.
    pub offset: u64,
    /// Block length, excluding the trailer.
    pub size: u64,
}

impl BlockHandle {
    /// Largest possible encoding: two maximal varint64s.
    pub const MAX_ENCODED_LENGTH: usize = 2 * MAX_VARINT64_LEN;

    /// Append the varint encoding to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    /// The encoded form as a fresh vector.
    pub fn encoded(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut dst);
        dst
    }

    /// Decode from the front of `src`, returning the bytes consumed.
    pub fn decode_from(src: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, n0) =
            get_varint64(src).ok_or_else(|| Status::corruption("bad block handle offset"))?;
        let (size, n1) = get_varint64(&src[n0..])
            .ok_or_else(|| Status::corruption("bad block handle size"))?;
        Ok((BlockHandle { offset, size }, n0 + n1))
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// The fixed-size trailer of a table file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    /// Handle of the meta-index block.
    pub metaindex_handle: BlockHandle,
    /// Handle of the index block.
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Append the 48-byte encoding to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + 2 * BlockHandle::MAX_ENCODED_LENGTH, 0);
        put_fixed64(dst, TABLE_MAGIC);
        debug_assert_eq!(dst.len() - start, FOOTER_ENCODED_LENGTH);
    }

    /// Decode a footer from exactly [`FOOTER_ENCODED_LENGTH`] bytes.
    pub fn decode_from(src: &[u8]) -> Result<Footer> {
        if src.len() < FOOTER_ENCODED_LENGTH {
            return Err(Status::corruption("footer too short"));
        }
        let magic = decode_fixed64(&src[FOOTER_ENCODED_LENGTH - 8..]);
        if magic != TABLE_MAGIC {
            return Err(Status::InvalidArgument(
                "not a table file (bad magic number)".into(),
            ));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Block reads
// ------------------------------------------------------------------------------------------------

/// Read the block at `handle` and strip its trailer.
///
/// When `verify_checksums` is set, the stored masked CRC is checked
/// over `contents ‖ tag` before the contents are returned.
pub fn read_block(
    file: &dyn RandomAccessFile,
    verify_checksums: bool,
    handle: &BlockHandle,
) -> Result<Vec<u8>> {
    let n = handle.size as usize;
    let mut data = file.read(handle.offset, n + BLOCK_TRAILER_SIZE)?;
    if data.len() != n + BLOCK_TRAILER_SIZE {
        return Err(Status::corruption("truncated block read"));
    }

    if verify_checksums {
        let stored = crc::unmask(crate::encoding::decode_fixed32(&data[n + 1..]));
        let actual = crc::value(&data[..n + 1]);
        if stored != actual {
            return Err(Status::corruption("block checksum mismatch"));
        }
    }

    match data[n] {
        tag if tag == CompressionType::None as u8 => {
            data.truncate(n);
            Ok(data)
        }
        tag if tag == CompressionType::Snappy as u8 => Err(Status::NotSupported(
            "snappy-compressed block (no codec built in)".into(),
        )),
        tag => Err(Status::corruption(format!("unknown compression tag {tag}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::put_fixed32;

    struct MemFile(Vec<u8>);

    impl RandomAccessFile for MemFile {
        fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
            let offset = offset as usize;
            if offset + n > self.0.len() {
                return Err(Status::corruption("short read"));
            }
            Ok(self.0[offset..offset + n].to_vec())
        }
    }

    fn encode_block(contents: &[u8], tag: u8) -> Vec<u8> {
        let mut out = contents.to_vec();
        out.push(tag);
        let checksum = crc::mask(crc::value(&out));
        put_fixed32(&mut out, checksum);
        out
    }

    #[test]
    fn block_handle_round_trip() {
        for (offset, size) in [(0u64, 0u64), (1, 2), (u64::MAX, 12345), (1 << 40, 1 << 33)] {
            let handle = BlockHandle { offset, size };
            let encoded = handle.encoded();
            let (decoded, n) = BlockHandle::decode_from(&encoded).unwrap();
            assert_eq!(decoded, handle);
            assert_eq!(n, encoded.len());
        }
    }

    #[test]
    fn footer_round_trip_is_fixed_size() {
        let footer = Footer {
            metaindex_handle: BlockHandle { offset: 17, size: 33 },
            index_handle: BlockHandle {
                offset: 1 << 30,
                size: 4096,
            },
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        assert_eq!(encoded.len(), FOOTER_ENCODED_LENGTH);

        let decoded = Footer::decode_from(&encoded).unwrap();
        assert_eq!(decoded.metaindex_handle, footer.metaindex_handle);
        assert_eq!(decoded.index_handle, footer.index_handle);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let mut encoded = Vec::new();
        Footer::default().encode_to(&mut encoded);
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert!(Footer::decode_from(&encoded).is_err());
        assert!(Footer::decode_from(&encoded[..10]).is_err());
    }

    #[test]
    fn read_block_verifies_checksum() {
        let contents = b"some block contents".to_vec();
        let file = MemFile(encode_block(&contents, CompressionType::None as u8));
        let handle = BlockHandle {
            offset: 0,
            size: contents.len() as u64,
        };

        assert_eq!(read_block(&file, true, &handle).unwrap(), contents);

        // Corrupt one payload byte.
        let mut bad = encode_block(&contents, CompressionType::None as u8);
        bad[3] ^= 0xff;
        let file = MemFile(bad);
        assert!(read_block(&file, true, &handle).is_err());
        // Without verification the flip goes unnoticed.
        assert!(read_block(&file, false, &handle).is_ok());
    }

    #[test]
    fn read_block_rejects_unknown_tags() {
        let contents = b"abc".to_vec();
        let handle = BlockHandle { offset: 0, size: 3 };

        let snappy = MemFile(encode_block(&contents, CompressionType::Snappy as u8));
        assert!(matches!(
            read_block(&snappy, true, &handle),
            Err(Status::NotSupported(_))
        ));

        let garbage = MemFile(encode_block(&contents, 0x77));
        assert!(matches!(
            read_block(&garbage, true, &handle),
            Err(Status::Corruption(_))
        ));
    }
}
