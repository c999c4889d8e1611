//! Checksum helpers shared by the log and table formats.
//!
//! Stored checksums are **masked**: rotated and offset so that a CRC
//! computed over bytes that themselves contain CRCs does not degenerate.
//! Writers store `mask(crc)`; readers unmask before comparing.

use crc32fast::Hasher;

const MASK_DELTA: u32 = 0xa282_ead8;

/// CRC of `data`.
pub fn value(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC of `init`'s data concatenated with `data`.
pub fn extend(init: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(init);
    hasher.update(data);
    hasher.finalize()
}

/// Masked representation of `crc`, fit for storage.
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Inverse of [`mask`].
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_round_trips() {
        for crc in [0u32, 1, 0xdead_beef, u32::MAX, value(b"foo")] {
            assert_eq!(unmask(mask(crc)), crc);
        }
    }

    #[test]
    fn mask_changes_value() {
        let crc = value(b"foo");
        assert_ne!(mask(crc), crc);
        // Masking twice is not idempotent.
        assert_ne!(mask(mask(crc)), mask(crc));
    }

    #[test]
    fn extend_matches_concatenation() {
        assert_eq!(extend(value(b"hello "), b"world"), value(b"hello world"));
    }

    #[test]
    fn distinct_inputs_distinct_crcs() {
        assert_ne!(value(b"a"), value(b"foo"));
        assert_ne!(value(b""), value(b"\x00"));
    }
}
