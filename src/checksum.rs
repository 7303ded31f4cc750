//! CRC32 (IEEE) checksums, used by the checksummed memory write protocol
//! and the TOC descriptor-table hash.

/// Computes the IEEE CRC32 of `data` and returns it as 4 little-endian bytes.
pub fn crc32_le(data: &[u8]) -> [u8; 4] {
    crc32fast::hash(data).to_le_bytes()
}

/// The raw 32-bit CRC, for callers that compare against a firmware-reported
/// value directly rather than wire bytes.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector_matches_ieee_crc32() {
        // "123456789" is the standard CRC32/IEEE check vector.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32_le(b"123456789"), 0xCBF4_3926u32.to_le_bytes());
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc32(b""), 0);
    }
}
