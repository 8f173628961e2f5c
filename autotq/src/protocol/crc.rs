//! CRC32 checksum (ISO-HDLC, the same polynomial as zlib's `crc32`).
//!
//! The device recomputes this value over the bytes it wrote to flash and
//! compares against the one announced in the `download_file` command, so
//! host and firmware must agree bit-for-bit.

/// Reflected CRC32 polynomial.
const POLY: u32 = 0xEDB8_8320;

/// Lookup table, computed at compile time.
static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute CRC32 over the full buffer.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn crc32_known_vectors() {
        // Standard check value for "123456789"
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b"The quick brown fox jumps over the lazy dog"), 0x414FA339);
    }

    #[test]
    fn crc32_detects_single_bit_flip() {
        let mut data = vec![0x5Au8; 4096];
        let original = crc32(&data);
        data[2048] ^= 0x01;
        assert_ne!(crc32(&data), original);
    }
}
