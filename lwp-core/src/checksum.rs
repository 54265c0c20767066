/// CRC-32C (Castagnoli) over a byte slice.
///
/// Hardware accelerated on x86_64 (SSE 4.2) and aarch64 where available.
#[inline]
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_empty_is_zero() {
        assert_eq!(crc32c(&[]), 0);
    }

    #[test]
    fn crc32c_known_vector() {
        // RFC 3720 B.4 test vector: 32 bytes of zeros.
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
    }

    #[test]
    fn crc32c_is_deterministic() {
        let data = b"hello lwp";
        assert_eq!(crc32c(data), crc32c(data));
        assert_ne!(crc32c(data), crc32c(b"hello lwq"));
    }
}
