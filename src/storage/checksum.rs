/// CRC32 (IEEE) over `bytes`.
///
/// Used for both page checksums (over the page excluding the checksum
/// field) and WAL record checksums (over all preceding framing fields).
/// This is the single canonical implementation; pages and WAL records both
/// call through here rather than each carrying their own copy.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
