#![forbid(unsafe_code)]

/// Integrity check applied to persisted column payloads.
///
/// The tile store computes the checksum over each column's uncompressed
/// bytes on write, records it in fragment metadata, and verifies it on read.
/// Implementations run on every column access and must be cheap.
pub trait Checksum: Send + Sync {
    /// Checksum of one payload.
    fn checksum(&self, payload: &[u8]) -> u32;
}

/// CRC32 backed by `crc32fast`.
#[derive(Debug, Default)]
pub struct Crc32Fast;

impl Checksum for Crc32Fast {
    fn checksum(&self, payload: &[u8]) -> u32 {
        crc32fast::hash(payload)
    }
}
