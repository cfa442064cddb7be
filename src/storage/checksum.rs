//! CRC32C integrity checks for fixed-size pages.
//!
//! Every page this crate writes is exactly `page_size` bytes, so a
//! checksum here reserves a fixed trailer at the end of the page image
//! rather than wrapping a variable-length blob the way a record store
//! would. `DocMap` calls [`Checksum::write_trailer`]/[`Checksum::verify_trailer`]
//! on its cache pages, the place `load` is documented to verify integrity
//! before trusting a saved cache mask enough to skip a full rescan.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Bytes reserved at the end of a checksummed page for the trailer.
pub const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    Crc32C,
    None,
}

impl Default for ChecksumType {
    fn default() -> Self {
        Self::Crc32C
    }
}

pub struct Checksum;

impl Checksum {
    pub fn compute(checksum_type: ChecksumType, data: &[u8]) -> u32 {
        match checksum_type {
            ChecksumType::Crc32C => {
                let mut hasher = Hasher::new();
                hasher.update(data);
                hasher.finalize()
            }
            ChecksumType::None => 0,
        }
    }

    /// Writes a checksum over `page[..page.len() - TRAILER_LEN]` into the
    /// trailing `TRAILER_LEN` bytes of `page`. A no-op under
    /// `ChecksumType::None` or when `page` is too short to hold a trailer.
    pub fn write_trailer(checksum_type: ChecksumType, page: &mut [u8]) {
        if checksum_type == ChecksumType::None || page.len() < TRAILER_LEN {
            return;
        }
        let split = page.len() - TRAILER_LEN;
        let checksum = Self::compute(checksum_type, &page[..split]);
        page[split..].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Verifies the trailer written by [`Checksum::write_trailer`]. Always
    /// passes under `ChecksumType::None`.
    pub fn verify_trailer(checksum_type: ChecksumType, page: &[u8]) -> std::result::Result<(), ChecksumError> {
        if checksum_type == ChecksumType::None || page.len() < TRAILER_LEN {
            return Ok(());
        }
        let split = page.len() - TRAILER_LEN;
        let expected = u32::from_le_bytes(page[split..].try_into().unwrap());
        let actual = Self::compute(checksum_type, &page[..split]);
        if actual != expected {
            return Err(ChecksumError::Mismatch { expected, actual, data_len: split });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch { expected: u32, actual: u32, data_len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_payload(payload: &[u8]) -> Vec<u8> {
        let mut page = vec![0u8; 64];
        page[..payload.len()].copy_from_slice(payload);
        page
    }

    #[test]
    fn write_then_verify_trailer_round_trips() {
        let mut page = page_with_payload(b"some cache page bytes");
        Checksum::write_trailer(ChecksumType::Crc32C, &mut page);
        assert!(Checksum::verify_trailer(ChecksumType::Crc32C, &page).is_ok());
    }

    #[test]
    fn tampering_with_the_body_is_detected() {
        let mut page = page_with_payload(b"some cache page bytes");
        Checksum::write_trailer(ChecksumType::Crc32C, &mut page);
        page[0] ^= 0xFF;
        assert!(Checksum::verify_trailer(ChecksumType::Crc32C, &page).is_err());
    }

    #[test]
    fn tampering_with_the_trailer_is_detected() {
        let mut page = page_with_payload(b"some cache page bytes");
        Checksum::write_trailer(ChecksumType::Crc32C, &mut page);
        let last = page.len() - 1;
        page[last] ^= 0xFF;
        assert!(Checksum::verify_trailer(ChecksumType::Crc32C, &page).is_err());
    }

    #[test]
    fn none_type_never_writes_or_rejects() {
        let mut page = page_with_payload(b"untouched");
        let before = page.clone();
        Checksum::write_trailer(ChecksumType::None, &mut page);
        assert_eq!(page, before);
        page[0] ^= 0xFF;
        assert!(Checksum::verify_trailer(ChecksumType::None, &page).is_ok());
    }
}
