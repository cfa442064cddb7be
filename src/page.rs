//! On-disk page identity: location, size bounds, and the tag byte every
//! page starts with.
//!
//! A location is a (fileno, offset) pair rather than a raw byte pointer.
//! Earlier designs tagged the low bits of an in-memory pointer to mark a
//! page as a leaf; that collapses once the page moves between files or
//! processes. Tagging lives in the page header instead, as an explicit
//! byte that every reader checks before interpreting the rest of the page.

use crate::error::{Result, StorageError};

/// Smallest page the stores will allocate. Below this a slotted page
/// cannot hold a realistic term plus overhead.
pub const MIN_PAGE_SIZE: u32 = 4 * 1024;

/// Largest page size: the slot directory's offsets are 16-bit, so no page
/// can exceed what fits in that field.
pub const MAX_PAGE_SIZE: u32 = 65_535;

pub const DEFAULT_PAGE_SIZE: u32 = 8 * 1024;

pub fn validate_page_size(size: u32) -> Result<()> {
    if size < MIN_PAGE_SIZE || size > MAX_PAGE_SIZE {
        return Err(StorageError::arg(format!(
            "page size {size} out of range [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
        )));
    }
    Ok(())
}

/// Identifies a page by which numbered file it lives in and its byte
/// offset within that file. Filenos are assigned by the file set; offsets
/// are assigned by the free-space map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageLocation {
    pub fileno: u32,
    pub offset: u64,
}

impl PageLocation {
    pub const NULL: PageLocation = PageLocation {
        fileno: u32::MAX,
        offset: u64::MAX,
    };

    pub fn new(fileno: u32, offset: u64) -> Self {
        Self { fileno, offset }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for PageLocation {
    fn default() -> Self {
        Self::NULL
    }
}

/// The leading byte of every page on disk. Readers dispatch on this before
/// touching anything else in the page; writers set it once at allocation
/// and never need to change it except in the leaf/internal promotion case
/// the B+tree performs when a page is split for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageTag {
    /// Document-map data page that is not the last one in the store.
    DocmapData = 0xDA,
    /// Document-map data page that is currently the last (append target).
    DocmapDataFinal = 0xDF,
    /// Document-map cache page, not the last.
    DocmapCache = 0xCA,
    /// Document-map cache page, the last one written.
    DocmapCacheFinal = 0xCF,
    /// B+tree leaf bucket.
    BtreeLeaf = 0xB1,
    /// B+tree internal bucket.
    BtreeInternal = 0xB2,
}

impl PageTag {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0xDA => Ok(PageTag::DocmapData),
            0xDF => Ok(PageTag::DocmapDataFinal),
            0xCA => Ok(PageTag::DocmapCache),
            0xCF => Ok(PageTag::DocmapCacheFinal),
            0xB1 => Ok(PageTag::BtreeLeaf),
            0xB2 => Ok(PageTag::BtreeInternal),
            other => Err(StorageError::Corruption(format!(
                "unrecognised page tag 0x{other:02X}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_final(self) -> bool {
        matches!(self, PageTag::DocmapDataFinal | PageTag::DocmapCacheFinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_bounds_are_enforced() {
        assert!(validate_page_size(1024).is_err());
        assert!(validate_page_size(DEFAULT_PAGE_SIZE).is_ok());
        assert!(validate_page_size(MAX_PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn page_tag_round_trips() {
        for tag in [
            PageTag::DocmapData,
            PageTag::DocmapDataFinal,
            PageTag::DocmapCache,
            PageTag::DocmapCacheFinal,
            PageTag::BtreeLeaf,
            PageTag::BtreeInternal,
        ] {
            assert_eq!(PageTag::from_byte(tag.as_byte()).unwrap(), tag);
        }
    }

    #[test]
    fn unknown_tag_is_corruption() {
        assert!(PageTag::from_byte(0x00).is_err());
    }

    #[test]
    fn null_location_is_default() {
        assert!(PageLocation::default().is_null());
        assert!(!PageLocation::new(0, 0).is_null());
    }
}
