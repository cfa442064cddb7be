//! Tunable parameters for each store and the impact transform.
//!
//! Every store takes its page size, buffer budget, and file-size ceiling
//! independently, since a vocabulary and a document map tend to want
//! different page sizes in practice (many small terms vs. fewer, larger
//! per-document records).

use crate::docmap::CacheMask;
use crate::error::{Result, StorageError};
use crate::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use crate::storage::checksum::ChecksumType;
use serde::{Deserialize, Serialize};

/// Front-coding is only applied to a TRECNO every `n`th record; the
/// others are stored in full so a scan never has to walk more than this
/// many records back to reconstruct one.
pub const TRECNO_FRONT_FREQ: u32 = 4;

/// How many document-map records separate consecutive LOCATION deltas
/// that get stored as a full value instead of a gap.
pub const LOC_REL_FREQ: u32 = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreConfig {
    pub page_size: usize,
    pub max_filesize: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE as usize,
            max_filesize: 1 << 30,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        let page_size: u32 = self
            .page_size
            .try_into()
            .map_err(|_| StorageError::arg("page_size out of range"))?;
        validate_page_size(page_size)?;
        if self.max_filesize < self.page_size as u64 {
            return Err(StorageError::arg("max_filesize must be at least one page"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VocabConfig {
    pub store: StoreConfig,
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self { store: StoreConfig::default() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DocMapConfig {
    pub store: StoreConfig,
    pub buffer_pages: usize,
    pub cache_mask: CacheMask,
    /// Integrity check applied to cache pages; gates whether `load` trusts
    /// a saved cache mask enough to skip a rescan of the data pages.
    pub checksum: ChecksumType,
}

impl Default for DocMapConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            buffer_pages: 16,
            cache_mask: CacheMask::ALL,
            checksum: ChecksumType::default(),
        }
    }
}

impl DocMapConfig {
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        if self.buffer_pages < 2 {
            return Err(StorageError::arg("buffer_pages must be at least 2"));
        }
        Ok(())
    }
}

/// Parameters for the pivoted-cosine weighting and quantisation pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImpactConfig {
    /// Pivot point (0, 1) trading off document-length normalisation.
    pub pivot: f64,
    /// Blend factor between the logistic-normalised weight and the raw
    /// pivoted-cosine weight before quantising.
    pub slope: f64,
    /// Number of quantisation levels expressed as a bit width; levels run
    /// `1..=2^quant_bits - 1`.
    pub quant_bits: u32,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self { pivot: 0.2, slope: 0.6, quant_bits: 8 }
    }
}

impl ImpactConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.pivot) {
            return Err(StorageError::arg("pivot must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.slope) {
            return Err(StorageError::arg("slope must be in [0, 1]"));
        }
        if self.quant_bits == 0 || self.quant_bits > 32 {
            return Err(StorageError::arg("quant_bits must be in 1..=32"));
        }
        Ok(())
    }
}

impl From<ImpactConfig> for crate::impact::ImpactConfig {
    fn from(c: ImpactConfig) -> Self {
        crate::impact::ImpactConfig { pivot: c.pivot, slope: c.slope, quant_bits: c.quant_bits }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StemCacheConfig {
    pub capacity: usize,
}

impl Default for StemCacheConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Top-level configuration for an index built from these three stores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexConfig {
    pub vocab: VocabConfig,
    pub docmap: DocMapConfig,
    pub impact: ImpactConfig,
    pub stem_cache: StemCacheConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            vocab: VocabConfig::default(),
            docmap: DocMapConfig::default(),
            impact: ImpactConfig::default(),
            stem_cache: StemCacheConfig::default(),
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        self.vocab.store.validate()?;
        self.docmap.validate()?;
        self.impact.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        IndexConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_page_size_below_minimum() {
        let mut config = StoreConfig::default();
        config.page_size = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_pivot_out_of_range() {
        let mut config = ImpactConfig::default();
        config.pivot = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_buffer_pages_below_two() {
        let mut config = DocMapConfig::default();
        config.buffer_pages = 1;
        assert!(config.validate().is_err());
    }
}
