//! Impact Transform: rewrites document-ordered posting lists into a
//! quantised, impact-sorted form and appends a new vocabulary entry per
//! term pointing at the rewritten list.
//!
//! Two scans: the first establishes the global weight range so every
//! term's postings quantise onto a shared scale; the second rewrites each
//! term's list using that range and re-sorts it by descending impact,
//! ascending docno. The vocabulary rebuild uses the B+tree's append path
//! (entries are fed to it in final sorted order, so no bucket ever has to
//! split more than the page size forces) and commits only once the new
//! files are durable.

use crate::btree::Btree;
use crate::bucket::Strategy;
use crate::error::{Result, StorageError};
use crate::fileset::{FileSet, FileType};
use crate::freemap::FreeSpaceMap;
use crate::page::PageLocation;
use crate::vbyte::{self, Reader};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub struct ImpactConfig {
    pub pivot: f64,
    pub slope: f64,
    pub quant_bits: u32,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            pivot: 0.2,
            slope: 0.6,
            quant_bits: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub docno: u64,
    pub f_dt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostingListHeader {
    pub docs: u64,
    pub occurs: u64,
    pub last_docno: u64,
}

pub fn encode_posting_list(postings: &[Posting]) -> Vec<u8> {
    let docs = postings.len() as u64;
    let occurs: u64 = postings.iter().map(|p| p.f_dt as u64).sum();
    let last_docno = postings.last().map(|p| p.docno).unwrap_or(0);

    let mut out = Vec::new();
    vbyte::encode_u64(docs, &mut out);
    vbyte::encode_u64(occurs, &mut out);
    vbyte::encode_u64(last_docno, &mut out);

    let mut prev_docno = 0u64;
    for (i, p) in postings.iter().enumerate() {
        let delta = if i == 0 { p.docno } else { p.docno - prev_docno };
        vbyte::encode_u64(delta, &mut out);
        vbyte::encode_u64(p.f_dt as u64, &mut out);
        prev_docno = p.docno;
    }
    out
}

pub fn decode_posting_list(bytes: &[u8]) -> Result<(PostingListHeader, Vec<Posting>)> {
    let mut reader = Reader::new(bytes);
    let docs = reader.read_u64()?;
    let occurs = reader.read_u64()?;
    let last_docno = reader.read_u64()?;

    let mut postings = Vec::with_capacity(docs as usize);
    let mut docno = 0u64;
    for i in 0..docs {
        let delta = reader.read_u64()?;
        docno = if i == 0 { delta } else { docno + delta };
        let f_dt = reader.read_u32()?;
        postings.push(Posting { docno, f_dt });
    }

    Ok((PostingListHeader { docs, occurs, last_docno }, postings))
}

fn pivoted_cosine_weight(f_dt: u32, doc_weight: f64, avg_weight: f64, pivot: f64) -> f64 {
    (1.0 + (f_dt as f64).ln()) / ((1.0 - pivot) + pivot * doc_weight / avg_weight)
}

/// Scan 1: global minimum/maximum pivoted-cosine weight across every
/// posting in every term, plus the collection-wide average `f_t`.
pub fn scan_limits(
    index: &BTreeMap<String, Vec<Posting>>,
    doc_weight: impl Fn(u64) -> f64,
    avg_weight: f64,
    pivot: f64,
) -> (f64, f64, f64) {
    let mut min_w = f64::MAX;
    let mut max_w = f64::MIN;
    let mut total_f_t = 0u64;

    for postings in index.values() {
        total_f_t += postings.len() as u64;
        for p in postings {
            let w = pivoted_cosine_weight(p.f_dt, doc_weight(p.docno), avg_weight, pivot);
            min_w = min_w.min(w);
            max_w = max_w.max(w);
        }
    }

    let avg_f_t = if index.is_empty() {
        0.0
    } else {
        total_f_t as f64 / index.len() as f64
    };

    (min_w, max_w, avg_f_t)
}

pub fn normalisation_constant(min_w: f64, max_w: f64) -> f64 {
    if (max_w - min_w).abs() < f64::EPSILON {
        1.0
    } else {
        (max_w / min_w).powf(min_w / (max_w - min_w))
    }
}

fn quantise(w: f64, min_w: f64, max_w: f64, b: f64, slope: f64, quant_bits: u32) -> u32 {
    let log_b = if b > 1.0 { w.ln() / b.ln() - min_w.ln() / b.ln() } else { 0.0 };
    let w_prime = (min_w + min_w * log_b).clamp(min_w, max_w);
    let blended = (1.0 - slope) * w_prime + slope * w;
    let range = max_w - min_w + f64::EPSILON;
    let level = (((1u64 << quant_bits) as f64) * (blended - min_w) / range).floor() as i64 + 1;
    level.clamp(1, (1i64 << quant_bits) - 1) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImpactBlock {
    pub impact_level: u32,
    pub docnos: Vec<u64>,
}

pub struct TransformResult {
    pub lists: BTreeMap<String, Vec<ImpactBlock>>,
    pub w_qt_min: f64,
    pub w_qt_max: f64,
}

fn w_qt(f_dt: u32, f_t_avg: f64, f_t: u64) -> f64 {
    (1.0 + (f_dt as f64).ln()) * (1.0 + f_t_avg / f_t.max(1) as f64).ln()
}

/// Scan 2: rewrite every term's posting list into impact-sorted blocks.
pub fn transform(
    index: &BTreeMap<String, Vec<Posting>>,
    doc_weight: impl Fn(u64) -> f64,
    avg_weight: f64,
    config: &ImpactConfig,
) -> TransformResult {
    let (min_w, max_w, avg_f_t) = scan_limits(index, &doc_weight, avg_weight, config.pivot);
    let b = normalisation_constant(min_w, max_w);

    let mut lists = BTreeMap::new();
    let mut w_qt_min = f64::MAX;
    let mut w_qt_max = f64::MIN;

    for (term, postings) in index {
        let f_t = postings.len() as u64;
        let mut scored: Vec<(u32, u64)> = postings
            .iter()
            .map(|p| {
                let w = pivoted_cosine_weight(p.f_dt, doc_weight(p.docno), avg_weight, config.pivot);
                let level = quantise(w, min_w, max_w, b, config.slope, config.quant_bits);

                let qt = w_qt(p.f_dt, avg_f_t, f_t);
                w_qt_min = w_qt_min.min(qt);
                w_qt_max = w_qt_max.max(qt);

                (level, p.docno)
            })
            .collect();

        // Descending impact, ascending docno within a level.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut blocks: Vec<ImpactBlock> = Vec::new();
        for (level, docno) in scored {
            match blocks.last_mut() {
                Some(block) if block.impact_level == level => block.docnos.push(docno),
                _ => blocks.push(ImpactBlock { impact_level: level, docnos: vec![docno] }),
            }
        }

        lists.insert(term.clone(), blocks);
    }

    TransformResult { lists, w_qt_min, w_qt_max }
}

pub fn encode_impact_list(blocks: &[ImpactBlock]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        vbyte::encode_u64(block.docnos.len() as u64, &mut out);
        vbyte::encode_u64(block.impact_level as u64, &mut out);
        let mut prev: Option<u64> = None;
        for &docno in &block.docnos {
            match prev {
                None => vbyte::encode_u64(docno, &mut out),
                Some(p) => vbyte::encode_u64(docno - p - 1, &mut out),
            };
            prev = Some(docno);
        }
    }
    out
}

pub fn decode_impact_list(bytes: &[u8]) -> Result<Vec<ImpactBlock>> {
    let mut reader = Reader::new(bytes);
    let mut blocks = Vec::new();
    while !reader.at_end() {
        let block_size = reader.read_u64()?;
        let impact_level = reader.read_u32()?;
        let mut docnos = Vec::with_capacity(block_size as usize);
        let mut prev: Option<u64> = None;
        for i in 0..block_size {
            let value = reader.read_u64()?;
            let docno = match prev {
                None => value,
                Some(p) => p + value + 1,
            };
            docnos.push(docno);
            prev = Some(docno);
            let _ = i;
        }
        blocks.push(ImpactBlock { impact_level, docnos });
    }
    Ok(blocks)
}

/// Distinguishes a vocabulary record pointing at the original,
/// document-ordered posting list from one pointing at its impact-sorted
/// rewrite. Appended as the last byte of the B+tree key so both entries
/// for the same term sort adjacently with the original first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VocabEntryKind {
    Original = 0,
    Impact = 1,
}

pub fn vocab_key(term: &[u8], kind: VocabEntryKind) -> Vec<u8> {
    let mut key = term.to_vec();
    key.push(kind as u8);
    key
}

/// Bulk-loads a fresh vocabulary from `entries` (already sorted by key)
/// using the tree's append path, achieving a fill factor of 1.0 since no
/// capacity is held back for future random inserts. Writes to side files
/// and only renames over the original's fileno once durable, so a
/// mid-rebuild failure leaves the original vocabulary intact.
pub fn rebuild_vocabulary(
    file_set: FileSet,
    page_size: usize,
    leaf_strategy: Strategy,
    node_strategy: Strategy,
    max_filesize: u64,
    entries: &[(Vec<u8>, Vec<u8>)],
    original_root_fileno: u32,
) -> Result<PageLocation> {
    let mut tree = Btree::new(
        page_size,
        leaf_strategy,
        node_strategy,
        FreeSpaceMap::new(),
        file_set.clone(),
        FileType::Vocab,
        max_filesize,
    )?;

    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, payload) in &sorted {
        match tree.append(key, payload)? {
            crate::error::Fit::Ok(_) => {}
            crate::error::Fit::TooBig => {
                return Err(StorageError::arg("vocabulary entry exceeds the maximum payload size"))
            }
            crate::error::Fit::DoesNotFit => {
                return Err(StorageError::Mem("append failed to make room even after a split".into()))
            }
        }
    }
    tree.flush()?;

    let new_root = tree.root_location();
    file_set.replace(FileType::Vocab, original_root_fileno, new_root.fileno)?;
    Ok(PageLocation::new(original_root_fileno, new_root.offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posting_list_round_trips() {
        let postings = vec![
            Posting { docno: 1, f_dt: 3 },
            Posting { docno: 2, f_dt: 1 },
            Posting { docno: 3, f_dt: 2 },
        ];
        let encoded = encode_posting_list(&postings);
        let (header, decoded) = decode_posting_list(&encoded).unwrap();
        assert_eq!(header.docs, 3);
        assert_eq!(header.last_docno, 3);
        assert_eq!(decoded, postings);
    }

    #[test]
    fn impact_block_round_trips() {
        let blocks = vec![
            ImpactBlock { impact_level: 200, docnos: vec![1, 3, 7] },
            ImpactBlock { impact_level: 50, docnos: vec![2, 4] },
        ];
        let encoded = encode_impact_list(&blocks);
        let decoded = decode_impact_list(&encoded).unwrap();
        assert_eq!(decoded, blocks);
    }

    #[test]
    fn two_term_transform_produces_descending_levels_and_ascending_docnos() {
        let mut index = BTreeMap::new();
        index.insert(
            "alpha".to_string(),
            vec![
                Posting { docno: 1, f_dt: 3 },
                Posting { docno: 2, f_dt: 1 },
                Posting { docno: 3, f_dt: 2 },
            ],
        );
        index.insert(
            "beta".to_string(),
            vec![Posting { docno: 2, f_dt: 5 }, Posting { docno: 4, f_dt: 1 }],
        );

        let config = ImpactConfig { pivot: 0.2, slope: 0.6, quant_bits: 8 };
        let result = transform(&index, |_docno| 1.0, 1.0, &config);

        assert_eq!(result.lists.len(), 2);
        for blocks in result.lists.values() {
            for w in blocks.windows(2) {
                assert!(w[0].impact_level > w[1].impact_level);
            }
            for block in blocks {
                for w in block.docnos.windows(2) {
                    assert!(w[0] < w[1]);
                }
            }

            let encoded = encode_impact_list(blocks);
            let decoded = decode_impact_list(&encoded).unwrap();
            assert_eq!(&decoded, blocks);
        }
    }

    #[test]
    fn normalisation_constant_handles_equal_min_and_max() {
        assert_eq!(normalisation_constant(1.0, 1.0), 1.0);
    }

    #[test]
    fn decoded_docno_set_matches_pre_encoding_set() {
        let block = ImpactBlock { impact_level: 10, docnos: vec![5, 9, 20, 21] };
        let encoded = encode_impact_list(&[block.clone()]);
        let decoded = decode_impact_list(&encoded).unwrap();
        let original: std::collections::BTreeSet<_> = block.docnos.into_iter().collect();
        let round_tripped: std::collections::BTreeSet<_> = decoded[0].docnos.iter().copied().collect();
        assert_eq!(original, round_tripped);
    }
}
