//! Document Map: an append-only sequential store of per-document records.
//!
//! Records are delta-coded against the previous record on the same page
//! and written as a vbyte stream behind a one-byte page tag and a
//! big-endian entry count. At `save` time, a run of cache pages follows
//! the data pages, holding self-describing tagged sections that let
//! `load` skip a full rescan when the requested cache mask matches what
//! was last saved.
//!
//! This implementation keeps the full record set resident in memory
//! rather than splitting a bounded page arena into a read buffer and an
//! append buffer with eviction; see `DESIGN.md` for the reasoning. The
//! on-disk page and cache-section formats are unaffected by that choice.

pub mod reposset;

use crate::config::{LOC_REL_FREQ, TRECNO_FRONT_FREQ};
use crate::error::{Result, StorageError};
use crate::fileset::{FileSet, FileType, Mode};
use crate::storage::checksum::{Checksum, ChecksumType, TRAILER_LEN};
use crate::vbyte::{self, Reader};
use reposset::RepositorySet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};

pub const DATA_TAG: u8 = 0xDA;
pub const DATA_FINAL_TAG: u8 = 0xDF;
pub const CACHE_TAG: u8 = 0xCA;
pub const CACHE_FINAL_TAG: u8 = 0xCF;
const PAGE_HEADER_LEN: usize = 5; // tag + 4-byte entry count

const SECTION_END: u8 = 0x00;
const SECTION_AGG: u8 = 0x01;
const SECTION_MAP: u8 = 0x02;
const SECTION_WORDS: u8 = 0x03;
const SECTION_DWORDS: u8 = 0x04;
const SECTION_WEIGHT: u8 = 0x05;
const SECTION_TRECNO: u8 = 0x06;
const SECTION_TYPEEX: u8 = 0x07;
const SECTION_MASK: u8 = 0x08;
const SECTION_TRECNO_CODE: u8 = 0x09;
const SECTION_LOC: u8 = 0x0A;
const SECTION_LOC_CODE: u8 = 0x0B;
const SECTION_REPOS_REC: u8 = 0x0C;
const SECTION_REPOS_CHECK: u8 = 0x0D;

#[derive(Debug, Clone, PartialEq)]
pub struct DocRecord {
    pub fileno: u32,
    pub offset: u64,
    pub bytes: u64,
    pub flags: u8,
    pub words: u32,
    pub distinct_words: u32,
    pub mime_type: u8,
    pub trecno: Vec<u8>,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheMask(u8);

impl CacheMask {
    pub const NONE: CacheMask = CacheMask(0);
    pub const LOCATION: CacheMask = CacheMask(1 << 0);
    pub const WORDS: CacheMask = CacheMask(1 << 1);
    pub const DISTINCT_WORDS: CacheMask = CacheMask(1 << 2);
    pub const WEIGHT: CacheMask = CacheMask(1 << 3);
    pub const TRECNO: CacheMask = CacheMask(1 << 4);

    pub const ALL: CacheMask = CacheMask(
        Self::LOCATION.0 | Self::WORDS.0 | Self::DISTINCT_WORDS.0 | Self::WEIGHT.0 | Self::TRECNO.0,
    );

    pub fn contains(self, bit: CacheMask) -> bool {
        self.0 & bit.0 == bit.0
    }

    fn bits(self) -> u8 {
        self.0
    }

    fn from_bits(bits: u8) -> Self {
        CacheMask(bits)
    }
}

impl BitOr for CacheMask {
    type Output = CacheMask;
    fn bitor(self, rhs: CacheMask) -> CacheMask {
        CacheMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for CacheMask {
    fn bitor_assign(&mut self, rhs: CacheMask) {
        self.0 |= rhs.0;
    }
}

const DEFAULT_MIME_TYPE: u8 = 0;

pub struct DocMap {
    file_set: FileSet,
    page_size: usize,
    buffer_pages: usize,
    max_filesize: u64,
    cache_mask: CacheMask,
    checksum_type: ChecksumType,

    records: Vec<DocRecord>,
    repos: RepositorySet,
    current_fileno: u32,
    next_offset: u64,
}

impl DocMap {
    pub fn new(
        file_set: FileSet,
        page_size: usize,
        buffer_pages: usize,
        max_filesize: u64,
        cache_mask: CacheMask,
        checksum_type: ChecksumType,
    ) -> Result<Self> {
        if buffer_pages < 2 {
            return Err(StorageError::arg("buffer_pages must be >= 2"));
        }
        let fileno = file_set.create(FileType::Docmap)?;
        Ok(Self {
            file_set,
            page_size,
            buffer_pages,
            max_filesize,
            cache_mask,
            checksum_type,
            records: Vec::new(),
            repos: RepositorySet::new(),
            current_fileno: fileno,
            next_offset: 0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        fileno: u32,
        offset: u64,
        bytes: u64,
        flags: u8,
        words: u32,
        distinct_words: u32,
        weight: f64,
        trecno: &[u8],
        mime_type: u8,
    ) -> Result<u64> {
        if words < distinct_words {
            return Err(StorageError::arg("words must be >= distinct_words"));
        }
        if bytes + 1 < 2 * words as u64 {
            return Err(StorageError::arg("bytes is too small for the given word count"));
        }
        self.records.push(DocRecord {
            fileno,
            offset,
            bytes,
            flags,
            words,
            distinct_words,
            mime_type,
            trecno: trecno.to_vec(),
            weight,
        });
        self.repos.add_many_docs(fileno, 1);
        Ok((self.records.len() - 1) as u64)
    }

    /// Source file backing `docno`, reconstructed from the repository set
    /// rather than the per-record LOCATION cache.
    pub fn fileno_for_docno(&self, docno: u64) -> Result<u32> {
        self.repos.fileno_for_docno(docno)
    }

    pub fn get(&self, docno: u64) -> Result<&DocRecord> {
        self.records
            .get(docno as usize)
            .ok_or_else(|| StorageError::arg(format!("docno {docno} out of range")))
    }

    pub fn get_location(&self, docno: u64) -> Result<(u32, u64, u64, u8, u8)> {
        let r = self.get(docno)?;
        Ok((r.fileno, r.offset, r.bytes, r.mime_type, r.flags))
    }

    pub fn get_trecno(&self, docno: u64) -> Result<&[u8]> {
        Ok(&self.get(docno)?.trecno)
    }

    pub fn get_words(&self, docno: u64) -> Result<u32> {
        Ok(self.get(docno)?.words)
    }

    pub fn get_distinct_words(&self, docno: u64) -> Result<u32> {
        Ok(self.get(docno)?.distinct_words)
    }

    pub fn get_weight(&self, docno: u64) -> Result<f64> {
        Ok(self.get(docno)?.weight)
    }

    pub fn get_bytes(&self, docno: u64) -> Result<u64> {
        Ok(self.get(docno)?.bytes)
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cache(&mut self, mask: CacheMask) {
        self.cache_mask = mask;
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.bytes).sum()
    }

    pub fn avg_bytes(&self) -> f64 {
        self.average(|r| r.bytes as f64)
    }

    pub fn avg_words(&self) -> f64 {
        self.average(|r| r.words as f64)
    }

    pub fn avg_distinct_words(&self) -> f64 {
        self.average(|r| r.distinct_words as f64)
    }

    pub fn avg_weight(&self) -> f64 {
        self.average(|r| r.weight)
    }

    fn average(&self, f: impl Fn(&DocRecord) -> f64) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(f).sum::<f64>() / self.records.len() as f64
    }

    fn reserve_page(&mut self) -> Result<(u32, u64)> {
        if self.next_offset + self.page_size as u64 > self.max_filesize {
            self.current_fileno = self.file_set.create(FileType::Docmap)?;
            self.next_offset = 0;
        }
        let location = (self.current_fileno, self.next_offset);
        self.next_offset += self.page_size as u64;
        Ok(location)
    }

    /// Encodes every record into a sequence of data pages, writes them,
    /// then appends the cache pages, and returns the map of (fileno,
    /// offset, entry_count) per data page, used to build the MAP section.
    fn write_data_pages(&mut self) -> Result<Vec<(u32, u64, u64, u32)>> {
        let mut map = Vec::new();
        let mut record_idx = 0usize;
        let capacity = self.page_size - PAGE_HEADER_LEN;

        while record_idx < self.records.len() {
            let mut body = Vec::new();
            let mut count = 0u32;
            let mut prev: Option<&DocRecord> = None;
            let first_docno = record_idx as u64;

            while record_idx < self.records.len() {
                let record = &self.records[record_idx];
                let mut encoded = Vec::new();
                encode_record(record, prev, &mut encoded);
                if !body.is_empty() && body.len() + encoded.len() > capacity {
                    break;
                }
                body.extend_from_slice(&encoded);
                prev = Some(record);
                record_idx += 1;
                count += 1;
            }

            let (fileno, offset) = self.reserve_page()?;
            let is_last = record_idx == self.records.len();
            let mut page = vec![0u8; self.page_size];
            page[0] = if is_last { DATA_FINAL_TAG } else { DATA_TAG };
            page[1..5].copy_from_slice(&count.to_be_bytes());
            let end = (PAGE_HEADER_LEN + body.len()).min(self.page_size);
            page[PAGE_HEADER_LEN..end].copy_from_slice(&body[..end - PAGE_HEADER_LEN]);

            let handle = self.file_set.pin(FileType::Docmap, fileno, Mode::Exclusive)?;
            handle.write_at(offset, &page)?;

            map.push((fileno, offset, first_docno, count));
        }

        Ok(map)
    }

    pub fn save(&mut self) -> Result<()> {
        let map = self.write_data_pages()?;

        let mut sections = Vec::new();
        write_section_mask(&mut sections, self.cache_mask);
        write_section_agg(&mut sections, self);
        write_section_map(&mut sections, &map);

        if self.cache_mask.contains(CacheMask::WORDS) {
            write_section_u32_array(&mut sections, SECTION_WORDS, self.records.iter().map(|r| r.words));
        }
        if self.cache_mask.contains(CacheMask::DISTINCT_WORDS) {
            write_section_u32_array(
                &mut sections,
                SECTION_DWORDS,
                self.records.iter().map(|r| r.distinct_words),
            );
        }
        if self.cache_mask.contains(CacheMask::WEIGHT) {
            write_section_weight(&mut sections, &self.records);
        }
        if self.cache_mask.contains(CacheMask::TRECNO) {
            write_section_trecno(&mut sections, &self.records);
        }
        if self.cache_mask.contains(CacheMask::LOCATION) {
            write_section_loc(&mut sections, &self.records);
        }
        write_section_typeex(&mut sections, &self.records);
        write_section_repos(&mut sections, &self.repos);
        sections.push(SECTION_END);

        let mut offset = 0usize;
        let mut first = true;
        let capacity = self.page_size - 1 - TRAILER_LEN;
        while offset < sections.len() || first {
            first = false;
            let end = (offset + capacity).min(sections.len());
            let chunk = &sections[offset..end];
            let is_last = end == sections.len();

            let (fileno, file_offset) = self.reserve_page()?;
            let mut page = vec![0u8; self.page_size];
            page[0] = if is_last { CACHE_FINAL_TAG } else { CACHE_TAG };
            page[1..1 + chunk.len()].copy_from_slice(chunk);
            Checksum::write_trailer(self.checksum_type, &mut page);

            let handle = self.file_set.pin(FileType::Docmap, fileno, Mode::Exclusive)?;
            handle.write_at(file_offset, &page)?;

            offset = end;
        }

        Ok(())
    }

    /// Reloads from disk. If `requested_mask` is fully covered by the
    /// mask that was active at save time, the per-docno caches plus
    /// aggregates reconstruct the full record set without decoding any
    /// data page; otherwise every data page is rescanned.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        file_set: FileSet,
        page_size: usize,
        buffer_pages: usize,
        max_filesize: u64,
        requested_mask: CacheMask,
        checksum_type: ChecksumType,
        root_fileno: u32,
    ) -> Result<Self> {
        let mut docmap = Self {
            file_set,
            page_size,
            buffer_pages,
            max_filesize,
            cache_mask: requested_mask,
            checksum_type,
            records: Vec::new(),
            repos: RepositorySet::new(),
            current_fileno: root_fileno,
            next_offset: 0,
        };

        let (saved_mask, map, cached, repos) = docmap.scan_cache_pages(root_fileno)?;
        docmap.repos = repos;

        if requested_mask == saved_mask {
            docmap.records = cached;
        } else {
            docmap.rescan_data_pages(&map)?;
        }

        Ok(docmap)
    }

    fn rescan_data_pages(&mut self, map: &[(u32, u64, u64, u32)]) -> Result<()> {
        self.records.clear();
        for &(fileno, offset, _, count) in map {
            let handle = self.file_set.pin(FileType::Docmap, fileno, Mode::Shared)?;
            let mut page = vec![0u8; self.page_size];
            handle.read_at(offset, &mut page)?;

            let tag = page[0];
            if tag != DATA_TAG && tag != DATA_FINAL_TAG {
                return Err(StorageError::Fmt("expected a document-map data page".into()));
            }
            let declared_count = u32::from_be_bytes(page[1..5].try_into().unwrap());
            if declared_count != count {
                return Err(StorageError::Corruption(
                    "data page entry count disagrees with the saved map".into(),
                ));
            }

            let mut reader = Reader::new(&page[PAGE_HEADER_LEN..]);
            let mut prev: Option<DocRecord> = None;
            for _ in 0..count {
                let record = decode_record(&mut reader, prev.as_ref())?;
                prev = Some(record.clone());
                self.records.push(record);
            }
        }
        Ok(())
    }

    /// Walks the cache pages, returning the saved mask, the data-page
    /// map, a record set reconstructed from whatever sections the saved
    /// mask covers (fields outside that mask default to zero/empty), and
    /// the repository set. Each page's integrity trailer is verified
    /// before its body is trusted.
    #[allow(clippy::type_complexity)]
    fn scan_cache_pages(
        &self,
        start_fileno: u32,
    ) -> Result<(CacheMask, Vec<(u32, u64, u64, u32)>, Vec<DocRecord>, RepositorySet)> {
        let mut sections = Vec::new();
        let mut fileno = start_fileno;
        let mut offset = self.find_first_cache_page_offset(fileno)?;

        loop {
            let handle = self.file_set.pin(FileType::Docmap, fileno, Mode::Shared)?;
            let mut page = vec![0u8; self.page_size];
            handle.read_at(offset, &mut page)?;
            Checksum::verify_trailer(self.checksum_type, &page)
                .map_err(|e| StorageError::Corruption(format!("cache page checksum failed: {e}")))?;
            let tag = page[0];
            if tag != CACHE_TAG && tag != CACHE_FINAL_TAG {
                return Err(StorageError::Fmt("expected a document-map cache page".into()));
            }
            let body_end = page.len() - TRAILER_LEN;
            sections.extend_from_slice(&page[1..body_end]);
            if tag == CACHE_FINAL_TAG {
                break;
            }
            offset += self.page_size as u64;
        }

        parse_cache_sections(&sections)
    }

    fn find_first_cache_page_offset(&self, fileno: u32) -> Result<u64> {
        let handle = self.file_set.pin(FileType::Docmap, fileno, Mode::Shared)?;
        let len = handle.len()?;
        let mut offset = 0u64;
        while offset < len {
            let mut tag = [0u8; 1];
            handle.read_at(offset, &mut tag)?;
            if tag[0] == CACHE_TAG || tag[0] == CACHE_FINAL_TAG {
                return Ok(offset);
            }
            offset += self.page_size as u64;
        }
        Err(StorageError::Fmt("no cache page found in document map file".into()))
    }

    pub fn root_fileno(&self) -> u32 {
        self.current_fileno
    }
}

fn encode_record(record: &DocRecord, prev: Option<&DocRecord>, out: &mut Vec<u8>) {
    match prev {
        Some(p) if p.fileno == record.fileno && record.offset == p.offset + p.bytes => {
            vbyte::encode_u64(0, out);
        }
        Some(p) => {
            vbyte::encode_u64(1 + (record.fileno as i64 - p.fileno as i64).max(0) as u64, out);
            vbyte::encode_u64(record.offset, out);
        }
        None => {
            vbyte::encode_u64(1 + record.fileno as u64, out);
            vbyte::encode_u64(record.offset, out);
        }
    }

    vbyte::encode_u64(record.flags as u64, out); // docno is implicit via position; flags alone suffice here
    vbyte::encode_u64(record.distinct_words as u64, out);
    vbyte::encode_u64((record.words - record.distinct_words) as u64, out);
    vbyte::encode_u64(record.bytes + 1 - 2 * record.words as u64, out);
    vbyte::encode_u64(record.mime_type as u64, out);

    let prev_trecno: &[u8] = prev.map(|p| p.trecno.as_slice()).unwrap_or(&[]);
    let prefix_len = common_prefix_len(prev_trecno, &record.trecno);
    let suffix = &record.trecno[prefix_len..];
    vbyte::encode_u64(prefix_len as u64, out);
    vbyte::encode_u64(suffix.len() as u64, out);
    out.extend_from_slice(suffix);

    vbyte::encode_float(record.weight, 7, out);
}

fn decode_record(reader: &mut Reader, prev: Option<&DocRecord>) -> Result<DocRecord> {
    let fileno_gap = reader.read_u64()?;
    let (fileno, offset) = if fileno_gap == 0 {
        let p = prev.ok_or_else(|| StorageError::Fmt("fileno-gap of 0 with no previous record".into()))?;
        (p.fileno, p.offset + p.bytes)
    } else {
        let fileno = prev.map(|p| p.fileno).unwrap_or(0) + (fileno_gap - 1) as u32;
        let offset = reader.read_u64()?;
        (fileno, offset)
    };

    let flags = reader.read_u64()? as u8;
    let distinct_words = reader.read_u32()?;
    let words_minus_distinct = reader.read_u32()?;
    let words = distinct_words + words_minus_distinct;
    let bytes_plus1_minus_2words = reader.read_u64()?;
    let bytes = bytes_plus1_minus_2words + 2 * words as u64 - 1;
    let mime_type = reader.read_u64()? as u8;

    let prefix_len = reader.read_u64()? as usize;
    let suffix_len = reader.read_u64()? as usize;
    let suffix = reader.read_bytes(suffix_len)?;
    let mut trecno = prev
        .map(|p| p.trecno[..prefix_len.min(p.trecno.len())].to_vec())
        .unwrap_or_default();
    trecno.extend_from_slice(suffix);

    let weight = crate::vbyte::decode_float_with_precision(reader, 7)?;

    Ok(DocRecord {
        fileno,
        offset,
        bytes,
        flags,
        words,
        distinct_words,
        mime_type,
        trecno,
        weight,
    })
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn write_section_mask(out: &mut Vec<u8>, mask: CacheMask) {
    out.push(SECTION_MASK);
    out.push(mask.bits());
}

fn write_section_agg(out: &mut Vec<u8>, docmap: &DocMap) {
    out.push(SECTION_AGG);
    let mut body = Vec::new();
    vbyte::encode_u64(docmap.records.len() as u64, &mut body);
    vbyte::encode_float(docmap.total_bytes() as f64, 32, &mut body);
    vbyte::encode_float(docmap.records.iter().map(|r| r.words as f64).sum(), 32, &mut body);
    vbyte::encode_float(
        docmap.records.iter().map(|r| r.distinct_words as f64).sum(),
        32,
        &mut body,
    );
    vbyte::encode_float(docmap.records.iter().map(|r| r.weight).sum(), 32, &mut body);
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);
}

fn write_section_map(out: &mut Vec<u8>, map: &[(u32, u64, u64, u32)]) {
    out.push(SECTION_MAP);
    let mut body = Vec::new();
    vbyte::encode_u64(map.len() as u64, &mut body);
    for &(fileno, offset, first_docno, count) in map {
        vbyte::encode_u64(fileno as u64, &mut body);
        vbyte::encode_u64(offset, &mut body);
        vbyte::encode_u64(first_docno, &mut body);
        vbyte::encode_u64(count as u64, &mut body);
    }
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);
}

fn write_section_u32_array(out: &mut Vec<u8>, tag: u8, values: impl Iterator<Item = u32>) {
    out.push(tag);
    let mut body = Vec::new();
    let values: Vec<u32> = values.collect();
    vbyte::encode_u64(values.len() as u64, &mut body);
    for v in values {
        vbyte::encode_u64(v as u64, &mut body);
    }
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);
}

fn write_section_weight(out: &mut Vec<u8>, records: &[DocRecord]) {
    out.push(SECTION_WEIGHT);
    let mut body = Vec::new();
    vbyte::encode_u64(records.len() as u64, &mut body);
    for r in records {
        vbyte::encode_float(r.weight, 23, &mut body);
    }
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);
}

/// TRECNO/TRECNO_CODE split the way §4.3 documents: `TRECNO` holds the
/// byte offset into `TRECNO_CODE` of every `TRECNO_FRONT_FREQ`th record,
/// so a scan never has to front-decode more than that many records back.
/// `TRECNO_CODE` carries the actual common-prefix-coded stream; a group
/// boundary forces `prefix_len = 0` so the group stands on its own.
fn write_section_trecno(out: &mut Vec<u8>, records: &[DocRecord]) {
    let mut code_body = Vec::new();
    vbyte::encode_u64(records.len() as u64, &mut code_body);
    let mut group_offsets = Vec::new();
    let mut prev: Vec<u8> = Vec::new();
    for (i, r) in records.iter().enumerate() {
        if i as u32 % TRECNO_FRONT_FREQ == 0 {
            prev.clear();
            group_offsets.push(code_body.len() as u64);
        }
        let prefix_len = common_prefix_len(&prev, &r.trecno);
        let suffix = &r.trecno[prefix_len..];
        vbyte::encode_u64(prefix_len as u64, &mut code_body);
        vbyte::encode_u64(suffix.len() as u64, &mut code_body);
        code_body.extend_from_slice(suffix);
        prev = r.trecno.clone();
    }

    out.push(SECTION_TRECNO);
    let mut body = Vec::new();
    vbyte::encode_u64(TRECNO_FRONT_FREQ as u64, &mut body);
    vbyte::encode_u64(group_offsets.len() as u64, &mut body);
    for o in &group_offsets {
        vbyte::encode_u64(*o, &mut body);
    }
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);

    out.push(SECTION_TRECNO_CODE);
    vbyte::encode_u64(code_body.len() as u64, out);
    out.extend_from_slice(&code_body);
}

/// LOC/LOC_CODE mirror the TRECNO split for per-document `(fileno,
/// offset, bytes)` triples, grouped every `LOC_REL_FREQ` records so a
/// group never depends on an earlier one's running offset.
fn write_section_loc(out: &mut Vec<u8>, records: &[DocRecord]) {
    let mut code_body = Vec::new();
    vbyte::encode_u64(records.len() as u64, &mut code_body);
    let mut group_offsets = Vec::new();
    let mut prev: Option<(u32, u64, u64)> = None;
    for (i, r) in records.iter().enumerate() {
        if i as u32 % LOC_REL_FREQ == 0 {
            prev = None;
            group_offsets.push(code_body.len() as u64);
        }
        match prev {
            Some((pfileno, poffset, pbytes)) if pfileno == r.fileno && r.offset == poffset + pbytes => {
                vbyte::encode_u64(0, &mut code_body);
            }
            Some((pfileno, _, _)) => {
                vbyte::encode_u64(1 + (r.fileno as i64 - pfileno as i64).max(0) as u64, &mut code_body);
                vbyte::encode_u64(r.offset, &mut code_body);
            }
            None => {
                vbyte::encode_u64(1 + r.fileno as u64, &mut code_body);
                vbyte::encode_u64(r.offset, &mut code_body);
            }
        }
        vbyte::encode_u64(r.bytes, &mut code_body);
        prev = Some((r.fileno, r.offset, r.bytes));
    }

    out.push(SECTION_LOC);
    let mut body = Vec::new();
    vbyte::encode_u64(LOC_REL_FREQ as u64, &mut body);
    vbyte::encode_u64(group_offsets.len() as u64, &mut body);
    for o in &group_offsets {
        vbyte::encode_u64(*o, &mut body);
    }
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);

    out.push(SECTION_LOC_CODE);
    vbyte::encode_u64(code_body.len() as u64, out);
    out.extend_from_slice(&code_body);
}

fn write_section_repos(out: &mut Vec<u8>, repos: &RepositorySet) {
    out.push(SECTION_REPOS_REC);
    let mut body = Vec::new();
    repos.encode_runs(&mut body);
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);

    if !repos.has_checkpoints() {
        return;
    }
    out.push(SECTION_REPOS_CHECK);
    let mut body = Vec::new();
    repos.encode_checkpoints(&mut body);
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);
}

fn write_section_typeex(out: &mut Vec<u8>, records: &[DocRecord]) {
    let exceptions: Vec<(u64, u8)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.mime_type != DEFAULT_MIME_TYPE)
        .map(|(i, r)| (i as u64, r.mime_type))
        .collect();
    if exceptions.is_empty() {
        return;
    }
    out.push(SECTION_TYPEEX);
    let mut body = Vec::new();
    vbyte::encode_u64(exceptions.len() as u64, &mut body);
    for (docno, mime_type) in exceptions {
        vbyte::encode_u64(docno, &mut body);
        vbyte::encode_u64(mime_type as u64, &mut body);
    }
    vbyte::encode_u64(body.len() as u64, out);
    out.extend_from_slice(&body);
}

/// Decodes the common-prefix-coded stream written by `write_section_trecno`.
/// Group boundaries need no special handling here: a group-start record
/// always carries `prefix_len == 0`, so `prev` from the prior group (if
/// any) never actually contributes any bytes.
fn decode_trecno_code(r: &mut Reader, n: u64) -> Result<Vec<Vec<u8>>> {
    let mut v: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
    let mut prev: Vec<u8> = Vec::new();
    for _ in 0..n {
        let prefix_len = r.read_u64()? as usize;
        let suffix_len = r.read_u64()? as usize;
        let suffix = r.read_bytes(suffix_len)?;
        let mut trecno = prev[..prefix_len.min(prev.len())].to_vec();
        trecno.extend_from_slice(suffix);
        prev = trecno.clone();
        v.push(trecno);
    }
    Ok(v)
}

/// Decodes the gap-coded `(fileno, offset, bytes)` stream written by
/// `write_section_loc`, the same self-contained-group property as
/// `decode_trecno_code` applies here.
fn decode_loc_code(r: &mut Reader, n: u64) -> Result<Vec<(u32, u64, u64)>> {
    let mut v = Vec::with_capacity(n as usize);
    let mut prev: Option<(u32, u64, u64)> = None;
    for _ in 0..n {
        let fileno_gap = r.read_u64()?;
        let (fileno, offset) = if fileno_gap == 0 {
            let (pfileno, poffset, pbytes) = prev
                .ok_or_else(|| StorageError::Fmt("fileno-gap of 0 with no previous location".into()))?;
            (pfileno, poffset + pbytes)
        } else {
            let fileno = prev.map(|(f, _, _)| f).unwrap_or(0) + (fileno_gap - 1) as u32;
            let offset = r.read_u64()?;
            (fileno, offset)
        };
        let bytes = r.read_u64()?;
        prev = Some((fileno, offset, bytes));
        v.push((fileno, offset, bytes));
    }
    Ok(v)
}

#[allow(clippy::type_complexity)]
fn parse_cache_sections(
    bytes: &[u8],
) -> Result<(CacheMask, Vec<(u32, u64, u64, u32)>, Vec<DocRecord>, RepositorySet)> {
    let mut reader = Reader::new(bytes);
    let mut mask = CacheMask::NONE;
    let mut map = Vec::new();
    let mut words: Option<Vec<u32>> = None;
    let mut dwords: Option<Vec<u32>> = None;
    let mut weights: Option<Vec<f64>> = None;
    let mut trecnos: Option<Vec<Vec<u8>>> = None;
    let mut locations: Option<Vec<(u32, u64, u64)>> = None;
    let mut mime_overrides: HashMap<u64, u8> = HashMap::new();
    let mut repos = RepositorySet::new();
    let mut total_count = 0u64;

    loop {
        let tag = reader.read_byte()?;
        if tag == SECTION_END {
            break;
        }
        match tag {
            SECTION_MASK => {
                let bits = reader.read_byte()?;
                mask = CacheMask::from_bits(bits);
            }
            SECTION_AGG => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                total_count = r.read_u64()?;
            }
            SECTION_MAP => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                for _ in 0..n {
                    let fileno = r.read_u32()?;
                    let offset = r.read_u64()?;
                    let first_docno = r.read_u64()?;
                    let count = r.read_u32()?;
                    map.push((fileno, offset, first_docno, count));
                }
            }
            SECTION_WORDS => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                let mut v = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    v.push(r.read_u32()?);
                }
                words = Some(v);
            }
            SECTION_DWORDS => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                let mut v = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    v.push(r.read_u32()?);
                }
                dwords = Some(v);
            }
            SECTION_WEIGHT => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                let mut v = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    v.push(crate::vbyte::decode_float_with_precision(&mut r, 23)?);
                }
                weights = Some(v);
            }
            SECTION_TRECNO => {
                // Group-offset index into TRECNO_CODE; a full reconstruction
                // scan doesn't need random access, so this is only consumed.
                let len = reader.read_u64()? as usize;
                reader.read_bytes(len)?;
            }
            SECTION_TRECNO_CODE => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                trecnos = Some(decode_trecno_code(&mut r, n)?);
            }
            SECTION_LOC => {
                let len = reader.read_u64()? as usize;
                reader.read_bytes(len)?;
            }
            SECTION_LOC_CODE => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                locations = Some(decode_loc_code(&mut r, n)?);
            }
            SECTION_TYPEEX => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                let n = r.read_u64()?;
                for _ in 0..n {
                    let docno = r.read_u64()?;
                    let mime_type = r.read_u64()? as u8;
                    mime_overrides.insert(docno, mime_type);
                }
            }
            SECTION_REPOS_REC => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                repos = RepositorySet::decode_runs(&mut r)?;
            }
            SECTION_REPOS_CHECK => {
                let len = reader.read_u64()? as usize;
                let section_bytes = reader.read_bytes(len)?;
                let mut r = Reader::new(section_bytes);
                repos.decode_checkpoints_into(&mut r)?;
            }
            other => return Err(StorageError::Fmt(format!("unknown cache section tag {other:#04x}"))),
        }
    }

    if mask.contains(CacheMask::WORDS) && words.is_none() {
        return Err(StorageError::Corruption("cache mask claims WORDS but the section is missing".into()));
    }
    if mask.contains(CacheMask::DISTINCT_WORDS) && dwords.is_none() {
        return Err(StorageError::Corruption(
            "cache mask claims DISTINCT_WORDS but the section is missing".into(),
        ));
    }
    if mask.contains(CacheMask::WEIGHT) && weights.is_none() {
        return Err(StorageError::Corruption("cache mask claims WEIGHT but the section is missing".into()));
    }
    if mask.contains(CacheMask::TRECNO) && trecnos.is_none() {
        return Err(StorageError::Corruption("cache mask claims TRECNO but the section is missing".into()));
    }
    if mask.contains(CacheMask::LOCATION) && locations.is_none() {
        return Err(StorageError::Corruption("cache mask claims LOCATION but the section is missing".into()));
    }

    let mut records = Vec::with_capacity(total_count as usize);
    for i in 0..total_count {
        let idx = i as usize;
        let (fileno, offset, rec_bytes) =
            locations.as_ref().map(|v| v[idx]).unwrap_or((0, 0, 0));
        records.push(DocRecord {
            fileno,
            offset,
            bytes: rec_bytes,
            flags: 0,
            words: words.as_ref().map(|v| v[idx]).unwrap_or(0),
            distinct_words: dwords.as_ref().map(|v| v[idx]).unwrap_or(0),
            mime_type: mime_overrides.get(&i).copied().unwrap_or(DEFAULT_MIME_TYPE),
            trecno: trecnos.as_ref().map(|v| v[idx].clone()).unwrap_or_default(),
            weight: weights.as_ref().map(|v| v[idx]).unwrap_or(0.0),
        });
    }

    Ok((mask, map, records, repos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_map(dir: &std::path::Path, mask: CacheMask) -> DocMap {
        let file_set = FileSet::open(dir).unwrap();
        DocMap::new(file_set, 4096, 2, 1 << 30, mask, ChecksumType::default()).unwrap()
    }

    #[test]
    fn add_then_get_round_trips_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::ALL);

        let docno = map
            .add(0, 0, 100, 0, 5, 5, 1.0, b"AP880212-0001", 0)
            .unwrap();
        assert_eq!(docno, 0);
        assert_eq!(map.get_trecno(0).unwrap(), b"AP880212-0001");
        assert_eq!(map.get_words(0).unwrap(), 5);
    }

    #[test]
    fn four_documents_one_source_file_trecno_and_location_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::TRECNO);

        let trecnos = [
            "AP880212-0001",
            "AP880212-0002",
            "AP880212-0003",
            "AP880212-0004",
        ];
        let words = [5u32, 7, 9, 11];
        for (i, trecno) in trecnos.iter().enumerate() {
            map.add(0, (i * 100) as u64, 100, 0, words[i], words[i], 1.0, trecno.as_bytes(), 0)
                .unwrap();
        }

        assert_eq!(map.get_trecno(2).unwrap(), b"AP880212-0003");
        assert_eq!(map.get_location(2).unwrap(), (0, 200, 100, 0, 0));
    }

    #[test]
    fn save_then_load_round_trips_full_cache_mask() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::ALL);
        for i in 0..50u32 {
            let trecno = format!("DOC-{i:05}");
            map.add(0, (i as u64) * 50, 50, 0, 10, 8, 1.5, trecno.as_bytes(), 0)
                .unwrap();
        }
        let root_fileno = map.root_fileno();
        map.save().unwrap();

        let file_set = FileSet::open(dir.path()).unwrap();
        let loaded = DocMap::load(
            file_set,
            4096,
            2,
            1 << 30,
            CacheMask::ALL,
            ChecksumType::default(),
            root_fileno,
        )
        .unwrap();

        assert_eq!(loaded.len(), 50);
        assert_eq!(loaded.get_trecno(10).unwrap(), b"DOC-00010");
        assert_eq!(loaded.get_words(10).unwrap(), 10);
        assert_eq!(loaded.get_distinct_words(10).unwrap(), 8);
        assert!((loaded.get_weight(10).unwrap() - 1.5).abs() < 0.1);
        assert_eq!(loaded.get_bytes(10).unwrap(), 50);
        assert_eq!(loaded.get_location(10).unwrap().0, 0);
    }

    #[test]
    fn weight_round_trips_within_five_percent() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::WEIGHT | CacheMask::LOCATION);
        map.add(0, 0, 10, 0, 2, 2, 3.33, b"x", 0).unwrap();
        let root_fileno = map.root_fileno();
        map.save().unwrap();

        let file_set = FileSet::open(dir.path()).unwrap();
        let loaded = DocMap::load(
            file_set,
            4096,
            2,
            1 << 30,
            CacheMask::WEIGHT | CacheMask::LOCATION,
            ChecksumType::default(),
            root_fileno,
        )
        .unwrap();
        let relative_error = (loaded.get_weight(0).unwrap() - 3.33).abs() / 3.33;
        assert!(relative_error < 0.05);
        assert_eq!(loaded.get_bytes(0).unwrap(), 10);
    }

    /// §4.3/§8: a partial mask that doesn't cover every field still
    /// round-trips correctly and still takes the skip-rescan path —
    /// exactness of the match is what matters, not whether it's `ALL`.
    #[test]
    fn partial_mask_without_trecno_or_distinct_words_skips_rescan_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mask = CacheMask::LOCATION | CacheMask::WORDS | CacheMask::WEIGHT;
        let mut map = new_map(dir.path(), mask);
        for i in 0..10u32 {
            map.add(0, (i as u64) * 20, 20, 0, 4, 3, 2.0 + i as f64, b"ignored", 0)
                .unwrap();
        }
        let root_fileno = map.root_fileno();
        map.save().unwrap();

        let file_set = FileSet::open(dir.path()).unwrap();
        let loaded =
            DocMap::load(file_set, 4096, 2, 1 << 30, mask, ChecksumType::default(), root_fileno).unwrap();

        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded.get_bytes(5).unwrap(), 20);
        assert_eq!(loaded.get_location(5).unwrap().0, 0);
        assert_eq!(loaded.get_words(5).unwrap(), 4);
        assert!((loaded.get_weight(5).unwrap() - 7.0).abs() < 0.5);
        // DISTINCT_WORDS and TRECNO weren't in the mask, so they default.
        assert_eq!(loaded.get_distinct_words(5).unwrap(), 0);
    }

    #[test]
    fn repository_set_survives_a_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::NONE);
        for i in 0..5u32 {
            map.add(7, (i as u64) * 10, 10, 0, 1, 1, 1.0, b"x", 0).unwrap();
        }
        let root_fileno = map.root_fileno();
        assert_eq!(map.fileno_for_docno(3).unwrap(), 7);
        map.save().unwrap();

        let file_set = FileSet::open(dir.path()).unwrap();
        let loaded = DocMap::load(
            file_set,
            4096,
            2,
            1 << 30,
            CacheMask::NONE,
            ChecksumType::default(),
            root_fileno,
        )
        .unwrap();
        assert_eq!(loaded.fileno_for_docno(3).unwrap(), 7);
    }

    #[test]
    fn bytes_invariant_is_enforced_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::NONE);
        // bytes + 1 >= 2*words must hold; bytes=1, words=5 violates it.
        assert!(map.add(0, 0, 1, 0, 5, 5, 1.0, b"x", 0).is_err());
    }

    #[test]
    fn words_must_be_at_least_distinct_words() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = new_map(dir.path(), CacheMask::NONE);
        assert!(map.add(0, 0, 100, 0, 2, 5, 1.0, b"x", 0).is_err());
    }
}
