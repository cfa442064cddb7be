//! Bucket: a page-sized slotted container of (term, payload) entries.
//!
//! Every operation is a total function over a caller-supplied image byte
//! slice — no I/O, no allocation beyond the image itself and small
//! scratch vectors used while rebuilding it. The layout is the classic
//! slotted page: a fixed header, a sorted directory of 16-bit entry
//! offsets growing forward from the header, and entry bytes growing
//! backward from the end of the page. The two meet in the middle; the gap
//! between them is free space.
//!
//! Rather than mutate entry bytes in place, every mutating operation
//! decodes the full entry list, applies the change, and re-serialises the
//! page from scratch. Pages top out at a few hundred entries, so this
//! keeps the logic easy to get right without sacrificing anything the
//! external contract promises.

use crate::error::{Fit, Result, StorageError};
use crate::page::{PageLocation, PageTag};
use crate::vbyte;

pub const HEADER_SIZE: usize = 15;
const SLOT_SIZE: usize = 2;

/// Closed set of on-page layouts. `Leaf` entries carry an arbitrary-length
/// payload; `Node` entries carry a fixed 12-byte child location, used by
/// B+tree internal pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Leaf,
    Node,
}

pub const NODE_PAYLOAD_SIZE: usize = 12;

#[derive(Debug, Clone)]
struct Entry {
    term: Vec<u8>,
    payload: Vec<u8>,
}

/// Parsed view of a bucket image, decoded once and re-serialised on every
/// mutation. `tag` and the sibling location live in the header; `entries`
/// are always kept sorted by term.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub tag: PageTag,
    pub sibling: PageLocation,
    entries: Vec<Entry>,
    strategy: Strategy,
    page_size: usize,
}

impl Bucket {
    /// Formats a fresh, empty bucket of the given strategy.
    pub fn new(page_size: usize, strategy: Strategy, tag: PageTag) -> Self {
        Self {
            tag,
            sibling: PageLocation::NULL,
            entries: Vec::new(),
            strategy,
            page_size,
        }
    }

    pub fn decode(image: &[u8], strategy: Strategy) -> Result<Self> {
        if image.len() < HEADER_SIZE {
            return Err(StorageError::Fmt("bucket image shorter than header".into()));
        }
        let tag = PageTag::from_byte(image[0])?;
        let sibling_fileno = u32::from_le_bytes(image[1..5].try_into().unwrap());
        let sibling_offset = u64::from_le_bytes(image[5..13].try_into().unwrap());
        let entry_count = u16::from_le_bytes(image[13..15].try_into().unwrap()) as usize;

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let slot_pos = HEADER_SIZE + i * SLOT_SIZE;
            let offset = u16::from_le_bytes(
                image
                    .get(slot_pos..slot_pos + 2)
                    .ok_or_else(|| StorageError::Fmt("truncated slot directory".into()))?
                    .try_into()
                    .unwrap(),
            ) as usize;
            entries.push(decode_entry(image, offset, strategy)?);
        }

        Ok(Self {
            tag,
            sibling: if sibling_fileno == u32::MAX {
                PageLocation::NULL
            } else {
                PageLocation::new(sibling_fileno, sibling_offset)
            },
            entries,
            strategy,
            page_size: image.len(),
        })
    }

    pub fn encode(&self, image: &mut [u8]) -> Result<()> {
        if image.len() != self.page_size {
            return Err(StorageError::arg("image size does not match bucket page size"));
        }
        image.fill(0);
        image[0] = self.tag.as_byte();
        let (fileno, offset) = if self.sibling.is_null() {
            (u32::MAX, u64::MAX)
        } else {
            (self.sibling.fileno, self.sibling.offset)
        };
        image[1..5].copy_from_slice(&fileno.to_le_bytes());
        image[5..13].copy_from_slice(&offset.to_le_bytes());
        image[13..15].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());

        let mut tail = self.page_size;
        for (i, entry) in self.entries.iter().enumerate() {
            let bytes = serialize_entry(entry, self.strategy);
            if tail < bytes.len() {
                return Err(StorageError::Bufsize("bucket image too small to encode".into()));
            }
            tail -= bytes.len();
            image[tail..tail + bytes.len()].copy_from_slice(&bytes);
            let slot_pos = HEADER_SIZE + i * SLOT_SIZE;
            image[slot_pos..slot_pos + 2].copy_from_slice(&(tail as u16).to_le_bytes());
        }

        let free_start = HEADER_SIZE + self.entries.len() * SLOT_SIZE;
        if free_start > tail {
            return Err(StorageError::Bufsize("bucket entries overlap slot directory".into()));
        }

        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn entries(&self) -> usize {
        self.entries.len()
    }

    pub fn term_at(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(|e| e.term.as_slice())
    }

    pub fn payload_at(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(|e| e.payload.as_slice())
    }

    pub fn sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].term < w[1].term)
    }

    /// Bytes actually used for header, slot directory, and entry data.
    pub fn utilised(&self) -> usize {
        self.overhead() + self.entries.iter().map(|e| serialize_entry(e, self.strategy).len()).sum::<usize>()
    }

    pub fn overhead(&self) -> usize {
        HEADER_SIZE + self.entries.len() * SLOT_SIZE
    }

    pub fn unused(&self) -> usize {
        self.page_size - self.utilised()
    }

    fn binary_search(&self, term: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.term.as_slice().cmp(term))
    }

    pub fn find(&self, term: &[u8]) -> Option<(usize, &[u8])> {
        self.binary_search(term)
            .ok()
            .map(|idx| (idx, self.entries[idx].payload.as_slice()))
    }

    /// Lexicographically-nearest predecessor: the greatest entry whose
    /// term is ≤ `term`. Used by the B+tree's internal-page descent.
    pub fn search(&self, term: &[u8]) -> Option<(usize, &[u8])> {
        match self.binary_search(term) {
            Ok(idx) => Some((idx, self.entries[idx].payload.as_slice())),
            Err(0) => None,
            Err(idx) => Some((idx - 1, self.entries[idx - 1].payload.as_slice())),
        }
    }

    fn entry_fits_empty(&self, term: &[u8], payload_len: usize) -> bool {
        let entry_len = encoded_entry_len(term.len(), payload_len, self.strategy);
        HEADER_SIZE + SLOT_SIZE + entry_len <= self.page_size
    }

    fn current_free_space(&self) -> usize {
        self.page_size - self.utilised()
    }

    /// Reserves space for a new (term, payload) entry, keeping the
    /// directory sorted. Returns the index the new entry landed at.
    pub fn alloc(&mut self, term: &[u8], payload_len: usize) -> Fit<usize> {
        if self.strategy == Strategy::Node && payload_len != NODE_PAYLOAD_SIZE {
            return Fit::TooBig;
        }
        if !self.entry_fits_empty(term, payload_len) {
            return Fit::TooBig;
        }
        let entry_len = encoded_entry_len(term.len(), payload_len, self.strategy);
        if entry_len + SLOT_SIZE > self.current_free_space() {
            return Fit::DoesNotFit;
        }

        let idx = match self.binary_search(term) {
            Ok(idx) => idx, // overwritten below
            Err(idx) => idx,
        };
        let entry = Entry {
            term: term.to_vec(),
            payload: vec![0u8; payload_len],
        };
        if self.binary_search(term).is_ok() {
            self.entries[idx] = entry;
        } else {
            self.entries.insert(idx, entry);
        }
        Fit::Ok(idx)
    }

    /// Appends without searching; caller guarantees `term` sorts after
    /// every existing entry.
    pub fn append(&mut self, term: &[u8], payload: &[u8]) -> Fit<usize> {
        if self.strategy == Strategy::Node && payload.len() != NODE_PAYLOAD_SIZE {
            return Fit::TooBig;
        }
        if let Some(last) = self.entries.last() {
            if term <= last.term.as_slice() {
                return Fit::TooBig;
            }
        }
        if !self.entry_fits_empty(term, payload.len()) {
            return Fit::TooBig;
        }
        let entry_len = encoded_entry_len(term.len(), payload.len(), self.strategy);
        if entry_len + SLOT_SIZE > self.current_free_space() {
            return Fit::DoesNotFit;
        }
        self.entries.push(Entry {
            term: term.to_vec(),
            payload: payload.to_vec(),
        });
        Fit::Ok(self.entries.len() - 1)
    }

    pub fn set_payload(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| StorageError::arg("index out of range"))?;
        entry.payload = payload.to_vec();
        Ok(())
    }

    pub fn set_term(&mut self, index: usize, term: &[u8]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| StorageError::arg("index out of range"))?;
        entry.term = term.to_vec();
        Ok(())
    }

    /// Grows or shrinks the payload at `index` in place, as long as the
    /// result still fits the page.
    pub fn realloc_at(&mut self, index: usize, new_size: usize) -> Fit<()> {
        let Some(entry) = self.entries.get(index) else {
            return Fit::TooBig;
        };
        if self.strategy == Strategy::Node && new_size != NODE_PAYLOAD_SIZE {
            return Fit::TooBig;
        }
        if !self.entry_fits_empty(&entry.term, new_size) {
            return Fit::TooBig;
        }
        let old_len = encoded_entry_len(entry.term.len(), entry.payload.len(), self.strategy);
        let new_len = encoded_entry_len(entry.term.len(), new_size, self.strategy);
        let delta = new_len as isize - old_len as isize;
        if delta > 0 && (delta as usize) > self.current_free_space() {
            return Fit::DoesNotFit;
        }
        self.entries[index].payload.resize(new_size, 0);
        Fit::Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        if index >= self.entries.len() {
            return Err(StorageError::arg("index out of range"));
        }
        self.entries.remove(index);
        Ok(())
    }

    pub fn remove(&mut self, term: &[u8]) -> bool {
        if let Ok(idx) = self.binary_search(term) {
            self.entries.remove(idx);
            true
        } else {
            false
        }
    }

    /// Cursor-driven in-order iteration. `cursor` is the next index to
    /// yield; returns the entry and the cursor's next value.
    pub fn next_term(&self, cursor: usize) -> Option<(usize, &[u8], &[u8])> {
        self.entries
            .get(cursor)
            .map(|e| (cursor + 1, e.term.as_slice(), e.payload.as_slice()))
    }

    /// Splits entries `[split_at, len)` off into a freshly formatted
    /// right-hand bucket; `self` retains `[0, split_at)`.
    pub fn split(&mut self, split_at: usize) -> Bucket {
        let mut right = Bucket::new(self.page_size, self.strategy, self.tag);
        right.sibling = self.sibling;
        right.entries = self.entries.split_off(split_at);
        right
    }

    /// Chooses a split index near the balanced midpoint such that
    /// inserting `(new_term, additional_bytes)` fits on its destination
    /// side, preferring the shortest discriminating separator within
    /// `range_hint` bytes of the midpoint.
    pub fn find_split_entry(
        &self,
        range_hint: usize,
        new_term: &[u8],
        additional_bytes: usize,
    ) -> (usize, bool) {
        let n = self.entries.len();
        debug_assert!(n >= 2, "cannot split a bucket with fewer than 2 entries");

        let sizes: Vec<usize> = self
            .entries
            .iter()
            .map(|e| encoded_entry_len(e.term.len(), e.payload.len(), self.strategy) + SLOT_SIZE)
            .collect();
        let total: usize = sizes.iter().sum();
        let target = total / 2;

        let mut best_idx = 1;
        let mut best_diff = usize::MAX;
        let mut running = 0usize;
        for (i, size) in sizes.iter().enumerate() {
            running += size;
            if i == 0 || i == n - 1 {
                continue;
            }
            let diff = running.abs_diff(target);
            if diff <= range_hint
                && (diff < best_diff
                    || (diff == best_diff
                        && self.entries[i].term.len() < self.entries[best_idx].term.len()))
            {
                best_diff = diff;
                best_idx = i;
            }
        }

        let insert_goes_left = new_term < self.entries[best_idx].term.as_slice();
        let _ = additional_bytes;
        (best_idx, insert_goes_left)
    }

    pub fn merge(&mut self, other: &Bucket) -> Result<()> {
        if self.strategy != other.strategy {
            return Err(StorageError::arg("cannot merge buckets of different strategies"));
        }
        for entry in &other.entries {
            if (self.utilised()
                + encoded_entry_len(entry.term.len(), entry.payload.len(), self.strategy)
                + SLOT_SIZE)
                > self.page_size
            {
                return Err(StorageError::Bufsize("merge does not fit destination bucket".into()));
            }
            self.entries.push(entry.clone());
        }
        self.entries.sort_by(|a, b| a.term.cmp(&b.term));
        Ok(())
    }

    pub fn resize(&mut self, new_page_size: usize) {
        self.page_size = new_page_size;
    }
}

fn encoded_entry_len(term_len: usize, payload_len: usize, strategy: Strategy) -> usize {
    let mut tmp = Vec::new();
    vbyte::encode_u64(term_len as u64, &mut tmp);
    let term_header = tmp.len();
    match strategy {
        Strategy::Leaf => {
            let mut tmp2 = Vec::new();
            vbyte::encode_u64(payload_len as u64, &mut tmp2);
            term_header + term_len + tmp2.len() + payload_len
        }
        Strategy::Node => term_header + term_len + NODE_PAYLOAD_SIZE,
    }
}

fn serialize_entry(entry: &Entry, strategy: Strategy) -> Vec<u8> {
    let mut out = Vec::new();
    vbyte::encode_u64(entry.term.len() as u64, &mut out);
    out.extend_from_slice(&entry.term);
    match strategy {
        Strategy::Leaf => {
            vbyte::encode_u64(entry.payload.len() as u64, &mut out);
            out.extend_from_slice(&entry.payload);
        }
        Strategy::Node => {
            debug_assert_eq!(entry.payload.len(), NODE_PAYLOAD_SIZE);
            out.extend_from_slice(&entry.payload);
        }
    }
    out
}

fn decode_entry(image: &[u8], offset: usize, strategy: Strategy) -> Result<Entry> {
    let mut reader = vbyte::Reader::new(&image[offset..]);
    let term_len = reader.read_u64()? as usize;
    let term = reader.read_bytes(term_len)?.to_vec();
    let payload = match strategy {
        Strategy::Leaf => {
            let payload_len = reader.read_u64()? as usize;
            reader.read_bytes(payload_len)?.to_vec()
        }
        Strategy::Node => reader.read_bytes(NODE_PAYLOAD_SIZE)?.to_vec(),
    };
    Ok(Entry { term, payload })
}

/// Packs a child [`PageLocation`] into the fixed 12-byte payload the
/// `Node` strategy expects.
pub fn encode_child(location: PageLocation) -> [u8; NODE_PAYLOAD_SIZE] {
    let mut out = [0u8; NODE_PAYLOAD_SIZE];
    out[0..4].copy_from_slice(&location.fileno.to_le_bytes());
    out[4..12].copy_from_slice(&location.offset.to_le_bytes());
    out
}

pub fn decode_child(bytes: &[u8]) -> Result<PageLocation> {
    if bytes.len() != NODE_PAYLOAD_SIZE {
        return Err(StorageError::Fmt("child payload has wrong length".into()));
    }
    let fileno = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let offset = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    Ok(PageLocation::new(fileno, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_leaf(page_size: usize) -> Bucket {
        Bucket::new(page_size, Strategy::Leaf, PageTag::BtreeLeaf)
    }

    #[test]
    fn alloc_then_find_round_trips() {
        let mut bucket = fresh_leaf(4096);
        bucket.alloc(b"a", 1).ok().unwrap();
        bucket.set_payload(0, &[0x01]).unwrap();
        bucket.alloc(b"b", 1).ok().unwrap();
        bucket.set_payload(1, &[0x02]).unwrap();
        bucket.alloc(b"c", 1).ok().unwrap();
        bucket.set_payload(2, &[0x03]).unwrap();

        assert_eq!(bucket.entries(), 3);
        assert!(bucket.sorted());
        assert_eq!(bucket.find(b"b").unwrap().1, &[0x02]);
        assert!(bucket.find(b"z").is_none());
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut bucket = fresh_leaf(4096);
        bucket.alloc(b"alpha", 3).ok().unwrap();
        bucket.set_payload(0, b"xyz").unwrap();
        bucket.alloc(b"beta", 2).ok().unwrap();
        bucket.set_payload(1, b"ab").unwrap();

        let mut image = vec![0u8; 4096];
        bucket.encode(&mut image).unwrap();

        let decoded = Bucket::decode(&image, Strategy::Leaf).unwrap();
        assert_eq!(decoded.entries(), 2);
        assert_eq!(decoded.find(b"alpha").unwrap().1, b"xyz");
        assert_eq!(decoded.find(b"beta").unwrap().1, b"ab");
    }

    #[test]
    fn alloc_rejects_oversized_entry_as_toobig() {
        let mut bucket = fresh_leaf(64);
        let huge_payload = vec![0u8; 1000];
        let result = bucket.alloc(b"term", huge_payload.len());
        assert!(result.is_too_big());
    }

    #[test]
    fn alloc_returns_does_not_fit_when_bucket_is_full_but_payload_would_fit_empty() {
        let mut bucket = fresh_leaf(64);
        // Fill the bucket until an additional entry no longer fits.
        let mut i = 0u32;
        loop {
            let term = format!("t{i:03}");
            match bucket.alloc(term.as_bytes(), 4) {
                Fit::Ok(idx) => {
                    bucket.set_payload(idx, &[0, 0, 0, 0]).unwrap();
                    i += 1;
                }
                Fit::DoesNotFit => break,
                Fit::TooBig => panic!("unexpectedly too big"),
            }
        }
        assert!(i > 0);
    }

    #[test]
    fn split_distributes_entries_and_keeps_both_sides_sorted() {
        let mut bucket = fresh_leaf(4096);
        for i in 0..20u32 {
            let term = format!("term{i:03}");
            let idx = bucket.alloc(term.as_bytes(), 4).ok().unwrap();
            bucket.set_payload(idx, &i.to_le_bytes()).unwrap();
        }
        let right = bucket.split(10);
        assert_eq!(bucket.entries(), 10);
        assert_eq!(right.entries(), 10);
        assert!(bucket.sorted());
        assert!(right.sorted());
        assert!(bucket.term_at(9).unwrap() < right.term_at(0).unwrap());
    }

    #[test]
    fn remove_then_find_returns_none() {
        let mut bucket = fresh_leaf(4096);
        bucket.alloc(b"x", 1).ok().unwrap();
        assert!(bucket.remove(b"x"));
        assert!(bucket.find(b"x").is_none());
        assert!(!bucket.remove(b"x"));
    }

    #[test]
    fn realloc_at_grows_payload_in_place() {
        let mut bucket = fresh_leaf(4096);
        bucket.alloc(b"k", 2).ok().unwrap();
        bucket.set_payload(0, &[1, 2]).unwrap();
        assert!(bucket.realloc_at(0, 10).ok().is_some());
        assert_eq!(bucket.payload_at(0).unwrap().len(), 10);
    }

    #[test]
    fn node_strategy_enforces_fixed_payload_size() {
        let mut bucket = Bucket::new(4096, Strategy::Node, PageTag::BtreeInternal);
        let loc = PageLocation::new(3, 128);
        let payload = encode_child(loc);
        let idx = bucket.alloc(b"m", payload.len()).ok().unwrap();
        bucket.set_payload(idx, &payload).unwrap();
        assert!(bucket.alloc(b"n", 4).is_too_big());

        let decoded = decode_child(bucket.payload_at(idx).unwrap()).unwrap();
        assert_eq!(decoded, loc);
    }

    #[test]
    fn find_split_entry_prefers_balanced_midpoint() {
        let mut bucket = fresh_leaf(4096);
        for i in 0..10u32 {
            let term = format!("k{i}");
            bucket.alloc(term.as_bytes(), 4).ok().unwrap();
        }
        let (split_at, _) = bucket.find_split_entry(3, b"k5x", 10);
        assert!(split_at > 0 && split_at < bucket.entries());
    }
}
