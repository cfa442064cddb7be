//! Repository Set: a compressed docno → source-file-number mapping.
//!
//! Represented as alternating runs of two record kinds: a *many-docs*
//! run, where a single fileno spans a contiguous range of docnos (the
//! common case for a compressed source file holding many documents), and
//! a *one-doc* run, where each docno in the range gets its own
//! sequentially numbered file. Runs are stored in docno order, so a
//! lookup is a binary search over run start docnos followed by O(1) work
//! within the run.

use crate::error::{Result, StorageError};
use crate::vbyte::{self, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    /// `[start_docno, start_docno + count)` all live in `fileno`.
    ManyDocs { start_docno: u64, count: u64, fileno: u32 },
    /// `[start_docno, start_docno + count)` map to sequential filenos
    /// starting at `start_fileno`.
    OneDocPerFile { start_docno: u64, count: u64, start_fileno: u32 },
}

impl Run {
    fn start_docno(&self) -> u64 {
        match self {
            Run::ManyDocs { start_docno, .. } => *start_docno,
            Run::OneDocPerFile { start_docno, .. } => *start_docno,
        }
    }

    fn count(&self) -> u64 {
        match self {
            Run::ManyDocs { count, .. } => *count,
            Run::OneDocPerFile { count, .. } => *count,
        }
    }

    fn fileno_for(&self, docno: u64) -> u32 {
        match self {
            Run::ManyDocs { fileno, .. } => *fileno,
            Run::OneDocPerFile { start_docno, start_fileno, .. } => {
                *start_fileno + (docno - start_docno) as u32
            }
        }
    }
}

/// One compression checkpoint recorded for the source file a run of
/// many-docs entries points into: the byte offset within that source at
/// which decompression may restart without replaying from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub fileno: u32,
    pub docno: u64,
    pub compressed_offset: u64,
}

#[derive(Default)]
pub struct RepositorySet {
    runs: Vec<Run>,
    checkpoints: Vec<Checkpoint>,
    next_docno: u64,
}

impl RepositorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the next `count` docnos all live in `fileno`,
    /// extending the current run if it already targets the same fileno.
    pub fn add_many_docs(&mut self, fileno: u32, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(Run::ManyDocs { fileno: last_fileno, count: last_count, .. }) = self.runs.last_mut() {
            if *last_fileno == fileno {
                *last_count += count;
                self.next_docno += count;
                return;
            }
        }
        self.runs.push(Run::ManyDocs {
            start_docno: self.next_docno,
            count,
            fileno,
        });
        self.next_docno += count;
    }

    /// Records that the next `count` docnos each get their own
    /// sequentially numbered file, starting at `start_fileno`.
    pub fn add_one_doc_per_file(&mut self, start_fileno: u32, count: u64) {
        if count == 0 {
            return;
        }
        self.runs.push(Run::OneDocPerFile {
            start_docno: self.next_docno,
            count,
            start_fileno,
        });
        self.next_docno += count;
    }

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
    }

    pub fn len(&self) -> u64 {
        self.next_docno
    }

    pub fn is_empty(&self) -> bool {
        self.next_docno == 0
    }

    pub fn has_checkpoints(&self) -> bool {
        !self.checkpoints.is_empty()
    }

    /// O(log runs) lookup of the source file backing `docno`.
    pub fn fileno_for_docno(&self, docno: u64) -> Result<u32> {
        if docno >= self.next_docno {
            return Err(StorageError::arg(format!("docno {docno} out of range")));
        }
        let run_idx = match self.runs.binary_search_by(|run| run.start_docno().cmp(&docno)) {
            Ok(idx) => idx,
            Err(0) => return Err(StorageError::arg("docno precedes the first run")),
            Err(idx) => idx - 1,
        };
        let run = &self.runs[run_idx];
        debug_assert!(docno >= run.start_docno() && docno < run.start_docno() + run.count());
        Ok(run.fileno_for(docno))
    }

    /// The most recent checkpoint at or before `docno` for its source
    /// file, used to resume decompression mid-stream.
    pub fn checkpoint_before(&self, fileno: u32, docno: u64) -> Option<Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|c| c.fileno == fileno && c.docno <= docno)
            .max_by_key(|c| c.docno)
            .copied()
    }

    /// Serializes the run list. A run's start docno is implied by the sum
    /// of every prior run's count, so only the kind, count, and fileno are
    /// written.
    pub fn encode_runs(&self, out: &mut Vec<u8>) {
        vbyte::encode_u64(self.runs.len() as u64, out);
        for run in &self.runs {
            match *run {
                Run::ManyDocs { count, fileno, .. } => {
                    out.push(0);
                    vbyte::encode_u64(count, out);
                    vbyte::encode_u64(fileno as u64, out);
                }
                Run::OneDocPerFile { count, start_fileno, .. } => {
                    out.push(1);
                    vbyte::encode_u64(count, out);
                    vbyte::encode_u64(start_fileno as u64, out);
                }
            }
        }
    }

    pub fn decode_runs(reader: &mut Reader) -> Result<Self> {
        let n = reader.read_u64()?;
        let mut set = Self::default();
        for _ in 0..n {
            let kind = reader.read_byte()?;
            let count = reader.read_u64()?;
            let fileno_or_start = reader.read_u32()?;
            match kind {
                0 => set.add_many_docs(fileno_or_start, count),
                1 => set.add_one_doc_per_file(fileno_or_start, count),
                other => return Err(StorageError::Fmt(format!("unknown repository run kind {other}"))),
            }
        }
        Ok(set)
    }

    pub fn encode_checkpoints(&self, out: &mut Vec<u8>) {
        vbyte::encode_u64(self.checkpoints.len() as u64, out);
        for c in &self.checkpoints {
            vbyte::encode_u64(c.fileno as u64, out);
            vbyte::encode_u64(c.docno, out);
            vbyte::encode_u64(c.compressed_offset, out);
        }
    }

    pub fn decode_checkpoints_into(&mut self, reader: &mut Reader) -> Result<()> {
        let n = reader.read_u64()?;
        for _ in 0..n {
            let fileno = reader.read_u32()?;
            let docno = reader.read_u64()?;
            let compressed_offset = reader.read_u64()?;
            self.checkpoints.push(Checkpoint { fileno, docno, compressed_offset });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn many_docs_run_maps_every_docno_to_the_same_file() {
        let mut set = RepositorySet::new();
        set.add_many_docs(7, 100);
        for docno in [0, 50, 99] {
            assert_eq!(set.fileno_for_docno(docno).unwrap(), 7);
        }
        assert!(set.fileno_for_docno(100).is_err());
    }

    #[test]
    fn one_doc_per_file_run_assigns_sequential_filenos() {
        let mut set = RepositorySet::new();
        set.add_one_doc_per_file(10, 5);
        assert_eq!(set.fileno_for_docno(0).unwrap(), 10);
        assert_eq!(set.fileno_for_docno(4).unwrap(), 14);
    }

    #[test]
    fn alternating_runs_resolve_correctly() {
        let mut set = RepositorySet::new();
        set.add_many_docs(1, 10); // docnos 0..10 -> file 1
        set.add_one_doc_per_file(100, 3); // docnos 10..13 -> files 100,101,102
        set.add_many_docs(2, 5); // docnos 13..18 -> file 2

        assert_eq!(set.fileno_for_docno(5).unwrap(), 1);
        assert_eq!(set.fileno_for_docno(11).unwrap(), 101);
        assert_eq!(set.fileno_for_docno(17).unwrap(), 2);
        assert_eq!(set.len(), 18);
    }

    #[test]
    fn runs_and_checkpoints_round_trip_through_encoding() {
        let mut set = RepositorySet::new();
        set.add_many_docs(1, 10);
        set.add_one_doc_per_file(100, 3);
        set.add_many_docs(2, 5);
        set.add_checkpoint(Checkpoint { fileno: 1, docno: 0, compressed_offset: 0 });
        set.add_checkpoint(Checkpoint { fileno: 2, docno: 13, compressed_offset: 4096 });

        let mut runs_bytes = Vec::new();
        set.encode_runs(&mut runs_bytes);
        let mut checkpoints_bytes = Vec::new();
        set.encode_checkpoints(&mut checkpoints_bytes);

        let mut reader = Reader::new(&runs_bytes);
        let mut decoded = RepositorySet::decode_runs(&mut reader).unwrap();
        let mut checkpoint_reader = Reader::new(&checkpoints_bytes);
        decoded.decode_checkpoints_into(&mut checkpoint_reader).unwrap();

        assert_eq!(decoded.len(), set.len());
        for docno in [0, 5, 11, 17] {
            assert_eq!(decoded.fileno_for_docno(docno).unwrap(), set.fileno_for_docno(docno).unwrap());
        }
        let cp = decoded.checkpoint_before(2, 13).unwrap();
        assert_eq!(cp.compressed_offset, 4096);
    }

    #[test]
    fn checkpoint_before_finds_the_latest_eligible_checkpoint() {
        let mut set = RepositorySet::new();
        set.add_many_docs(1, 1000);
        set.add_checkpoint(Checkpoint { fileno: 1, docno: 0, compressed_offset: 0 });
        set.add_checkpoint(Checkpoint { fileno: 1, docno: 500, compressed_offset: 4096 });

        let cp = set.checkpoint_before(1, 700).unwrap();
        assert_eq!(cp.docno, 500);
        assert_eq!(cp.compressed_offset, 4096);
    }
}
