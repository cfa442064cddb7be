//! File Set: numbered, type-tagged byte streams with reference-counted
//! handles and advisory locking.
//!
//! Every store (vocabulary, document map, impact lists) addresses its
//! pages as `(fileno, offset)` pairs rather than raw paths. The file set
//! is what turns a fileno into bytes: it owns the directory layout,
//! assigns filenos per type tag, and hands out `FileHandle`s that keep a
//! file open exactly as long as something references it. A handle holds a
//! shared (read) or exclusive (write) `flock` for as long as it is open,
//! so a reader in a separate process can safely open a file that no
//! writer currently holds.

use crate::error::{Result, StorageError};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Distinguishes the families of files a store creates, so filenos can be
/// assigned independently per type and a listing of the directory can
/// tell at a glance what each file is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Vocab,
    Docmap,
    Impact,
}

impl FileType {
    fn extension(self) -> &'static str {
        match self {
            FileType::Vocab => "voc",
            FileType::Docmap => "dm",
            FileType::Impact => "imp",
        }
    }
}

/// Whether a pinned handle intends to read or write. Shared locks may
/// overlap; an exclusive lock excludes every other handle on the same
/// file, including other readers, matching the "no writer holds a lock
/// on a file that's safe to reopen" external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Exclusive,
}

struct OpenFile {
    file: Arc<File>,
    ref_count: AtomicUsize,
}

/// Owns a base directory and hands out handles to the numbered files
/// within it. Cheap to clone; the underlying registry is shared.
#[derive(Clone)]
pub struct FileSet {
    inner: Arc<FileSetInner>,
}

struct FileSetInner {
    base_dir: PathBuf,
    open: RwLock<HashMap<PathBuf, Arc<OpenFile>>>,
    next_fileno: RwLock<HashMap<FileType, u32>>,
}

impl FileSet {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let mut next_fileno = HashMap::new();

        for file_type in [FileType::Vocab, FileType::Docmap, FileType::Impact] {
            let highest = Self::scan_highest_fileno(&base_dir, file_type)?;
            next_fileno.insert(file_type, highest + 1);
        }

        Ok(Self {
            inner: Arc::new(FileSetInner {
                base_dir,
                open: RwLock::new(HashMap::new()),
                next_fileno: RwLock::new(next_fileno),
            }),
        })
    }

    fn scan_highest_fileno(base_dir: &Path, file_type: FileType) -> Result<u32> {
        let ext = file_type.extension();
        let mut highest = 0u32;
        if !base_dir.exists() {
            return Ok(highest);
        }
        for entry in std::fs::read_dir(base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(&format!(".{ext}")) {
                if let Ok(n) = stem.parse::<u32>() {
                    highest = highest.max(n);
                }
            }
        }
        Ok(highest)
    }

    fn path_for(&self, file_type: FileType, fileno: u32) -> PathBuf {
        self.inner
            .base_dir
            .join(format!("{fileno}.{}", file_type.extension()))
    }

    /// Allocates a fresh fileno for `file_type` and creates the backing
    /// file. Does not pin it; call [`FileSet::pin`] to get a handle.
    pub fn create(&self, file_type: FileType) -> Result<u32> {
        let mut next = self.inner.next_fileno.write().map_err(lock_poisoned)?;
        let fileno = *next.get(&file_type).unwrap_or(&1);
        let path = self.path_for(file_type, fileno);
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        next.insert(file_type, fileno + 1);
        Ok(fileno)
    }

    /// Opens (or reuses an already-open) handle to `fileno`, taking an
    /// advisory lock matching `mode`. The handle is released, and the
    /// lock dropped, when the returned [`FileHandle`] is dropped.
    pub fn pin(&self, file_type: FileType, fileno: u32, mode: Mode) -> Result<FileHandle> {
        let path = self.path_for(file_type, fileno);
        let mut open = self.inner.open.write().map_err(lock_poisoned)?;

        let open_file = if let Some(existing) = open.get(&path) {
            existing.ref_count.fetch_add(1, Ordering::SeqCst);
            existing.clone()
        } else {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            flock(&file, mode)?;
            let open_file = Arc::new(OpenFile {
                file: Arc::new(file),
                ref_count: AtomicUsize::new(1),
            });
            open.insert(path.clone(), open_file.clone());
            open_file
        };

        Ok(FileHandle {
            file: open_file.file.clone(),
            path,
            open_file,
            set: self.clone(),
        })
    }

    /// Atomically renames `new_fileno` over `old_fileno`, the commit point
    /// for a rebuild that wrote its replacement into side files first.
    /// Callers must not hold a pinned handle to either file.
    pub fn replace(&self, file_type: FileType, old_fileno: u32, new_fileno: u32) -> Result<()> {
        let old_path = self.path_for(file_type, old_fileno);
        let new_path = self.path_for(file_type, new_fileno);
        std::fs::rename(&new_path, &old_path)?;
        Ok(())
    }

    fn unpin(&self, path: &Path, open_file: &Arc<OpenFile>) {
        if open_file.ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Ok(mut open) = self.inner.open.write() {
                open.remove(path);
            }
        }
    }
}

fn lock_poisoned<T>(_: std::sync::PoisonError<T>) -> StorageError {
    StorageError::Mem("file set registry lock poisoned".into())
}

#[cfg(unix)]
fn flock(file: &File, mode: Mode) -> Result<()> {
    let op = match mode {
        Mode::Shared => libc::LOCK_SH,
        Mode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(StorageError::Eagain);
        }
        return Err(StorageError::Io(err));
    }
    Ok(())
}

/// A pinned, positioned handle to one numbered file. Transient: callers
/// are not expected to keep one alive across a suspension point any
/// longer than the read or write they're performing.
pub struct FileHandle {
    file: Arc<File>,
    path: PathBuf,
    open_file: Arc<OpenFile>,
    set: FileSet,
}

impl FileHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.as_ref();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.as_ref();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.set.unpin(&self.path, &self.open_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_pin_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let set = FileSet::open(dir.path()).unwrap();
        let fileno = set.create(FileType::Vocab).unwrap();

        {
            let handle = set.pin(FileType::Vocab, fileno, Mode::Exclusive).unwrap();
            handle.write_at(0, b"hello").unwrap();
        }

        let handle = set.pin(FileType::Vocab, fileno, Mode::Shared).unwrap();
        let mut buf = [0u8; 5];
        handle.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn filenos_increase_per_type_independently() {
        let dir = tempfile::tempdir().unwrap();
        let set = FileSet::open(dir.path()).unwrap();
        assert_eq!(set.create(FileType::Vocab).unwrap(), 1);
        assert_eq!(set.create(FileType::Vocab).unwrap(), 2);
        assert_eq!(set.create(FileType::Docmap).unwrap(), 1);
    }

    #[test]
    fn reopen_recovers_highest_fileno() {
        let dir = tempfile::tempdir().unwrap();
        {
            let set = FileSet::open(dir.path()).unwrap();
            set.create(FileType::Impact).unwrap();
            set.create(FileType::Impact).unwrap();
        }
        let set = FileSet::open(dir.path()).unwrap();
        assert_eq!(set.create(FileType::Impact).unwrap(), 3);
    }

    #[test]
    fn exclusive_lock_blocks_a_second_exclusive_pin() {
        let dir = tempfile::tempdir().unwrap();
        let set_a = FileSet::open(dir.path()).unwrap();
        let set_b = FileSet::open(dir.path()).unwrap();
        let fileno = set_a.create(FileType::Vocab).unwrap();

        let _held = set_a.pin(FileType::Vocab, fileno, Mode::Exclusive).unwrap();
        let result = set_b.pin(FileType::Vocab, fileno, Mode::Exclusive);
        assert!(matches!(result, Err(StorageError::Eagain)));
    }
}
