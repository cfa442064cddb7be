//! Error taxonomy shared by every on-disk component.
//!
//! The core distinguishes *kinds* of failure rather than individual types: a
//! programmer-misuse error (`Arg`), a bytes-didn't-decode error (`Fmt`), an
//! I/O error, an allocation failure, and the `Bufsize`/`Eintr`/`Eagain`
//! transients that surface from the encoders and the file set.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Programmer misuse: out-of-range docno, oversized term+payload,
    /// an iterator used after the underlying store mutated, etc.
    #[error("invalid argument: {0}")]
    Arg(String),

    /// On-disk bytes did not decode as expected: wrong page tag, truncated
    /// record, cache pages inconsistent with data pages.
    #[error("format error: {0}")]
    Fmt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation failed (bucket/page arena exhausted, or the free-space
    /// map itself returned an error).
    #[error("allocation failed: {0}")]
    Mem(String),

    /// An encoder ran out of room in the destination page. Internal to the
    /// document map; external callers of the B+tree never see this — they
    /// see `Fit::TooBig`/`Fit::DoesNotFit` instead.
    #[error("buffer too small: {0}")]
    Bufsize(String),

    /// Transient I/O interruption. Never retried automatically; surfaced
    /// to the caller unchanged.
    #[error("interrupted")]
    Eintr,

    /// Transient resource-unavailable condition from the file set.
    #[error("would block")]
    Eagain,

    /// Benign end-of-iteration sentinel.
    #[error("iteration finished")]
    IterFinish,

    /// Checksum or invariant mismatch detected on load.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl StorageError {
    pub fn arg(msg: impl Into<String>) -> Self {
        StorageError::Arg(msg.into())
    }

    pub fn fmt(msg: impl Into<String>) -> Self {
        StorageError::Fmt(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Eintr | StorageError::Eagain)
    }
}

/// Result of an operation that may legitimately fail to fit rather than
/// error outright. The bucket layer and the B+tree's write path use this
/// instead of `Result` so "try a fresh bucket" and "never fits anywhere"
/// are distinguishable without allocating an error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit<T> {
    Ok(T),
    /// Doesn't fit in this bucket, but might fit a freshly split one.
    DoesNotFit,
    /// Exceeds what an empty bucket could ever hold.
    TooBig,
}

impl<T> Fit<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Fit::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_too_big(&self) -> bool {
        matches!(self, Fit::TooBig)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fit<U> {
        match self {
            Fit::Ok(v) => Fit::Ok(f(v)),
            Fit::DoesNotFit => Fit::DoesNotFit,
            Fit::TooBig => Fit::TooBig,
        }
    }
}
