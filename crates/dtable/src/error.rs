use std::io::Error as IoError;
use std::path::PathBuf;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;

/// Mirrors spec.md §7's POSIX errno domain, kept as a typed enum rather than raw integers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error(transparent)]
    RwFile(#[from] rwfile::Error),

    #[error("source iterator rejected a value that no handler in the chain would accept (EINVAL)")]
    Rejected,

    #[error("comparator mismatch: dtable was built with {existing:?}, opened with {candidate}")]
    ComparatorMismatch { existing: Option<String>, candidate: String },

    #[error("dtable at {0:?} is corrupt: {1}")]
    Corrupt(PathBuf, &'static str),

    #[error("{0}")]
    Unsupported(&'static str),
}
