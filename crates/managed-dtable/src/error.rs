use std::io::Error as IoError;
use std::path::PathBuf;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;

/// The POSIX-flavored error domain from spec.md §7, as a typed enum rather than raw errno codes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error(transparent)]
    DTable(#[from] dtable::Error),

    #[error(transparent)]
    Journal(#[from] journal::Error),

    #[error(transparent)]
    SysJournal(#[from] sys_journal::Error),

    #[error("managed dtable at {0:?} has no such level")]
    NotFound(PathBuf),

    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("managed dtable is busy: {0}")]
    Busy(&'static str),

    #[error("abortable transaction {0} already exists or was not found")]
    Exists(u32),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("md_meta at {0:?} is corrupt: {1}")]
    Corrupt(PathBuf, &'static str),
}

/// The short error classification from spec.md §7, independent of the richer [`Error`] above;
/// useful for callers that want to match on category rather than message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    Busy,
    Exists,
    Unsupported,
    Io,
}

impl Error {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Busy(_) => ErrorCode::Busy,
            Self::Exists(_) => ErrorCode::Exists,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Io(_) | Self::Journal(_) | Self::SysJournal(_) | Self::Corrupt(..) => ErrorCode::Io,
            Self::DTable(_) => ErrorCode::InvalidArgument,
        }
    }
}
