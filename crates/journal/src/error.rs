use std::io::Error as IoError;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error(transparent)]
    RwFile(#[from] rwfile::Error),

    #[error("record of {0} bytes does not fit in a single journal record (max {max})", max = u16::MAX)]
    RecordTooLarge(usize),

    #[error("journal is already committed; no further appends are allowed")]
    AlreadyCommitted,

    #[error("journal at {0:?} is corrupt (truncated record, bad checksum, or missing commit marker)")]
    Corrupt(std::path::PathBuf),
}
