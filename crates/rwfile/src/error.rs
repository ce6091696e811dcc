use std::io::Error as IoError;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;

/// Failures from the buffered file wrappers. These are always fatal to the operation in progress;
/// see spec.md §7 for how callers above this layer (the journal, file-transaction layer) should
/// treat them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("read of {len} bytes at offset {offset} extends past end of file (size {size})")]
    ReadPastEnd { offset: u64, len: usize, size: u64 },
}
