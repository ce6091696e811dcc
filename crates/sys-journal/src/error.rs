use std::io::Error as IoError;
use std::path::PathBuf;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error(transparent)]
    RwFile(#[from] rwfile::Error),

    #[error("system journal at {0:?} references string index {1} that was never interned")]
    UnknownStringIndex(PathBuf, u32),
}
