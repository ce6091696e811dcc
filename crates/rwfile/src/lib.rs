//! Buffered read-only (`RoFile`) and append-only (`RwFile`) file wrappers.
//!
//! Grounded on `anchored-vfs`'s `std_fs` module, but scoped down to direct `std::fs` usage per
//! spec.md §1's single-host, single-process Non-goals (a pluggable virtual filesystem is not
//! part of this spec).

mod error;
mod rofile;
mod rwfile;

pub use self::error::{Error, Result};
pub use self::rofile::RoFile;
pub use self::rwfile::{FlushHandler, RwFile};
