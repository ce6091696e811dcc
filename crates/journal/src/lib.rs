//! Checksummed append-only journaling, and the file-transaction layer built on top of it.
//!
//! [`low_level`] is the bare record log (spec.md §4.3): a sequence of length-prefixed records
//! terminated by an MD5-checksummed commit sentinel, chained across rotated journal files.
//! [`metafile`] is the higher-level transactional layer (spec.md §4.4) that batches writes to
//! small files and atomically applies them to the real filesystem through a single journal
//! commit, recovering automatically on restart.

mod error;
mod low_level;
mod metafile;

pub use self::error::{Error, Result};
pub use self::low_level::{CommittedJournal, Journal};
pub use self::metafile::{FileTxContext, MetaFileHandle, PreEndHandlerId, TxId};
