//! The system journal: a logical record log shared by every journal-dtable co-located in one
//! managed-dtable directory (spec.md §4.5).
//!
//! Distinct from [`journal`](../journal/index.html)'s low-level file-transaction log: this one
//! stays open for the life of the process, is replayed record-by-record at startup against a
//! [`ListenerWarehouse`], and is periodically [`SysJournal::filter`]ed down to just the live
//! state once it grows large.

mod error;
mod journal;
mod listener;
mod record;

pub use self::error::{Error, Result};
pub use self::journal::SysJournal;
pub use self::listener::{JournalListener, ListenerWarehouse};
pub use self::record::Record;
