//! The dtable contract (spec.md §3), its iterator protocol, a handful of on-disk immutable leaf
//! formats (spec.md §4.6), and the wrapper codecs that compose over them.
//!
//! Grounded on `anchored-sstable`'s table/iterator split: one trait for the data, one for the
//! cursor over it, with every concrete format implementing both.

pub mod codec;
pub mod error;
pub mod leaf;
pub mod stringtbl;
pub mod support;
pub mod traits;
pub mod wrapper;

pub use self::error::{Error, Result};
pub use self::stringtbl::StringTable;
pub use self::traits::{DTable, DTableIter, SourceId, WritableDTable};
