//! Blob, metablob, and typed key primitives shared by every layer of the dtable stack.
//!
//! See spec.md §3 ("Data model") and §4.1 for the contract these types exist to satisfy.

mod blob;
mod comparator;
mod key;
mod seek;

pub use self::blob::{Blob, Metablob};
pub use self::comparator::{
    BlobComparator, ByteOrderComparator, SharedComparator, comparator_is_compatible,
};
pub use self::key::{Key, KeyType};
pub use self::seek::SeekTest;
