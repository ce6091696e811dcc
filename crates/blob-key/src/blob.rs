use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;


/// An immutable, reference-counted byte string, or the explicit absence of one.
///
/// The absent variant is the tombstone used throughout the dtable stack to record a deletion;
/// it is distinct from [`Blob::empty`], a zero-length but *present* value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Blob(Option<Arc<[u8]>>);

impl Blob {
    /// The tombstone value: no bytes exist for this key.
    #[must_use]
    pub const fn tombstone() -> Self {
        Self(None)
    }

    /// A zero-length, but present, value.
    #[must_use]
    pub fn empty() -> Self {
        Self(Some(Arc::from([])))
    }

    #[must_use]
    pub fn present(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(Some(bytes.into()))
    }

    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.0.is_some()
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    /// The byte length of the value, or `0` for a tombstone.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.as_deref().map_or(0, <[u8]>::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn meta(&self) -> Metablob {
        Metablob {
            exists: self.exists(),
            size:   self.len(),
        }
    }
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.0 {
            None => f.write_str("Blob::tombstone()"),
            Some(bytes) => f.debug_tuple("Blob::present").field(bytes).finish(),
        }
    }
}

/// Existent blobs order greater than non-existent ones; among existent blobs, lexicographic
/// byte-string order applies. This matches spec.md §4.1's default ordering, used whenever no
/// [`BlobComparator`](crate::BlobComparator) overrides it.
impl PartialOrd for Blob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Blob {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

/// Existence and size only, readable without fetching a blob's bytes. Iterators hand these out
/// cheaply so callers can filter on size before paying for the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metablob {
    pub exists: bool,
    pub size:   usize,
}

impl Metablob {
    #[must_use]
    pub const fn tombstone() -> Self {
        Self { exists: false, size: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_is_distinct_from_empty() {
        let tomb = Blob::tombstone();
        let empty = Blob::empty();
        assert!(!tomb.exists());
        assert!(empty.exists());
        assert_ne!(tomb, empty);
        assert_eq!(empty.len(), 0);
    }

    #[test]
    fn ordering_puts_tombstones_first() {
        let tomb = Blob::tombstone();
        let a = Blob::present(*b"a");
        let z = Blob::present(*b"z");
        assert!(tomb < a);
        assert!(a < z);
    }

    #[test]
    fn meta_matches_blob() {
        let b = Blob::present(*b"hello");
        assert_eq!(b.meta(), Metablob { exists: true, size: 5 });
        assert_eq!(Blob::tombstone().meta(), Metablob::tombstone());
    }
}
