use std::fmt;

use blob_key::{Blob, Key, KeyType, Metablob, SeekTest, SharedComparator};


/// An opaque identity for the dtable that actually holds the entry an iterator is positioned at.
/// Used by overlay iterators to report `source()` without exposing a live reference (spec.md
/// §9's "`source()` returns an opaque handle used only for identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

/// The uniform contract every dtable layer honors (spec.md §3 "dtable (contract)").
///
/// Dyn-compatible: every wrapper layer stores its child as `Box<dyn DTable>` (spec.md §9's
/// factory-registry redesign note).
pub trait DTable: fmt::Debug + Send + Sync {
    fn key_type(&self) -> KeyType;

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        None
    }

    fn cmp_name(&self) -> Option<&str> {
        self.blob_comparator().map(|c| c.name())
    }

    fn lookup(&self, key: &Key) -> (bool, Blob);

    fn present(&self, key: &Key) -> (bool, bool) {
        let (found, blob) = self.lookup(key);
        (found, blob.exists())
    }

    fn iter(&self) -> Box<dyn DTableIter + '_>;

    /// Number of live entries, if cheaply known.
    fn size(&self) -> Option<usize> {
        None
    }

    /// Positional access, for formats that support it (array/linear/fixed).
    fn index(&self, _i: usize) -> Option<(Key, Blob)> {
        None
    }

    fn contains_index(&self, _i: usize) -> bool {
        false
    }

    /// No-op by default; overridden by formats with deferred maintenance (e.g. `cache`'s LRU).
    fn maintain(&self) {}
}

/// A dtable that additionally supports direct mutation (spec.md §3: "a dtable may be writable").
pub trait WritableDTable: DTable {
    fn insert(&mut self, key: Key, blob: Blob, append: bool) -> bool;

    /// Stores a tombstone; does not shrink the key space.
    fn remove(&mut self, key: &Key) -> bool;
}

/// The iterator protocol (spec.md §3 "iterator (contract)", §4.1).
///
/// An iterator always points either at a valid entry or at a single after-the-end position.
pub trait DTableIter {
    fn valid(&self) -> bool;

    fn first(&mut self);

    fn last(&mut self);

    /// Returns `true` iff the iterator is at a valid entry afterwards.
    fn next(&mut self) -> bool;

    /// Never moves past the first entry: calling it there returns `false` and leaves position
    /// unchanged.
    fn prev(&mut self) -> bool;

    fn seek(&mut self, key: &Key);

    fn seek_test(&mut self, test: &dyn SeekTest);

    /// # Panics
    /// Implementations may panic if called while `!self.valid()`.
    fn key(&self) -> Key;

    fn meta(&self) -> Metablob;

    fn value(&self) -> Blob;

    fn source(&self) -> SourceId;

    /// Positional access, mirroring [`DTable::index`].
    fn seek_index(&mut self, _i: usize) {}

    fn get_index(&self) -> Option<usize> {
        None
    }

    /// Called by a leaf format's `create()` when it cannot encode the current value. `candidate`
    /// is the deterministic placeholder the format proposes to store instead.
    ///
    /// Returns `Some(replacement)` (usually `candidate` unchanged) if some handler upstream in
    /// the iterator chain accepts the substitution (and remembers the real value so that a later
    /// `lookup` on the resulting dtable reverses it); `None` if nothing in the chain accepts, in
    /// which case `create` must fail with [`crate::Error::Rejected`] (spec.md §3 "Rejection
    /// protocol").
    ///
    /// The default implementation always refuses; only exception-aware wrapping iterators
    /// override it.
    fn reject(&mut self, _candidate: &Blob) -> Option<Blob> {
        None
    }
}
