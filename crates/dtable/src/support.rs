use blob_key::{Blob, Key, Metablob, SeekTest, SharedComparator};

use crate::error::{Error, Result};
use crate::traits::{DTable, DTableIter, SourceId};


/// Walks `source`, eliding tombstones unless `shadow` still contains the key (spec.md §3 "Shadow
/// and tombstones"). Every leaf format's `create()` goes through this.
pub fn collect_with_shadow(source: &dyn DTable, shadow: Option<&dyn DTable>) -> Vec<(Key, Blob)> {
    let mut out = Vec::new();
    let mut it = source.iter();
    it.first();
    while it.valid() {
        let key = it.key();
        let blob = it.value();
        if blob.exists() || shadow.is_some_and(|s| s.present(&key).0) {
            out.push((key, blob));
        }
        it.next();
    }
    out
}

/// Like [`collect_with_shadow`], but additionally validates every surviving entry through
/// `validate`. On `Err(candidate)`, the format proposes `candidate` to the source iterator's
/// [`DTableIter::reject`]; accepting it stores the returned replacement, refusing it fails the
/// whole `create()` (spec.md §3 "Rejection protocol").
///
/// # Errors
/// Returns [`Error::Rejected`] if a value is unencodable and nothing upstream accepts a
/// replacement.
pub fn collect_with_validation(
    source:   &dyn DTable,
    shadow:   Option<&dyn DTable>,
    mut validate: impl FnMut(&Key, &Blob) -> std::result::Result<Blob, Blob>,
) -> Result<Vec<(Key, Blob)>> {
    let mut out = Vec::new();
    let mut it = source.iter();
    it.first();
    while it.valid() {
        let key = it.key();
        let blob = it.value();
        if blob.exists() || shadow.is_some_and(|s| s.present(&key).0) {
            match validate(&key, &blob) {
                Ok(stored) => out.push((key, stored)),
                Err(candidate) => {
                    let replacement = it.reject(&candidate).ok_or(Error::Rejected)?;
                    tracing::debug!(?key, "value rejected by leaf format, stored via exception chain");
                    out.push((key, replacement));
                }
            }
        }
        it.next();
    }
    Ok(out)
}

/// A `DTableIter` over an in-memory sorted `Vec<(Key, Blob)>`, shared by every leaf format. Each
/// format differs in *what* it can encode and how it validates values at `create()` time, not in
/// how it walks an already-loaded table; this is the common walking logic.
#[derive(Debug)]
pub struct VecIter<'a> {
    entries:    &'a [(Key, Blob)],
    pos:        Option<usize>,
    source:     SourceId,
    comparator: Option<SharedComparator>,
}

impl<'a> VecIter<'a> {
    /// Equivalent to [`Self::with_comparator`] with no comparator, for `U32`/`F64`/`Str`-keyed
    /// formats where a blob comparator can never apply.
    #[must_use]
    pub fn new(entries: &'a [(Key, Blob)], source: SourceId) -> Self {
        Self::with_comparator(entries, source, None)
    }

    #[must_use]
    pub fn with_comparator(
        entries:    &'a [(Key, Blob)],
        source:     SourceId,
        comparator: Option<SharedComparator>,
    ) -> Self {
        Self { entries, pos: None, source, comparator }
    }
}

impl DTableIter for VecIter<'_> {
    fn valid(&self) -> bool {
        self.pos.is_some_and(|i| i < self.entries.len())
    }

    fn first(&mut self) {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn last(&mut self) {
        self.pos = self.entries.len().checked_sub(1);
    }

    fn next(&mut self) -> bool {
        let next = self.pos.map_or(0, |i| i + 1);
        if next < self.entries.len() {
            self.pos = Some(next);
            true
        } else {
            self.pos = Some(self.entries.len());
            false
        }
    }

    fn prev(&mut self) -> bool {
        match self.pos {
            Some(0) | None => false,
            Some(i) => {
                self.pos = Some(i - 1);
                true
            }
        }
    }

    fn seek(&mut self, key: &Key) {
        let idx = self.entries.partition_point(|(k, _)| k.cmp_with(key, self.comparator.as_ref()).is_lt());
        self.pos = Some(idx);
    }

    fn seek_test(&mut self, test: &dyn SeekTest) {
        let idx = self.entries.partition_point(|(k, _)| test.test(k).is_lt());
        self.pos = Some(idx);
    }

    fn key(&self) -> Key {
        self.entries[self.pos.expect("key() called on invalid iterator")].0.clone()
    }

    fn meta(&self) -> Metablob {
        self.entries[self.pos.expect("meta() called on invalid iterator")].1.meta()
    }

    fn value(&self) -> Blob {
        self.entries[self.pos.expect("value() called on invalid iterator")].1.clone()
    }

    fn source(&self) -> SourceId {
        self.source
    }

    fn seek_index(&mut self, i: usize) {
        self.pos = Some(i);
    }

    fn get_index(&self) -> Option<usize> {
        self.valid().then_some(self.pos.unwrap())
    }
}

/// Binary-searches `entries` (sorted by [`Key::natural_cmp`]) for `key`.
#[must_use]
pub fn lookup_sorted(entries: &[(Key, Blob)], key: &Key) -> (bool, Blob) {
    lookup_sorted_with(entries, key, None)
}

/// Like [`lookup_sorted`], but orders `Blob` keys through `comparator` when one is given — the
/// table must have been built with the same comparator, or this binary search silently returns
/// wrong answers (spec.md §3: a dtable's comparator is fixed for its lifetime).
#[must_use]
pub fn lookup_sorted_with(
    entries:    &[(Key, Blob)],
    key:        &Key,
    comparator: Option<&SharedComparator>,
) -> (bool, Blob) {
    match entries.binary_search_by(|(k, _)| k.cmp_with(key, comparator)) {
        Ok(i) => (true, entries[i].1.clone()),
        Err(_) => (false, Blob::tombstone()),
    }
}

/// A trivial in-memory [`DTable`], used across this crate's unit tests to stand in for a
/// `source`/`shadow` without round-tripping through a real on-disk format.
#[cfg(test)]
pub mod test_support {
    use blob_key::KeyType;

    use super::{Blob, DTable, DTableIter, Key, SourceId, VecIter};

    #[derive(Debug)]
    pub struct MemDTable {
        key_type: KeyType,
        entries:  Vec<(Key, Blob)>,
    }

    impl MemDTable {
        #[must_use]
        pub fn new(key_type: KeyType, mut entries: Vec<(Key, Blob)>) -> Self {
            entries.sort_by(|a, b| a.0.natural_cmp(&b.0));
            Self { key_type, entries }
        }
    }

    impl DTable for MemDTable {
        fn key_type(&self) -> KeyType {
            self.key_type
        }

        fn lookup(&self, key: &Key) -> (bool, Blob) {
            super::lookup_sorted(&self.entries, key)
        }

        fn iter(&self) -> Box<dyn DTableIter + '_> {
            Box::new(VecIter::new(&self.entries, SourceId(std::ptr::from_ref(self) as usize)))
        }

        fn size(&self) -> Option<usize> {
            Some(self.entries.len())
        }
    }
}
