use std::cell::RefCell;
use std::path::Path;

use blob_key::{Blob, Key, KeyType, Metablob, SeekTest, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::{VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


/// `exception_dtable`: union of `base` and `alt`. Used to back lossy leaf formats — when a
/// leaf's `create()` rejects a value it can't encode, the caller stores a deterministic
/// placeholder in `base` and the real value in `alt`; `lookup` tries `base` first and falls back
/// to `alt` only for keys the caller flagged as exceptions (spec.md §4.6, §3 "Rejection
/// protocol").
#[derive(Debug)]
pub struct ExceptionDTable {
    base:       Box<dyn DTable>,
    alt:        Box<dyn DTable>,
    exceptions: Vec<Key>,
}

impl ExceptionDTable {
    #[must_use]
    pub fn new(base: Box<dyn DTable>, alt: Box<dyn DTable>, exceptions: Vec<Key>) -> Self {
        Self { base, alt, exceptions }
    }

    /// Builds `base` over `source` via `build_base`, recording every key `build_base`'s leaf
    /// format rejects instead of propagating [`Error::Rejected`] (spec.md §3 "Rejection
    /// protocol"): `source` is wrapped so its iterator's [`DTableIter::reject`] always accepts,
    /// remembering the key and real value it was asked to substitute. `build_alt` then builds
    /// `alt` from exactly those recorded entries. The exception key list is persisted alongside
    /// so [`Self::open`] can restore it without re-deriving it from `base`/`alt`.
    ///
    /// `build_base`/`build_alt` report their own error type `E`, which must be constructible from
    /// this crate's [`Error`] — so a caller in another crate can build `base`/`alt` with
    /// factories returning its own error type and still have `?` convert the error this function
    /// raises while persisting the exception key list.
    ///
    /// # Errors
    /// Propagates whatever `build_base`/`build_alt` return, or I/O failures persisting the
    /// exception key list.
    pub fn create<E: From<Error>>(
        dir:        &Path,
        name:       &str,
        source:     &dyn DTable,
        build_base: impl FnOnce(&dyn DTable) -> std::result::Result<Box<dyn DTable>, E>,
        build_alt:  impl FnOnce(&dyn DTable) -> std::result::Result<Box<dyn DTable>, E>,
    ) -> std::result::Result<Self, E> {
        let key_type = source.key_type();
        let recorder = RecordingSource::new(source);
        let base = build_base(&recorder)?;
        let recorded = recorder.into_exceptions();
        let exceptions: Vec<Key> = recorded.iter().map(|(k, _)| k.clone()).collect();

        let alt_source = StaticSource::new(key_type, recorded);
        let alt = build_alt(&alt_source)?;

        write_exceptions(dir, name, key_type, &exceptions).map_err(E::from)?;
        Ok(Self { base, alt, exceptions })
    }

    /// Reopens a table previously written by [`Self::create`]. See [`Self::create`] for why
    /// `open_base`/`open_alt` report a caller-chosen error type `E`.
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] if the exception key list is malformed, or propagates whatever
    /// `open_base`/`open_alt` return.
    pub fn open<E: From<Error>>(
        dir:       &Path,
        name:      &str,
        open_base: impl FnOnce() -> std::result::Result<Box<dyn DTable>, E>,
        open_alt:  impl FnOnce() -> std::result::Result<Box<dyn DTable>, E>,
    ) -> std::result::Result<Self, E> {
        let exceptions = read_exceptions(dir, name).map_err(E::from)?;
        let base = open_base()?;
        let alt = open_alt()?;
        Ok(Self { base, alt, exceptions })
    }

    fn is_exception(&self, key: &Key) -> bool {
        let comparator = self.base.blob_comparator();
        self.exceptions.iter().any(|k| k.cmp_with(key, comparator).is_eq())
    }
}

fn write_exceptions(dir: &Path, name: &str, key_type: KeyType, exceptions: &[Key]) -> Result<()> {
    let mut out = vec![key_type.tag()];
    out.extend_from_slice(&(exceptions.len() as u32).to_le_bytes());
    for key in exceptions {
        codec::encode_key(&mut out, key);
    }
    std::fs::write(dir.join(format!("{name}.exc")), out)?;
    Ok(())
}

fn read_exceptions(dir: &Path, name: &str) -> Result<Vec<Key>> {
    let path = dir.join(format!("{name}.exc"));
    let data = std::fs::read(&path)?;
    let err = || Error::Corrupt(path.clone(), "truncated exception_dtable key list");

    let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
    let count = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()) as usize;

    let mut offset = 5;
    let mut exceptions = Vec::with_capacity(count);
    for _ in 0..count {
        exceptions.push(codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?);
    }
    Ok(exceptions)
}

/// Wraps `inner` so its iterator's [`DTableIter::reject`] always accepts a candidate, recording
/// the key and real value it replaces. Feeds [`ExceptionDTable::create`]'s `build_base` closure.
struct RecordingSource<'a> {
    inner:      &'a dyn DTable,
    exceptions: RefCell<Vec<(Key, Blob)>>,
}

impl<'a> RecordingSource<'a> {
    fn new(inner: &'a dyn DTable) -> Self {
        Self { inner, exceptions: RefCell::new(Vec::new()) }
    }

    fn into_exceptions(self) -> Vec<(Key, Blob)> {
        self.exceptions.into_inner()
    }
}

impl DTable for RecordingSource<'_> {
    fn key_type(&self) -> KeyType {
        self.inner.key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.inner.blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.inner.lookup(key)
    }

    fn present(&self, key: &Key) -> (bool, bool) {
        self.inner.present(key)
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(RecordingIter { inner: self.inner.iter(), exceptions: &self.exceptions })
    }

    fn size(&self) -> Option<usize> {
        self.inner.size()
    }

    fn maintain(&self) {
        self.inner.maintain();
    }
}

struct RecordingIter<'a> {
    inner:      Box<dyn DTableIter + 'a>,
    exceptions: &'a RefCell<Vec<(Key, Blob)>>,
}

impl DTableIter for RecordingIter<'_> {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn first(&mut self) {
        self.inner.first();
    }

    fn last(&mut self) {
        self.inner.last();
    }

    fn next(&mut self) -> bool {
        self.inner.next()
    }

    fn prev(&mut self) -> bool {
        self.inner.prev()
    }

    fn seek(&mut self, key: &Key) {
        self.inner.seek(key);
    }

    fn seek_test(&mut self, test: &dyn SeekTest) {
        self.inner.seek_test(test);
    }

    fn key(&self) -> Key {
        self.inner.key()
    }

    fn meta(&self) -> Metablob {
        self.inner.meta()
    }

    fn value(&self) -> Blob {
        self.inner.value()
    }

    fn source(&self) -> SourceId {
        self.inner.source()
    }

    fn seek_index(&mut self, i: usize) {
        self.inner.seek_index(i);
    }

    fn get_index(&self) -> Option<usize> {
        self.inner.get_index()
    }

    fn reject(&mut self, candidate: &Blob) -> Option<Blob> {
        self.exceptions.borrow_mut().push((self.inner.key(), self.inner.value()));
        Some(candidate.clone())
    }
}

/// A sorted, in-memory [`DTable`] built from exactly the entries `RecordingSource` captured, fed
/// to [`ExceptionDTable::create`]'s `build_alt` closure.
#[derive(Debug)]
struct StaticSource {
    key_type: KeyType,
    entries:  Vec<(Key, Blob)>,
}

impl StaticSource {
    fn new(key_type: KeyType, mut entries: Vec<(Key, Blob)>) -> Self {
        entries.sort_by(|a, b| a.0.natural_cmp(&b.0));
        Self { key_type, entries }
    }
}

impl DTable for StaticSource {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        lookup_sorted_with(&self.entries, key, None)
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(VecIter::new(&self.entries, SourceId(std::ptr::from_ref(self) as usize)))
    }

    fn size(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

impl DTable for ExceptionDTable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.base.blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        if self.is_exception(key) {
            let (found, blob) = self.alt.lookup(key);
            if found {
                return (found, blob);
            }
        }
        self.base.lookup(key)
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(ExceptionIter {
            base:       self.base.iter(),
            alt:        &*self.alt,
            exceptions: &self.exceptions,
            comparator: self.base.blob_comparator(),
        })
    }

    fn size(&self) -> Option<usize> {
        self.base.size()
    }
}

struct ExceptionIter<'a> {
    base:       Box<dyn DTableIter + 'a>,
    alt:        &'a dyn DTable,
    exceptions: &'a [Key],
    comparator: Option<&'a SharedComparator>,
}

impl ExceptionIter<'_> {
    fn resolve(&self) -> Blob {
        let key = self.base.key();
        if self.exceptions.iter().any(|k| k.cmp_with(&key, self.comparator).is_eq()) {
            let (found, blob) = self.alt.lookup(&key);
            if found {
                return blob;
            }
        }
        self.base.value()
    }
}

impl DTableIter for ExceptionIter<'_> {
    fn valid(&self) -> bool {
        self.base.valid()
    }

    fn first(&mut self) {
        self.base.first();
    }

    fn last(&mut self) {
        self.base.last();
    }

    fn next(&mut self) -> bool {
        self.base.next()
    }

    fn prev(&mut self) -> bool {
        self.base.prev()
    }

    fn seek(&mut self, key: &Key) {
        self.base.seek(key);
    }

    fn seek_test(&mut self, test: &dyn SeekTest) {
        self.base.seek_test(test);
    }

    fn key(&self) -> Key {
        self.base.key()
    }

    fn meta(&self) -> Metablob {
        self.base.meta()
    }

    fn value(&self) -> Blob {
        self.resolve()
    }

    fn source(&self) -> SourceId {
        self.base.source()
    }

    fn reject(&mut self, candidate: &Blob) -> Option<Blob> {
        Some(candidate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::fixed::FixedDTable;
    use crate::leaf::simple::SimpleDTable;
    use crate::support::test_support::MemDTable;

    #[test]
    fn lookup_falls_back_to_alt_only_for_flagged_exceptions() {
        let base = MemDTable::new(
            KeyType::U32,
            vec![(Key::U32(0), Blob::present(*b"_____")), (Key::U32(1), Blob::present(*b"fixed"))],
        );
        let alt = MemDTable::new(KeyType::U32, vec![(Key::U32(0), Blob::present(b"exception".to_vec()))]);
        let table = ExceptionDTable::new(Box::new(base), Box::new(alt), vec![Key::U32(0)]);

        assert_eq!(table.lookup(&Key::U32(0)).1.as_bytes(), Some(&b"exception"[..]));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"fixed"[..]));
    }

    #[test]
    fn iteration_reverses_exceptions_in_place() {
        let base = MemDTable::new(
            KeyType::U32,
            vec![
                (Key::U32(0), Blob::present(*b"_____")),
                (Key::U32(1), Blob::present(*b"fixed")),
                (Key::U32(3), Blob::present(*b"fixed")),
                (Key::U32(8), Blob::present(*b"_____")),
            ],
        );
        let alt = MemDTable::new(
            KeyType::U32,
            vec![
                (Key::U32(0), Blob::present(b"exception".to_vec())),
                (Key::U32(8), Blob::present(b"exception".to_vec())),
            ],
        );
        let table = ExceptionDTable::new(Box::new(base), Box::new(alt), vec![Key::U32(0), Key::U32(8)]);

        let mut it = table.iter();
        it.first();
        let mut got = Vec::new();
        while it.valid() {
            got.push((it.key(), it.value().as_bytes().unwrap().to_vec()));
            it.next();
        }
        assert_eq!(
            got,
            vec![
                (Key::U32(0), b"exception".to_vec()),
                (Key::U32(1), b"fixed".to_vec()),
                (Key::U32(3), b"fixed".to_vec()),
                (Key::U32(8), b"exception".to_vec()),
            ]
        );
    }

    #[test]
    fn create_routes_rejected_values_into_alt_and_open_restores_them() {
        let dir = std::env::temp_dir().join(format!("exception-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemDTable::new(
            KeyType::U32,
            vec![(Key::U32(1), Blob::present(*b"toolong")), (Key::U32(2), Blob::present(*b"ok!"))],
        );

        let table = ExceptionDTable::create(
            &dir,
            "lvl",
            &source,
            |src| Ok(Box::new(FixedDTable::create(&dir, "lvl", 3, None, None, src, None)?)),
            |src| Ok(Box::new(SimpleDTable::create(&dir, "lvl-alt", None, src, None)?)),
        )
        .unwrap();

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"toolong"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"ok!"[..]));

        let reopened = ExceptionDTable::open(
            &dir,
            "lvl",
            || Ok(Box::new(FixedDTable::open(&dir, "lvl", None)?)),
            || Ok(Box::new(SimpleDTable::open(&dir, "lvl-alt", None)?)),
        )
        .unwrap();
        assert_eq!(reopened.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"toolong"[..]));
        assert_eq!(reopened.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"ok!"[..]));
    }
}
