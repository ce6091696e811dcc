//! `journal_dtable` and `temp_journal_dtable`: writable dtables backed by the system journal
//! (spec.md §4.7).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use blob_key::{Blob, Key, KeyType, Metablob, SeekTest, SharedComparator};
use dtable::{DTable, DTableIter, SourceId};
use sys_journal::{JournalListener, Record, SysJournal};

use crate::error::Result;


/// A `DTableIter` over an owned, already-sorted `Vec<(Key, Blob)>`. Mirrors `dtable`'s internal
/// `VecIter` (which only borrows a slice); a journal-backed tip has no long-lived backing array
/// to borrow from, so its iterator owns a point-in-time snapshot instead. `pub(crate)` so
/// [`crate::managed`] can reuse it for the managed dtable's own merged-snapshot iterator.
#[derive(Debug)]
pub(crate) struct OwnedVecIter {
    entries:    Vec<(Key, Blob)>,
    pos:        Option<usize>,
    source:     SourceId,
    comparator: Option<SharedComparator>,
}

impl OwnedVecIter {
    pub(crate) fn new(entries: Vec<(Key, Blob)>, source: SourceId) -> Self {
        Self::with_comparator(entries, source, None)
    }

    pub(crate) fn with_comparator(
        entries:    Vec<(Key, Blob)>,
        source:     SourceId,
        comparator: Option<SharedComparator>,
    ) -> Self {
        Self { entries, pos: None, source, comparator }
    }
}

impl DTableIter for OwnedVecIter {
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


/// Orders [`Key`]s by [`Key::cmp_with`] so they can live in a [`BTreeMap`]; `Key` itself has
/// no `Ord`/`Eq`/`Hash` impl because of its `F64` variant. Every `SortKey` inserted into one
/// `BTreeMap` must carry the same comparator, which holds here since both `JournalDTable` and
/// `TempJournalDTable` clone their one `comparator` field into every `SortKey` they build.
#[derive(Debug, Clone)]
struct SortKey(Key, Option<SharedComparator>);

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.cmp_with(&other.0, self.1.as_ref()).is_eq()
    }
}
impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_with(&other.0, self.1.as_ref())
    }
}

/// A byte encoding of a [`Key`] good enough for a [`HashMap`] key, not meant to be compact or
/// stable across versions (spec.md §4.7's "hash index").
fn key_hash_bytes(key: &Key) -> Vec<u8> {
    match key {
        Key::U32(k) => k.to_le_bytes().to_vec(),
        Key::F64(k) => k.to_le_bytes().to_vec(),
        Key::Str(s) => s.as_bytes().to_vec(),
        Key::Blob(b) => b.to_vec(),
    }
}

/// Combines a prior stored value with a newly inserted one when `append` is set: bytes are
/// concatenated rather than replaced (a reading of spec.md §3's `insert(key,blob,append?)` that
/// the surviving `original_source/journal_dtable.cpp` leaves ambiguous; recorded here as a
/// concrete decision, see DESIGN.md).
fn combine_for_append(existing: Option<&Blob>, incoming: &Blob, append: bool) -> Blob {
    if !append || !incoming.exists() {
        return incoming.clone();
    }
    match existing.and_then(Blob::as_bytes) {
        Some(prior) => {
            let mut bytes = prior.to_vec();
            bytes.extend_from_slice(incoming.as_bytes().unwrap_or(&[]));
            Blob::present(bytes)
        }
        None => incoming.clone(),
    }
}

/// The writable tip of a [`crate::ManagedDTable`] (spec.md §4.7): state lives entirely in memory
/// and in the system journal. `insert`/`remove` append a record before updating the in-memory
/// map, so a crash mid-write leaves either the old or the new state, never a torn one.
#[derive(Debug, Clone)]
pub struct JournalDTable {
    listener_id: u32,
    key_type:    KeyType,
    comparator:  Option<SharedComparator>,
    entries:     BTreeMap<SortKey, Blob>,
}

impl JournalDTable {
    #[must_use]
    pub fn new(listener_id: u32, key_type: KeyType, comparator: Option<SharedComparator>) -> Self {
        Self { listener_id, key_type, comparator, entries: BTreeMap::new() }
    }

    #[must_use]
    pub const fn listener_id(&self) -> u32 {
        self.listener_id
    }

    /// Logs the comparator name once, if one is set and hasn't been logged yet. Idempotent to
    /// call more than once; callers should call it exactly after construction of a fresh tip.
    ///
    /// # Errors
    /// Propagates I/O failures appending to `journal`.
    pub fn log_comparator(&self, journal: &mut SysJournal) -> Result<()> {
        if let Some(cmp) = &self.comparator {
            journal.append(&Record::BlobCmp { listener_id: self.listener_id, comparator_name: cmp.name().to_owned() })?;
        }
        Ok(())
    }

    /// Appends a record and updates the in-memory map. Per spec.md §3, a non-existent `blob` on
    /// a key not yet present is a no-op handled by the caller (`ManagedDTable::insert`); this
    /// method always writes through.
    ///
    /// # Errors
    /// Propagates I/O failures appending to `journal`.
    pub fn insert(&mut self, journal: &mut SysJournal, key: Key, blob: Blob, append: bool) -> Result<bool> {
        let existing = self.entries.get(&SortKey(key.clone(), self.comparator.clone()));
        let stored = combine_for_append(existing, &blob, append);
        journal.append(&Record::Entry {
            listener_id: self.listener_id,
            key:         key.clone(),
            value:       stored.as_bytes().map(<[u8]>::to_vec),
        })?;
        self.entries.insert(SortKey(key, self.comparator.clone()), stored);
        Ok(true)
    }

    /// # Errors
    /// Propagates I/O failures appending to `journal`.
    pub fn remove(&mut self, journal: &mut SysJournal, key: &Key) -> Result<bool> {
        journal.append(&Record::Entry { listener_id: self.listener_id, key: key.clone(), value: None })?;
        self.entries.insert(SortKey(key.clone(), self.comparator.clone()), Blob::tombstone());
        Ok(true)
    }
}

impl DTable for JournalDTable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.comparator.as_ref()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.entries
            .get(&SortKey(key.clone(), self.comparator.clone()))
            .map_or((false, Blob::tombstone()), |blob| (true, blob.clone()))
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        let entries: Vec<(Key, Blob)> = self.entries.iter().map(|(k, v)| (k.0.clone(), v.clone())).collect();
        Box::new(OwnedVecIter::with_comparator(
            entries,
            SourceId(std::ptr::from_ref(self) as usize),
            self.comparator.clone(),
        ))
    }

    fn size(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

impl JournalListener for JournalDTable {
    fn listener_id(&self) -> u32 {
        self.listener_id
    }

    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn comparator_name(&self) -> Option<&str> {
        self.comparator.as_ref().map(|c| c.name())
    }

    fn journal_replay(&mut self, key: &Key, value: Option<&[u8]>) {
        let blob = value.map_or_else(Blob::tombstone, |v| Blob::present(v.to_vec()));
        self.entries.insert(SortKey(key.clone(), self.comparator.clone()), blob);
    }

    fn snapshot(&self) -> Vec<(Key, Vec<u8>)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_bytes().map(|bytes| (k.0.clone(), bytes.to_vec())))
            .collect()
    }
}

/// An abortable transaction's temp tip (spec.md §4.7). Keeps only a hash index until
/// [`DTable::iter`] is first called, at which point it materializes (and memoizes) a sorted
/// snapshot; any later mutation invalidates the memoized snapshot rather than maintaining it
/// incrementally, since temp tips are short-lived and usually either looked up or iterated once.
#[derive(Debug)]
pub struct TempJournalDTable {
    listener_id: u32,
    key_type:    KeyType,
    comparator:  Option<SharedComparator>,
    hash:        HashMap<Vec<u8>, (Key, Blob)>,
    sorted:      Mutex<Option<Vec<(Key, Blob)>>>,
}

impl Clone for TempJournalDTable {
    fn clone(&self) -> Self {
        Self {
            listener_id: self.listener_id,
            key_type:    self.key_type,
            comparator:  self.comparator.clone(),
            hash:        self.hash.clone(),
            sorted:      Mutex::new(None),
        }
    }
}

impl TempJournalDTable {
    #[must_use]
    pub fn new(listener_id: u32, key_type: KeyType, comparator: Option<SharedComparator>) -> Self {
        Self { listener_id, key_type, comparator, hash: HashMap::new(), sorted: Mutex::new(None) }
    }

    #[must_use]
    pub const fn listener_id(&self) -> u32 {
        self.listener_id
    }

    /// # Errors
    /// Propagates I/O failures appending to `journal`.
    pub fn insert(&mut self, journal: &mut SysJournal, key: Key, blob: Blob, append: bool) -> Result<bool> {
        let existing = self.hash.get(&key_hash_bytes(&key)).map(|(_, b)| b);
        let stored = combine_for_append(existing, &blob, append);
        journal.append(&Record::Entry {
            listener_id: self.listener_id,
            key:         key.clone(),
            value:       stored.as_bytes().map(<[u8]>::to_vec),
        })?;
        self.hash.insert(key_hash_bytes(&key), (key, stored));
        *self.sorted.lock().unwrap() = None;
        Ok(true)
    }

    /// # Errors
    /// Propagates I/O failures appending to `journal`.
    pub fn remove(&mut self, journal: &mut SysJournal, key: &Key) -> Result<bool> {
        journal.append(&Record::Entry { listener_id: self.listener_id, key: key.clone(), value: None })?;
        self.hash.insert(key_hash_bytes(key), (key.clone(), Blob::tombstone()));
        *self.sorted.lock().unwrap() = None;
        Ok(true)
    }

    /// All entries, tombstones included, for rolling a committed transaction's records into the
    /// main tip (where a removal must become a tombstone there too, not merely vanish).
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Key, &Blob)> {
        self.hash.values().map(|(k, v)| (k, v))
    }

    fn materialized(&self) -> Vec<(Key, Blob)> {
        let mut guard = self.sorted.lock().unwrap();
        if let Some(sorted) = guard.as_ref() {
            return sorted.clone();
        }
        let mut entries: Vec<(Key, Blob)> = self.hash.values().cloned().collect();
        entries.sort_by(|a, b| a.0.cmp_with(&b.0, self.comparator.as_ref()));
        *guard = Some(entries.clone());
        entries
    }
}

impl DTable for TempJournalDTable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.comparator.as_ref()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.hash.get(&key_hash_bytes(key)).map_or((false, Blob::tombstone()), |(_, blob)| (true, blob.clone()))
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(OwnedVecIter::with_comparator(
            self.materialized(),
            SourceId(std::ptr::from_ref(self) as usize),
            self.comparator.clone(),
        ))
    }

    fn size(&self) -> Option<usize> {
        Some(self.hash.len())
    }
}

impl JournalListener for TempJournalDTable {
    fn listener_id(&self) -> u32 {
        self.listener_id
    }

    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn journal_replay(&mut self, key: &Key, value: Option<&[u8]>) {
        let blob = value.map_or_else(Blob::tombstone, |v| Blob::present(v.to_vec()));
        self.hash.insert(key_hash_bytes(key), (key.clone(), blob));
        *self.sorted.lock().unwrap() = None;
    }

    fn snapshot(&self) -> Vec<(Key, Vec<u8>)> {
        self.hash.values().filter_map(|(k, v)| v.as_bytes().map(|bytes| (k.clone(), bytes.to_vec()))).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    use super::*;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_journal_path() -> PathBuf {
        let n = COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        std::env::temp_dir().join(format!("managed-dtable-jdt-test-{}-{n}.sjnl", std::process::id()))
    }

    struct NullWarehouse;
    impl sys_journal::ListenerWarehouse for NullWarehouse {
        fn lookup(&mut self, _listener_id: u32) -> Option<&mut dyn JournalListener> {
            None
        }
        fn obtain(&mut self, _listener_id: u32, _key_type: KeyType) -> Option<&mut dyn JournalListener> {
            None
        }
        fn live_listener_ids(&self) -> Vec<u32> {
            Vec::new()
        }
    }

    #[test]
    fn insert_and_remove_round_trip_through_lookup() {
        let path = temp_journal_path();
        let mut warehouse = NullWarehouse;
        let mut sj = SysJournal::spawn_init(&path, &mut warehouse, false).unwrap();

        let mut jdt = JournalDTable::new(1, KeyType::U32, None);
        jdt.insert(&mut sj, Key::U32(1), Blob::present(*b"a"), false).unwrap();
        jdt.insert(&mut sj, Key::U32(2), Blob::present(*b"b"), false).unwrap();
        assert_eq!(jdt.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"a"[..]));

        jdt.remove(&mut sj, &Key::U32(1)).unwrap();
        let (found, blob) = jdt.lookup(&Key::U32(1));
        assert!(found);
        assert!(!blob.exists());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn append_concatenates_rather_than_overwriting() {
        let path = temp_journal_path();
        let mut warehouse = NullWarehouse;
        let mut sj = SysJournal::spawn_init(&path, &mut warehouse, false).unwrap();

        let mut jdt = JournalDTable::new(1, KeyType::U32, None);
        jdt.insert(&mut sj, Key::U32(1), Blob::present(*b"ab"), false).unwrap();
        jdt.insert(&mut sj, Key::U32(1), Blob::present(*b"cd"), true).unwrap();
        assert_eq!(jdt.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"abcd"[..]));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn temp_journal_dtable_materializes_sorted_view_lazily() {
        let path = temp_journal_path();
        let mut warehouse = NullWarehouse;
        let mut sj = SysJournal::spawn_init(&path, &mut warehouse, false).unwrap();

        let mut tip = TempJournalDTable::new(2, KeyType::U32, None);
        tip.insert(&mut sj, Key::U32(3), Blob::present(*b"z"), false).unwrap();
        tip.insert(&mut sj, Key::U32(1), Blob::present(*b"x"), false).unwrap();

        let mut it = tip.iter();
        it.first();
        assert_eq!(it.key(), Key::U32(1));
        it.next();
        assert_eq!(it.key(), Key::U32(3));

        let _ = std::fs::remove_file(&path);
    }
}
