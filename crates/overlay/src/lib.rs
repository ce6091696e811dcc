//! `overlay_dtable`: stateless composition over an ordered list of dtables, newest first
//! (spec.md §4.8). Grounded on `anchored-leveldb`'s merging iterator over the memtable and
//! sstable levels of a `Version`, adapted to the generic `DTable`/`DTableIter` contract.

use blob_key::{Blob, Key, Metablob, SeekTest, SharedComparator};
use dtable::{DTable, DTableIter, SourceId};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Composes `layers` (newest at index 0) into one logical sorted view. `lookup` stops at the
/// first layer that reports the key present at all, existent or not — a tombstone in a newer
/// layer shadows any value in an older one and is itself reported as a miss.
#[derive(Debug)]
pub struct OverlayDTable {
    layers: Vec<Box<dyn DTable>>,
}

impl OverlayDTable {
    #[must_use]
    pub fn new(layers: Vec<Box<dyn DTable>>) -> Self {
        Self { layers }
    }

    #[must_use]
    pub fn layers(&self) -> &[Box<dyn DTable>] {
        &self.layers
    }
}

impl DTable for OverlayDTable {
    fn key_type(&self) -> blob_key::KeyType {
        self.layers[0].key_type()
    }

    fn blob_comparator(&self) -> Option<&blob_key::SharedComparator> {
        self.layers.first().and_then(|l| l.blob_comparator())
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        for layer in &self.layers {
            let (found, blob) = layer.lookup(key);
            if found {
                return (blob.exists(), blob);
            }
        }
        (false, Blob::tombstone())
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(OverlayIter::new(
            self.layers.iter().map(|l| l.iter()).collect(),
            self.blob_comparator().cloned(),
        ))
    }

    fn maintain(&self) {
        for layer in &self.layers {
            layer.maintain();
        }
    }
}

/// One sub-iterator per layer, plus per-layer `valid`/`shadow` state and a direction sentinel
/// (spec.md §4.8). `shadow[i]` is set when layer `i` is positioned at the same key as the
/// winning (newest) layer this step — it still advances in lockstep with the winner, but its
/// value is not the one reported.
struct OverlayIter<'a> {
    iters:      Vec<Box<dyn DTableIter + 'a>>,
    valid:      Vec<bool>,
    shadow:     Vec<bool>,
    direction:  Direction,
    winner:     Option<usize>,
    key:        Option<Key>,
    comparator: Option<SharedComparator>,
}

impl<'a> OverlayIter<'a> {
    fn new(iters: Vec<Box<dyn DTableIter + 'a>>, comparator: Option<SharedComparator>) -> Self {
        let n = iters.len();
        Self {
            iters,
            valid: vec![false; n],
            shadow: vec![false; n],
            direction: Direction::Forward,
            winner: None,
            key: None,
            comparator,
        }
    }

    fn find_extreme(&mut self, want_smallest: bool) {
        self.valid = self.iters.iter().map(|it| it.valid()).collect();
        let mut winner = None;
        for i in 0..self.iters.len() {
            if !self.valid[i] {
                continue;
            }
            winner = Some(match winner {
                None => i,
                Some(w) => {
                    let cmp = self.iters[i].key().cmp_with(&self.iters[w].key(), self.comparator.as_ref());
                    if (want_smallest && cmp.is_lt()) || (!want_smallest && cmp.is_gt()) { i } else { w }
                }
            });
        }
        self.winner = winner;
        self.key = winner.map(|i| self.iters[i].key());
        self.shadow = vec![false; self.iters.len()];
        if let (Some(w), Some(key)) = (winner, &self.key) {
            for i in 0..self.iters.len() {
                if i != w && self.valid[i] && self.iters[i].key().cmp_with(key, self.comparator.as_ref()).is_eq() {
                    self.shadow[i] = true;
                }
            }
        }
    }

    /// Repositions every sub-iterator so it's consistent with `new_direction`, without changing
    /// the logical current key. Needed because a forward-primed iterator (positioned at the
    /// first key `>= target`) and a backward-primed one (positioned at the last key
    /// `<= target`) land on different underlying positions whenever a layer lacks the current
    /// key (spec.md §4.8: "reversing direction re-primes every sub-iterator").
    fn reprime(&mut self, new_direction: Direction) {
        if self.direction == new_direction {
            return;
        }
        if let Some(key) = self.key.clone() {
            for it in &mut self.iters {
                it.seek(&key);
                if new_direction == Direction::Backward
                    && !(it.valid() && it.key().cmp_with(&key, self.comparator.as_ref()).is_eq())
                {
                    it.prev();
                }
            }
        }
        self.direction = new_direction;
        self.find_extreme(new_direction == Direction::Forward);
    }
}

impl DTableIter for OverlayIter<'_> {
    fn valid(&self) -> bool {
        self.winner.is_some()
    }

    fn first(&mut self) {
        for it in &mut self.iters {
            it.first();
        }
        self.direction = Direction::Forward;
        self.find_extreme(true);
    }

    fn last(&mut self) {
        for it in &mut self.iters {
            it.last();
        }
        self.direction = Direction::Backward;
        self.find_extreme(false);
    }

    fn next(&mut self) -> bool {
        self.reprime(Direction::Forward);
        if let Some(key) = self.key.clone() {
            for i in 0..self.iters.len() {
                if self.valid[i] && self.iters[i].key().cmp_with(&key, self.comparator.as_ref()).is_eq() {
                    self.iters[i].next();
                }
            }
        }
        self.find_extreme(true);
        self.valid()
    }

    fn prev(&mut self) -> bool {
        self.reprime(Direction::Backward);
        if let Some(key) = self.key.clone() {
            for i in 0..self.iters.len() {
                if self.valid[i] && self.iters[i].key().cmp_with(&key, self.comparator.as_ref()).is_eq() {
                    self.iters[i].prev();
                }
            }
        }
        self.find_extreme(false);
        self.valid()
    }

    fn seek(&mut self, key: &Key) {
        for it in &mut self.iters {
            it.seek(key);
        }
        self.direction = Direction::Forward;
        self.find_extreme(true);
    }

    fn seek_test(&mut self, test: &dyn SeekTest) {
        for it in &mut self.iters {
            it.seek_test(test);
        }
        self.direction = Direction::Forward;
        self.find_extreme(true);
    }

    fn key(&self) -> Key {
        self.key.clone().expect("key() called on invalid overlay iterator")
    }

    fn meta(&self) -> Metablob {
        self.iters[self.winner.expect("meta() called on invalid overlay iterator")].meta()
    }

    fn value(&self) -> Blob {
        self.iters[self.winner.expect("value() called on invalid overlay iterator")].value()
    }

    fn source(&self) -> SourceId {
        self.iters[self.winner.expect("source() called on invalid overlay iterator")].source()
    }

    fn reject(&mut self, candidate: &Blob) -> Option<Blob> {
        self.iters[self.winner?].reject(candidate)
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use blob_key::{BlobComparator, KeyType};
    use dtable::support::{VecIter, lookup_sorted_with};

    use super::*;

    /// A trivial in-memory [`DTable`], standing in for a real leaf format in these tests.
    #[derive(Debug)]
    struct MemDTable {
        key_type:   KeyType,
        entries:    Vec<(Key, Blob)>,
        comparator: Option<SharedComparator>,
    }

    impl MemDTable {
        fn new(key_type: KeyType, mut entries: Vec<(Key, Blob)>) -> Self {
            entries.sort_by(|a, b| a.0.natural_cmp(&b.0));
            Self { key_type, entries, comparator: None }
        }

        fn with_comparator(key_type: KeyType, mut entries: Vec<(Key, Blob)>, comparator: SharedComparator) -> Self {
            entries.sort_by(|a, b| a.0.cmp_with(&b.0, Some(&comparator)));
            Self { key_type, entries, comparator: Some(comparator) }
        }
    }

    impl DTable for MemDTable {
        fn key_type(&self) -> KeyType {
            self.key_type
        }

        fn blob_comparator(&self) -> Option<&SharedComparator> {
            self.comparator.as_ref()
        }

        fn lookup(&self, key: &Key) -> (bool, Blob) {
            lookup_sorted_with(&self.entries, key, self.comparator.as_ref())
        }

        fn iter(&self) -> Box<dyn DTableIter + '_> {
            Box::new(VecIter::with_comparator(
                &self.entries,
                SourceId(std::ptr::from_ref(self) as usize),
                self.comparator.clone(),
            ))
        }

        fn size(&self) -> Option<usize> {
            Some(self.entries.len())
        }
    }

    #[derive(Debug)]
    struct ReverseComparator;

    impl BlobComparator for ReverseComparator {
        fn name(&self) -> &str {
            "reverse"
        }

        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    fn collect_forward(table: &OverlayDTable) -> Vec<(Key, Vec<u8>)> {
        let mut it = table.iter();
        it.first();
        let mut out = Vec::new();
        while it.valid() {
            out.push((it.key(), it.value().as_bytes().unwrap_or_default().to_vec()));
            it.next();
        }
        out
    }

    fn collect_backward(table: &OverlayDTable) -> Vec<(Key, Vec<u8>)> {
        let mut it = table.iter();
        it.last();
        let mut out = Vec::new();
        while it.valid() {
            out.push((it.key(), it.value().as_bytes().unwrap_or_default().to_vec()));
            it.prev();
        }
        out
    }

    #[test]
    fn lookup_prefers_newest_layer_and_stops_at_a_tombstone() {
        let newest = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::tombstone())]);
        let older = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"old")), (Key::U32(2), Blob::present(*b"only-old"))]);
        let table = OverlayDTable::new(vec![Box::new(newest), Box::new(older)]);

        assert_eq!(table.lookup(&Key::U32(1)), (false, Blob::tombstone()));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"only-old"[..]));
        assert_eq!(table.lookup(&Key::U32(9)), (false, Blob::tombstone()));
    }

    #[test]
    fn iteration_merges_layers_newest_wins_on_duplicate_keys() {
        let newest = MemDTable::new(KeyType::U32, vec![(Key::U32(2), Blob::present(*b"new"))]);
        let older = MemDTable::new(
            KeyType::U32,
            vec![(Key::U32(1), Blob::present(*b"a")), (Key::U32(2), Blob::present(*b"stale")), (Key::U32(3), Blob::present(*b"b"))],
        );
        let table = OverlayDTable::new(vec![Box::new(newest), Box::new(older)]);

        let forward = collect_forward(&table);
        assert_eq!(
            forward,
            vec![(Key::U32(1), b"a".to_vec()), (Key::U32(2), b"new".to_vec()), (Key::U32(3), b"b".to_vec())]
        );
    }

    #[test]
    fn reversing_direction_mid_scan_still_yields_newest_wins() {
        let newest = MemDTable::new(KeyType::U32, vec![(Key::U32(2), Blob::present(*b"new"))]);
        let older = MemDTable::new(
            KeyType::U32,
            vec![(Key::U32(1), Blob::present(*b"a")), (Key::U32(2), Blob::present(*b"stale")), (Key::U32(3), Blob::present(*b"b"))],
        );
        let table = OverlayDTable::new(vec![Box::new(newest), Box::new(older)]);

        let mut it = table.iter();
        it.first();
        assert_eq!(it.key(), Key::U32(1));
        it.next();
        assert_eq!(it.key(), Key::U32(2));
        it.next();
        assert_eq!(it.key(), Key::U32(3));
        it.prev();
        assert_eq!(it.key(), Key::U32(2));
        assert_eq!(it.value().as_bytes(), Some(&b"new"[..]));
        it.prev();
        assert_eq!(it.key(), Key::U32(1));

        let backward = collect_backward(&table);
        assert_eq!(
            backward,
            vec![(Key::U32(3), b"b".to_vec()), (Key::U32(2), b"new".to_vec()), (Key::U32(1), b"a".to_vec())]
        );
    }

    #[test]
    fn reverse_comparator_reverses_blob_key_iteration_order() {
        let comparator: SharedComparator = std::sync::Arc::new(ReverseComparator);
        let entries = vec![
            (Key::Blob(std::sync::Arc::from(&b"a"[..])), Blob::present(*b"1")),
            (Key::Blob(std::sync::Arc::from(&b"b"[..])), Blob::present(*b"2")),
            (Key::Blob(std::sync::Arc::from(&b"c"[..])), Blob::present(*b"3")),
        ];
        let layer = MemDTable::with_comparator(KeyType::Blob, entries, comparator);
        let table = OverlayDTable::new(vec![Box::new(layer)]);

        let forward = collect_forward(&table);
        assert_eq!(
            forward,
            vec![
                (Key::Blob(std::sync::Arc::from(&b"c"[..])), b"3".to_vec()),
                (Key::Blob(std::sync::Arc::from(&b"b"[..])), b"2".to_vec()),
                (Key::Blob(std::sync::Arc::from(&b"a"[..])), b"1".to_vec()),
            ]
        );
    }
}
