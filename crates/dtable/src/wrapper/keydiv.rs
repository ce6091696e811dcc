use blob_key::{Blob, Key, KeyType, Metablob, SeekTest, SharedComparator};

use crate::traits::{DTable, DTableIter, SourceId};


/// `keydiv_dtable`: partitions the keyspace into `dividers.len() + 1` disjoint, key-ordered
/// ranges, each served by its own sub-dtable. `dividers[i]` is the first key routed to
/// `parts[i + 1]` (spec.md §4.6: "partitions keyspace by supplied dividers into sub-dtables").
#[derive(Debug)]
pub struct KeydivDTable {
    dividers: Vec<Key>,
    parts:    Vec<Box<dyn DTable>>,
}

impl KeydivDTable {
    /// # Panics
    /// Panics if `parts.len() != dividers.len() + 1`.
    #[must_use]
    pub fn new(dividers: Vec<Key>, parts: Vec<Box<dyn DTable>>) -> Self {
        assert_eq!(parts.len(), dividers.len() + 1, "keydiv_dtable needs one more part than divider");
        Self { dividers, parts }
    }

    fn partition_of(&self, key: &Key) -> usize {
        let comparator = self.parts[0].blob_comparator();
        self.dividers.partition_point(|d| d.cmp_with(key, comparator).is_le())
    }
}

impl DTable for KeydivDTable {
    fn key_type(&self) -> KeyType {
        self.parts[0].key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.parts[0].blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.parts[self.partition_of(key)].lookup(key)
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(ConcatIter { parts: &self.parts, current: 0, inner: None, source: SourceId(std::ptr::from_ref(self) as usize) })
    }

    fn size(&self) -> Option<usize> {
        self.parts.iter().try_fold(0, |acc, p| Some(acc + p.size()?))
    }

    fn maintain(&self) {
        for p in &self.parts {
            p.maintain();
        }
    }
}

/// Walks each partition's sub-iterator in order; since partitions are disjoint, non-overlapping
/// key ranges, this is already a total order without needing a heap-based merge.
struct ConcatIter<'a> {
    parts:   &'a [Box<dyn DTable>],
    current: usize,
    inner:   Option<Box<dyn DTableIter + 'a>>,
    source:  SourceId,
}

impl<'a> ConcatIter<'a> {
    fn advance_to_first_valid(&mut self, reverse: bool) {
        loop {
            let Some(it) = &mut self.inner else { return };
            if it.valid() {
                return;
            }
            if reverse {
                if self.current == 0 {
                    self.inner = None;
                    return;
                }
                self.current -= 1;
            } else {
                self.current += 1;
                if self.current >= self.parts.len() {
                    self.inner = None;
                    return;
                }
            }
            let mut next_it = self.parts[self.current].iter();
            if reverse {
                next_it.last();
            } else {
                next_it.first();
            }
            self.inner = Some(next_it);
        }
    }
}

impl DTableIter for ConcatIter<'_> {
    fn valid(&self) -> bool {
        self.inner.as_ref().is_some_and(|it| it.valid())
    }

    fn first(&mut self) {
        self.current = 0;
        if self.parts.is_empty() {
            self.inner = None;
            return;
        }
        let mut it = self.parts[0].iter();
        it.first();
        self.inner = Some(it);
        self.advance_to_first_valid(false);
    }

    fn last(&mut self) {
        if self.parts.is_empty() {
            self.inner = None;
            return;
        }
        self.current = self.parts.len() - 1;
        let mut it = self.parts[self.current].iter();
        it.last();
        self.inner = Some(it);
        self.advance_to_first_valid(true);
    }

    fn next(&mut self) -> bool {
        if let Some(it) = &mut self.inner {
            if it.next() {
                return true;
            }
        }
        self.advance_to_first_valid(false);
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if let Some(it) = &mut self.inner {
            if it.prev() {
                return true;
            }
        }
        self.advance_to_first_valid(true);
        self.valid()
    }

    fn seek(&mut self, key: &Key) {
        self.current = 0;
        self.inner = None;
        for (i, p) in self.parts.iter().enumerate() {
            self.current = i;
            let mut it = p.iter();
            it.seek(key);
            if it.valid() {
                self.inner = Some(it);
                return;
            }
        }
        self.advance_to_first_valid(false);
    }

    fn seek_test(&mut self, test: &dyn SeekTest) {
        self.current = 0;
        self.inner = None;
        for (i, p) in self.parts.iter().enumerate() {
            self.current = i;
            let mut it = p.iter();
            it.seek_test(test);
            if it.valid() {
                self.inner = Some(it);
                return;
            }
        }
        self.advance_to_first_valid(false);
    }

    fn key(&self) -> Key {
        self.inner.as_ref().expect("key() called on invalid iterator").key()
    }

    fn meta(&self) -> Metablob {
        self.inner.as_ref().expect("meta() called on invalid iterator").meta()
    }

    fn value(&self) -> Blob {
        self.inner.as_ref().expect("value() called on invalid iterator").value()
    }

    fn source(&self) -> SourceId {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::test_support::MemDTable;

    #[test]
    fn lookup_routes_to_the_right_partition() {
        let low = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"lo"))]);
        let high = MemDTable::new(KeyType::U32, vec![(Key::U32(100), Blob::present(*b"hi"))]);
        let table = KeydivDTable::new(vec![Key::U32(50)], vec![Box::new(low), Box::new(high)]);

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"lo"[..]));
        assert_eq!(table.lookup(&Key::U32(100)).1.as_bytes(), Some(&b"hi"[..]));
    }

    #[test]
    fn iteration_walks_partitions_in_key_order() {
        let low = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"a")), (Key::U32(2), Blob::present(*b"b"))]);
        let high = MemDTable::new(KeyType::U32, vec![(Key::U32(100), Blob::present(*b"c"))]);
        let table = KeydivDTable::new(vec![Key::U32(50)], vec![Box::new(low), Box::new(high)]);

        let mut it = table.iter();
        it.first();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key());
            it.next();
        }
        assert_eq!(keys, vec![Key::U32(1), Key::U32(2), Key::U32(100)]);
    }
}
