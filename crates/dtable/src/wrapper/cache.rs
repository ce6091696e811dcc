use blob_key::{Blob, Key, KeyType, SharedComparator};
use quick_cache::sync::Cache;

use crate::codec;
use crate::traits::{DTable, DTableIter, SourceId};


const DEFAULT_CAPACITY: usize = 1024;

/// `cache_dtable`: a process-private LRU over `base`'s `lookup` results (spec.md §4.6). Pure
/// read-through: a miss queries `base` and populates the cache, a hit never touches `base`.
///
/// [`Key`] carries an `f64` variant and so has no `Eq`/`Hash` impl; the cache is keyed on the
/// key's encoded bytes instead.
#[derive(Debug)]
pub struct CacheDTable {
    base:  Box<dyn DTable>,
    cache: Cache<Vec<u8>, (bool, Blob)>,
}

impl CacheDTable {
    #[must_use]
    pub fn new(base: Box<dyn DTable>, capacity: Option<usize>) -> Self {
        Self { base, cache: Cache::new(capacity.unwrap_or(DEFAULT_CAPACITY)) }
    }
}

impl DTable for CacheDTable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.base.blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        let mut cache_key = Vec::new();
        codec::encode_key(&mut cache_key, key);
        if let Some(hit) = self.cache.get(&cache_key) {
            return hit;
        }
        let result = self.base.lookup(key);
        self.cache.insert(cache_key, result.clone());
        result
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        self.base.iter()
    }

    fn size(&self) -> Option<usize> {
        self.base.size()
    }

    fn index(&self, i: usize) -> Option<(Key, Blob)> {
        self.base.index(i)
    }

    fn contains_index(&self, i: usize) -> bool {
        self.base.contains_index(i)
    }

    /// Drops every cached entry. `base`'s own `maintain` runs first so a stale miss isn't
    /// immortalized by this wrapper outliving the underlying data's own refresh.
    fn maintain(&self) {
        self.base.maintain();
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::test_support::MemDTable;

    #[derive(Debug)]
    struct CountingDTable {
        inner: MemDTable,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl DTable for CountingDTable {
        fn key_type(&self) -> KeyType {
            self.inner.key_type()
        }
        fn lookup(&self, key: &Key) -> (bool, Blob) {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.lookup(key)
        }
        fn iter(&self) -> Box<dyn DTableIter + '_> {
            self.inner.iter()
        }
    }

    #[test]
    fn repeated_lookups_hit_the_cache_not_base() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let inner = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"v"))]);
        let counting = CountingDTable { inner, calls: calls.clone() };
        let table = CacheDTable::new(Box::new(counting), None);

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"v"[..]));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"v"[..]));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"v"[..]));

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
