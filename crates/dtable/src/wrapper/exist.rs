use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::traits::{DTable, DTableIter, SourceId};


/// `exist_dtable`: an existence-only wrapper. `present()` is served entirely from a bitmap built
/// at `create` time; `lookup`/`iter` fall through to `base` only when a caller actually wants the
/// bytes (`original_source/exist_dtable.h`, not detailed in spec.md §4.6's table).
#[derive(Debug)]
pub struct ExistDTable {
    base:   Box<dyn DTable>,
    sorted: Vec<Key>,
}

impl ExistDTable {
    /// # Errors
    /// Propagates I/O failures persisting the bitmap's key list.
    pub fn create(dir: &Path, name: &str, base: Box<dyn DTable>) -> Result<Self> {
        let mut sorted = Vec::new();
        let mut it = base.iter();
        it.first();
        while it.valid() {
            if it.value().exists() {
                sorted.push(it.key());
            }
            it.next();
        }

        let key_type = base.key_type();
        let mut out = vec![key_type.tag()];
        out.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
        for key in &sorted {
            codec::encode_key(&mut out, key);
        }
        std::fs::write(dir.join(format!("{name}.exist")), out)?;

        Ok(Self { base, sorted })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the bitmap's key list is malformed.
    pub fn open(dir: &Path, name: &str, base: Box<dyn DTable>) -> Result<Self> {
        let path = dir.join(format!("{name}.exist"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated exist_dtable key list");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let count = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 5;
        let mut sorted = Vec::with_capacity(count);
        for _ in 0..count {
            sorted.push(codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?);
        }

        Ok(Self { base, sorted })
    }

    fn contains(&self, key: &Key) -> bool {
        let comparator = self.base.blob_comparator();
        self.sorted.binary_search_by(|k| k.cmp_with(key, comparator)).is_ok()
    }
}

impl DTable for ExistDTable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.base.blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.base.lookup(key)
    }

    fn present(&self, key: &Key) -> (bool, bool) {
        let exists = self.contains(key);
        (exists, exists)
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        self.base.iter()
    }

    fn size(&self) -> Option<usize> {
        Some(self.sorted.len())
    }

    fn maintain(&self) {
        self.base.maintain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::test_support::MemDTable;

    #[test]
    fn present_uses_the_bitmap_lookup_falls_through_to_base() {
        let dir = std::env::temp_dir().join(format!("exist-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let base = MemDTable::new(
            KeyType::U32,
            vec![(Key::U32(1), Blob::present(*b"v")), (Key::U32(2), Blob::tombstone())],
        );
        let table = ExistDTable::create(&dir, "lvl", Box::new(base)).unwrap();

        assert_eq!(table.present(&Key::U32(1)), (true, true));
        assert_eq!(table.present(&Key::U32(2)), (false, false));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"v"[..]));
    }
}
