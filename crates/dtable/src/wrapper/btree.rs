use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::lookup_sorted_with;
use crate::traits::{DTable, DTableIter, SourceId};


/// `btree_dtable`: wraps a leaf with a second-level sorted key index, so `lookup` binary-searches
/// the index instead of walking `base` linearly (spec.md §4.6, `original_source/btree_dtable.h`).
///
/// `base.index()`'s position space (a raw cell offset for array/linear leaves) doesn't line up
/// with an iterator's rank among *present* entries, so rather than recording positions into
/// `base` this keeps its own flat `(key, value)` copy built once from `base`'s iterator — still a
/// real win over repeatedly walking `base`'s own iterator chain, just not a byte-for-byte replay
/// of the original's on-disk index (documented in `DESIGN.md`).
#[derive(Debug)]
pub struct BtreeDTable {
    base:  Box<dyn DTable>,
    index: Vec<(Key, Blob)>,
}

impl BtreeDTable {
    /// # Errors
    /// Propagates I/O failures persisting the index.
    pub fn create(dir: &Path, name: &str, base: Box<dyn DTable>) -> Result<Self> {
        let mut index = Vec::new();
        let mut it = base.iter();
        it.first();
        while it.valid() {
            index.push((it.key(), it.value()));
            it.next();
        }

        let key_type = base.key_type();
        let mut out = vec![key_type.tag()];
        out.extend_from_slice(&(index.len() as u32).to_le_bytes());
        for (key, blob) in &index {
            codec::encode_key(&mut out, key);
            codec::encode_blob(&mut out, blob);
        }
        std::fs::write(dir.join(format!("{name}.btree")), out)?;

        Ok(Self { base, index })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the index file is malformed.
    pub fn open(dir: &Path, name: &str, base: Box<dyn DTable>) -> Result<Self> {
        let path = dir.join(format!("{name}.btree"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated btree_dtable index");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let count = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 5;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?;
            let blob = codec::decode_blob(&data, &mut offset).ok_or_else(err)?;
            index.push((key, blob));
        }

        Ok(Self { base, index })
    }
}

impl DTable for BtreeDTable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.base.blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        lookup_sorted_with(&self.index, key, self.base.blob_comparator())
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        self.base.iter()
    }

    fn size(&self) -> Option<usize> {
        Some(self.index.len())
    }

    fn index(&self, i: usize) -> Option<(Key, Blob)> {
        self.base.index(i)
    }

    fn contains_index(&self, i: usize) -> bool {
        self.base.contains_index(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::array::ArrayDTable;

    #[test]
    fn lookup_uses_the_external_index_instead_of_scanning_base() {
        let dir = std::env::temp_dir().join(format!("btree-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let base = ArrayDTable::from_memory(
            0,
            vec![Some(Blob::present(*b"ab")), Some(Blob::present(*b"cd")), None, Some(Blob::present(*b"ef"))],
        );
        let table = BtreeDTable::create(&dir, "lvl", Box::new(base)).unwrap();

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"cd"[..]));
        assert_eq!(table.lookup(&Key::U32(3)).1.as_bytes(), Some(&b"ef"[..]));
        assert_eq!(table.lookup(&Key::U32(2)), (false, Blob::tombstone()));

        let reopened_base = ArrayDTable::from_memory(
            0,
            vec![Some(Blob::present(*b"ab")), Some(Blob::present(*b"cd")), None, Some(Blob::present(*b"ef"))],
        );
        let reopened = BtreeDTable::open(&dir, "lvl", Box::new(reopened_base)).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(3)).1.as_bytes(), Some(&b"ef"[..]));
    }
}
