use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};
use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::traits::{DTable, DTableIter, SourceId};


const DEFAULT_BITS: usize = 8 * 1024 * 8;
const DEFAULT_K: u32 = 4;

/// `bloom_dtable`: a sibling bit-vector that lets `lookup` short-circuit misses without
/// consulting `base` (spec.md §4.6). Never used to answer a hit: a filter match always falls
/// through to the base lookup.
#[derive(Debug)]
pub struct BloomDTable {
    base: Box<dyn DTable>,
    bits: Vec<u8>,
    k:    u32,
}

fn key_bytes(key: &Key) -> Vec<u8> {
    match key {
        Key::U32(k) => k.to_le_bytes().to_vec(),
        Key::F64(k) => k.to_le_bytes().to_vec(),
        Key::Str(s) => s.as_bytes().to_vec(),
        Key::Blob(b) => b.to_vec(),
    }
}

fn bit_indices(key: &Key, k: u32, nbits: usize) -> impl Iterator<Item = usize> {
    let mut hasher = Md5::new();
    hasher.update(key_bytes(key));
    let digest = hasher.finalize();
    (0..k).map(move |i| {
        let start = (i as usize * 4) % 13;
        let chunk: [u8; 4] = digest[start..start + 4].try_into().unwrap();
        u32::from_le_bytes(chunk) as usize % nbits
    })
}

fn set_bit(bits: &mut [u8], i: usize) {
    bits[i / 8] |= 1 << (i % 8);
}

fn test_bit(bits: &[u8], i: usize) -> bool {
    bits[i / 8] & (1 << (i % 8)) != 0
}

impl BloomDTable {
    /// # Errors
    /// Propagates I/O failures persisting the sibling bit vector.
    pub fn create(dir: &Path, name: &str, base: Box<dyn DTable>, bits_len: Option<usize>, k: Option<u32>) -> Result<Self> {
        let nbits = bits_len.unwrap_or(DEFAULT_BITS);
        let k = k.unwrap_or(DEFAULT_K);
        let mut bits = vec![0_u8; nbits.div_ceil(8)];

        let mut it = base.iter();
        it.first();
        while it.valid() {
            let key = it.key();
            for i in bit_indices(&key, k, nbits) {
                set_bit(&mut bits, i);
            }
            it.next();
        }

        let mut out = Vec::with_capacity(bits.len() + 8);
        out.extend_from_slice(&(nbits as u32).to_le_bytes());
        out.extend_from_slice(&k.to_le_bytes());
        out.extend_from_slice(&bits);
        std::fs::write(dir.join(format!("{name}.bloom")), out)?;

        Ok(Self { base, bits, k })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the sibling bit vector is malformed.
    pub fn open(dir: &Path, name: &str, base: Box<dyn DTable>) -> Result<Self> {
        let path = dir.join(format!("{name}.bloom"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated bloom_dtable header");
        let nbits = u32::from_le_bytes(data.get(0..4).ok_or_else(err)?.try_into().unwrap()) as usize;
        let k = u32::from_le_bytes(data.get(4..8).ok_or_else(err)?.try_into().unwrap());
        let bits = data.get(8..8 + nbits.div_ceil(8)).ok_or_else(err)?.to_vec();
        Ok(Self { base, bits, k })
    }

    fn might_contain(&self, key: &Key) -> bool {
        let nbits = self.bits.len() * 8;
        bit_indices(key, self.k, nbits).all(|i| test_bit(&self.bits, i))
    }
}

impl DTable for BloomDTable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.base.blob_comparator()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        if !self.might_contain(key) {
            return (false, Blob::tombstone());
        }
        self.base.lookup(key)
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

    fn maintain(&self) {
        self.base.maintain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::test_support::MemDTable;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("bloom-dtable-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn absent_key_short_circuits_without_consulting_base() {
        let dir = temp_dir("miss");
        let base = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"a"))]);
        let table = BloomDTable::create(&dir, "lvl", Box::new(base), None, None).unwrap();

        // Many keys genuinely absent from a one-entry filter should test negative.
        let mut misses = 0;
        for candidate in 1000..1050u32 {
            if !table.might_contain(&Key::U32(candidate)) {
                misses += 1;
            }
        }
        assert!(misses > 0);
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"a"[..]));
    }

    #[test]
    fn present_key_always_found() {
        let dir = temp_dir("hit");
        let base = MemDTable::new(
            KeyType::U32,
            (0..200).map(|i| (Key::U32(i), Blob::present(i.to_le_bytes().to_vec()))).collect(),
        );
        let table = BloomDTable::create(&dir, "lvl", Box::new(base), None, None).unwrap();
        for i in 0..200u32 {
            assert!(table.lookup(&Key::U32(i)).0);
        }

        let reopened_base = MemDTable::new(
            KeyType::U32,
            (0..200).map(|i| (Key::U32(i), Blob::present(i.to_le_bytes().to_vec()))).collect(),
        );
        let reopened = BloomDTable::open(&dir, "lvl", Box::new(reopened_base)).unwrap();
        assert!(reopened.lookup(&Key::U32(42)).0);
    }
}
