use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::{self, VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


/// Encodes `value` as the shortest little-endian prefix of its bytes (1 to 4), i.e. the smallest
/// `n` such that the top `4 - n` bytes of `value.to_le_bytes()` are all zero. Used to validate
/// that a four-byte `u32` value is actually storable in `smallint_dtable`'s variable width
/// (spec.md §4.6: "1-4 byte little-endian encoding of a u32").
#[must_use]
fn encode_u32(value: u32) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    let len = (1..=4).find(|&n| bytes[n..].iter().all(|&b| b == 0)).unwrap_or(4);
    bytes[..len].to_vec()
}

fn decode_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    let mut buf = [0_u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    Some(u32::from_le_bytes(buf))
}

/// `smallint_dtable`: stores a `u32` value in 1-4 bytes, the shortest little-endian encoding that
/// round-trips it. Rejects values whose raw bytes don't parse back to a `u32` (e.g. a 5+ byte
/// value, or one that isn't 4 raw LE bytes to begin with) (spec.md §4.6).
#[derive(Debug)]
pub struct SmallintDTable {
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    entries:    Vec<(Key, Blob)>,
}

impl SmallintDTable {
    /// # Errors
    /// Returns [`Error::Rejected`] if a value can't be parsed as a `u32` and nothing upstream
    /// accepts a replacement, or propagates I/O failures persisting the table.
    pub fn create(
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Self> {
        let key_type = source.key_type();
        let entries = support::collect_with_validation(source, shadow, |_key, blob| match blob.as_bytes() {
            None => Ok(blob.clone()),
            Some(bytes) if bytes.len() == 4 => {
                let value = u32::from_le_bytes(bytes.try_into().unwrap());
                Ok(Blob::present(encode_u32(value)))
            }
            Some(bytes) => Err(Blob::present(bytes.to_vec())),
        })?;

        let mut out = vec![key_type.tag()];
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key, blob) in &entries {
            codec::encode_key(&mut out, key);
            codec::encode_blob(&mut out, blob);
        }
        std::fs::write(dir.join(format!("{name}.smallint")), out)?;

        Ok(Self { key_type, comparator, entries })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Self> {
        let path = dir.join(format!("{name}.smallint"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated smallint_dtable header");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let count = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 5;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?;
            let blob = codec::decode_blob(&data, &mut offset).ok_or_else(err)?;
            entries.push((key, blob));
        }

        Ok(Self { key_type, comparator, entries })
    }

    fn decoded(blob: &Blob) -> Blob {
        match blob.as_bytes() {
            Some(bytes) => decode_u32(bytes).map_or_else(|| blob.clone(), |v| Blob::present(v.to_le_bytes().to_vec())),
            None => blob.clone(),
        }
    }
}

impl DTable for SmallintDTable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.comparator.as_ref()
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        let (found, blob) = lookup_sorted_with(&self.entries, key, self.comparator.as_ref());
        (found, Self::decoded(&blob))
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(DecodingIter {
            inner: VecIter::with_comparator(
                &self.entries,
                SourceId(std::ptr::from_ref(self) as usize),
                self.comparator.clone(),
            ),
        })
    }

    fn size(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

struct DecodingIter<'a> {
    inner: VecIter<'a>,
}

impl DTableIter for DecodingIter<'_> {
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

    fn seek_test(&mut self, test: &dyn blob_key::SeekTest) {
        self.inner.seek_test(test);
    }

    fn key(&self) -> Key {
        self.inner.key()
    }

    fn meta(&self) -> blob_key::Metablob {
        self.inner.meta()
    }

    fn value(&self) -> Blob {
        SmallintDTable::decoded(&self.inner.value())
    }

    fn source(&self) -> SourceId {
        self.inner.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::test_support::MemDTable;

    #[test]
    fn values_round_trip_at_their_shortest_encoding() {
        let dir = std::env::temp_dir().join(format!("smallint-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemDTable::new(
            KeyType::U32,
            vec![
                (Key::U32(1), Blob::present(7_u32.to_le_bytes().to_vec())),
                (Key::U32(2), Blob::present(70_000_u32.to_le_bytes().to_vec())),
            ],
        );
        let table = SmallintDTable::create(&dir, "lvl", None, &source, None).unwrap();
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&7_u32.to_le_bytes()[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&70_000_u32.to_le_bytes()[..]));

        let reopened = SmallintDTable::open(&dir, "lvl", None).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(2)).1.as_bytes(), Some(&70_000_u32.to_le_bytes()[..]));
    }

    #[test]
    fn non_u32_value_is_rejected() {
        let dir = std::env::temp_dir().join(format!("smallint-dtable-test-reject-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"notfour!"))]);
        let err = SmallintDTable::create(&dir, "bad", None, &source, None).unwrap_err();
        assert!(matches!(err, Error::Rejected));
    }
}
