use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::error::Result;
use crate::support;
use crate::traits::{DTable, DTableIter, SourceId};


const DEFAULT_WINDOW: usize = 4096;

/// `uniq_dtable`: deduplicates values within a sliding window of the last `window` distinct
/// values seen while building the table, storing each key as an index into a value dictionary
/// rather than the value itself (spec.md §4.6). Both halves are stored together here rather than
/// as two sibling dtables, which is a deliberate simplification — see `DESIGN.md`.
#[derive(Debug)]
pub struct UniqDTable {
    key_type: KeyType,
    keys:     Vec<(Key, u32)>,
    values:   Vec<Blob>,
}

impl UniqDTable {
    /// # Errors
    /// Propagates I/O failures persisting the table.
    pub fn create(
        dir:    &Path,
        name:   &str,
        window: Option<usize>,
        source: &dyn DTable,
        shadow: Option<&dyn DTable>,
    ) -> Result<Self> {
        let key_type = source.key_type();
        let entries = support::collect_with_shadow(source, shadow);
        let window = window.unwrap_or(DEFAULT_WINDOW);

        let mut values: Vec<Blob> = Vec::new();
        // Sliding window of the last `window` distinct values' positions in `values`, in
        // most-recently-used order, so repeated values within the window reuse their slot.
        let mut recent: Vec<(Vec<u8>, u32)> = Vec::new();
        let mut keys = Vec::with_capacity(entries.len());

        for (key, blob) in &entries {
            let bytes = blob.as_bytes().map(<[u8]>::to_vec);
            let idx = if let Some(bytes) = &bytes {
                if let Some(pos) = recent.iter().position(|(v, _)| v == bytes) {
                    let (_, idx) = recent.remove(pos);
                    recent.push((bytes.clone(), idx));
                    idx
                } else {
                    #[expect(clippy::cast_possible_truncation, reason = "value counts stay well under u32")]
                    let idx = values.len() as u32;
                    values.push(blob.clone());
                    recent.push((bytes.clone(), idx));
                    if recent.len() > window {
                        recent.remove(0);
                    }
                    idx
                }
            } else {
                u32::MAX
            };
            keys.push((key.clone(), idx));
        }

        let table = Self { key_type, keys, values };
        table.write_to(dir, name)?;
        Ok(table)
    }

    fn write_to(&self, dir: &Path, name: &str) -> Result<()> {
        let mut out = Vec::new();
        out.push(self.key_type.tag());
        out.extend_from_slice(&(self.keys.len() as u32).to_le_bytes());
        for (key, idx) in &self.keys {
            crate::codec::encode_key(&mut out, key);
            out.extend_from_slice(&idx.to_le_bytes());
        }
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for value in &self.values {
            crate::codec::encode_blob(&mut out, value);
        }
        std::fs::write(dir.join(format!("{name}.uniq")), out)?;
        Ok(())
    }

    /// # Errors
    /// Returns [`crate::Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        use crate::error::Error;
        let path = dir.join(format!("{name}.uniq"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated uniq_dtable header");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let key_count = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 5;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let key = crate::codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?;
            let idx = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap());
            offset += 4;
            keys.push((key, idx));
        }

        let value_count = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap()) as usize;
        offset += 4;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(crate::codec::decode_blob(&data, &mut offset).ok_or_else(err)?);
        }

        Ok(Self { key_type, keys, values })
    }

    fn entries(&self) -> Vec<(Key, Blob)> {
        self.keys
            .iter()
            .map(|(k, idx)| {
                let blob = if *idx == u32::MAX { Blob::tombstone() } else { self.values[*idx as usize].clone() };
                (k.clone(), blob)
            })
            .collect()
    }

    /// Number of distinct stored values, for tests and diagnostics.
    #[must_use]
    pub fn distinct_value_count(&self) -> usize {
        self.values.len()
    }
}

impl DTable for UniqDTable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn blob_comparator(&self) -> Option<&SharedComparator> {
        None
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        match self.keys.binary_search_by(|(k, _)| k.natural_cmp(key)) {
            Ok(i) => {
                let (_, idx) = self.keys[i];
                (true, if idx == u32::MAX { Blob::tombstone() } else { self.values[idx as usize].clone() })
            }
            Err(_) => (false, Blob::tombstone()),
        }
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        // The materialized view is rebuilt per-call; acceptable since `uniq` sits over already
        // small leaf tables in this design (see `DESIGN.md`).
        let entries = self.entries();
        Box::new(OwnedVecIter::new(entries, SourceId(std::ptr::from_ref(self) as usize)))
    }

    fn size(&self) -> Option<usize> {
        Some(self.keys.len())
    }
}

/// Like [`VecIter`] but owns its entries, needed because `uniq`'s logical view is materialized
/// on demand rather than stored contiguously.
#[derive(Debug)]
struct OwnedVecIter {
    entries: Vec<(Key, Blob)>,
    pos:     Option<usize>,
    source:  SourceId,
}

impl OwnedVecIter {
    fn new(entries: Vec<(Key, Blob)>, source: SourceId) -> Self {
        Self { entries, pos: None, source }
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
        self.pos = Some(self.entries.partition_point(|(k, _)| k.natural_cmp(key).is_lt()));
    }

    fn seek_test(&mut self, test: &dyn blob_key::SeekTest) {
        self.pos = Some(self.entries.partition_point(|(k, _)| test.test(k).is_lt()));
    }

    fn key(&self) -> Key {
        self.entries[self.pos.expect("key() called on invalid iterator")].0.clone()
    }

    fn meta(&self) -> blob_key::Metablob {
        self.entries[self.pos.expect("meta() called on invalid iterator")].1.meta()
    }

    fn value(&self) -> Blob {
        self.entries[self.pos.expect("value() called on invalid iterator")].1.clone()
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
    fn shared_values_across_many_keys_deduplicate() {
        let dir = std::env::temp_dir().join(format!("uniq-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let entries: Vec<_> =
            (0..50u32).map(|i| (Key::U32(i), Blob::present(if i % 2 == 0 { *b"even" } else { *b"odd_" }))).collect();
        let source = MemDTable::new(KeyType::U32, entries.clone());
        let table = UniqDTable::create(&dir, "lvl", None, &source, None).unwrap();

        assert_eq!(table.distinct_value_count(), 2);
        for (key, blob) in &entries {
            assert_eq!(table.lookup(key).1.as_bytes(), blob.as_bytes());
        }

        let reopened = UniqDTable::open(&dir, "lvl").unwrap();
        assert_eq!(reopened.distinct_value_count(), 2);
        assert_eq!(reopened.lookup(&Key::U32(7)).1.as_bytes(), Some(&b"odd_"[..]));
    }
}
