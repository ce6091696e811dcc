use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::{self, VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


const DEFAULT_SKIP: usize = 16;
const TAG_REFERENCE: u8 = 0;
const TAG_DELTA: u8 = 1;

/// Reverses the encoding applied by `create`: `encoded[i]` holds either a tombstone, a full
/// reference value (when `i % skip == 0`), or a delta against the nearest earlier reference.
fn decode_entries(skip: usize, encoded: &[(Key, Blob)]) -> Vec<(Key, Blob)> {
    let mut references: Vec<u32> = vec![0; encoded.len()];
    encoded
        .iter()
        .enumerate()
        .map(|(i, (key, blob))| {
            let Some(bytes) = blob.as_bytes() else { return (key.clone(), Blob::tombstone()) };
            let value = if i % skip == 0 {
                let value = u32::from_le_bytes(bytes.try_into().expect("reference is always 4 bytes"));
                references[i] = value;
                value
            } else {
                let reference = references[(i / skip) * skip];
                let delta = i32::from_le_bytes(bytes.try_into().expect("delta is always 4 bytes"));
                (i64::from(reference) + i64::from(delta)) as u32
            };
            (key.clone(), Blob::present(value.to_le_bytes().to_vec()))
        })
        .collect()
}

/// `deltaint_dtable`: stores a `u32` value as a delta against a reference stream sampled every
/// `skip` entries (by position in sorted order), so every `skip`-th value is stored in full and
/// the rest as a signed offset from it. Rejects when a delta overflows `i32` (spec.md §4.6).
#[derive(Debug)]
pub struct DeltaintDTable {
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    skip:       usize,
    entries:    Vec<(Key, Blob)>,
}

impl DeltaintDTable {
    /// # Errors
    /// Returns [`Error::Rejected`] if a delta overflows `i32` and nothing upstream accepts a
    /// replacement, or propagates I/O failures persisting the table.
    pub fn create(
        dir:        &Path,
        name:       &str,
        skip:       Option<usize>,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Self> {
        let key_type = source.key_type();
        let skip = skip.unwrap_or(DEFAULT_SKIP).max(1);

        let mut pos = 0_usize;
        let mut references: Vec<u32> = Vec::new();
        let entries = support::collect_with_validation(source, shadow, |_key, blob| {
            let is_reference = pos % skip == 0;
            let result = match blob.as_bytes() {
                None => Ok(blob.clone()),
                Some(bytes) if is_reference => match <[u8; 4]>::try_from(bytes) {
                    Ok(raw) => {
                        references.push(u32::from_le_bytes(raw));
                        Ok(blob.clone())
                    }
                    Err(_) => Err(blob.clone()),
                },
                Some(bytes) => match <[u8; 4]>::try_from(bytes) {
                    Ok(raw) => {
                        let value = u32::from_le_bytes(raw);
                        let reference = references[references.len() - 1];
                        let delta = i64::from(value) - i64::from(reference);
                        match i32::try_from(delta) {
                            Ok(delta) => Ok(Blob::present(delta.to_le_bytes().to_vec())),
                            Err(_) => Err(blob.clone()),
                        }
                    }
                    Err(_) => Err(blob.clone()),
                },
            };
            pos += 1;
            result
        })?;

        let mut out = vec![key_type.tag()];
        out.extend_from_slice(&(skip as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (i, (key, blob)) in entries.iter().enumerate() {
            codec::encode_key(&mut out, key);
            match blob.as_bytes() {
                None => out.push(2), // tombstone tag, distinct from reference/delta
                Some(bytes) if i % skip == 0 => {
                    out.push(TAG_REFERENCE);
                    out.extend_from_slice(bytes);
                }
                Some(bytes) => {
                    out.push(TAG_DELTA);
                    out.extend_from_slice(bytes);
                }
            }
        }
        std::fs::write(dir.join(format!("{name}.deltaint")), out)?;

        let decoded = decode_entries(skip, &entries);
        Ok(Self { key_type, comparator, skip, entries: decoded })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Self> {
        let path = dir.join(format!("{name}.deltaint"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated deltaint_dtable header");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let skip = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()).max(1) as usize;
        let count = u32::from_le_bytes(data.get(5..9).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 9;
        let mut encoded: Vec<(Key, Blob)> = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?;
            let tag = *data.get(offset).ok_or_else(err)?;
            offset += 1;
            let blob = if tag == 2 {
                Blob::tombstone()
            } else if tag == TAG_REFERENCE || tag == TAG_DELTA {
                let bytes = data.get(offset..offset + 4).ok_or_else(err)?;
                offset += 4;
                Blob::present(bytes.to_vec())
            } else {
                return Err(Error::Corrupt(path, "unknown deltaint_dtable tag"));
            };
            encoded.push((key, blob));
        }

        let entries = decode_entries(skip, &encoded);
        Ok(Self { key_type, comparator, skip, entries })
    }

    #[must_use]
    pub const fn skip(&self) -> usize {
        self.skip
    }
}

impl DTable for DeltaintDTable {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::test_support::MemDTable;

    #[test]
    fn values_round_trip_through_deltas_and_references() {
        let dir = std::env::temp_dir().join(format!("deltaint-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let entries: Vec<_> =
            (0..40u32).map(|i| (Key::U32(i), Blob::present((1000 + i * 3).to_le_bytes().to_vec()))).collect();
        let source = MemDTable::new(KeyType::U32, entries.clone());
        let table = DeltaintDTable::create(&dir, "lvl", Some(8), None, &source, None).unwrap();

        for (key, blob) in &entries {
            assert_eq!(table.lookup(key).1.as_bytes(), blob.as_bytes());
        }

        let reopened = DeltaintDTable::open(&dir, "lvl", None).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(17)).1.as_bytes(), Some(&(1000 + 17 * 3_u32).to_le_bytes()[..]));
    }
}
