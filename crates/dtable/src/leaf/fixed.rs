use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::{self, VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


fn resize_to(bytes: &[u8], size: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(size, 0);
    out
}

/// `fixed_dtable`: sorted keys of any type, fixed-size values, one existence bit per key
/// (spec.md §4.6). Rejects any value whose length does not match `value_size`.
#[derive(Debug)]
pub struct FixedDTable {
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    value_size: usize,
    entries:    Vec<(Key, Blob)>,
}

impl FixedDTable {
    /// # Errors
    /// Returns [`Error::Rejected`] if a wrong-size value is refused by every handler in the
    /// rejection chain, or propagates I/O failures persisting the table.
    pub fn create(
        dir:          &Path,
        name:         &str,
        value_size:   usize,
        reject_value: Option<&Blob>,
        comparator:   Option<SharedComparator>,
        source:       &dyn DTable,
        shadow:       Option<&dyn DTable>,
    ) -> Result<Self> {
        let key_type = source.key_type();
        let entries = support::collect_with_validation(source, shadow, |_key, blob| match blob.as_bytes() {
            None => Ok(blob.clone()),
            Some(bytes) if bytes.len() == value_size => Ok(blob.clone()),
            Some(bytes) => Err(reject_value.cloned().unwrap_or_else(|| Blob::present(resize_to(bytes, value_size)))),
        })?;

        let mut out = vec![key_type.tag()];
        out.extend_from_slice(&(value_size as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key, blob) in &entries {
            codec::encode_key(&mut out, key);
            out.push(u8::from(blob.exists()));
            if let Some(bytes) = blob.as_bytes() {
                out.extend_from_slice(bytes);
            }
        }
        std::fs::write(dir.join(format!("{name}.fixed")), out)?;

        Ok(Self { key_type, comparator, value_size, entries })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Self> {
        let path = dir.join(format!("{name}.fixed"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated fixed_dtable header");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let value_size = u32::from_le_bytes(data.get(1..5).ok_or_else(err)?.try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(data.get(5..9).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 9;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?;
            let exists = *data.get(offset).ok_or_else(err)? != 0;
            offset += 1;
            let blob = if exists {
                let bytes = data.get(offset..offset + value_size).ok_or_else(err)?;
                offset += value_size;
                Blob::present(bytes.to_vec())
            } else {
                Blob::tombstone()
            };
            entries.push((key, blob));
        }

        Ok(Self { key_type, comparator, value_size, entries })
    }

    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.value_size
    }
}

impl DTable for FixedDTable {
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
    fn rejects_wrong_size_value_without_a_handler() {
        let dir = std::env::temp_dir().join(format!("fixed-dtable-test-reject-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"toolong"))]);
        let err = FixedDTable::create(&dir, "bad", 3, None, None, &source, None).unwrap_err();
        assert!(matches!(err, Error::Rejected));
    }

    /// A configured `reject_value` only supplies *what* candidate to offer in place of a value
    /// this format can't encode; something upstream in the iterator chain still has to accept
    /// it, or `create` fails regardless. A bare source's iterator never overrides
    /// [`crate::traits::DTableIter::reject`], so `create` still returns
    /// [`Error::Rejected`] here even with `reject_value` set — see
    /// `wrapper::exception::ExceptionDTable::create` for the handler that actually accepts.
    #[test]
    fn reject_value_alone_does_not_bypass_the_rejection_chain() {
        let dir = std::env::temp_dir().join(format!("fixed-dtable-test-accept-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"toolong"))]);
        let reject = Blob::present(*b"___");
        let err = FixedDTable::create(&dir, "ok", 3, Some(&reject), None, &source, None).unwrap_err();
        assert!(matches!(err, Error::Rejected));
    }
}
