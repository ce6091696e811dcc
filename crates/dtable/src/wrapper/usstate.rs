use std::path::Path;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::{self, VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


/// The 52 two-letter US state/territory codes recognized by this format (spec.md §4.6:
/// "1-byte index into 52-code table").
pub const STATE_CODES: [&str; 52] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA", "KS", "KY", "LA", "ME",
    "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA",
    "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA", "WV", "WI", "WY", "DC", "PR",
];

fn code_index(text: &str) -> Option<u8> {
    #[expect(clippy::cast_possible_truncation, reason = "STATE_CODES.len() == 52")]
    STATE_CODES.iter().position(|&c| c == text).map(|i| i as u8)
}

/// `usstate_dtable`: stores each value as a single-byte index into [`STATE_CODES`]. Rejects any
/// value that isn't a recognized two-letter code (spec.md §4.6).
#[derive(Debug)]
pub struct UsstateDTable {
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    entries:    Vec<(Key, Blob)>,
}

impl UsstateDTable {
    /// # Errors
    /// Returns [`Error::Rejected`] if an unrecognized code is refused by every handler in the
    /// chain, or propagates I/O failures persisting the table.
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
            Some(bytes) => match std::str::from_utf8(bytes).ok().and_then(code_index) {
                Some(idx) => Ok(Blob::present(vec![idx])),
                None => Err(blob.clone()),
            },
        })?;

        let mut out = vec![key_type.tag()];
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key, blob) in &entries {
            codec::encode_key(&mut out, key);
            codec::encode_blob(&mut out, blob);
        }
        std::fs::write(dir.join(format!("{name}.usstate")), out)?;

        Ok(Self { key_type, comparator, entries })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Self> {
        let path = dir.join(format!("{name}.usstate"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated usstate_dtable header");

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
            Some([idx]) => STATE_CODES
                .get(*idx as usize)
                .map_or_else(|| blob.clone(), |code| Blob::present(code.as_bytes().to_vec())),
            _ => blob.clone(),
        }
    }
}

impl DTable for UsstateDTable {
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

/// Decodes each `(index -> code)` on the way out of iteration, mirroring [`DTable::lookup`].
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
        UsstateDTable::decoded(&self.inner.value())
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
    fn known_codes_round_trip_and_unknown_is_rejected() {
        let dir = std::env::temp_dir().join(format!("usstate-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemDTable::new(
            KeyType::U32,
            vec![(Key::U32(1), Blob::present(*b"CA")), (Key::U32(2), Blob::present(*b"NY"))],
        );
        let table = UsstateDTable::create(&dir, "lvl", None, &source, None).unwrap();
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"CA"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"NY"[..]));

        let reopened = UsstateDTable::open(&dir, "lvl", None).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"NY"[..]));

        let bad = MemDTable::new(KeyType::U32, vec![(Key::U32(1), Blob::present(*b"ZZ"))]);
        let err = UsstateDTable::create(&dir, "bad", None, &bad, None).unwrap_err();
        assert!(matches!(err, Error::Rejected));
    }
}
