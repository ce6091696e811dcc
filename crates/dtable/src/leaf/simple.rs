use std::path::Path;
use std::sync::Arc;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::stringtbl::StringTable;
use crate::support::{self, VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


/// `simple_dtable`: sorted arbitrary keys, variable-size values (spec.md §4.6). String keys are
/// deduplicated through a sibling [`StringTable`] rather than stored inline.
#[derive(Debug)]
pub struct SimpleDTable {
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    entries:    Vec<(Key, Blob)>,
    #[expect(dead_code, reason = "kept alive so stringtbl file handle and LRU persist with the dtable")]
    strings:    Option<Arc<StringTable>>,
}

impl SimpleDTable {
    /// Builds a new table from `source`, eliding tombstones not covered by `shadow`.
    ///
    /// # Errors
    /// Propagates I/O failures writing the table or its sibling string table.
    pub fn create(
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Self> {
        let entries = support::collect_with_shadow(source, shadow);
        let key_type = source.key_type();

        let strings = if key_type == KeyType::Str {
            let mut distinct: Vec<Arc<str>> = entries
                .iter()
                .filter_map(|(k, _)| if let Key::Str(s) = k { Some(Arc::clone(s)) } else { None })
                .collect();
            distinct.sort_unstable();
            distinct.dedup();
            Some(StringTable::create(&strtbl_path(dir, name), &distinct)?)
        } else {
            None
        };

        let bytes = encode(key_type, &entries, strings.as_ref());
        std::fs::write(table_path(dir, name), bytes)?;

        Ok(Self { key_type, comparator, entries, strings: strings.map(Arc::new) })
    }

    /// Reopens a table previously written by [`Self::create`].
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed, or propagates I/O failures.
    pub fn open(dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Self> {
        let path = table_path(dir, name);
        let bytes = std::fs::read(&path)?;
        let (key_type, offsets, header_len) = decode_header(&path, &bytes)?;

        let strings = if key_type == KeyType::Str {
            Some(Arc::new(StringTable::open(&strtbl_path(dir, name), offsets)?))
        } else {
            None
        };

        let entries = decode_entries(&path, key_type, &bytes, header_len, strings.as_deref())?;
        Ok(Self { key_type, comparator, entries, strings })
    }
}

fn table_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join(format!("{name}.simple"))
}

fn strtbl_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join(format!("{name}.strtbl"))
}

fn encode(key_type: KeyType, entries: &[(Key, Blob)], strings: Option<&StringTable>) -> Vec<u8> {
    let mut out = vec![key_type.tag()];
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    let offsets = strings.map(StringTable::offsets).unwrap_or_default();
    out.extend_from_slice(&(offsets.len() as u32).to_le_bytes());
    for (offset, len) in offsets {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
    }

    for (key, blob) in entries {
        match key {
            Key::Str(s) => {
                let index = strings.and_then(|t| t.locate(s)).expect("string dtable key was deduped into its stringtbl");
                out.extend_from_slice(&index.to_le_bytes());
            }
            other => codec::encode_key(&mut out, other),
        }
        codec::encode_blob(&mut out, blob);
    }
    out
}

/// Returns `(key_type, stringtbl offsets, byte offset where entries begin)`.
fn decode_header(path: &Path, data: &[u8]) -> Result<(KeyType, Vec<(u64, u32)>, usize)> {
    let tag = *data.first().ok_or_else(|| Error::Corrupt(path.to_path_buf(), "empty file"))?;
    let key_type = KeyType::from_tag(tag).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "unknown key type"))?;
    let mut offset = 5; // tag + entry count, entry count re-read by caller
    let strtbl_count =
        u32::from_le_bytes(data.get(5..9).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated header"))?.try_into().unwrap());
    offset = 9;
    let mut offsets = Vec::with_capacity(strtbl_count as usize);
    for _ in 0..strtbl_count {
        let o = u64::from_le_bytes(data.get(offset..offset + 8).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated stringtbl offsets"))?.try_into().unwrap());
        let l = u32::from_le_bytes(data.get(offset + 8..offset + 12).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated stringtbl offsets"))?.try_into().unwrap());
        offsets.push((o, l));
        offset += 12;
    }
    Ok((key_type, offsets, offset))
}

fn decode_entries(
    path:       &Path,
    key_type:   KeyType,
    data:       &[u8],
    mut offset: usize,
    strings:    Option<&StringTable>,
) -> Result<Vec<(Key, Blob)>> {
    let count = u32::from_le_bytes(data.get(1..5).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated header"))?.try_into().unwrap());
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = if key_type == KeyType::Str {
            let index = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated key"))?.try_into().unwrap());
            offset += 4;
            let s = strings.expect("Str-keyed table always has a stringtbl").get(index)?;
            Key::Str(s)
        } else {
            codec::decode_key(key_type, data, &mut offset).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated key"))?
        };
        let blob = codec::decode_blob(data, &mut offset).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated value"))?;
        entries.push((key, blob));
    }
    Ok(entries)
}

impl DTable for SimpleDTable {
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
    use blob_key::Metablob;

    use super::*;
    use crate::leaf::array::ArrayDTable;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("simple-dtable-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn create_then_open_round_trips_u32_keys() {
        let dir = temp_dir("u32");
        let source = ArrayDTable::from_memory(
            0,
            vec![Some(Blob::present(*b"hello")), None, Some(Blob::present(*b"world"))],
        );
        let table = SimpleDTable::create(&dir, "level", None, &source, None).unwrap();
        assert_eq!(table.lookup(&Key::U32(0)).1.as_bytes(), Some(&b"hello"[..]));
        assert_eq!(table.lookup(&Key::U32(1)), (false, Blob::tombstone()));

        let reopened = SimpleDTable::open(&dir, "level", None).unwrap();
        assert_eq!(reopened.entries, table.entries);
    }

    #[test]
    fn string_keys_round_trip_through_sibling_stringtbl() {
        let dir = temp_dir("str");
        let entries = vec![
            (Key::Str("alpha".into()), Blob::present(*b"1")),
            (Key::Str("beta".into()), Blob::present(*b"2")),
        ];
        let source = crate::support::test_support::MemDTable::new(KeyType::Str, entries);
        let table = SimpleDTable::create(&dir, "strs", None, &source, None).unwrap();
        assert_eq!(table.lookup(&Key::Str("beta".into())).1.meta(), Metablob { exists: true, size: 1 });

        let reopened = SimpleDTable::open(&dir, "strs", None).unwrap();
        assert_eq!(reopened.entries.len(), 2);
    }
}
