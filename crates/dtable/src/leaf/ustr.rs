use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use blob_key::{Blob, Key, KeyType, SharedComparator};

use crate::codec;
use crate::error::{Error, Result};
use crate::support::{self, VecIter, lookup_sorted_with};
use crate::traits::{DTable, DTableIter, SourceId};


const MIN_SUBSTRING_LEN: usize = 4;
const MAX_SUBSTRING_LEN: usize = 12;
/// Index `0xFF` is reserved to mean "a literal escape byte", so the dictionary itself is capped.
const MAX_DICT_ENTRIES: usize = 254;
const LITERAL_ESCAPE_INDEX: u8 = 0xFF;

/// `ustr_dtable`: as `simple_dtable`, but repeated printable substrings across values are
/// replaced with an escape byte plus a one-byte dictionary index (spec.md §4.6).
#[derive(Debug)]
pub struct UstrDTable {
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    escape:     u8,
    dict:       Vec<Arc<str>>,
    entries:    Vec<(Key, Blob)>,
}

/// Picks the least-frequent byte across `values` as the escape byte, ties broken by the smallest
/// byte value (documented open-question decision: the source chooses this heuristically and
/// offers no deterministic fallback when every byte appears, so the tie-break here is ours).
fn choose_escape_byte(values: &[&[u8]]) -> u8 {
    let mut counts = [0_u64; 256];
    for value in values {
        for &b in *value {
            counts[b as usize] += 1;
        }
    }
    (0..=255_u8).min_by_key(|&b| counts[b as usize]).unwrap_or(0)
}

/// Greedily picks substrings worth replacing, ranked by total bytes saved.
fn build_dictionary(values: &[&[u8]]) -> Vec<Arc<str>> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in values {
        let Ok(text) = std::str::from_utf8(value) else { continue };
        if !text.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            continue;
        }
        for len in MIN_SUBSTRING_LEN..=MAX_SUBSTRING_LEN.min(text.len()) {
            for start in 0..=text.len().saturating_sub(len) {
                *counts.entry(&text[start..start + len]).or_insert(0) += 1;
            }
        }
    }

    let mut candidates: Vec<(&str, usize)> =
        counts.into_iter().filter(|&(s, count)| count >= 2 && (count - 1) * (s.len() - 2) > 0).collect();
    candidates.sort_by(|a, b| {
        let save_a = (a.1 - 1) * a.0.len();
        let save_b = (b.1 - 1) * b.0.len();
        save_b.cmp(&save_a).then_with(|| a.0.cmp(b.0))
    });
    candidates.truncate(MAX_DICT_ENTRIES);
    candidates.into_iter().map(|(s, _)| Arc::from(s)).collect()
}

fn encode_value(escape: u8, dict: &[Arc<str>], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    let mut pos = 0;
    'outer: while pos < value.len() {
        for (idx, candidate) in dict.iter().enumerate() {
            let bytes = candidate.as_bytes();
            if value[pos..].starts_with(bytes) {
                out.push(escape);
                #[expect(clippy::cast_possible_truncation, reason = "dict is capped at MAX_DICT_ENTRIES")]
                out.push(idx as u8);
                pos += bytes.len();
                continue 'outer;
            }
        }
        if value[pos] == escape {
            out.push(escape);
            out.push(LITERAL_ESCAPE_INDEX);
        } else {
            out.push(value[pos]);
        }
        pos += 1;
    }
    out
}

fn decode_value(path: &Path, escape: u8, dict: &[Arc<str>], data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    while pos < data.len() {
        if data[pos] == escape {
            let idx = *data.get(pos + 1).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "truncated ustr escape"))?;
            if idx == LITERAL_ESCAPE_INDEX {
                out.push(escape);
            } else {
                let s = dict.get(idx as usize).ok_or_else(|| Error::Corrupt(path.to_path_buf(), "unknown ustr dict index"))?;
                out.extend_from_slice(s.as_bytes());
            }
            pos += 2;
        } else {
            out.push(data[pos]);
            pos += 1;
        }
    }
    Ok(out)
}

impl UstrDTable {
    /// # Errors
    /// Propagates I/O failures persisting the table.
    pub fn create(
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Self> {
        let key_type = source.key_type();
        let entries = support::collect_with_shadow(source, shadow);

        let present_values: Vec<&[u8]> = entries.iter().filter_map(|(_, b)| b.as_bytes()).collect();
        let escape = choose_escape_byte(&present_values);
        let dict = build_dictionary(&present_values);

        let mut out = vec![key_type.tag(), escape];
        out.extend_from_slice(&(dict.len() as u32).to_le_bytes());
        for s in &dict {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key, blob) in &entries {
            codec::encode_key(&mut out, key);
            match blob.as_bytes() {
                None => out.extend_from_slice(&u32::MAX.to_le_bytes()),
                Some(bytes) => {
                    let encoded = encode_value(escape, &dict, bytes);
                    out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                    out.extend_from_slice(&encoded);
                }
            }
        }
        std::fs::write(dir.join(format!("{name}.ustr")), out)?;

        Ok(Self { key_type, comparator, escape, dict, entries })
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Self> {
        let path = dir.join(format!("{name}.ustr"));
        let data = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated ustr_dtable header");

        let key_type = KeyType::from_tag(*data.first().ok_or_else(err)?).ok_or_else(err)?;
        let escape = *data.get(1).ok_or_else(err)?;
        let dict_len = u32::from_le_bytes(data.get(2..6).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 6;
        let mut dict = Vec::with_capacity(dict_len);
        for _ in 0..dict_len {
            let len = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap()) as usize;
            offset += 4;
            let s = std::str::from_utf8(data.get(offset..offset + len).ok_or_else(err)?)
                .map_err(|_| Error::Corrupt(path.clone(), "non-utf8 ustr dictionary entry"))?;
            dict.push(Arc::from(s));
            offset += len;
        }

        let count = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap()) as usize;
        offset += 4;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::decode_key(key_type, &data, &mut offset).ok_or_else(err)?;
            let len = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap());
            offset += 4;
            let blob = if len == u32::MAX {
                Blob::tombstone()
            } else {
                let encoded = data.get(offset..offset + len as usize).ok_or_else(err)?;
                offset += len as usize;
                Blob::present(decode_value(&path, escape, &dict, encoded)?)
            };
            entries.push((key, blob));
        }

        Ok(Self { key_type, comparator, escape, dict, entries })
    }

    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        let raw: usize = self.entries.iter().filter_map(|(_, b)| b.as_bytes().map(<[u8]>::len)).sum();
        if raw == 0 {
            return 1.0;
        }
        let encoded: usize = self
            .entries
            .iter()
            .filter_map(|(_, b)| b.as_bytes().map(|bytes| encode_value(self.escape, &self.dict, bytes).len()))
            .sum();
        encoded as f64 / raw as f64
    }
}

impl DTable for UstrDTable {
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

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("ustr-dtable-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn repeated_substrings_round_trip() {
        let dir = temp_dir("roundtrip");
        let entries = vec![
            (Key::U32(1), Blob::present(*b"error: connection refused")),
            (Key::U32(2), Blob::present(*b"error: connection timeout")),
            (Key::U32(3), Blob::present(*b"ok")),
        ];
        let source = MemDTable::new(KeyType::U32, entries);
        let table = UstrDTable::create(&dir, "lvl", None, &source, None).unwrap();

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"error: connection refused"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"error: connection timeout"[..]));

        let reopened = UstrDTable::open(&dir, "lvl", None).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"error: connection timeout"[..]));
    }
}
