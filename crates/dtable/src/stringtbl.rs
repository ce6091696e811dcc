use std::path::Path;
use std::sync::{Arc, Mutex};

use quick_cache::sync::Cache;
use rwfile::{RoFile, RwFile};

use crate::error::Result;


/// Read access keeps a small LRU so repeated lookups avoid file I/O (spec.md §4.10).
const LRU_CAPACITY: usize = 16;

/// A sorted, deduplicated table of strings, stored once per file and referenced elsewhere by
/// index (spec.md §3 "Strings in a `stringtbl` section... are deduplicated and stored once in
/// sorted order; keys elsewhere reference them by index").
#[derive(Debug)]
pub struct StringTable {
    file:    Mutex<RoFile>,
    /// `(byte offset, byte length)` into `file`, in the same order as the sorted strings (so
    /// index `i` here is the index callers use).
    offsets: Vec<(u64, u32)>,
    cache:   Cache<u32, Arc<str>>,
}

impl StringTable {
    /// Writes `sorted_strings` (already deduplicated and sorted) to `path` and returns a table
    /// ready for lookups.
    ///
    /// # Errors
    /// Propagates I/O failures writing or reopening the file.
    pub fn create(path: &Path, sorted_strings: &[Arc<str>]) -> Result<Self> {
        let mut writer = RwFile::create(path, ())?;
        let mut offsets = Vec::with_capacity(sorted_strings.len());
        for s in sorted_strings {
            let offset = writer.len();
            writer.append(s.as_bytes())?;
            #[expect(clippy::cast_possible_truncation, reason = "individual strings are small")]
            offsets.push((offset, s.len() as u32));
        }
        writer.close()?;
        Self::open(path, offsets)
    }

    /// Reopens a table whose `offsets` were recovered from a format's own header.
    ///
    /// # Errors
    /// Propagates I/O failures opening the file.
    pub fn open(path: &Path, offsets: Vec<(u64, u32)>) -> Result<Self> {
        let file = RoFile::open(path, 4096, 4)?;
        Ok(Self { file: Mutex::new(file), offsets, cache: Cache::new(LRU_CAPACITY) })
    }

    #[must_use]
    pub fn offsets(&self) -> &[(u64, u32)] {
        &self.offsets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Fetches the string at `index`.
    ///
    /// # Errors
    /// Propagates I/O failures reading the backing file.
    pub fn get(&self, index: u32) -> Result<Arc<str>> {
        if let Some(cached) = self.cache.get(&index) {
            return Ok(cached);
        }
        let (offset, len) = self.offsets[index as usize];
        let bytes = self.file.lock().expect("stringtbl mutex poisoned").read_at(offset, len as usize)?;
        let s: Arc<str> = String::from_utf8_lossy(&bytes).into_owned().into();
        self.cache.insert(index, Arc::clone(&s));
        Ok(s)
    }

    /// Binary-searches for `target`, returning its index if present.
    #[must_use]
    pub fn locate(&self, target: &str) -> Option<u32> {
        let mut lo = 0_usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            #[expect(clippy::arithmetic_side_effects, reason = "lo < hi < usize::MAX in practice")]
            let mid = lo + (hi - lo) / 2;
            let s = self.get(mid as u32).ok()?;
            match s.as_ref().cmp(target) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid as u32),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("stringtbl-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn get_and_locate_round_trip() {
        let path = temp_path("roundtrip");
        let strings: Vec<Arc<str>> = vec!["alpha".into(), "beta".into(), "gamma".into()];
        let table = StringTable::create(&path, &strings).unwrap();

        assert_eq!(table.get(1).unwrap().as_ref(), "beta");
        assert_eq!(table.locate("gamma"), Some(2));
        assert_eq!(table.locate("missing"), None);

        let _ = std::fs::remove_file(&path);
    }
}
