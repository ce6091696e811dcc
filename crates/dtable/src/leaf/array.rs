use std::path::Path;

use blob_key::{Blob, Key, KeyType};

use crate::error::{Error, Result};
use crate::support::{self, VecIter};
use crate::traits::{DTable, DTableIter, SourceId};


/// One array slot (spec.md §4.6: "holes and DNE via tag byte").
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cell {
    /// No entry was ever written at this index; does not appear in iteration.
    Hole,
    /// An explicit tombstone.
    Tombstone,
    Present(Vec<u8>),
}

/// `array_dtable`: a contiguous `u32` key range `[min, min+N)` with constant-time index-from-key
/// lookup and fixed-size values (spec.md §4.6).
#[derive(Debug)]
pub struct ArrayDTable {
    min:        u32,
    value_size: usize,
    cells:      Vec<Cell>,
    entries:    Vec<(Key, Blob)>,
}

fn resize_to(bytes: &[u8], size: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(size, 0);
    out
}

impl ArrayDTable {
    /// Builds a new table over `[min, min+N)`. Any value whose length does not match
    /// `value_size` is offered to the source iterator's rejection chain with a deterministic,
    /// size-correct candidate (`reject_value` if configured, else a truncated/zero-padded
    /// version of the real value).
    ///
    /// # Errors
    /// Returns [`Error::Rejected`] if a wrong-size value is refused by every handler in the
    /// chain.
    pub fn create(
        dir:         &Path,
        name:        &str,
        min:         u32,
        value_size:  usize,
        reject_value: Option<&Blob>,
        source:      &dyn DTable,
        shadow:      Option<&dyn DTable>,
    ) -> Result<Self> {
        let entries = support::collect_with_validation(source, shadow, |_key, blob| match blob.as_bytes() {
            None => Ok(blob.clone()),
            Some(bytes) if bytes.len() == value_size => Ok(blob.clone()),
            Some(bytes) => Err(reject_value.cloned().unwrap_or_else(|| Blob::present(resize_to(bytes, value_size)))),
        })?;

        let cells = Self::cells_from_entries(min, &entries);
        let table = Self { min, value_size, cells, entries };
        table.write_to(dir, name)?;
        Ok(table)
    }

    fn cells_from_entries(min: u32, entries: &[(Key, Blob)]) -> Vec<Cell> {
        let max_index = entries
            .iter()
            .map(|(k, _)| if let Key::U32(k) = k { k - min } else { unreachable!("array_dtable keys are always u32") })
            .max()
            .map_or(0, |m| m + 1);

        let mut cells = vec![Cell::Hole; max_index as usize];
        for (key, blob) in entries {
            let Key::U32(k) = key else { unreachable!() };
            let idx = (k - min) as usize;
            cells[idx] = match blob.as_bytes() {
                None => Cell::Tombstone,
                Some(bytes) => Cell::Present(bytes.to_vec()),
            };
        }
        cells
    }

    /// Builds an in-memory table directly from a sparse list of cells (used by this crate's own
    /// tests as a lightweight stand-in `source`).
    #[must_use]
    pub fn from_memory(min: u32, values: Vec<Option<Blob>>) -> Self {
        let value_size = values.iter().flatten().map(Blob::len).max().unwrap_or(0);
        let cells: Vec<Cell> = values
            .iter()
            .map(|v| match v {
                None => Cell::Hole,
                Some(b) if b.exists() => Cell::Present(b.as_bytes().unwrap_or_default().to_vec()),
                Some(_) => Cell::Tombstone,
            })
            .collect();
        let entries = cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Cell::Hole => None,
                Cell::Tombstone => Some((Key::U32(min + i as u32), Blob::tombstone())),
                Cell::Present(bytes) => Some((Key::U32(min + i as u32), Blob::present(bytes.clone()))),
            })
            .collect();
        Self { min, value_size, cells, entries }
    }

    /// Persists this table to `dir/name.array`.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn write_to(&self, dir: &Path, name: &str) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&(self.value_size as u32).to_le_bytes());
        out.extend_from_slice(&(self.cells.len() as u32).to_le_bytes());
        for cell in &self.cells {
            match cell {
                Cell::Hole => out.push(0),
                Cell::Tombstone => out.push(1),
                Cell::Present(bytes) => {
                    out.push(2);
                    out.extend_from_slice(bytes);
                }
            }
        }
        std::fs::write(dir.join(format!("{name}.array")), out)?;
        Ok(())
    }

    /// Reopens a table written by [`Self::write_to`].
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{name}.array"));
        let bytes = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated array_dtable header");
        let min = u32::from_le_bytes(bytes.get(0..4).ok_or_else(err)?.try_into().unwrap());
        let value_size = u32::from_le_bytes(bytes.get(4..8).ok_or_else(err)?.try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(bytes.get(8..12).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 12;
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = *bytes.get(offset).ok_or_else(err)?;
            offset += 1;
            let cell = match tag {
                0 => Cell::Hole,
                1 => Cell::Tombstone,
                2 => {
                    let data = bytes.get(offset..offset + value_size).ok_or_else(err)?;
                    offset += value_size;
                    Cell::Present(data.to_vec())
                }
                _ => return Err(Error::Corrupt(path, "unknown array_dtable cell tag")),
            };
            cells.push(cell);
        }

        let entries = cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Cell::Hole => None,
                Cell::Tombstone => Some((Key::U32(min + i as u32), Blob::tombstone())),
                Cell::Present(bytes) => Some((Key::U32(min + i as u32), Blob::present(bytes.clone()))),
            })
            .collect();

        Ok(Self { min, value_size, cells, entries })
    }

    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.value_size
    }
}

impl DTable for ArrayDTable {
    fn key_type(&self) -> KeyType {
        KeyType::U32
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        let Key::U32(k) = key else { return (false, Blob::tombstone()) };
        let Some(idx) = k.checked_sub(self.min) else { return (false, Blob::tombstone()) };
        match self.cells.get(idx as usize) {
            None | Some(Cell::Hole) => (false, Blob::tombstone()),
            Some(Cell::Tombstone) => (true, Blob::tombstone()),
            Some(Cell::Present(bytes)) => (true, Blob::present(bytes.clone())),
        }
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(VecIter::new(&self.entries, SourceId(std::ptr::from_ref(self) as usize)))
    }

    fn size(&self) -> Option<usize> {
        Some(self.entries.len())
    }

    fn index(&self, i: usize) -> Option<(Key, Blob)> {
        match self.cells.get(i)? {
            Cell::Hole => None,
            Cell::Tombstone => Some((Key::U32(self.min + i as u32), Blob::tombstone())),
            Cell::Present(bytes) => Some((Key::U32(self.min + i as u32), Blob::present(bytes.clone()))),
        }
    }

    fn contains_index(&self, i: usize) -> bool {
        !matches!(self.cells.get(i), None | Some(Cell::Hole))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_and_tombstones_differ_from_missing_lookup() {
        let table = ArrayDTable::from_memory(
            10,
            vec![Some(Blob::present(*b"hi")), None, Some(Blob::tombstone())],
        );
        assert_eq!(table.lookup(&Key::U32(10)).1.as_bytes(), Some(&b"hi"[..]));
        assert_eq!(table.lookup(&Key::U32(11)), (false, Blob::tombstone()));
        assert_eq!(table.lookup(&Key::U32(12)), (true, Blob::tombstone()));
        assert_eq!(table.lookup(&Key::U32(999)), (false, Blob::tombstone()));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("array-dtable-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let table = ArrayDTable::from_memory(0, vec![Some(Blob::present(*b"ab")), Some(Blob::present(*b"cd"))]);
        table.write_to(&dir, "level0").unwrap();
        let reopened = ArrayDTable::open(&dir, "level0").unwrap();
        assert_eq!(reopened.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"cd"[..]));
    }
}
