use std::path::Path;

use blob_key::{Blob, Key, KeyType};

use crate::error::{Error, Result};
use crate::support::{self, VecIter};
use crate::traits::{DTable, DTableIter, SourceId};


/// `linear_dtable`: a contiguous `u32` key range with variable-size values. Each slot's on-disk
/// length field is the real length `+2`, reserving `0` for a hole and `1` for an explicit
/// tombstone (spec.md §4.6).
#[derive(Debug)]
pub struct LinearDTable {
    min:     u32,
    entries: Vec<(Key, Blob)>,
    /// One slot per index in `[min, min+cells.len())`; `None` is a hole.
    cells:   Vec<Option<Blob>>,
}

impl LinearDTable {
    /// # Errors
    /// Propagates I/O failures persisting the table.
    pub fn create(dir: &Path, name: &str, min: u32, source: &dyn DTable, shadow: Option<&dyn DTable>) -> Result<Self> {
        let entries = support::collect_with_shadow(source, shadow);
        let table = Self::from_entries(min, entries);
        table.write_to(dir, name)?;
        Ok(table)
    }

    fn from_entries(min: u32, entries: Vec<(Key, Blob)>) -> Self {
        let max_index = entries
            .iter()
            .map(|(k, _)| if let Key::U32(k) = k { k - min } else { unreachable!("linear_dtable keys are always u32") })
            .max()
            .map_or(0, |m| m + 1);
        let mut cells: Vec<Option<Blob>> = vec![None; max_index as usize];
        for (key, blob) in &entries {
            let Key::U32(k) = key else { unreachable!() };
            cells[(k - min) as usize] = Some(blob.clone());
        }
        Self { min, entries, cells }
    }

    /// Builds an in-memory table directly, for use as a lightweight test `source`.
    #[must_use]
    pub fn from_memory(min: u32, values: Vec<Option<Blob>>) -> Self {
        let entries = values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.clone().map(|b| (Key::U32(min + i as u32), b)))
            .collect();
        Self { min, entries, cells: values }
    }

    /// Persists this table to `dir/name.linear`.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn write_to(&self, dir: &Path, name: &str) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&(self.cells.len() as u32).to_le_bytes());

        let mut lengths = Vec::with_capacity(self.cells.len());
        let mut data = Vec::new();
        for cell in &self.cells {
            match cell {
                None => lengths.push(0_u32),
                Some(blob) if !blob.exists() => lengths.push(1),
                Some(blob) => {
                    let bytes = blob.as_bytes().unwrap_or_default();
                    #[expect(clippy::cast_possible_truncation, reason = "values are bounded well under u32")]
                    lengths.push(bytes.len() as u32 + 2);
                    data.extend_from_slice(bytes);
                }
            }
        }
        for len in &lengths {
            out.extend_from_slice(&len.to_le_bytes());
        }
        out.extend_from_slice(&data);

        std::fs::write(dir.join(format!("{name}.linear")), out)?;
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if the file is malformed.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{name}.linear"));
        let bytes = std::fs::read(&path)?;
        let err = || Error::Corrupt(path.clone(), "truncated linear_dtable header");

        let min = u32::from_le_bytes(bytes.get(0..4).ok_or_else(err)?.try_into().unwrap());
        let count = u32::from_le_bytes(bytes.get(4..8).ok_or_else(err)?.try_into().unwrap()) as usize;

        let mut offset = 8;
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            lengths.push(u32::from_le_bytes(bytes.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap()));
            offset += 4;
        }

        let mut cells = Vec::with_capacity(count);
        for len in lengths {
            match len {
                0 => cells.push(None),
                1 => cells.push(Some(Blob::tombstone())),
                n => {
                    let actual = (n - 2) as usize;
                    let data = bytes.get(offset..offset + actual).ok_or_else(err)?;
                    offset += actual;
                    cells.push(Some(Blob::present(data.to_vec())));
                }
            }
        }

        let entries = cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.clone().map(|b| (Key::U32(min + i as u32), b)))
            .collect();

        Ok(Self { min, entries, cells })
    }
}

impl DTable for LinearDTable {
    fn key_type(&self) -> KeyType {
        KeyType::U32
    }

    fn lookup(&self, key: &Key) -> (bool, Blob) {
        let Key::U32(k) = key else { return (false, Blob::tombstone()) };
        let Some(idx) = k.checked_sub(self.min) else { return (false, Blob::tombstone()) };
        match self.cells.get(idx as usize) {
            None | Some(None) => (false, Blob::tombstone()),
            Some(Some(blob)) => (true, blob.clone()),
        }
    }

    fn iter(&self) -> Box<dyn DTableIter + '_> {
        Box::new(VecIter::new(&self.entries, SourceId(std::ptr::from_ref(self) as usize)))
    }

    fn size(&self) -> Option<usize> {
        Some(self.entries.len())
    }

    fn index(&self, i: usize) -> Option<(Key, Blob)> {
        self.cells.get(i)?.clone().map(|b| (Key::U32(self.min + i as u32), b))
    }

    fn contains_index(&self, i: usize) -> bool {
        matches!(self.cells.get(i), Some(Some(_)))
    }
}
