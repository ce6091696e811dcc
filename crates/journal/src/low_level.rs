use std::fs;
use std::path::{Path, PathBuf};

use md5::{Digest as _, Md5};
use rwfile::RwFile;

use crate::error::{Error, Result};


/// Record type/length value reserved to mark the commit record (spec.md §4.3: "the all-ones
/// sentinel marking the commit record").
const SENTINEL: u16 = 0xFFFF;
const MD5_LEN: usize = 16;

fn jnl_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:08}.jnl"))
}

fn commit_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:08}.jnl.commit"))
}

/// An open, appendable journal. Created empty by [`Journal::create`]; becomes a
/// [`CommittedJournal`] once [`Journal::commit`] succeeds.
///
/// Per spec.md §4.3's chain invariant, a journal's commit must happen in sequence with its
/// predecessor's commit; this type does not enforce that itself; the file-transaction layer
/// (which only ever has one journal open for appending at a time) is what guarantees it.
#[derive(Debug)]
pub struct Journal {
    dir:    PathBuf,
    seq:    u64,
    writer: RwFile,
    hasher: Md5,
}

impl Journal {
    /// Starts a new, empty journal depending on `prev` (recorded only for documentation/tracing
    /// purposes; sequencing is enforced by the caller, per spec.md §4.3).
    pub fn create(dir: &Path, seq: u64, prev: Option<u64>) -> Result<Self> {
        tracing::debug!(seq, ?prev, "creating journal");
        let writer = RwFile::create(&jnl_path(dir, seq), ())?;
        Ok(Self { dir: dir.to_path_buf(), seq, writer, hasher: Md5::new() })
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Appends one record. `data.len()` must fit in a `u16`.
    pub fn append(&mut self, data: &[u8], record_type: u16) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(Error::RecordTooLarge(data.len()));
        }
        #[expect(clippy::cast_possible_truncation, reason = "checked above")]
        let len = data.len() as u16;

        let mut header = [0_u8; 4];
        header[0..2].copy_from_slice(&len.to_le_bytes());
        header[2..4].copy_from_slice(&record_type.to_le_bytes());

        self.writer.append(&header)?;
        self.writer.append(data)?;
        self.hasher.update(header);
        self.hasher.update(data);
        Ok(())
    }

    /// Writes multiple records of the same type back-to-back; equivalent to several [`append`]
    /// calls but documented as a single logical group (spec.md §4.3's `appendv`).
    ///
    /// [`append`]: Journal::append
    pub fn appendv(&mut self, parts: &[&[u8]], record_type: u16) -> Result<()> {
        for part in parts {
            self.append(part, record_type)?;
        }
        Ok(())
    }

    /// Writes the commit sentinel and checksum, syncs the journal to disk, and creates the
    /// companion `.commit` marker file.
    pub fn commit(mut self) -> Result<CommittedJournal> {
        let checksum: [u8; MD5_LEN] = self.hasher.clone().finalize().into();

        let mut sentinel = [0_u8; 4];
        sentinel[0..2].copy_from_slice(&SENTINEL.to_le_bytes());
        sentinel[2..4].copy_from_slice(&SENTINEL.to_le_bytes());
        self.writer.append(&sentinel)?;
        self.writer.append(&checksum)?;
        self.writer.close()?;

        fs::write(commit_path(&self.dir, self.seq), checksum)?;

        tracing::debug!(seq = self.seq, "committed journal");
        Ok(CommittedJournal { dir: self.dir, seq: self.seq })
    }
}

/// A journal that has been committed (either in this process, via [`Journal::commit`], or in a
/// past process, recovered via [`CommittedJournal::reopen`]).
#[derive(Debug, Clone)]
pub struct CommittedJournal {
    dir: PathBuf,
    seq: u64,
}

impl CommittedJournal {
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Verifies a previously-written journal's checksum and, if valid, returns a handle ready
    /// for playback. Returns `Ok(None)` if the commit marker is absent or the data is corrupt;
    /// per spec.md §7, the caller should then remove the partial journal.
    pub fn reopen(dir: &Path, seq: u64) -> Result<Option<Self>> {
        let commit_file = commit_path(dir, seq);
        let Ok(stored_checksum) = fs::read(&commit_file) else {
            return Ok(None);
        };
        if stored_checksum.len() != MD5_LEN {
            return Ok(None);
        }

        let Ok(bytes) = fs::read(jnl_path(dir, seq)) else {
            return Ok(None);
        };

        match verify(&bytes) {
            Some(computed) if computed.as_slice() == stored_checksum.as_slice() => {
                Ok(Some(Self { dir: dir.to_path_buf(), seq }))
            }
            _ => Ok(None),
        }
    }

    /// Reads every record before the commit sentinel, calling `f(data, record_type)` in order.
    ///
    /// # Errors
    /// Returns [`Error::Corrupt`] if the file cannot be parsed (it should already have been
    /// validated by [`Self::reopen`] or by having just been produced by [`Journal::commit`]).
    pub fn playback(&self, mut f: impl FnMut(&[u8], u16)) -> Result<()> {
        let path = jnl_path(&self.dir, self.seq);
        let bytes = fs::read(&path)?;
        for_each_record(&bytes, |data, record_type| f(data, record_type))
            .ok_or_else(|| Error::Corrupt(path.clone()))
    }

    /// Deletes the journal and its commit marker. Must be called only after playback has
    /// completed (spec.md §4.3).
    pub fn erase(self) -> Result<()> {
        tracing::debug!(seq = self.seq, "erasing journal");
        let _ = fs::remove_file(commit_path(&self.dir, self.seq));
        fs::remove_file(jnl_path(&self.dir, self.seq))?;
        Ok(())
    }
}

/// Parses every pre-sentinel record in `bytes`, calling `f`. Returns `None` on truncation.
fn for_each_record(bytes: &[u8], mut f: impl FnMut(&[u8], u16)) -> Option<()> {
    let mut offset = 0_usize;
    loop {
        let header = bytes.get(offset..offset + 4)?;
        let len = u16::from_le_bytes([header[0], header[1]]);
        let record_type = u16::from_le_bytes([header[2], header[3]]);
        offset += 4;

        if len == SENTINEL && record_type == SENTINEL {
            return Some(());
        }

        let data = bytes.get(offset..offset + len as usize)?;
        f(data, record_type);
        offset += len as usize;
    }
}

/// Recomputes the MD5 checksum over every pre-sentinel record, returning `None` if the byte
/// stream is truncated or never reaches a sentinel.
fn verify(bytes: &[u8]) -> Option<[u8; MD5_LEN]> {
    let mut hasher = Md5::new();
    let mut offset = 0_usize;
    loop {
        let header = bytes.get(offset..offset + 4)?;
        let len = u16::from_le_bytes([header[0], header[1]]);
        let record_type = u16::from_le_bytes([header[2], header[3]]);

        if len == SENTINEL && record_type == SENTINEL {
            let checksum = bytes.get(offset + 4..offset + 4 + MD5_LEN)?;
            return Some(checksum.try_into().ok()?);
        }

        let record_end = offset + 4 + len as usize;
        let record = bytes.get(offset..record_end)?;
        hasher.update(record);
        offset = record_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("journal-test-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn commit_then_playback_round_trips() {
        let dir = temp_dir("roundtrip");
        let mut j = Journal::create(&dir, 0, None).unwrap();
        j.append(b"hello", 1).unwrap();
        j.append(b"world", 2).unwrap();
        let committed = j.commit().unwrap();

        let mut seen = Vec::new();
        committed.playback(|data, ty| seen.push((data.to_vec(), ty))).unwrap();
        assert_eq!(seen, vec![(b"hello".to_vec(), 1), (b"world".to_vec(), 2)]);

        committed.erase().unwrap();
        assert!(!jnl_path(&dir, 0).exists());
    }

    #[test]
    fn reopen_after_restart_verifies_checksum() {
        let dir = temp_dir("reopen");
        let mut j = Journal::create(&dir, 0, None).unwrap();
        j.append(b"abc", 7).unwrap();
        j.commit().unwrap();

        let reopened = CommittedJournal::reopen(&dir, 0).unwrap().expect("should verify");
        let mut seen = Vec::new();
        reopened.playback(|data, ty| seen.push((data.to_vec(), ty))).unwrap();
        assert_eq!(seen, vec![(b"abc".to_vec(), 7)]);
    }

    #[test]
    fn truncated_journal_fails_to_reopen() {
        let dir = temp_dir("truncated");
        let mut j = Journal::create(&dir, 0, None).unwrap();
        j.append(b"abc", 7).unwrap();
        j.commit().unwrap();

        // Corrupt the data file after the fact; the commit marker no longer matches.
        let mut bytes = fs::read(jnl_path(&dir, 0)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(jnl_path(&dir, 0), bytes).unwrap();

        assert!(CommittedJournal::reopen(&dir, 0).unwrap().is_none());
    }

    #[test]
    fn missing_commit_marker_is_not_committed() {
        let dir = temp_dir("nomarker");
        let mut j = Journal::create(&dir, 0, None).unwrap();
        j.append(b"abc", 7).unwrap();
        // Deliberately never call `.commit()`.
        drop(j);

        assert!(CommittedJournal::reopen(&dir, 0).unwrap().is_none());
    }
}
