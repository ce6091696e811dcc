use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::low_level::Journal;


const RECORD_WRITE:  u16 = 1;
const RECORD_UNLINK: u16 = 2;
const RECORD_RM_R:   u16 = 3;

/// A handle to a small file open within a [`FileTxContext`]. Opaque; all operations on it go
/// through the owning context (spec.md §4.4's process-wide metafile table, modeled here as an
/// explicitly-passed context rather than a global, per spec.md §9's REDESIGN FLAGS).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaFileHandle(PathBuf);

#[derive(Debug)]
struct MetaFileEntry {
    data:     Vec<u8>,
    dirty:    bool,
    refcount: u32,
}

/// An identifier for a completed transaction, returned by [`FileTxContext::tx_end`] when
/// `assign_id` is set, for later use with [`FileTxContext::tx_sync`]/[`tx_forget`].
///
/// [`tx_forget`]: FileTxContext::tx_forget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(u64);

/// A FIFO-ordered handler registration, used to unregister a pre-end handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreEndHandlerId(u64);

/// The file-transaction layer: represents each "small file" as an in-memory buffer, batches all
/// writes within a transaction, and applies them to the filesystem atomically on commit via the
/// low-level [`Journal`] (spec.md §4.4).
pub struct FileTxContext {
    root:             PathBuf,
    journals_dir:     PathBuf,
    #[expect(dead_code, reason = "retained for parity with spec.md's configurable log rotation size")]
    log_size:         u64,
    files:            HashMap<PathBuf, MetaFileEntry>,
    pending_unlinks:  Vec<(PathBuf, bool)>,
    depth:            u32,
    next_seq:         u64,
    last_committed:   Option<u64>,
    next_tx_id:       u64,
    synced_tx_ids:    std::collections::HashSet<u64>,
    pre_end_handlers: Vec<(u64, Box<dyn FnMut()>)>,
    next_handler_id:  u64,
}

impl FileTxContext {
    /// Recovers by scanning the journals directory, sorting lexicographically, and for each
    /// committed journal: replaying it against the real filesystem, then erasing it. The last
    /// surviving sequence number (committed or not) is where the next journal continues from.
    ///
    /// # Errors
    /// Returns an error if the journals directory cannot be created or a recovered write cannot
    /// be applied to the filesystem.
    pub fn tx_init(root: &Path, log_size: u64) -> Result<Self> {
        let journals_dir = root.join("journals");
        fs::create_dir_all(&journals_dir)?;

        let mut seqs = list_journal_seqs(&journals_dir)?;
        seqs.sort_unstable();

        let mut max_seq = None;
        for seq in seqs {
            max_seq = Some(seq);
            if let Some(committed) = crate::low_level::CommittedJournal::reopen(&journals_dir, seq)? {
                tracing::info!(seq, "recovering committed journal");
                apply_records(&journals_dir, &committed)?;
                committed.erase()?;
            } else {
                tracing::warn!(seq, "removing uncommitted/corrupt journal left by a crash");
                let _ = fs::remove_file(journals_dir.join(format!("{seq:08}.jnl")));
                let _ = fs::remove_file(journals_dir.join(format!("{seq:08}.jnl.commit")));
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            journals_dir,
            log_size,
            files: HashMap::new(),
            pending_unlinks: Vec::new(),
            depth: 0,
            next_seq: max_seq.map_or(0, |s| s + 1),
            last_committed: None,
            next_tx_id: 0,
            synced_tx_ids: std::collections::HashSet::new(),
            pre_end_handlers: Vec::new(),
            next_handler_id: 0,
        })
    }

    fn resolve(&self, dfd: &Path, name: &str) -> PathBuf {
        self.root.join(dfd).join(name)
    }

    /// Opens (or creates) a small file for buffered, transactional access.
    pub fn mf_open(&mut self, dfd: &Path, name: &str, create: bool) -> Result<MetaFileHandle> {
        let path = self.resolve(dfd, name);
        if let Some(entry) = self.files.get_mut(&path) {
            entry.refcount += 1;
            return Ok(MetaFileHandle(path));
        }

        let data = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        self.files.insert(path.clone(), MetaFileEntry { data, dirty: false, refcount: 1 });
        Ok(MetaFileHandle(path))
    }

    fn entry(&self, handle: &MetaFileHandle) -> &MetaFileEntry {
        self.files.get(&handle.0).expect("MetaFileHandle used after close")
    }

    fn entry_mut(&mut self, handle: &MetaFileHandle) -> &mut MetaFileEntry {
        self.files.get_mut(&handle.0).expect("MetaFileHandle used after close")
    }

    #[must_use]
    pub fn mf_read(&self, handle: &MetaFileHandle, offset: usize, len: usize) -> Vec<u8> {
        let data = &self.entry(handle).data;
        let end = (offset + len).min(data.len());
        let start = offset.min(end);
        data[start..end].to_vec()
    }

    pub fn mf_write(&mut self, handle: &MetaFileHandle, offset: usize, data: &[u8]) {
        let entry = self.entry_mut(handle);
        let end = offset + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset..end].copy_from_slice(data);
        entry.dirty = true;
    }

    pub fn mf_truncate(&mut self, handle: &MetaFileHandle, new_len: usize) {
        let entry = self.entry_mut(handle);
        entry.data.truncate(new_len);
        entry.dirty = true;
    }

    #[must_use]
    pub fn mf_size(&self, handle: &MetaFileHandle) -> usize {
        self.entry(handle).data.len()
    }

    /// Drops a reference; the entry is released once the refcount reaches zero and the file is
    /// clean (any dirty data has already been flushed out in a `tx_end`).
    pub fn mf_close(&mut self, handle: MetaFileHandle) {
        if let Some(entry) = self.files.get_mut(&handle.0) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 && !entry.dirty {
                self.files.remove(&handle.0);
            }
        }
    }

    /// Records a pending unlink, applied at the next `tx_end`.
    pub fn mf_unlink(&mut self, dfd: &Path, name: &str, recursive: bool) {
        let path = self.resolve(dfd, name);
        self.files.remove(&path);
        self.pending_unlinks.push((path, recursive));
    }

    /// Recursive; nests freely — only the outermost `tx_end` does any work.
    pub fn tx_start(&mut self) {
        self.depth += 1;
    }

    /// Registers a handler invoked (in FIFO order) at the top of the next `tx_end`.
    pub fn tx_register_pre_end(&mut self, handler: Box<dyn FnMut()>) -> PreEndHandlerId {
        let id = self.next_handler_id;
        self.next_handler_id += 1;
        self.pre_end_handlers.push((id, handler));
        PreEndHandlerId(id)
    }

    pub fn tx_unregister_pre_end(&mut self, id: PreEndHandlerId) {
        self.pre_end_handlers.retain(|(existing, _)| *existing != id.0);
    }

    /// Ends (or un-nests) the current transaction. Only the outermost `tx_end` actually commits:
    /// every registered pre-end handler runs, every dirty metafile is appended as a `WRITE`
    /// record, every pending unlink as an `UNLINK`/`RM_R` record, the journal is committed and
    /// immediately played back against the real filesystem (write-to-temp, then rename; then
    /// unlink), and finally erased.
    ///
    /// # Errors
    /// Any I/O failure here should be treated as fatal for the transaction per spec.md §7.
    pub fn tx_end(&mut self, assign_id: bool) -> Result<Option<TxId>> {
        assert!(self.depth > 0, "tx_end called without a matching tx_start");
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(None);
        }

        let mut idx = 0;
        while idx < self.pre_end_handlers.len() {
            (self.pre_end_handlers[idx].1)();
            idx += 1;
        }

        let prev = self.last_committed;
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut journal = Journal::create(&self.journals_dir, seq, prev)?;

        for (path, entry) in &self.files {
            if !entry.dirty {
                continue;
            }
            let path_bytes = path.to_string_lossy().into_owned().into_bytes();
            let mut record = Vec::with_capacity(8 + path_bytes.len() + entry.data.len());
            record.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
            record.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
            record.extend_from_slice(&path_bytes);
            record.extend_from_slice(&entry.data);
            journal.append(&record, RECORD_WRITE)?;
        }

        for (path, recursive) in &self.pending_unlinks {
            let record_type = if *recursive { RECORD_RM_R } else { RECORD_UNLINK };
            journal.append(path.to_string_lossy().as_bytes(), record_type)?;
        }

        let committed = journal.commit()?;
        apply_records(&self.journals_dir, &committed)?;
        committed.erase()?;
        self.last_committed = Some(seq);

        for entry in self.files.values_mut() {
            entry.dirty = false;
        }
        self.files.retain(|_, entry| entry.refcount > 0);
        self.pending_unlinks.clear();

        if assign_id {
            let id = self.next_tx_id;
            self.next_tx_id += 1;
            self.synced_tx_ids.insert(id);
            Ok(Some(TxId(id)))
        } else {
            Ok(None)
        }
    }

    /// Blocks until the transaction for `id` is durable. `tx_end` above is already synchronous,
    /// so this only validates that `id` was really returned by a completed transaction.
    pub fn tx_sync(&self, id: TxId) {
        debug_assert!(self.synced_tx_ids.contains(&id.0), "tx_sync called with an unknown TxId");
    }

    pub fn tx_forget(&mut self, id: TxId) {
        self.synced_tx_ids.remove(&id.0);
    }
}

impl Drop for FileTxContext {
    fn drop(&mut self) {
        if self.depth > 0 {
            tracing::warn!(depth = self.depth, "FileTxContext dropped with a dangling transaction");
        }
    }
}

fn list_journal_seqs(dir: &Path) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".jnl") {
            if let Ok(seq) = stem.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    Ok(seqs)
}

fn apply_records(_journals_dir: &Path, committed: &crate::low_level::CommittedJournal) -> Result<()> {
    let mut io_err = None;
    committed
        .playback(|data, record_type| {
            if io_err.is_some() {
                return;
            }
            if let Err(e) = apply_one(data, record_type) {
                io_err = Some(e);
            }
        })
        .map_err(|_| Error::Corrupt(PathBuf::from(format!("seq {}", committed.seq()))))?;
    io_err.map_or(Ok(()), Err)
}

fn apply_one(data: &[u8], record_type: u16) -> Result<()> {
    match record_type {
        RECORD_WRITE => {
            let path_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
            let data_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
            let path = PathBuf::from(String::from_utf8_lossy(&data[8..8 + path_len]).into_owned());
            let contents = &data[8 + path_len..8 + path_len + data_len];

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp_path = path.with_extension("mf-tmp");
            fs::write(&tmp_path, contents)?;
            fs::rename(&tmp_path, &path)?;
        }
        RECORD_UNLINK => {
            let path = PathBuf::from(String::from_utf8_lossy(data).into_owned());
            match fs::remove_file(&path) {
                Ok(()) | Err(_) => {}
            }
        }
        RECORD_RM_R => {
            let path = PathBuf::from(String::from_utf8_lossy(data).into_owned());
            let _ = fs::remove_dir_all(&path);
        }
        other => {
            tracing::warn!(record_type = other, "ignoring unknown metafile record type");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("metafile-test-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn write_is_only_visible_on_disk_after_tx_end() {
        let root = temp_root("write");
        let mut ctx = FileTxContext::tx_init(&root, 1 << 20).unwrap();

        ctx.tx_start();
        let h = ctx.mf_open(Path::new("."), "a.txt", true).unwrap();
        ctx.mf_write(&h, 0, b"hello");
        assert!(!root.join("a.txt").exists());
        ctx.tx_end(false).unwrap();

        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"hello");
        ctx.mf_close(h);
    }

    #[test]
    fn nested_transactions_only_commit_once() {
        let root = temp_root("nested");
        let mut ctx = FileTxContext::tx_init(&root, 1 << 20).unwrap();

        ctx.tx_start();
        ctx.tx_start();
        let h = ctx.mf_open(Path::new("."), "b.txt", true).unwrap();
        ctx.mf_write(&h, 0, b"x");
        ctx.tx_end(false).unwrap();
        assert!(!root.join("b.txt").exists(), "inner tx_end must not commit");
        ctx.tx_end(false).unwrap();
        assert!(root.join("b.txt").exists());
        ctx.mf_close(h);
    }

    #[test]
    fn pre_end_handlers_run_in_fifo_order() {
        let root = temp_root("preend");
        let mut ctx = FileTxContext::tx_init(&root, 1 << 20).unwrap();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = std::sync::Arc::clone(&order);
        ctx.tx_register_pre_end(Box::new(move || o1.lock().unwrap().push(1)));
        let o2 = std::sync::Arc::clone(&order);
        ctx.tx_register_pre_end(Box::new(move || o2.lock().unwrap().push(2)));

        ctx.tx_start();
        ctx.tx_end(false).unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unlink_removes_file_at_commit() {
        let root = temp_root("unlink");
        let mut ctx = FileTxContext::tx_init(&root, 1 << 20).unwrap();

        ctx.tx_start();
        let h = ctx.mf_open(Path::new("."), "c.txt", true).unwrap();
        ctx.mf_write(&h, 0, b"x");
        ctx.tx_end(false).unwrap();
        ctx.mf_close(h);
        assert!(root.join("c.txt").exists());

        ctx.tx_start();
        ctx.mf_unlink(Path::new("."), "c.txt", false);
        ctx.tx_end(false).unwrap();
        assert!(!root.join("c.txt").exists());
    }

    #[test]
    fn recovery_replays_committed_journal_left_by_a_crash() {
        let root = temp_root("recovery");
        {
            let mut ctx = FileTxContext::tx_init(&root, 1 << 20).unwrap();
            ctx.tx_start();
            let h = ctx.mf_open(Path::new("."), "d.txt", true).unwrap();
            ctx.mf_write(&h, 0, b"persisted");
            ctx.tx_end(false).unwrap();
            ctx.mf_close(h);
        }
        // Simulate a fresh process reopening the same root.
        let _ctx2 = FileTxContext::tx_init(&root, 1 << 20).unwrap();
        assert_eq!(fs::read(root.join("d.txt")).unwrap(), b"persisted");
    }
}
