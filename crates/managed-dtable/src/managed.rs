//! [`ManagedDTable`]: a writable journal tip plus a sequence of immutable levels, combined into
//! one dtable and maintained (digested, combined) over time (spec.md §4.9).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use blob_key::{Blob, Key, KeyType, SharedComparator};
use dtable::{DTable, DTableIter, SourceId};
use journal::FileTxContext;
use overlay::OverlayDTable;
use sys_journal::{JournalListener, ListenerWarehouse, SysJournal};

use crate::config::{LevelFactory, ManagedDTableConfig};
use crate::error::{Error, Result};
use crate::journal_dtable::{JournalDTable, OwnedVecIter, TempJournalDTable};
use crate::meta::{LevelEntry, MdMeta};
use crate::worker::WorkerHandle;


/// Wraps an `Arc<dyn DTable>` so it can stand in a `Vec<Box<dyn DTable>>` layer list (orphan
/// rules forbid implementing the foreign `DTable` trait directly on the foreign `Arc<dyn DTable>`
/// type from this crate).
#[derive(Debug)]
struct ArcDTable(Arc<dyn DTable>);

impl DTable for ArcDTable {
    fn key_type(&self) -> KeyType {
        self.0.key_type()
    }
    fn blob_comparator(&self) -> Option<&SharedComparator> {
        self.0.blob_comparator()
    }
    fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.0.lookup(key)
    }
    fn iter(&self) -> Box<dyn DTableIter + '_> {
        self.0.iter()
    }
    fn size(&self) -> Option<usize> {
        self.0.size()
    }
    fn index(&self, i: usize) -> Option<(Key, Blob)> {
        self.0.index(i)
    }
    fn contains_index(&self, i: usize) -> bool {
        self.0.contains_index(i)
    }
    fn maintain(&self) {
        self.0.maintain();
    }
}

fn boxed_arc(table: &Arc<dyn DTable>) -> Box<dyn DTable> {
    Box::new(ArcDTable(Arc::clone(table)))
}

/// One immutable level: its on-disk identity (`md_data.{id}`, also present in [`MdMeta`]) and the
/// loaded table. `Arc` (not `Box`) so a clone kept by a live iterator snapshot can outlive the
/// level's removal from [`Inner::levels`] during a later combine — the idiomatic-Rust substitute
/// for the spec's manual doomed-dtable callback registry.
#[derive(Debug)]
struct Level {
    id:          u32,
    is_fastbase: bool,
    table:       Arc<dyn DTable>,
}

/// A transient [`ListenerWarehouse`] built on-demand around `Inner`'s live listeners, for the
/// span of a single `spawn_init`/`filter` call. Abortable-transaction temp tips are never
/// resurrected across a restart (`spawn_init` is always called with `discard_temporaries:
/// true`), so `obtain` never needs to manufacture a fresh `TempJournalDTable`.
struct WarehouseView<'a> {
    tip:       &'a mut JournalDTable,
    temp_tips: &'a mut HashMap<u32, TempJournalDTable>,
}

impl ListenerWarehouse for WarehouseView<'_> {
    fn lookup(&mut self, listener_id: u32) -> Option<&mut dyn JournalListener> {
        if listener_id == self.tip.listener_id() {
            return Some(&mut *self.tip);
        }
        self.temp_tips.get_mut(&listener_id).map(|t| t as &mut dyn JournalListener)
    }

    fn obtain(&mut self, listener_id: u32, _key_type: KeyType) -> Option<&mut dyn JournalListener> {
        self.lookup(listener_id)
    }

    fn live_listener_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.temp_tips.keys().copied().collect();
        ids.push(self.tip.listener_id());
        ids
    }
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
}

fn level_name(id: u32) -> String {
    format!("md_data.{id}")
}

/// Walks `table` front to back, collecting every entry into an owned, sorted vector. Used to
/// build a point-in-time snapshot iterator over an [`OverlayDTable`] that no longer borrows
/// `Inner`'s levels once returned.
fn collect_all(table: &dyn DTable) -> Vec<(Key, Blob)> {
    let mut it = table.iter();
    it.first();
    let mut out = Vec::new();
    while it.valid() {
        out.push((it.key(), it.value()));
        it.next();
    }
    out
}

/// Private state behind [`ManagedDTable`]'s `Arc<Mutex<_>>`; stands in for the spec's `bg_token`
/// handoff between the foreground caller and the background worker (spec.md §4.9), using a plain
/// mutex rather than a hand-rolled token-passing protocol since this codebase's single-process,
/// single-writer model (spec.md §5) needs only mutual exclusion, not a loaned/returned handle.
pub(crate) struct Inner {
    root:       PathBuf,
    /// This managed dtable's directory, relative to `tx`'s root. A standalone instance (opened
    /// directly against its own directory rather than through a [`crate::store::Store`]) uses
    /// `"."`; a `Store`-owned instance shares one context rooted at the store root and uses its
    /// own name as `dfd`, so that the transaction log itself is common to every co-located
    /// managed dtable (spec.md §4.4's process-wide `FileTxContext`, spec.md §4.9 `sys_journal`).
    dfd:        PathBuf,
    key_type:   KeyType,
    comparator: Option<SharedComparator>,
    config:     ManagedDTableConfig,
    tx:         Arc<Mutex<FileTxContext>>,
    sys:        SysJournal,
    meta:       MdMeta,
    tip:        JournalDTable,
    levels:     Vec<Level>,
    temp_tips:  HashMap<u32, TempJournalDTable>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("root", &self.root)
            .field("key_type", &self.key_type)
            .field("meta", &self.meta)
            .field("levels", &self.levels)
            .field("temp_tips", &self.temp_tips.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn create(root: &Path, key_type: KeyType, comparator: Option<SharedComparator>, config: ManagedDTableConfig) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let tx = Arc::new(Mutex::new(FileTxContext::tx_init(root, config.tx_log_size)?));
        Self::create_shared(root, PathBuf::from("."), tx, key_type, comparator, config)
    }

    fn open(root: &Path, comparator: Option<SharedComparator>, config: ManagedDTableConfig) -> Result<Self> {
        let tx = Arc::new(Mutex::new(FileTxContext::tx_init(root, config.tx_log_size)?));
        Self::open_shared(root, PathBuf::from("."), tx, comparator, config)
    }

    /// Builds a fresh managed dtable that shares `tx` (and, through it, its transaction log) with
    /// every other managed dtable `dfd` is co-located with under the same context root
    /// (spec.md §4.4, §4.9: `Store::create` passes down one context per store).
    pub(crate) fn create_shared(
        root:       &Path,
        dfd:        PathBuf,
        tx:         Arc<Mutex<FileTxContext>>,
        key_type:   KeyType,
        comparator: Option<SharedComparator>,
        config:     ManagedDTableConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let sys_path = root.join("sys_journal");

        let mut tip = JournalDTable::new(0, key_type, comparator.clone());
        let mut temp_tips = HashMap::new();
        let mut sys = {
            let mut view = WarehouseView { tip: &mut tip, temp_tips: &mut temp_tips };
            SysJournal::spawn_init(&sys_path, &mut view, true)?
        };
        let listener_id = sys.get_unique_id(false);
        let tip = JournalDTable::new(listener_id, key_type, comparator.clone());
        tip.log_comparator(&mut sys)?;

        let meta = MdMeta::new(key_type, listener_id);

        let mut inner = Self { root: root.to_path_buf(), dfd, key_type, comparator, config, tx, sys, meta, tip, levels: Vec::new(), temp_tips };
        inner.persist_meta()?;
        Ok(inner)
    }

    /// Reopens a managed dtable against a shared context; see [`Self::create_shared`].
    pub(crate) fn open_shared(
        root:       &Path,
        dfd:        PathBuf,
        tx:         Arc<Mutex<FileTxContext>>,
        comparator: Option<SharedComparator>,
        config:     ManagedDTableConfig,
    ) -> Result<Self> {
        let bytes = std::fs::read(root.join("md_meta"))?;
        let meta = MdMeta::decode(&bytes)?;
        let key_type = meta.key_type;

        let sys_path = root.join("sys_journal");

        let mut tip = JournalDTable::new(meta.listener_id, key_type, comparator.clone());
        let mut temp_tips = HashMap::new();
        let sys = {
            let mut view = WarehouseView { tip: &mut tip, temp_tips: &mut temp_tips };
            SysJournal::spawn_init(&sys_path, &mut view, true)?
        };

        let mut levels = Vec::with_capacity(meta.levels.len());
        for entry in &meta.levels {
            let name = level_name(entry.id);
            let factory: &Arc<dyn LevelFactory> = if entry.is_fastbase { &config.fastbase } else { &config.base };
            let table = factory.open(root, &name, comparator.clone())?;
            levels.push(Level { id: entry.id, is_fastbase: entry.is_fastbase, table: Arc::from(table) });
        }

        Ok(Self { root: root.to_path_buf(), dfd, key_type, comparator, config, tx, sys, meta, tip, levels, temp_tips })
    }

    fn persist_meta(&mut self) -> Result<()> {
        let mut tx = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tx.tx_start();
        let bytes = self.meta.encode();
        let handle = tx.mf_open(&self.dfd, "md_meta", true)?;
        tx.mf_truncate(&handle, 0);
        tx.mf_write(&handle, 0, &bytes);
        tx.mf_close(handle);
        tx.tx_end(false)?;
        Ok(())
    }

    fn filter_journal(&mut self) -> Result<()> {
        let mut view = WarehouseView { tip: &mut self.tip, temp_tips: &mut self.temp_tips };
        self.sys.filter(&mut view)?;
        Ok(())
    }

    pub(crate) fn lookup(&self, key: &Key) -> (bool, Blob) {
        let (found, blob) = self.tip.lookup(key);
        if found {
            return (blob.exists(), blob);
        }
        for level in self.levels.iter().rev() {
            let (found, blob) = level.table.lookup(key);
            if found {
                return (blob.exists(), blob);
            }
        }
        (false, Blob::tombstone())
    }

    pub(crate) fn insert(&mut self, key: Key, blob: Blob, append: bool) -> Result<bool> {
        if !blob.exists() {
            let (found, _) = self.lookup(&key);
            if !found {
                return Ok(true);
            }
        }
        self.tip.insert(&mut self.sys, key, blob, append)?;
        if self.tip.size().unwrap_or(0) >= self.config.digest_size {
            self.digest()?;
        }
        Ok(true)
    }

    pub(crate) fn remove(&mut self, key: &Key) -> Result<bool> {
        let (found, _) = self.lookup(key);
        if !found {
            return Ok(true);
        }
        self.tip.remove(&mut self.sys, key)?;
        Ok(true)
    }

    pub(crate) fn create_tx(&mut self) -> u32 {
        let id = self.sys.get_unique_id(true);
        self.temp_tips.insert(id, TempJournalDTable::new(id, self.key_type, self.comparator.clone()));
        id
    }

    pub(crate) fn lookup_tx(&self, atx: u32, key: &Key) -> Result<(bool, Blob)> {
        let temp = self.temp_tips.get(&atx).ok_or(Error::Exists(atx))?;
        let (found, blob) = temp.lookup(key);
        if found {
            return Ok((blob.exists(), blob));
        }
        Ok(self.lookup(key))
    }

    pub(crate) fn insert_tx(&mut self, atx: u32, key: Key, blob: Blob, append: bool) -> Result<bool> {
        if !self.temp_tips.contains_key(&atx) {
            return Err(Error::Exists(atx));
        }
        if !blob.exists() {
            let (found, _) = self.lookup_tx(atx, &key)?;
            if !found {
                return Ok(true);
            }
        }
        let sys = &mut self.sys;
        let temp = self.temp_tips.get_mut(&atx).expect("checked above");
        temp.insert(sys, key, blob, append)
    }

    pub(crate) fn remove_tx(&mut self, atx: u32, key: &Key) -> Result<bool> {
        let (found, _) = self.lookup_tx(atx, key)?;
        if !found {
            return Ok(true);
        }
        let sys = &mut self.sys;
        let temp = self.temp_tips.get_mut(&atx).ok_or(Error::Exists(atx))?;
        temp.remove(sys, key)
    }

    pub(crate) fn commit_tx(&mut self, atx: u32) -> Result<()> {
        let temp = self.temp_tips.remove(&atx).ok_or(Error::Exists(atx))?;
        for (key, blob) in temp.entries() {
            if blob.exists() {
                self.tip.insert(&mut self.sys, key.clone(), blob.clone(), false)?;
            } else {
                self.tip.remove(&mut self.sys, key)?;
            }
        }
        self.filter_journal()
    }

    pub(crate) fn abort_tx(&mut self, atx: u32) -> Result<()> {
        self.temp_tips.remove(&atx).ok_or(Error::Exists(atx))?;
        self.filter_journal()
    }

    fn snapshot_layers(&self, with_tx: Option<u32>) -> Result<Vec<Box<dyn DTable>>> {
        let mut layers: Vec<Box<dyn DTable>> = Vec::with_capacity(self.levels.len() + 2);
        if let Some(atx) = with_tx {
            let temp = self.temp_tips.get(&atx).ok_or(Error::Exists(atx))?;
            layers.push(Box::new(temp.clone()));
        }
        layers.push(Box::new(self.tip.clone()));
        for level in self.levels.iter().rev() {
            layers.push(boxed_arc(&level.table));
        }
        Ok(layers)
    }

    pub(crate) fn snapshot_iter(&self) -> Box<dyn DTableIter> {
        let overlay = OverlayDTable::new(self.snapshot_layers(None).expect("no tx id to look up"));
        Box::new(OwnedVecIter::with_comparator(collect_all(&overlay), SourceId(0), self.comparator.clone()))
    }

    pub(crate) fn snapshot_iter_tx(&self, atx: u32) -> Result<Box<dyn DTableIter>> {
        let overlay = OverlayDTable::new(self.snapshot_layers(Some(atx))?);
        Ok(Box::new(OwnedVecIter::with_comparator(collect_all(&overlay), SourceId(0), self.comparator.clone())))
    }

    pub(crate) fn digest(&mut self) -> Result<()> {
        if self.tip.size().unwrap_or(0) == 0 {
            return Ok(());
        }

        let id = self.meta.ddt_next;
        self.meta.ddt_next += 1;
        let name = level_name(id);
        let table = self.config.fastbase.create(&self.root, &name, self.comparator.clone(), &self.tip, None)?;

        let new_listener_id = self.sys.get_unique_id(false);
        let new_tip = JournalDTable::new(new_listener_id, self.key_type, self.comparator.clone());
        new_tip.log_comparator(&mut self.sys)?;

        self.meta.listener_id = new_listener_id;
        self.meta.levels.push(LevelEntry { id, is_fastbase: true });
        self.meta.last_digest = now_secs();
        self.meta.digests_since_combine += 1;
        self.meta.fastbase_run_length += 1;
        self.persist_meta()?;

        self.levels.push(Level { id, is_fastbase: true, table: Arc::from(table) });
        self.tip = new_tip;

        self.filter_journal()
    }

    /// Folds levels `first..=last` into one new level. `last == self.levels.len()` is
    /// tip-inclusive: the live journal tip is folded in too, and a fresh tip replaces it
    /// afterward (`original_source/managed_dtable.h` allows `last == disks.size()` the same way).
    pub(crate) fn combine(&mut self, first: usize, last: usize, fastbase: bool) -> Result<()> {
        if last > self.levels.len() || first > last {
            return Err(Error::InvalidArgument("combine index range out of bounds"));
        }
        let include_tip = last == self.levels.len();
        let disk_end = if include_tip { last } else { last + 1 };

        let mut source_layers: Vec<Box<dyn DTable>> = Vec::new();
        if include_tip {
            source_layers.push(Box::new(self.tip.clone()));
        }
        source_layers.extend(self.levels[first..disk_end].iter().rev().map(|l| boxed_arc(&l.table)));
        let source = OverlayDTable::new(source_layers);
        let shadow = if first > 0 {
            let shadow_layers: Vec<Box<dyn DTable>> = self.levels[..first].iter().rev().map(|l| boxed_arc(&l.table)).collect();
            Some(OverlayDTable::new(shadow_layers))
        } else {
            None
        };

        let id = self.meta.ddt_next;
        self.meta.ddt_next += 1;
        let name = level_name(id);
        let factory: &Arc<dyn LevelFactory> = if fastbase { &self.config.fastbase } else { &self.config.base };
        let table = factory.create(&self.root, &name, self.comparator.clone(), &source, shadow.as_ref().map(|s| s as &dyn DTable))?;

        let removed: Vec<Level> =
            self.levels.splice(first..disk_end, std::iter::once(Level { id, is_fastbase: fastbase, table: Arc::from(table) })).collect();
        self.meta.levels.splice(first..disk_end, std::iter::once(LevelEntry { id, is_fastbase }));

        if include_tip {
            let new_listener_id = self.sys.get_unique_id(false);
            let new_tip = JournalDTable::new(new_listener_id, self.key_type, self.comparator.clone());
            new_tip.log_comparator(&mut self.sys)?;
            self.meta.listener_id = new_listener_id;
            self.tip = new_tip;
        }

        self.meta.last_combine = now_secs();
        self.meta.digests_since_combine = 0;
        self.meta.fastbase_run_length = 0;
        self.persist_meta()?;

        for level in removed {
            let lvl_factory: &Arc<dyn LevelFactory> = if level.is_fastbase { &self.config.fastbase } else { &self.config.base };
            lvl_factory.remove(&self.root, &level_name(level.id))?;
        }

        self.filter_journal()
    }

    /// The tail-of-list window of same-kind consecutive levels a combine would fold, bounded by
    /// `combine_count`. `None` when fewer than two levels qualify.
    fn combine_window(&self) -> Option<(usize, usize, bool)> {
        let last = self.levels.len().checked_sub(1)?;
        let kind = self.levels[last].is_fastbase;
        let mut first = last;
        while first > 0 && self.levels[first - 1].is_fastbase == kind && last - (first - 1) + 1 <= self.config.combine_count {
            first -= 1;
        }
        (first < last).then_some((first, last, kind))
    }

    pub(crate) fn maintain(&mut self, force: bool) -> Result<()> {
        let now = now_secs();
        if force || now.saturating_sub(self.meta.last_digest) >= self.config.digest_interval.as_secs() as i64 {
            self.digest()?;
        }

        let interval_due = now.saturating_sub(self.meta.last_combine) >= self.config.combine_interval.as_secs() as i64;
        let auto_due = self.config.autocombine
            && (self.meta.digests_since_combine >= self.config.autocombine_digests
                || self.meta.fastbase_run_length as usize >= self.config.autocombine_combine_count);

        if force || interval_due || auto_due {
            if let Some((first, last, kind)) = self.combine_window() {
                self.combine(first, last, kind)?;
            }
        }
        Ok(())
    }

    fn digest_on_close(&self) -> bool {
        self.config.digest_on_close
    }

    /// How often the background worker should check whether a digest or combine is due: a
    /// quarter of the shorter of the two intervals, so a timer-only worker doesn't lag noticeably
    /// behind an interval it's meant to enforce.
    pub(crate) fn poll_tick(&self) -> std::time::Duration {
        self.config.digest_interval.min(self.config.combine_interval) / 4
    }
}

/// Combines a writable journal tip and a sequence of immutable levels into one managed,
/// background-maintained dtable (spec.md §4.9).
pub struct ManagedDTable {
    inner:  Arc<Mutex<Inner>>,
    worker: Option<WorkerHandle>,
}

impl fmt::Debug for ManagedDTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDTable").field("running", &self.worker.is_some()).finish_non_exhaustive()
    }
}

impl ManagedDTable {
    /// Creates a fresh managed dtable rooted at `root` (which must not already hold one).
    ///
    /// # Errors
    /// Propagates I/O failures creating `root` or its `sys_journal`/`md_meta` files.
    pub fn create(root: &Path, key_type: KeyType, comparator: Option<SharedComparator>, config: ManagedDTableConfig) -> Result<Self> {
        Ok(Self { inner: Arc::new(Mutex::new(Inner::create(root, key_type, comparator, config)?)), worker: None })
    }

    /// Reopens a managed dtable previously created at `root`.
    ///
    /// # Errors
    /// Propagates I/O failures, or [`Error::Corrupt`] if `md_meta` is unreadable.
    pub fn open(root: &Path, comparator: Option<SharedComparator>, config: ManagedDTableConfig) -> Result<Self> {
        Ok(Self { inner: Arc::new(Mutex::new(Inner::open(root, comparator, config)?)), worker: None })
    }

    /// Like [`Self::create`], but shares `tx`'s transaction log (and, through it, a common
    /// journals directory) with every other managed dtable opened against the same context —
    /// used by [`crate::store::Store`] so co-located managed dtables share one `sys_journal`
    /// transaction log instead of each keeping a private one (spec.md §4.9).
    pub(crate) fn create_shared(
        root:       &Path,
        dfd:        PathBuf,
        tx:         Arc<Mutex<FileTxContext>>,
        key_type:   KeyType,
        comparator: Option<SharedComparator>,
        config:     ManagedDTableConfig,
    ) -> Result<Self> {
        Ok(Self { inner: Arc::new(Mutex::new(Inner::create_shared(root, dfd, tx, key_type, comparator, config)?)), worker: None })
    }

    /// Like [`Self::open`]; see [`Self::create_shared`].
    pub(crate) fn open_shared(
        root:       &Path,
        dfd:        PathBuf,
        tx:         Arc<Mutex<FileTxContext>>,
        comparator: Option<SharedComparator>,
        config:     ManagedDTableConfig,
    ) -> Result<Self> {
        Ok(Self { inner: Arc::new(Mutex::new(Inner::open_shared(root, dfd, tx, comparator, config)?)), worker: None })
    }

    /// Starts the background maintenance worker (spec.md §4.9), idempotent if already running.
    pub fn spawn_background(&mut self) {
        if self.worker.is_none() {
            self.worker = Some(WorkerHandle::spawn(Arc::clone(&self.inner)));
        }
    }

    /// Stops the background worker, if one is running.
    pub fn stop_background(&mut self) {
        self.worker.take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// # Errors
    /// Propagates I/O failures appending to the system journal, or triggering a digest.
    pub fn insert(&self, key: Key, blob: Blob, append: bool) -> Result<bool> {
        self.lock().insert(key, blob, append)
    }

    /// # Errors
    /// Propagates I/O failures appending to the system journal.
    pub fn remove(&self, key: &Key) -> Result<bool> {
        self.lock().remove(key)
    }

    #[must_use]
    pub fn lookup(&self, key: &Key) -> (bool, Blob) {
        self.lock().lookup(key)
    }

    /// A point-in-time, owned snapshot iterator over the tip and every level, newest first.
    #[must_use]
    pub fn iterator(&self) -> Box<dyn DTableIter> {
        self.lock().snapshot_iter()
    }

    /// # Errors
    /// Propagates I/O failures triggered by an automatic digest or combine.
    pub fn maintain(&self, force: bool) -> Result<()> {
        self.lock().maintain(force)
    }

    /// Folds the tip into a fresh `fastbase` level, inline (spec.md §4.9's non-background
    /// digest).
    ///
    /// # Errors
    /// Propagates I/O failures writing the new level or `md_meta`.
    pub fn digest(&self) -> Result<()> {
        self.lock().digest()
    }

    /// Folds levels `[first, last]` (inclusive) into one level of the requested kind. `last`
    /// equal to the current number of immutable levels additionally folds in the live tip,
    /// replacing it with a fresh one afterward.
    ///
    /// # Errors
    /// Propagates I/O failures, or [`Error::InvalidArgument`] if the range is out of bounds.
    pub fn combine(&self, first: usize, last: usize, fastbase: bool) -> Result<()> {
        self.lock().combine(first, last, fastbase)
    }

    /// Starts an abortable transaction, returning its id.
    #[must_use]
    pub fn create_tx(&self) -> u32 {
        self.lock().create_tx()
    }

    /// # Errors
    /// Returns [`Error::Exists`] if `atx` is unknown, or propagates a journal I/O failure.
    pub fn insert_tx(&self, atx: u32, key: Key, blob: Blob, append: bool) -> Result<bool> {
        self.lock().insert_tx(atx, key, blob, append)
    }

    /// # Errors
    /// Returns [`Error::Exists`] if `atx` is unknown, or propagates a journal I/O failure.
    pub fn remove_tx(&self, atx: u32, key: &Key) -> Result<bool> {
        self.lock().remove_tx(atx, key)
    }

    /// # Errors
    /// Returns [`Error::Exists`] if `atx` is unknown.
    pub fn lookup_tx(&self, atx: u32, key: &Key) -> Result<(bool, Blob)> {
        self.lock().lookup_tx(atx, key)
    }

    /// # Errors
    /// Returns [`Error::Exists`] if `atx` is unknown.
    pub fn iterator_tx(&self, atx: u32) -> Result<Box<dyn DTableIter>> {
        self.lock().snapshot_iter_tx(atx)
    }

    /// Rolls `atx`'s records into the main tip and discards the transaction.
    ///
    /// # Errors
    /// Returns [`Error::Exists`] if `atx` is unknown, or propagates a journal I/O failure.
    pub fn commit_tx(&self, atx: u32) -> Result<()> {
        self.lock().commit_tx(atx)
    }

    /// Discards `atx` and every record written under it.
    ///
    /// # Errors
    /// Returns [`Error::Exists`] if `atx` is unknown, or propagates a journal I/O failure.
    pub fn abort_tx(&self, atx: u32) -> Result<()> {
        self.lock().abort_tx(atx)
    }

    /// Stops the background worker (if any) and, per `digest_on_close`, digests the tip once
    /// more before returning.
    ///
    /// # Errors
    /// Propagates I/O failures from the closing digest.
    pub fn close(mut self) -> Result<()> {
        self.worker.take();
        if self.lock().digest_on_close() {
            self.lock().digest()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::sync::Arc;

    use blob_key::{Blob, BlobComparator, Key, KeyType, SharedComparator};
    use dtable::DTableIter;

    use crate::config::ManagedDTableConfig;

    use super::ManagedDTable;

    fn dir(label: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("managed-dtable-test-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn insert_and_digest_survive_a_restart() {
        let dir = dir("restart");
        let table = ManagedDTable::create(&dir, KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        table.insert(Key::U32(1), Blob::present(*b"one"), false).unwrap();
        table.insert(Key::U32(2), Blob::present(*b"two"), false).unwrap();
        table.digest().unwrap();
        table.insert(Key::U32(3), Blob::present(*b"three"), false).unwrap();
        drop(table);

        let reopened = ManagedDTable::open(&dir, None, ManagedDTableConfig::default()).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"one"[..]));
        assert_eq!(reopened.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"two"[..]));
        assert_eq!(reopened.lookup(&Key::U32(3)).1.as_bytes(), Some(&b"three"[..]));
        assert!(!reopened.lookup(&Key::U32(4)).0);
    }

    #[test]
    fn remove_tombstone_survives_a_digest() {
        let dir = dir("tombstone");
        let table = ManagedDTable::create(&dir, KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        table.insert(Key::U32(1), Blob::present(*b"one"), false).unwrap();
        table.digest().unwrap();
        table.remove(&Key::U32(1)).unwrap();
        table.digest().unwrap();

        let (found, _) = table.lookup(&Key::U32(1));
        assert!(!found);
    }

    #[test]
    fn combine_folds_several_disk_levels_without_touching_the_tip() {
        let dir = dir("combine-disk");
        let table = ManagedDTable::create(&dir, KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        table.insert(Key::U32(1), Blob::present(*b"one"), false).unwrap();
        table.digest().unwrap();
        table.insert(Key::U32(2), Blob::present(*b"two"), false).unwrap();
        table.digest().unwrap();
        table.insert(Key::U32(3), Blob::present(*b"three"), false).unwrap();

        // Two immutable levels exist (indices 0 and 1); `last == 1` is not tip-inclusive since
        // it's less than the level count (2), so this folds only the two disk levels.
        table.combine(0, 1, false).unwrap();

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"one"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"two"[..]));
        assert_eq!(table.lookup(&Key::U32(3)).1.as_bytes(), Some(&b"three"[..]));
    }

    #[test]
    fn combine_including_the_tip_replaces_it_with_a_fresh_one() {
        let dir = dir("combine-tip");
        let table = ManagedDTable::create(&dir, KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        table.insert(Key::U32(1), Blob::present(*b"one"), false).unwrap();
        table.digest().unwrap();
        table.insert(Key::U32(2), Blob::present(*b"two"), false).unwrap();

        // One immutable level exists (index 0); `last == 1` equals the level count, so this
        // combine is tip-inclusive: it folds level 0 and the live tip together.
        table.combine(0, 1, false).unwrap();

        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"one"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"two"[..]));

        // The fresh tip that replaced the folded-in one still accepts writes.
        table.insert(Key::U32(3), Blob::present(*b"three"), false).unwrap();
        assert_eq!(table.lookup(&Key::U32(3)).1.as_bytes(), Some(&b"three"[..]));
    }

    #[test]
    fn abortable_transactions_are_isolated_until_committed() {
        let dir = dir("tx");
        let table = ManagedDTable::create(&dir, KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        table.insert(Key::U32(1), Blob::present(*b"base"), false).unwrap();

        let aborted = table.create_tx();
        table.insert_tx(aborted, Key::U32(2), Blob::present(*b"doomed"), false).unwrap();
        assert_eq!(table.lookup_tx(aborted, &Key::U32(2)).unwrap().1.as_bytes(), Some(&b"doomed"[..]));
        assert!(!table.lookup(&Key::U32(2)).0);
        table.abort_tx(aborted).unwrap();
        assert!(table.lookup_tx(aborted, &Key::U32(2)).is_err());
        assert!(!table.lookup(&Key::U32(2)).0);

        let committed = table.create_tx();
        table.insert_tx(committed, Key::U32(3), Blob::present(*b"kept"), false).unwrap();
        table.commit_tx(committed).unwrap();
        assert_eq!(table.lookup(&Key::U32(3)).1.as_bytes(), Some(&b"kept"[..]));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"base"[..]));
    }

    #[derive(Debug)]
    struct ReverseComparator;

    impl BlobComparator for ReverseComparator {
        fn name(&self) -> &str {
            "reverse"
        }

        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    #[test]
    fn reopening_with_a_reverse_comparator_reverses_iteration_order() {
        let dir = dir("reverse-cmp");
        let comparator: SharedComparator = Arc::new(ReverseComparator);
        let table = ManagedDTable::create(&dir, KeyType::Blob, Some(Arc::clone(&comparator)), ManagedDTableConfig::default()).unwrap();

        let key = |b: &[u8]| Key::Blob(Arc::from(b));
        table.insert(key(b"a"), Blob::present(*b"1"), false).unwrap();
        table.insert(key(b"z"), Blob::present(*b"2"), false).unwrap();
        table.digest().unwrap();
        table.insert(key(b"m"), Blob::present(*b"3"), false).unwrap();

        let mut it = table.iterator();
        it.first();
        let mut keys = Vec::new();
        while it.valid() {
            let Key::Blob(bytes) = it.key() else { unreachable!("blob-keyed table") };
            keys.push(bytes.to_vec());
            it.next();
        }

        assert_eq!(keys, vec![b"z".to_vec(), b"m".to_vec(), b"a".to_vec()]);
    }
}
