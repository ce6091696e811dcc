//! [`Store`]: the root scope a process opens once, under which any number of named managed
//! dtables live as sibling directories (spec.md §6's `Store::init`/`Store::shutdown`).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use blob_key::{KeyType, SharedComparator};
use journal::FileTxContext;

use crate::config::ManagedDTableConfig;
use crate::error::Result;
use crate::managed::ManagedDTable;


/// Owns a root directory under which managed dtables are created as `root/<name>/` subdirectories,
/// all sharing one [`FileTxContext`] rooted at `root` (spec.md §4.4's process-wide metafile
/// table, §4.9's `sys_journal` "shared among co-located managed dtables"): each managed dtable
/// addresses its own files through that one context via its name as the relative `dfd`, rather
/// than opening an independent transaction log under its own subdirectory.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    tx:   Arc<Mutex<FileTxContext>>,
}

impl Store {
    /// Ensures `root_path` exists and opens the one [`FileTxContext`] every managed dtable this
    /// `Store` creates or opens will share, recovering any journal left behind by a prior crash.
    ///
    /// # Errors
    /// Propagates I/O failures creating `root_path` or recovering its transaction log.
    pub fn init(root_path: &Path, tx_log_size: u64) -> Result<Self> {
        std::fs::create_dir_all(root_path)?;
        let tx = FileTxContext::tx_init(root_path, tx_log_size)?;
        Ok(Self { root: root_path.to_path_buf(), tx: Arc::new(Mutex::new(tx)) })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh managed dtable at `root/name`, sharing this store's transaction log.
    ///
    /// # Errors
    /// Propagates I/O failures; see [`ManagedDTable::create`].
    pub fn create(
        &self,
        name:       &str,
        key_type:   KeyType,
        comparator: Option<SharedComparator>,
        config:     ManagedDTableConfig,
    ) -> Result<ManagedDTable> {
        ManagedDTable::create_shared(&self.root.join(name), PathBuf::from(name), Arc::clone(&self.tx), key_type, comparator, config)
    }

    /// Reopens the managed dtable at `root/name`, sharing this store's transaction log.
    ///
    /// # Errors
    /// Propagates I/O failures; see [`ManagedDTable::open`].
    pub fn open(&self, name: &str, comparator: Option<SharedComparator>, config: ManagedDTableConfig) -> Result<ManagedDTable> {
        ManagedDTable::open_shared(&self.root.join(name), PathBuf::from(name), Arc::clone(&self.tx), comparator, config)
    }

    /// Releases the root. Managed dtables opened through this `Store` are independent and must be
    /// closed (or simply dropped) on their own; `shutdown` does not reach into them.
    pub fn shutdown(self) {}
}

#[cfg(test)]
mod tests {
    use blob_key::{Blob, Key, KeyType};

    use super::Store;
    use crate::config::ManagedDTableConfig;

    fn root(label: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("store-test-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn co_located_tables_share_one_transaction_log() {
        let root = root("shared-log");
        let store = Store::init(&root, 1 << 20).unwrap();

        let a = store.create("a", KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        let b = store.create("b", KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        a.insert(Key::U32(1), Blob::present(*b"a-one"), false).unwrap();
        b.insert(Key::U32(1), Blob::present(*b"b-one"), false).unwrap();

        // One journals directory at the store root, shared by every managed dtable it opened;
        // neither table keeps an independent one under its own subdirectory.
        assert!(root.join("journals").is_dir());
        assert!(!root.join("a").join("journals").exists());
        assert!(!root.join("b").join("journals").exists());

        drop(a);
        drop(b);

        let reopened_a = store.open("a", None, ManagedDTableConfig::default()).unwrap();
        let reopened_b = store.open("b", None, ManagedDTableConfig::default()).unwrap();
        assert_eq!(reopened_a.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"a-one"[..]));
        assert_eq!(reopened_b.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"b-one"[..]));
    }

    #[test]
    fn create_and_open_round_trip_through_a_store() {
        let root = root("roundtrip");
        let store = Store::init(&root, 1 << 20).unwrap();

        let table = store.create("named", KeyType::U32, None, ManagedDTableConfig::default()).unwrap();
        table.insert(Key::U32(7), Blob::present(*b"seven"), false).unwrap();
        table.digest().unwrap();
        drop(table);

        let reopened = store.open("named", None, ManagedDTableConfig::default()).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(7)).1.as_bytes(), Some(&b"seven"[..]));
        store.shutdown();
    }
}
