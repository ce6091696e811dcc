use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use blob_key::{Blob, KeyType, SharedComparator};
use dtable::DTable;
use dtable::leaf::array::ArrayDTable;
use dtable::leaf::fixed::FixedDTable;
use dtable::leaf::simple::SimpleDTable;
use dtable::leaf::ustr::UstrDTable;
use dtable::wrapper::btree::BtreeDTable;
use dtable::wrapper::exception::ExceptionDTable;
use dtable::wrapper::exist::ExistDTable;
use dtable::wrapper::uniq::UniqDTable;

use crate::error::Result;


/// Builds (and reopens) one immutable level directory from a source iterator, standing in for
/// the spec's "`base`, `fastbase` factories" (spec.md §4.9). Dyn-compatible so a config can swap
/// factories at runtime.
pub trait LevelFactory: fmt::Debug + Send + Sync {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>>;

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>>;

    /// Removes every file a prior `create`/`open` under `name` left in `dir`. The default walks
    /// `dir` for files whose name starts with `"{name}."`, matching how every leaf format in this
    /// codebase derives its on-disk filenames from a shared `(dir, name)` pair.
    fn remove(&self, dir: &Path, name: &str) -> Result<()> {
        let prefix = format!("{name}.");
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// The general-purpose level format: variable-size values, any key type. Used as the default
/// `base` factory for k-way combines.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleLevelFactory;

impl LevelFactory for SimpleLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        Ok(Box::new(SimpleDTable::create(dir, name, comparator, source, shadow)?))
    }

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        Ok(Box::new(SimpleDTable::open(dir, name, comparator)?))
    }
}

/// Substring-compressing level format, used as the default `fastbase` factory: a tip digest is
/// usually small and string-heavy, where `ustr_dtable`'s dictionary pays for itself immediately
/// rather than waiting for a later combine to shrink it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UstrLevelFactory;

impl LevelFactory for UstrLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        Ok(Box::new(UstrDTable::create(dir, name, comparator, source, shadow)?))
    }

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        Ok(Box::new(UstrDTable::open(dir, name, comparator)?))
    }
}

/// `U32`-keyed, fixed-size-value level format. Only valid when the managed dtable's `key_type`
/// is `U32` (see [`factory_supports`]); rejects any value whose length doesn't match
/// `value_size`, storing `reject_value` in its place when one is configured.
#[derive(Debug, Clone)]
pub struct FixedLevelFactory {
    pub value_size:   usize,
    pub reject_value: Option<Blob>,
}

impl LevelFactory for FixedLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        Ok(Box::new(FixedDTable::create(
            dir,
            name,
            self.value_size,
            self.reject_value.as_ref(),
            comparator,
            source,
            shadow,
        )?))
    }

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        Ok(Box::new(FixedDTable::open(dir, name, comparator)?))
    }
}

/// `U32`-keyed, positional array level format. Densest and fastest of the fixed-width formats,
/// but only usable for `U32` keys (see [`factory_supports`]) and carries no comparator.
#[derive(Debug, Clone)]
pub struct ArrayLevelFactory {
    pub min:          u32,
    pub value_size:   usize,
    pub reject_value: Option<Blob>,
}

impl LevelFactory for ArrayLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        _comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        Ok(Box::new(ArrayDTable::create(
            dir,
            name,
            self.min,
            self.value_size,
            self.reject_value.as_ref(),
            source,
            shadow,
        )?))
    }

    fn open(&self, dir: &Path, name: &str, _comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        Ok(Box::new(ArrayDTable::open(dir, name)?))
    }
}

/// Wraps an inner factory in `uniq_dtable`, deduplicating values that repeat within `window`
/// entries of each other (spec.md §4.6, §8 scenario 4).
#[derive(Debug, Clone)]
pub struct UniqLevelFactory {
    pub window: Option<usize>,
    pub inner:  Arc<dyn LevelFactory>,
}

impl LevelFactory for UniqLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        _comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        Ok(Box::new(UniqDTable::create(dir, name, self.window, source, shadow)?))
    }

    fn open(&self, dir: &Path, name: &str, _comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        Ok(Box::new(UniqDTable::open(dir, name)?))
    }
}

/// Wraps two inner factories in `exception_dtable`: `base` holds every key with a deterministic
/// placeholder for values it can't encode, `alt` holds the real values for exactly those keys
/// (spec.md §3 "Rejection protocol", §8 scenario 3). `base` and `alt` are written under
/// `"{name}-base"`/`"{name}-alt"` so they don't collide with the sidecar `{name}.exc` file.
#[derive(Debug, Clone)]
pub struct ExceptionLevelFactory {
    pub base: Arc<dyn LevelFactory>,
    pub alt:  Arc<dyn LevelFactory>,
}

impl LevelFactory for ExceptionLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        let base_name = format!("{name}-base");
        let alt_name = format!("{name}-alt");
        let base = Arc::clone(&self.base);
        let alt = Arc::clone(&self.alt);
        let base_comparator = comparator.clone();
        let table = ExceptionDTable::create(
            dir,
            name,
            source,
            |src| base.create(dir, &base_name, base_comparator, src, shadow),
            |src| alt.create(dir, &alt_name, comparator, src, None),
        )?;
        Ok(Box::new(table))
    }

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        let base_name = format!("{name}-base");
        let alt_name = format!("{name}-alt");
        let base = Arc::clone(&self.base);
        let alt = Arc::clone(&self.alt);
        let base_comparator = comparator.clone();
        let table = ExceptionDTable::open(
            dir,
            name,
            || base.open(dir, &base_name, base_comparator),
            || alt.open(dir, &alt_name, comparator),
        )?;
        Ok(Box::new(table))
    }

    fn remove(&self, dir: &Path, name: &str) -> Result<()> {
        self.base.remove(dir, &format!("{name}-base"))?;
        self.alt.remove(dir, &format!("{name}-alt"))?;
        let path = dir.join(format!("{name}.exc"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Wraps an inner factory in `btree_dtable`'s external index, trading a second on-disk index for
/// binary-search-then-seek lookups instead of a linear scan on `seek` (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct BtreeLevelFactory {
    pub inner: Arc<dyn LevelFactory>,
}

impl LevelFactory for BtreeLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        let base = self.inner.create(dir, name, comparator, source, shadow)?;
        Ok(Box::new(BtreeDTable::create(dir, name, base)?))
    }

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        let base = self.inner.open(dir, name, comparator)?;
        Ok(Box::new(BtreeDTable::open(dir, name, base)?))
    }
}

/// Wraps an inner factory in `exist_dtable`, serving `present()` from a bitmap built at `create`
/// time instead of a full `lookup` (spec.md §4.6, `original_source/exist_dtable.h`).
#[derive(Debug, Clone)]
pub struct ExistLevelFactory {
    pub inner: Arc<dyn LevelFactory>,
}

impl LevelFactory for ExistLevelFactory {
    fn create(
        &self,
        dir:        &Path,
        name:       &str,
        comparator: Option<SharedComparator>,
        source:     &dyn DTable,
        shadow:     Option<&dyn DTable>,
    ) -> Result<Box<dyn DTable>> {
        let base = self.inner.create(dir, name, comparator, source, shadow)?;
        Ok(Box::new(ExistDTable::create(dir, name, base)?))
    }

    fn open(&self, dir: &Path, name: &str, comparator: Option<SharedComparator>) -> Result<Box<dyn DTable>> {
        let base = self.inner.open(dir, name, comparator)?;
        Ok(Box::new(ExistDTable::open(dir, name, base)?))
    }
}

/// Configuration for one [`crate::ManagedDTable`] instance (spec.md §4.9's state list).
///
/// Matches the teacher's `option_structs`/`options_` pattern: a plain struct with a `Default`
/// impl, constructed once and passed to `create`/`open`, rather than an env-var or config-file
/// surface (spec.md §6: no env vars).
#[derive(Debug, Clone)]
pub struct ManagedDTableConfig {
    /// Factory used by k-way [`combine`](crate::ManagedDTable::combine).
    pub base:                      Arc<dyn LevelFactory>,
    /// Factory used by [`digest`](crate::ManagedDTable::digest) (the tip-only combine).
    pub fastbase:                  Arc<dyn LevelFactory>,
    /// Minimum time between automatic digests triggered by [`maintain`](crate::ManagedDTable::maintain).
    pub digest_interval:           Duration,
    /// Minimum time between automatic combines triggered by `maintain`.
    pub combine_interval:          Duration,
    /// Maximum number of consecutive same-`is_fastbase` levels folded into one automatic combine.
    pub combine_count:             usize,
    /// Tip size (live entry count) at which `insert` triggers a digest.
    pub digest_size:                usize,
    /// Enables the autocombine policy on top of the interval-based one (spec.md §4.9).
    pub autocombine:                bool,
    /// Digests accumulated since the last combine before autocombine forces one.
    pub autocombine_digests:        u32,
    /// Unused by the policy directly; carried for parity with the spec's field list and surfaced
    /// for introspection/tuning by callers that read it back.
    pub autocombine_digest_count:   u32,
    /// `is_fastbase` levels accumulated before autocombine forces a combine regardless of the
    /// digest counter.
    pub autocombine_combine_count:  usize,
    /// Whether to digest the tip one last time when the managed dtable is dropped.
    pub digest_on_close:            bool,
    /// Size of the file-transaction log `FileTxContext::tx_init` rotates at (spec.md §4.4).
    /// Normally left at the default and set once, workspace-wide, via [`crate::Store::init`].
    pub tx_log_size:                u64,
}

impl Default for ManagedDTableConfig {
    fn default() -> Self {
        Self {
            base:                     Arc::new(SimpleLevelFactory),
            fastbase:                 Arc::new(UstrLevelFactory),
            digest_interval:          Duration::from_secs(60),
            combine_interval:         Duration::from_secs(600),
            combine_count:            4,
            digest_size:              4096,
            autocombine:              true,
            autocombine_digests:      8,
            autocombine_digest_count: 0,
            autocombine_combine_count: 6,
            digest_on_close:          true,
            tx_log_size:              1 << 20,
        }
    }
}

/// Only `U32`-keyed managed dtables may use the `array`/`linear` leaf formats as a custom
/// [`LevelFactory`] (they require fixed-width integer keys); this is not enforced by the trait
/// itself, so a config built around a non-default factory should check it against the managed
/// dtable's `key_type` before `create`/`open`.
#[must_use]
pub fn factory_supports(factory_name: &str, key_type: KeyType) -> bool {
    match factory_name {
        "array" | "linear" => key_type == KeyType::U32,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use blob_key::Key;
    use dtable::DTableIter;
    use dtable::support::{VecIter, lookup_sorted};
    use dtable::traits::SourceId;

    use super::*;

    /// Minimal in-memory source, mirroring `dtable`'s own test helper, for exercising
    /// [`LevelFactory`] impls without needing an already-built leaf format on disk.
    #[derive(Debug)]
    struct MemSource(Vec<(Key, Blob)>);

    impl MemSource {
        fn new(mut entries: Vec<(Key, Blob)>) -> Self {
            entries.sort_by(|a, b| a.0.natural_cmp(&b.0));
            Self(entries)
        }
    }

    impl DTable for MemSource {
        fn key_type(&self) -> KeyType {
            match self.0.first() {
                Some((Key::U32(_), _)) | None => KeyType::U32,
                Some((Key::F64(_), _)) => KeyType::F64,
                Some((Key::Str(_), _)) => KeyType::Str,
                Some((Key::Blob(_), _)) => KeyType::Blob,
            }
        }

        fn lookup(&self, key: &Key) -> (bool, Blob) {
            lookup_sorted(&self.0, key)
        }

        fn iter(&self) -> Box<dyn DTableIter + '_> {
            Box::new(VecIter::new(&self.0, SourceId(std::ptr::from_ref(self) as usize)))
        }

        fn size(&self) -> Option<usize> {
            Some(self.0.len())
        }
    }

    #[test]
    fn array_level_factory_roundtrips_u32_values() {
        let dir = std::env::temp_dir().join(format!("config-test-array-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemSource::new(vec![
            (Key::U32(0), Blob::present(*b"abc")),
            (Key::U32(2), Blob::present(*b"xyz")),
        ]);
        let factory = ArrayLevelFactory { min: 0, value_size: 3, reject_value: None };
        let table = factory.create(&dir, "lvl", None, &source, None).unwrap();
        assert_eq!(table.lookup(&Key::U32(0)).1.as_bytes(), Some(&b"abc"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"xyz"[..]));

        let reopened = factory.open(&dir, "lvl", None).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"xyz"[..]));
    }

    #[test]
    fn uniq_level_factory_deduplicates_repeated_values() {
        let dir = std::env::temp_dir().join(format!("config-test-uniq-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemSource::new(vec![
            (Key::U32(0), Blob::present(b"same".to_vec())),
            (Key::U32(1), Blob::present(b"same".to_vec())),
            (Key::U32(2), Blob::present(b"different".to_vec())),
        ]);
        let factory = UniqLevelFactory { window: Some(8), inner: Arc::new(SimpleLevelFactory) };
        let table = factory.create(&dir, "lvl", None, &source, None).unwrap();

        assert_eq!(table.lookup(&Key::U32(0)).1.as_bytes(), Some(&b"same"[..]));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"same"[..]));
        assert_eq!(table.lookup(&Key::U32(2)).1.as_bytes(), Some(&b"different"[..]));
    }

    #[test]
    fn exception_level_factory_routes_rejected_values_into_alt() {
        let dir = std::env::temp_dir().join(format!("config-test-exception-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let source = MemSource::new(vec![
            (Key::U32(0), Blob::present(*b"toolong")),
            (Key::U32(1), Blob::present(*b"ok!")),
        ]);
        let factory = ExceptionLevelFactory {
            base: Arc::new(ArrayLevelFactory { min: 0, value_size: 3, reject_value: None }),
            alt:  Arc::new(SimpleLevelFactory),
        };
        let table = factory.create(&dir, "lvl", None, &source, None).unwrap();

        assert_eq!(table.lookup(&Key::U32(0)).1.as_bytes(), Some(&b"toolong"[..]));
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"ok!"[..]));

        let reopened = factory.open(&dir, "lvl", None).unwrap();
        assert_eq!(reopened.lookup(&Key::U32(0)).1.as_bytes(), Some(&b"toolong"[..]));
    }
}
