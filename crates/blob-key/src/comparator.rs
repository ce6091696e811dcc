use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;


/// A caller-supplied, named ordering over blob keys, used in place of a key type's natural order.
///
/// Two dtables are only compatible (may be merged by an [overlay]) when their comparator names
/// match, per spec.md §3.
///
/// [overlay]: https://docs.rs/overlay
pub trait BlobComparator: Debug + Send + Sync {
    /// A short, stable identifier for this comparator's behavior. Persisted alongside dtable
    /// data so that a later `open` can detect a mismatched comparator (spec.md §7:
    /// "comparator mismatch").
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Reference-counted handle to a [`BlobComparator`], cheap to clone and share across every dtable
/// using it.
pub type SharedComparator = Arc<dyn BlobComparator>;

/// The comparator implied by `[u8]`'s own `Ord`, used whenever a dtable does not set one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteOrderComparator;

impl BlobComparator for ByteOrderComparator {
    fn name(&self) -> &str {
        "bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Checks whether a dtable may adopt `comparator`, given its own already-set name (if any).
///
/// Mirrors spec.md §3: "Setting a comparator is allowed only if `cmp_name` matches or is empty".
#[must_use]
pub fn comparator_is_compatible(existing_name: Option<&str>, candidate: &dyn BlobComparator) -> bool {
    match existing_name {
        None => true,
        Some(name) => name.is_empty() || name == candidate.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Reverse;

    impl BlobComparator for Reverse {
        fn name(&self) -> &str {
            "reverse"
        }

        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    #[test]
    fn byte_order_matches_slice_ord() {
        let cmp = ByteOrderComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
    }

    #[test]
    fn compatibility_rules() {
        let reverse = Reverse;
        assert!(comparator_is_compatible(None, &reverse));
        assert!(comparator_is_compatible(Some(""), &reverse));
        assert!(comparator_is_compatible(Some("reverse"), &reverse));
        assert!(!comparator_is_compatible(Some("bytewise"), &reverse));
    }
}
