use blob_key::{Key, KeyType};


/// A live, in-memory recipient of system-journal records (spec.md §4.7: a `journal_dtable`).
///
/// Implementors are driven both at startup replay and on every live `insert`/`remove`.
pub trait JournalListener: Send {
    fn listener_id(&self) -> u32;

    fn key_type(&self) -> KeyType;

    /// The comparator name last logged for this listener, if any, used to re-emit a `BLOB_CMP`
    /// record during [`crate::SysJournal::filter`].
    fn comparator_name(&self) -> Option<&str> {
        None
    }

    /// Applies one replayed record. `value` of `None` means the key was a tombstone.
    fn journal_replay(&mut self, key: &Key, value: Option<&[u8]>);

    /// Every `(key, value)` pair this listener currently holds; used by
    /// [`crate::SysJournal::filter`] to compact the journal down to live state.
    fn snapshot(&self) -> Vec<(Key, Vec<u8>)>;
}

/// Maps listener ids to live listeners, and lazily constructs one on first sight of a record for
/// an id that hasn't been opened yet (spec.md §4.5: `obtain(id, key_type)`).
pub trait ListenerWarehouse {
    fn lookup(&mut self, listener_id: u32) -> Option<&mut dyn JournalListener>;

    /// Constructs (or returns an already-constructed) listener for `listener_id`, now that its
    /// key type is known from the first record referencing it.
    fn obtain(&mut self, listener_id: u32, key_type: KeyType) -> Option<&mut dyn JournalListener>;

    /// All listener ids currently live, for [`crate::SysJournal::filter`] to iterate over.
    fn live_listener_ids(&self) -> Vec<u32>;
}
