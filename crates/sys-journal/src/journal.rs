use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use blob_key::{Key, KeyType};
use rwfile::RwFile;

use crate::error::Result;
use crate::listener::{JournalListener, ListenerWarehouse};
use crate::record::{self, Record};


/// Listener ids allocated via `get_unique_id(true)` are marked with this high bit, so that a
/// restart can recognize and discard their leftover journal records (spec.md §4.5: "temporary
/// ids are discarded at process restart").
const TEMPORARY_ID_BIT: u32 = 0x8000_0000;

/// The shared system journal file for every managed dtable co-located in one directory
/// (spec.md §4.5, §4.9: `sys_journal`).
pub struct SysJournal {
    path:          PathBuf,
    writer:        RwFile,
    strings:       Vec<String>,
    intern:        HashMap<String, u32>,
    next_id:       u32,
    next_temp_id:  u32,
    /// Records seen for a listener id the warehouse did not recognize at replay time, kept so a
    /// later [`ListenerWarehouse::obtain`] can be replayed against.
    pending:       HashMap<u32, Vec<(Key, Option<Vec<u8>>)>>,
}

impl SysJournal {
    /// Opens (creating if absent) the system journal at `path`, replaying every record against
    /// `warehouse`. Unknown listeners' records are queued in `pending` until a later
    /// [`ListenerWarehouse::obtain`]; if `discard_temporaries` is set, records for ids with the
    /// temporary bit set are dropped instead of queued.
    ///
    /// # Errors
    /// Propagates I/O failures opening or reading the journal file.
    pub fn spawn_init(
        path:               &Path,
        warehouse:          &mut dyn ListenerWarehouse,
        discard_temporaries: bool,
    ) -> Result<Self> {
        let bytes = fs::read(path).unwrap_or_default();

        let mut strings: Vec<String> = Vec::new();
        let mut pending: HashMap<u32, Vec<(Key, Option<Vec<u8>>)>> = HashMap::new();
        let mut max_id = 0_u32;

        let mut offset = 0_usize;
        while let Some(header) = bytes.get(offset..offset + 4) {
            let len = u16::from_le_bytes([header[0], header[1]]) as usize;
            let tag = u16::from_le_bytes([header[2], header[3]]);
            offset += 4;
            let Some(data) = bytes.get(offset..offset + len) else {
                tracing::warn!(?path, "system journal truncated mid-record; stopping replay");
                break;
            };
            offset += len;

            apply_one(tag, data, &mut strings, &mut max_id, discard_temporaries, warehouse, &mut pending);
        }

        let intern = strings.iter().enumerate().map(|(i, s)| (s.clone(), i as u32)).collect();
        let writer = if path.exists() { RwFile::open_append(path, ())? } else { RwFile::create(path, ())? };

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            strings,
            intern,
            next_id: max_id.wrapping_add(1).min(TEMPORARY_ID_BIT - 1),
            next_temp_id: 0,
            pending,
        })
    }

    /// Allocates a fresh listener id. Temporary ids (high bit set) are never reused across a
    /// restart; their leftover records are dropped by a future `spawn_init(discard_temporaries:
    /// true)` or cleaned up by [`Self::filter`].
    pub fn get_unique_id(&mut self, temporary: bool) -> u32 {
        if temporary {
            let id = TEMPORARY_ID_BIT | self.next_temp_id;
            self.next_temp_id += 1;
            id
        } else {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

    /// Any records that arrived for `listener_id` before it was `obtain`ed, removing them from
    /// the pending queue.
    #[must_use]
    pub fn take_pending(&mut self, listener_id: u32) -> Vec<(Key, Option<Vec<u8>>)> {
        self.pending.remove(&listener_id).unwrap_or_default()
    }

    fn intern(&mut self, s: &str) -> Result<u32> {
        if let Some(&index) = self.intern.get(s) {
            return Ok(index);
        }
        let index = self.strings.len() as u32;
        self.writer.append(&frame(record::encode_string(index, s), record::TAG_STRING))?;
        self.strings.push(s.to_owned());
        self.intern.insert(s.to_owned(), index);
        Ok(index)
    }

    /// Appends one logical record, interning the key string first if this is a `KEY_STR` entry.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let (payload, tag) = match record {
            Record::BlobCmp { listener_id, comparator_name } => {
                (record::encode_blob_cmp(*listener_id, comparator_name), record::TAG_BLOB_CMP)
            }
            Record::Entry { listener_id, key, value } => match key {
                Key::U32(k) => (record::encode_key_u32(*listener_id, *k, value.as_deref()), record::TAG_KEY_U32),
                Key::F64(k) => (record::encode_key_dbl(*listener_id, *k, value.as_deref()), record::TAG_KEY_DBL),
                Key::Str(s) => {
                    let index = self.intern(s)?;
                    (record::encode_key_str(*listener_id, index, value.as_deref()), record::TAG_KEY_STR)
                }
                Key::Blob(b) => (record::encode_key_blob(*listener_id, b, value.as_deref()), record::TAG_KEY_BLOB),
            },
        };
        self.writer.append(&frame(payload, tag))?;
        Ok(())
    }

    /// Compacts the journal: writes a new file holding only each live listener's current state
    /// (spec.md §4.5: "respecting the last state per (listener,key) pair"), then atomically
    /// replaces the original.
    ///
    /// # Errors
    /// Propagates I/O failures writing or renaming the replacement file.
    pub fn filter(&mut self, warehouse: &mut dyn ListenerWarehouse) -> Result<()> {
        let tmp_path = self.path.with_extension("sjnl-tmp");
        let mut new_writer = RwFile::create(&tmp_path, ())?;
        let mut strings: Vec<String> = Vec::new();
        let mut intern: HashMap<String, u32> = HashMap::new();

        let mut intern_into = |s: &str, strings: &mut Vec<String>, intern: &mut HashMap<String, u32>, w: &mut RwFile| -> Result<u32> {
            if let Some(&idx) = intern.get(s) {
                return Ok(idx);
            }
            let idx = strings.len() as u32;
            w.append(&frame(record::encode_string(idx, s), record::TAG_STRING))?;
            strings.push(s.to_owned());
            intern.insert(s.to_owned(), idx);
            Ok(idx)
        };

        for listener_id in warehouse.live_listener_ids() {
            let Some(listener) = warehouse.lookup(listener_id) else { continue };
            if let Some(name) = listener.comparator_name() {
                let payload = record::encode_blob_cmp(listener_id, name);
                new_writer.append(&frame(payload, record::TAG_BLOB_CMP))?;
            }
            for (key, value) in listener.snapshot() {
                let (payload, tag) = match &key {
                    Key::U32(k) => (record::encode_key_u32(listener_id, *k, Some(&value)), record::TAG_KEY_U32),
                    Key::F64(k) => (record::encode_key_dbl(listener_id, *k, Some(&value)), record::TAG_KEY_DBL),
                    Key::Str(s) => {
                        let idx = intern_into(s, &mut strings, &mut intern, &mut new_writer)?;
                        (record::encode_key_str(listener_id, idx, Some(&value)), record::TAG_KEY_STR)
                    }
                    Key::Blob(b) => (record::encode_key_blob(listener_id, b, Some(&value)), record::TAG_KEY_BLOB),
                };
                new_writer.append(&frame(payload, tag))?;
            }
        }

        new_writer.close()?;
        fs::rename(&tmp_path, &self.path)?;
        self.writer = RwFile::open_append(&self.path, ())?;
        self.strings = strings;
        self.intern = intern;
        tracing::info!(path = ?self.path, "filtered system journal");
        Ok(())
    }
}

fn frame(payload: Vec<u8>, tag: u16) -> Vec<u8> {
    #[expect(clippy::cast_possible_truncation, reason = "records are bounded by caller contract")]
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

#[expect(clippy::too_many_arguments, reason = "single dispatch point for replaying one on-disk record")]
fn apply_one(
    tag:                 u16,
    data:                &[u8],
    strings:             &mut Vec<String>,
    max_id:              &mut u32,
    discard_temporaries: bool,
    warehouse:           &mut dyn ListenerWarehouse,
    pending:             &mut HashMap<u32, Vec<(Key, Option<Vec<u8>>)>>,
) {
    if tag == record::TAG_STRING {
        if let Some((index, value)) = record::decode_string(data) {
            if strings.len() == index as usize {
                strings.push(value);
            } else if let Some(slot) = strings.get_mut(index as usize) {
                *slot = value;
            }
        }
        return;
    }

    if tag == record::TAG_BLOB_CMP {
        if let Some((listener_id, _name)) = record::decode_blob_cmp(data) {
            *max_id = (*max_id).max(listener_id);
        }
        return;
    }

    let Some((listener_id, key, value)) = (match tag {
        record::TAG_KEY_U32 => {
            record::decode_key_u32(data).map(|(id, k, v)| (id, Key::U32(k), v))
        }
        record::TAG_KEY_DBL => {
            record::decode_key_dbl(data).map(|(id, k, v)| (id, Key::F64(k), v))
        }
        record::TAG_KEY_STR => record::decode_key_str(data).and_then(|(id, idx, v)| {
            strings.get(idx as usize).map(|s| (id, Key::Str(s.as_str().into()), v))
        }),
        record::TAG_KEY_BLOB => {
            record::decode_key_blob(data).map(|(id, k, v)| (id, Key::Blob(k.into()), v))
        }
        _ => None,
    }) else {
        return;
    };

    *max_id = (*max_id).max(listener_id & !TEMPORARY_ID_BIT);

    if discard_temporaries && listener_id & TEMPORARY_ID_BIT != 0 {
        return;
    }

    let key_type = key.key_type();
    let listener = warehouse
        .lookup(listener_id)
        .or_else(|| warehouse.obtain(listener_id, key_type));

    match listener {
        Some(listener) => listener.journal_replay(&key, value.as_deref()),
        None => pending.entry(listener_id).or_default().push((key, value)),
    }
}
