//! `md_meta`: a managed dtable's own metadata file (spec.md §6).
//!
//! Laid out exactly as specified: magic, version, key type, combine count, listener id, level
//! count/next-id, two timestamps, four autocombine state words, then one `(id, is_fastbase)`
//! pair per level, oldest first.

use blob_key::KeyType;

use crate::error::{Error, Result};


pub const MAGIC:   u32 = 0x784D_3DB7;
pub const VERSION: u16 = 1;

/// One level directory's entry in `md_meta` (spec.md §4.9: "per-level metadata `(id,
/// is_fastbase)`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelEntry {
    pub id:           u32,
    pub is_fastbase:  bool,
}

/// The full contents of `md_meta` (spec.md §6's on-disk layout).
///
/// The spec calls for "four u32 autocombine fields" without naming them; here they are the
/// *live* autocombine counters — `digests_since_combine` and `fastbase_run_length` drive the
/// policy in [`crate::ManagedDTable::maintain`], the last two are reserved for forward
/// compatibility. The *thresholds* (`autocombine_digests`, `autocombine_combine_count`, ...) are
/// config, supplied fresh by the caller at `open`, not persisted.
#[derive(Debug, Clone)]
pub struct MdMeta {
    pub key_type:              KeyType,
    pub combine_count:         u8,
    pub listener_id:           u32,
    pub ddt_next:               u32,
    pub last_digest:           i64,
    pub last_combine:          i64,
    pub digests_since_combine:  u32,
    pub fastbase_run_length:    u32,
    pub reserved:               [u32; 2],
    pub levels:                Vec<LevelEntry>,
}

impl MdMeta {
    #[must_use]
    pub fn new(key_type: KeyType, listener_id: u32) -> Self {
        Self {
            key_type,
            combine_count: 0,
            listener_id,
            ddt_next: 0,
            last_digest: 0,
            last_combine: 0,
            digests_since_combine: 0,
            fastbase_run_length: 0,
            reserved: [0; 2],
            levels: Vec::new(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.levels.len() * 5);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.push(self.key_type.tag());
        out.push(self.combine_count);
        out.extend_from_slice(&self.listener_id.to_le_bytes());
        out.extend_from_slice(&(self.levels.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.ddt_next.to_le_bytes());
        out.extend_from_slice(&self.last_digest.to_le_bytes());
        out.extend_from_slice(&self.last_combine.to_le_bytes());
        out.extend_from_slice(&self.digests_since_combine.to_le_bytes());
        out.extend_from_slice(&self.fastbase_run_length.to_le_bytes());
        out.extend_from_slice(&self.reserved[0].to_le_bytes());
        out.extend_from_slice(&self.reserved[1].to_le_bytes());
        for level in &self.levels {
            out.extend_from_slice(&level.id.to_le_bytes());
            out.push(u8::from(level.is_fastbase));
        }
        out
    }

    /// # Errors
    /// Returns [`Error::Corrupt`] if `data` is truncated, carries a bad magic/version, or an
    /// unknown key-type tag.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let err = || Error::Corrupt(std::path::PathBuf::from("md_meta"), "truncated or malformed header");

        let magic = u32::from_le_bytes(data.get(0..4).ok_or_else(err)?.try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::Corrupt(std::path::PathBuf::from("md_meta"), "bad magic"));
        }
        let version = u16::from_le_bytes(data.get(4..6).ok_or_else(err)?.try_into().unwrap());
        if version != VERSION {
            return Err(Error::Corrupt(std::path::PathBuf::from("md_meta"), "unsupported version"));
        }
        let key_type = KeyType::from_tag(*data.get(6).ok_or_else(err)?)
            .ok_or_else(|| Error::Corrupt(std::path::PathBuf::from("md_meta"), "unknown key type tag"))?;
        let combine_count = *data.get(7).ok_or_else(err)?;
        let listener_id = u32::from_le_bytes(data.get(8..12).ok_or_else(err)?.try_into().unwrap());
        let ddt_count = u32::from_le_bytes(data.get(12..16).ok_or_else(err)?.try_into().unwrap()) as usize;
        let ddt_next = u32::from_le_bytes(data.get(16..20).ok_or_else(err)?.try_into().unwrap());
        let last_digest = i64::from_le_bytes(data.get(20..28).ok_or_else(err)?.try_into().unwrap());
        let last_combine = i64::from_le_bytes(data.get(28..36).ok_or_else(err)?.try_into().unwrap());
        let digests_since_combine = u32::from_le_bytes(data.get(36..40).ok_or_else(err)?.try_into().unwrap());
        let fastbase_run_length = u32::from_le_bytes(data.get(40..44).ok_or_else(err)?.try_into().unwrap());
        let reserved0 = u32::from_le_bytes(data.get(44..48).ok_or_else(err)?.try_into().unwrap());
        let reserved1 = u32::from_le_bytes(data.get(48..52).ok_or_else(err)?.try_into().unwrap());

        let mut offset = 52;
        let mut levels = Vec::with_capacity(ddt_count);
        for _ in 0..ddt_count {
            let id = u32::from_le_bytes(data.get(offset..offset + 4).ok_or_else(err)?.try_into().unwrap());
            let is_fastbase = *data.get(offset + 4).ok_or_else(err)? != 0;
            offset += 5;
            levels.push(LevelEntry { id, is_fastbase });
        }

        Ok(Self {
            key_type,
            combine_count,
            listener_id,
            ddt_next,
            last_digest,
            last_combine,
            digests_since_combine,
            fastbase_run_length,
            reserved: [reserved0, reserved1],
            levels,
        })
    }
}
