//! Shared, format-agnostic serialization for a sorted `Vec<(Key, Blob)>`.
//!
//! Every leaf format validates and (for `ustr`) transforms its values differently, but once a
//! table is built, writing it out as `[key_type tag][count][(key, value)...]` is common
//! machinery; this keeps that one encoding in one place instead of five near-identical copies.

use std::sync::Arc;

use blob_key::{Blob, Key, KeyType};

use crate::error::{Error, Result};


const TOMBSTONE: u32 = u32::MAX;

pub(crate) fn encode_key(out: &mut Vec<u8>, key: &Key) {
    match key {
        Key::U32(k) => out.extend_from_slice(&k.to_le_bytes()),
        Key::F64(k) => out.extend_from_slice(&k.to_le_bytes()),
        Key::Str(s) => {
            let bytes = s.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Key::Blob(b) => {
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
    }
}

pub(crate) fn decode_key(key_type: KeyType, data: &[u8], offset: &mut usize) -> Option<Key> {
    Some(match key_type {
        KeyType::U32 => {
            let k = u32::from_le_bytes(data.get(*offset..*offset + 4)?.try_into().ok()?);
            *offset += 4;
            Key::U32(k)
        }
        KeyType::F64 => {
            let k = f64::from_le_bytes(data.get(*offset..*offset + 8)?.try_into().ok()?);
            *offset += 8;
            Key::F64(k)
        }
        KeyType::Str => {
            let len = u32::from_le_bytes(data.get(*offset..*offset + 4)?.try_into().ok()?) as usize;
            *offset += 4;
            let s = std::str::from_utf8(data.get(*offset..*offset + len)?).ok()?;
            let key = Key::Str(Arc::from(s));
            *offset += len;
            key
        }
        KeyType::Blob => {
            let len = u32::from_le_bytes(data.get(*offset..*offset + 4)?.try_into().ok()?) as usize;
            *offset += 4;
            let key = Key::Blob(Arc::from(data.get(*offset..*offset + len)?));
            *offset += len;
            key
        }
    })
}

pub(crate) fn encode_blob(out: &mut Vec<u8>, blob: &Blob) {
    match blob.as_bytes() {
        None => out.extend_from_slice(&TOMBSTONE.to_le_bytes()),
        Some(bytes) => {
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
    }
}

pub(crate) fn decode_blob(data: &[u8], offset: &mut usize) -> Option<Blob> {
    let len = u32::from_le_bytes(data.get(*offset..*offset + 4)?.try_into().ok()?);
    *offset += 4;
    if len == TOMBSTONE {
        return Some(Blob::tombstone());
    }
    let bytes = data.get(*offset..*offset + len as usize)?;
    *offset += len as usize;
    Some(Blob::present(bytes.to_vec()))
}

/// Encodes `entries` (already sorted, shadow-elided) with a small header carrying `key_type`.
#[must_use]
pub fn encode(key_type: KeyType, entries: &[(Key, Blob)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(key_type.tag());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, blob) in entries {
        encode_key(&mut out, key);
        encode_blob(&mut out, blob);
    }
    out
}

/// Decodes a buffer written by [`encode`].
///
/// # Errors
/// Returns [`Error::Corrupt`] if the buffer is truncated or carries an unknown key-type tag.
pub fn decode(path: &std::path::Path, data: &[u8]) -> Result<(KeyType, Vec<(Key, Blob)>)> {
    let tag = *data.first().ok_or(Error::Corrupt(path.to_path_buf(), "empty file"))?;
    let key_type = KeyType::from_tag(tag).ok_or(Error::Corrupt(path.to_path_buf(), "unknown key type tag"))?;
    let count = u32::from_le_bytes(
        data.get(1..5).ok_or(Error::Corrupt(path.to_path_buf(), "missing count"))?.try_into().unwrap(),
    ) as usize;

    let mut offset = 5;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = decode_key(key_type, data, &mut offset)
            .ok_or(Error::Corrupt(path.to_path_buf(), "truncated key"))?;
        let blob = decode_blob(data, &mut offset)
            .ok_or(Error::Corrupt(path.to_path_buf(), "truncated value"))?;
        entries.push((key, blob));
    }
    Ok((key_type, entries))
}
