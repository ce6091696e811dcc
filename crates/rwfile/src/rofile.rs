use std::fs::File;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;

use crate::error::{Error, Result};


/// Buffered, fixed-buffer-count read-only access to an immutable file (spec.md §4.2).
///
/// `RoFile` keeps `num_buffers` fixed-size buffers, LRU-replaced; reads that fit inside one
/// buffer are served from cache, while reads larger than a single buffer fall through to a
/// direct positioned read. The wrapped file is never written to after construction.
#[derive(Debug)]
pub struct RoFile {
    file:        File,
    size:        u64,
    buffer_size: usize,
    buffers:     Vec<CachedBuffer>,
    clock:       u64,
}

#[derive(Debug)]
struct CachedBuffer {
    /// `None` until the buffer slot has been filled at least once.
    start:     Option<u64>,
    data:      Vec<u8>,
    last_used: u64,
}

impl RoFile {
    /// Opens `path` for buffered random reads.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or its size cannot be determined.
    pub fn open(path: &Path, buffer_size: usize, num_buffers: usize) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let num_buffers = num_buffers.max(1);
        let buffers = (0..num_buffers)
            .map(|_| CachedBuffer { start: None, data: vec![0; buffer_size], last_used: 0 })
            .collect();

        Ok(Self { file, size, buffer_size, buffers, clock: 0 })
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Reads `len` bytes starting at `offset`, serving from the LRU buffer ring when the read
    /// fits inside a single buffer and falling through to a direct read otherwise.
    ///
    /// # Errors
    /// Returns an error on I/O failure, or if `offset + len` exceeds the file's size.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(Error::ReadPastEnd { offset, len, size: self.size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > self.buffer_size {
            return self.direct_read(offset, len);
        }

        let buf_start = (offset / self.buffer_size as u64) * self.buffer_size as u64;
        // A read could straddle a buffer-aligned boundary; only serve from cache when it fits
        // entirely within one aligned buffer's span.
        let fits_in_one_buffer = offset + len as u64 <= buf_start + self.buffer_size as u64;

        if !fits_in_one_buffer {
            return self.direct_read(offset, len);
        }

        self.clock += 1;
        let clock = self.clock;

        if let Some(idx) = self.buffers.iter().position(|b| b.start == Some(buf_start)) {
            let buf = &mut self.buffers[idx];
            buf.last_used = clock;
            let in_buf_offset = (offset - buf_start) as usize;
            return Ok(buf.data[in_buf_offset..in_buf_offset + len].to_vec());
        }

        // Evict the least-recently-used slot and fill it from disk.
        let victim = self.buffers
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.last_used)
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let read_len = self.buffer_size.min((self.size - buf_start) as usize);
        let bytes = direct_read(&self.file, buf_start, read_len)?;

        let buf = &mut self.buffers[victim];
        buf.data[..bytes.len()].copy_from_slice(&bytes);
        buf.start = Some(buf_start);
        buf.last_used = clock;

        let in_buf_offset = (offset - buf_start) as usize;
        Ok(buf.data[in_buf_offset..in_buf_offset + len].to_vec())
    }

    fn direct_read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        direct_read(&self.file, offset, len)
    }

    /// Reads a fixed-size, plain-old-data struct out of the file by reinterpreting its bytes.
    ///
    /// # Safety
    /// `T` must be a type for which any bit pattern of the right size is valid (no padding
    /// bytes, no niches) — e.g. arrays of `u8`/`u32`/`u64`, or `#[repr(C)]` structs of such.
    pub unsafe fn read_struct<T: Copy>(&mut self, offset: u64) -> Result<T> {
        let len = size_of::<T>();
        let bytes = self.read_at(offset, len)?;
        debug_assert_eq!(bytes.len(), len);
        // SAFETY: caller guarantees `T` accepts any bit pattern of this size; `bytes` has
        // exactly `size_of::<T>()` bytes by construction above.
        Ok(unsafe { bytes.as_ptr().cast::<T>().read_unaligned() })
    }
}

#[cfg(unix)]
fn direct_read(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

#[cfg(not(unix))]
fn direct_read(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    use std::io::{Read as _, Seek as _, SeekFrom};

    // `RoFile` is documented as owned by a single logical reader at a time (spec.md §5), so a
    // seek-then-read pair here is not racy in practice, but we still need `&File` not `&mut File`
    // to keep the buffer-cache borrow checker happy; clone the handle instead.
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0_u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &[u8]) -> tempfile_path::TempFile {
        tempfile_path::TempFile::with_contents(contents)
    }

    mod tempfile_path {
        use std::fs::{self, File};
        use std::io::Write as _;
        use std::path::{Path, PathBuf};
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempFile {
            path: PathBuf,
        }

        impl TempFile {
            pub fn with_contents(contents: &[u8]) -> Self {
                let id = COUNTER.fetch_add(1, Ordering::Relaxed);
                let path = std::env::temp_dir().join(format!("rwfile-test-{}-{id}", std::process::id()));
                let mut f = File::create(&path).unwrap();
                f.write_all(contents).unwrap();
                Self { path }
            }

            pub fn path(&self) -> &Path {
                &self.path
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn reads_within_and_across_buffers() {
        let data: Vec<u8> = (0..256).map(|i| i as u8).collect();
        let tmp = write_temp(&data);
        let mut rofile = RoFile::open(tmp.path(), 16, 2).unwrap();

        assert_eq!(rofile.size(), 256);
        assert_eq!(rofile.read_at(0, 4).unwrap(), &data[0..4]);
        // Straddles the 16-byte buffer boundary; must fall through to a direct read.
        assert_eq!(rofile.read_at(14, 4).unwrap(), &data[14..18]);
        // Re-reading a cached region.
        assert_eq!(rofile.read_at(0, 16).unwrap(), &data[0..16]);
    }

    #[test]
    fn read_past_end_errors() {
        let tmp = write_temp(&[1, 2, 3]);
        let mut rofile = RoFile::open(tmp.path(), 16, 1).unwrap();
        assert!(rofile.read_at(1, 10).is_err());
    }

    #[test]
    fn lru_eviction_keeps_most_recent() {
        let data: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let tmp = write_temp(&data);
        let mut rofile = RoFile::open(tmp.path(), 16, 2).unwrap();

        // Touch three distinct buffer-aligned regions with only 2 slots; the first touched
        // region should be evicted, but re-fetching it must still produce correct data.
        assert_eq!(rofile.read_at(0, 4), rofile.read_at(0, 4));
        let _ = rofile.read_at(16, 4).unwrap();
        let _ = rofile.read_at(32, 4).unwrap();
        assert_eq!(rofile.read_at(0, 4).unwrap(), &data[0..4]);
    }
}
