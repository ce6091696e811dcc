use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use crate::error::Result;


/// Called around every buffer flush, letting a caller stage linked changes atomically with the
/// write (spec.md §4.2). Both hooks default to no-ops.
pub trait FlushHandler {
    fn pre(&mut self) {}
    fn post(&mut self) {}
}

impl FlushHandler for () {}

/// A buffered, append-only writer (spec.md §4.2). Holds at most one in-memory buffer; flushing
/// invokes the configured [`FlushHandler`] around the actual write, and, when external-transaction
/// mode is enabled, wraps the write in the caller's `tx_start_external`/`tx_end_external` pair.
pub struct RwFile<H: FlushHandler = ()> {
    path:          PathBuf,
    writer:        BufWriter<File>,
    len:           u64,
    flush_handler: H,
    external_tx:   Option<Box<dyn FnMut(bool)>>,
}

impl<H: FlushHandler> RwFile<H> {
    /// Creates (truncating) or opens `path` for appending, with the given flush handler.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn create(path: &Path, flush_handler: H) -> Result<Self> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len: 0,
            flush_handler,
            external_tx: None,
        })
    }

    /// Opens an existing file for continued appending, preserving its current length.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or its size queried.
    pub fn open_append(path: &Path, flush_handler: H) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len,
            flush_handler,
            external_tx: None,
        })
    }

    /// Registers a callback invoked with `true` on entering an external transaction around a
    /// flush and `false` on leaving it, mirroring `tx_start_external`/`tx_end_external`
    /// (spec.md §4.2, §4.4).
    pub fn set_external_tx(&mut self, callback: Box<dyn FnMut(bool)>) {
        self.external_tx = Some(callback);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if let Some(cb) = self.external_tx.as_mut() {
            cb(true);
        }
        self.flush_handler.pre();
        self.writer.write_all(data)?;
        self.len += data.len() as u64;
        self.flush_handler.post();
        if let Some(cb) = self.external_tx.as_mut() {
            cb(false);
        }
        Ok(())
    }

    /// Reads `len` bytes at `offset` from what has already been written, flushing the buffer
    /// first so the read observes it.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.writer.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt as _;
            let mut buf = vec![0_u8; len];
            self.writer.get_ref().read_exact_at(&mut buf, offset)?;
            return Ok(buf);
        }
        #[cfg(not(unix))]
        {
            let file = self.writer.get_mut();
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0_u8; len];
            std::io::Read::read_exact(file, &mut buf)?;
            Ok(buf)
        }
    }

    pub fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(new_len)?;
        self.writer.get_mut().seek(SeekFrom::Start(new_len))?;
        self.len = new_len;
        Ok(())
    }

    /// Appends `count` zero bytes, used to pad a file out to a block boundary.
    pub fn pad(&mut self, count: usize) -> Result<()> {
        self.append(&vec![0_u8; count])
    }

    /// Flushes and closes the file. Subsequent use of `self` after `close` is a logic error but
    /// not unsafe, since `BufWriter` tolerates repeated flushes.
    pub fn close(&mut self) -> Result<()> {
        if let Some(cb) = self.external_tx.as_mut() {
            cb(true);
        }
        self.flush_handler.pre();
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.flush_handler.post();
        if let Some(cb) = self.external_tx.as_mut() {
            cb(false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rwfile-rw-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn append_and_read_back() {
        let path = temp_path("append");
        let mut f = RwFile::create(&path, ()).unwrap();
        f.append(b"hello").unwrap();
        f.append(b" world").unwrap();
        assert_eq!(f.len(), 11);
        assert_eq!(f.read_at(0, 11).unwrap(), b"hello world");
        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn flush_handler_runs_around_writes() {
        struct CountingHandler(Rc<RefCell<(u32, u32)>>);
        impl FlushHandler for CountingHandler {
            fn pre(&mut self) {
                self.0.borrow_mut().0 += 1;
            }
            fn post(&mut self) {
                self.0.borrow_mut().1 += 1;
            }
        }

        let counts = Rc::new(RefCell::new((0, 0)));
        let path = temp_path("handler");
        let mut f = RwFile::create(&path, CountingHandler(Rc::clone(&counts))).unwrap();
        f.append(b"x").unwrap();
        assert_eq!(*counts.borrow(), (1, 1));
        f.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncate_shrinks_and_updates_len() {
        let path = temp_path("truncate");
        let mut f = RwFile::create(&path, ()).unwrap();
        f.append(b"0123456789").unwrap();
        f.truncate(4).unwrap();
        assert_eq!(f.len(), 4);
        assert_eq!(f.read_at(0, 4).unwrap(), b"0123");
        let _ = std::fs::remove_file(&path);
    }
}
