//! Append-only log sinks and positional log sources.
//!
//! The writer appends finalized blocks into a data log and an index log
//! through [`LogSink`]; the reader pulls byte ranges back out through
//! [`LogSource`]. Both are object-safe so callers can hand the directory
//! any storage they like; file-backed and in-memory implementations are
//! provided.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Abstraction for writing data to storage, append-only.
pub trait LogSink: Send + Sync {
    /// Appends `data` to the log.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// The current logical write offset: bytes successfully written so
    /// far, monotonically increasing.
    fn tell(&self) -> u64;

    /// Forces buffered data to storage.
    fn sync(&self) -> Result<()>;

    /// Closes the log; no further writes are accepted. When `sync` is
    /// set, data is forced to storage first.
    fn close(&self, sync: bool) -> Result<()>;
}

/// Abstraction for reading data back from storage.
pub trait LogSource: Send + Sync {
    /// Fills `buf` from the log starting at `offset`, returning how many
    /// bytes were read. Short counts indicate the log ended.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Total log size in bytes.
    fn size(&self) -> u64;
}

struct FileSinkInner {
    file: Option<File>,
    offset: u64,
}

/// A file-backed [`LogSink`].
pub struct FileSink {
    inner: Mutex<FileSinkInner>,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            inner: Mutex::new(FileSinkInner {
                file: Some(file),
                offset: 0,
            }),
        })
    }
}

impl LogSink for FileSink {
    fn write(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file.as_mut().ok_or(Error::ReadOnly)?;
        file.write_all(data)?;
        inner.offset += data.len() as u64;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.inner.lock().unwrap().offset
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_mut() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn close(&self, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.take() {
            if sync {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

/// A file-backed [`LogSource`].
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl LogSource for FileSource {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

struct MemLog {
    data: Vec<u8>,
    closed: bool,
}

/// An in-memory [`LogSink`] whose contents can be read back through a
/// shared [`MemSource`].
#[derive(Clone)]
pub struct MemSink {
    log: Arc<Mutex<MemLog>>,
}

impl MemSink {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(MemLog {
                data: Vec::new(),
                closed: false,
            })),
        }
    }

    /// A source over this sink's log. Reads observe all bytes written
    /// before the read.
    pub fn source(&self) -> MemSource {
        MemSource {
            log: self.log.clone(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.log.lock().unwrap().data.clone()
    }
}

impl Default for MemSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemSink {
    fn write(&self, data: &[u8]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.closed {
            return Err(Error::ReadOnly);
        }
        log.data.extend_from_slice(data);
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.log.lock().unwrap().data.len() as u64
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self, _sync: bool) -> Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

/// An in-memory [`LogSource`].
#[derive(Clone)]
pub struct MemSource {
    log: Arc<Mutex<MemLog>>,
}

impl MemSource {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            log: Arc::new(Mutex::new(MemLog { data, closed: true })),
        }
    }
}

impl LogSource for MemSource {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let log = self.log.lock().unwrap();
        let offset = offset.min(log.data.len() as u64) as usize;
        let n = buf.len().min(log.data.len() - offset);
        buf[..n].copy_from_slice(&log.data[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.log.lock().unwrap().data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_sink_and_source() -> Result<()> {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("data.log");

        let sink = FileSink::create(&path)?;
        assert_eq!(sink.tell(), 0);
        sink.write(b"hello ")?;
        sink.write(b"world")?;
        assert_eq!(sink.tell(), 11);
        sink.close(true)?;

        // Closed sink rejects writes.
        assert_eq!(sink.write(b"more"), Err(Error::ReadOnly));

        let src = FileSource::open(&path)?;
        assert_eq!(src.size(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(src.read_at(&mut buf, 6)?, 5);
        assert_eq!(&buf, b"world");

        // Reads past the end come back short.
        assert_eq!(src.read_at(&mut buf, 9)?, 2);
        Ok(())
    }

    #[test]
    fn test_mem_sink_and_source() -> Result<()> {
        let sink = MemSink::new();
        sink.write(b"abcdef")?;
        assert_eq!(sink.tell(), 6);

        let src = sink.source();
        let mut buf = [0u8; 3];
        assert_eq!(src.read_at(&mut buf, 2)?, 3);
        assert_eq!(&buf, b"cde");
        assert_eq!(src.read_at(&mut buf, 5)?, 1);

        sink.close(false)?;
        assert_eq!(sink.write(b"x"), Err(Error::ReadOnly));
        Ok(())
    }
}
