//! Offset writer for the temporary `.part` file of one download.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::StorageError;

/// Writer for a temp download file. Cloning shares the file; each `write_at` is
/// independent (pwrite-style) so the cursor never matters.
#[derive(Clone)]
pub struct StorageWriter {
    file: Arc<File>,
    temp_path: PathBuf,
}

impl StorageWriter {
    /// Create (truncating) the temp file and reserve `size` bytes on disk when known.
    pub fn create(temp_path: &Path, size: Option<u64>) -> Result<Self, StorageError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .map_err(|e| StorageError::io("create", temp_path, e))?;
        if let Some(size) = size {
            preallocate(&file, size).map_err(|e| StorageError::io("preallocate", temp_path, e))?;
        }
        Ok(Self {
            file: Arc::new(file),
            temp_path: temp_path.to_path_buf(),
        })
    }

    /// Open an existing temp file for resume (no truncation).
    pub fn open_existing(temp_path: &Path) -> Result<Self, StorageError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(temp_path)
            .map_err(|e| StorageError::io("open", temp_path, e))?;
        Ok(Self {
            file: Arc::new(file),
            temp_path: temp_path.to_path_buf(),
        })
    }

    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all_at(data, offset)
            .map_err(|e| StorageError::io("write", &self.temp_path, e))
    }

    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file)
            .try_clone()
            .map_err(|e| StorageError::io("write", &self.temp_path, e))?;
        f.seek(SeekFrom::Start(offset))
            .and_then(|_| f.write_all(data))
            .map_err(|e| StorageError::io("write", &self.temp_path, e))
    }

    /// Shrink or grow the file to exactly `len` bytes (drops preallocated tail).
    pub fn set_len(&self, len: u64) -> Result<(), StorageError> {
        self.file
            .set_len(len)
            .map_err(|e| StorageError::io("truncate", &self.temp_path, e))
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        self.file
            .sync_all()
            .map_err(|e| StorageError::io("sync", &self.temp_path, e))
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Rename the temp file over `final_path`. Readers never observe a partial file there.
    /// Fails if `final_path` is on a different filesystem.
    pub fn finalize(self, final_path: &Path) -> Result<(), StorageError> {
        let temp_path = self.temp_path.clone();
        drop(self.file);
        std::fs::rename(&temp_path, final_path).map_err(|e| StorageError::io("rename", &temp_path, e))
    }
}

/// On Unix tries `posix_fallocate` for real block allocation; falls back to `set_len`.
fn preallocate(file: &File, size: u64) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_path;

    #[test]
    fn create_preallocate_write_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("weights.bin");
        let tp = temp_path(&final_path);

        let writer = StorageWriter::create(&tp, Some(100)).unwrap();
        assert_eq!(std::fs::metadata(&tp).unwrap().len(), 100);
        writer.write_at(0, b"hello").unwrap();
        writer.write_at(95, b"xy").unwrap();
        writer.sync().unwrap();
        assert!(!final_path.exists(), "nothing at the final path before finalize");
        writer.finalize(&final_path).unwrap();

        assert!(!tp.exists());
        let buf = std::fs::read(&final_path).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(&buf[0..5], b"hello");
        assert_eq!(&buf[95..97], b"xy");
    }

    #[test]
    fn reopen_keeps_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let tp = dir.path().join("w.part");
        let writer = StorageWriter::create(&tp, None).unwrap();
        writer.write_at(0, b"abcd").unwrap();
        drop(writer);

        let writer = StorageWriter::open_existing(&tp).unwrap();
        writer.write_at(4, b"efgh").unwrap();
        writer.sync().unwrap();
        assert_eq!(std::fs::read(&tp).unwrap(), b"abcdefgh");
    }

    #[test]
    fn open_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StorageWriter::open_existing(&dir.path().join("nope.part")).err().unwrap();
        assert!(err.is_not_found());
    }
}
