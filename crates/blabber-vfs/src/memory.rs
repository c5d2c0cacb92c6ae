//! In-memory VFS for tests and ephemeral databases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use blabber_error::{BlabberError, Result};

use crate::traits::{Vfs, VfsFile};

/// Backing store of a single in-memory file.
///
/// Multiple [`MemoryFile`] handles can reference the same storage via
/// `Arc<Mutex<..>>`, which is what makes close-and-reopen tests work.
#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileStorage>>>,
}

/// An in-memory VFS.
///
/// All files live in memory with no persistence. The VFS is cheap to
/// clone; clones share the same file namespace, so a database "reopened"
/// through a clone sees the bytes written before it was closed.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err() -> BlabberError {
    BlabberError::invariant("MemoryVfs lock poisoned")
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &Path) -> Result<Self::File> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(FileStorage::default())));
        Ok(MemoryFile {
            storage: Arc::clone(storage),
        })
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        if inner.files.remove(path).is_none() {
            return Err(BlabberError::CannotOpen {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .contains_key(path))
    }
}

/// A file handle in the memory VFS.
#[derive(Debug)]
pub struct MemoryFile {
    storage: Arc<Mutex<FileStorage>>,
}

impl VfsFile for MemoryFile {
    #[allow(clippy::cast_possible_truncation)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let storage = self.storage.lock().map_err(|_| lock_err())?;

        let offset = offset as usize;
        let file_len = storage.data.len();
        if offset >= file_len {
            buf.fill(0);
            return Ok(());
        }

        let available = file_len - offset;
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&storage.data[offset..offset + to_read]);
        buf[to_read..].fill(0);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;

        let offset = offset as usize;
        let end = offset + buf.len();
        if end > storage.data.len() {
            storage.data.resize(end, 0);
        }
        storage.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, size: u64) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        storage.data.resize(size as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.storage.lock().map_err(|_| lock_err())?.data.len() as u64)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_sees_previous_writes() {
        let vfs = MemoryVfs::new();
        let path = Path::new("db");

        let mut file = vfs.open(path).unwrap();
        file.write_at(b"persisted", 0).unwrap();
        drop(file);

        let mut again = vfs.clone().open(path).unwrap();
        let mut buf = [0u8; 9];
        again.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"persisted");
    }

    #[test]
    fn read_past_end_zero_fills() {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open(Path::new("db")).unwrap();
        file.write_at(b"ab", 0).unwrap();

        let mut buf = [0xFFu8; 4];
        file.read_at(&mut buf, 1).unwrap();
        assert_eq!(buf, [b'b', 0, 0, 0]);
    }

    #[test]
    fn remove_missing_file_is_an_error() {
        let vfs = MemoryVfs::new();
        assert!(vfs.remove(Path::new("nope")).is_err());
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open(Path::new("db")).unwrap();
        file.write_at(b"abcdef", 0).unwrap();
        file.truncate(3).unwrap();
        assert_eq!(file.len().unwrap(), 3);
        file.truncate(5).unwrap();

        let mut buf = [0xFFu8; 5];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abc\0\0");
    }
}
