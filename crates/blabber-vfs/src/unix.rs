//! VFS backed by the real filesystem.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use blabber_error::Result;

use crate::traits::{Vfs, VfsFile};

/// The default VFS: plain files opened read-write through `std::fs`.
#[derive(Debug, Default, Clone)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create the default filesystem VFS.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, path: &Path) -> Result<Self::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(UnixFile { file })
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }
}

/// A file handle in the unix VFS.
#[derive(Debug)]
pub struct UnixFile {
    file: File,
}

impl VfsFile for UnixFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        // Zero-fill past end of file.
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.db");

        let vfs = UnixVfs::new();
        let mut file = vfs.open(&path).unwrap();

        file.write_at(b"hello", 10).unwrap();
        assert_eq!(file.len().unwrap(), 15);

        let mut buf = [0xFFu8; 20];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..15], b"hello");
        // Read past end of file is zero-filled, not stale.
        assert_eq!(&buf[15..], &[0u8; 5]);
    }

    #[test]
    fn truncate_grows_with_zeroes_and_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.db");

        let vfs = UnixVfs::new();
        let mut file = vfs.open(&path).unwrap();

        file.truncate(8).unwrap();
        assert_eq!(file.len().unwrap(), 8);
        let mut buf = [0xFFu8; 8];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0u8; 8]);

        file.truncate(2).unwrap();
        assert_eq!(file.len().unwrap(), 2);
    }

    #[test]
    fn remove_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.db");

        let vfs = UnixVfs::new();
        drop(vfs.open(&path).unwrap());
        assert!(vfs.exists(&path).unwrap());
        vfs.remove(&path).unwrap();
        assert!(!vfs.exists(&path).unwrap());
    }
}
