use std::path::Path;

use blabber_error::Result;

/// A virtual filesystem implementation.
///
/// This trait abstracts the file operations the engine needs, allowing
/// different backends: real files ([`crate::UnixVfs`]) or in-memory
/// storage ([`crate::MemoryVfs`]) for tests and ephemeral databases.
///
/// `Vfs` and [`VfsFile`] are open traits; hosts may provide their own
/// backends.
pub trait Vfs {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g., "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open a file read-write, creating it if it does not exist.
    fn open(&self, path: &Path) -> Result<Self::File>;

    /// Delete a file. Deleting a missing file is an error.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool>;
}

/// A file handle opened by a [`Vfs`].
///
/// All reads and writes are positioned; the handle keeps no cursor.
pub trait VfsFile {
    /// Read exactly `buf.len()` bytes starting at byte `offset`.
    ///
    /// Reading past the end of the file zero-fills the remainder of
    /// `buf`; the engine relies on this for blocks that were grown but
    /// never written.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` starting at byte `offset`, extending the file
    /// if necessary.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Set the file length to exactly `size` bytes. Growing zero-fills.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;

    /// Whether the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush file contents to stable storage.
    fn sync(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vfs_file_is_object_safe() {
        fn _accepts_dyn(_f: &mut dyn VfsFile) {}
    }
}
