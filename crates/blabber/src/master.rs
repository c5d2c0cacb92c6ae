//! The master block.
//!
//! Block 0 roots the entire persistent state: a magic header and format
//! version for verification on open, then the allocator anchor and the
//! store anchor. The driver materializes this record at the start of
//! every transaction and flushes it back if any anchor changed.

use blabber_container::AllocatorAnchor;
use blabber_error::{BlabberError, Result};
use blabber_types::{BinaryFormat, FieldReader, FieldWriter, BLOCK_SIZE};

use crate::store::StoreAnchor;

/// Magic bytes identifying a blabber database file.
pub const FILE_FORMAT_MAGIC: [u8; 10] = *b"BLABBER_DB";

/// Current file format version.
pub const FILE_FORMAT_VERSION: u32 = 1;

/// The verification header, always at byte offset 0 of block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    magic: [u8; 10],
    version: u32,
}

impl FileHeader {
    pub(crate) fn current() -> Self {
        Self {
            magic: FILE_FORMAT_MAGIC,
            version: FILE_FORMAT_VERSION,
        }
    }

    /// Validate magic and version against this build.
    pub(crate) fn check(&self) -> Result<()> {
        if self.magic != FILE_FORMAT_MAGIC {
            return Err(BlabberError::InvalidFormat);
        }
        if self.version != FILE_FORMAT_VERSION {
            return Err(BlabberError::UnsupportedVersion {
                found: self.version,
                supported: FILE_FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

impl BinaryFormat for FileHeader {
    const SERIALIZED_SIZE: usize = 14;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.magic);
        w.put(&self.version);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            magic: r.take(),
            version: r.take(),
        }
    }
}

/// Full content of block 0.
///
/// The header is the first serialized field, so it lands at byte offset
/// 0 of the block; `read_from`/`write_to` keep the field order fixed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MasterBlock {
    pub header: FileHeader,
    pub alloc: AllocatorAnchor,
    pub store: StoreAnchor,
}

impl MasterBlock {
    /// A fresh master block for a newly initialized database.
    pub(crate) fn initial() -> Self {
        Self {
            header: FileHeader::current(),
            alloc: AllocatorAnchor::default(),
            store: StoreAnchor::default(),
        }
    }
}

impl BinaryFormat for MasterBlock {
    const SERIALIZED_SIZE: usize = FileHeader::SERIALIZED_SIZE
        + AllocatorAnchor::SERIALIZED_SIZE
        + StoreAnchor::SERIALIZED_SIZE;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.header);
        w.put(&self.alloc);
        w.put(&self.store);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            header: r.take(),
            alloc: r.take(),
            store: r.take(),
        }
    }
}

// The whole master record must fit in its block.
const _: () = assert!(MasterBlock::SERIALIZED_SIZE <= BLOCK_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_serialized_at_offset_zero() {
        let master = MasterBlock::initial();
        let mut buf = [0u8; MasterBlock::SERIALIZED_SIZE];
        master.write_to(&mut buf);
        assert_eq!(&buf[..10], b"BLABBER_DB");
    }

    #[test]
    fn header_check_accepts_current_format() {
        assert!(FileHeader::current().check().is_ok());
    }

    #[test]
    fn header_check_rejects_bad_magic() {
        let header = FileHeader {
            magic: *b"NOT_A_BLAB",
            version: FILE_FORMAT_VERSION,
        };
        assert!(matches!(header.check(), Err(BlabberError::InvalidFormat)));
    }

    #[test]
    fn header_check_rejects_future_version() {
        let header = FileHeader {
            magic: FILE_FORMAT_MAGIC,
            version: 2,
        };
        assert!(matches!(
            header.check(),
            Err(BlabberError::UnsupportedVersion {
                found: 2,
                supported: 1
            })
        ));
    }

    #[test]
    fn master_block_round_trips() {
        let master = MasterBlock::initial();
        let mut buf = [0u8; MasterBlock::SERIALIZED_SIZE];
        master.write_to(&mut buf);
        let loaded = MasterBlock::read_from(&buf);
        assert_eq!(loaded.header, master.header);
        assert_eq!(loaded.alloc, master.alloc);
    }
}
