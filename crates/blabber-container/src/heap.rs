//! Unordered variable-size blob store.
//!
//! Each blob owns a contiguous extent of blocks, length-prefixed in the
//! first eight bytes. A [`HeapRef`] is the extent's first block index,
//! which gives references a stable total order for free. Objects are
//! limited to 2^32 - 1 bytes.

use std::io::Write;

use blabber_engine::TransactionEngine;
use blabber_error::{BlabberError, Result};
use blabber_types::{AnchorFlag, BinaryFormat, BlockIndex, FieldReader, FieldWriter, BLOCK_SIZE};
use blabber_vfs::VfsFile;

use crate::alloc::Allocator;

/// Bytes of blob data in the first block of an extent.
const FIRST_BLOCK_DATA: usize = BLOCK_SIZE - 8;

/// An opaque, totally ordered reference to a blob in a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapRef(u64);

impl HeapRef {
    fn block(self) -> BlockIndex {
        BlockIndex::new(self.0)
    }
}

impl BinaryFormat for HeapRef {
    const SERIALIZED_SIZE: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        self.0.write_to(buf);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self(u64::read_from(buf))
    }
}

/// Persistent state of a [`Heap`], stored in the owner's record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapAnchor {
    /// Number of blobs ever allocated.
    blob_count: u64,
    /// Total payload bytes across all blobs.
    total_bytes: u64,
}

impl BinaryFormat for HeapAnchor {
    const SERIALIZED_SIZE: usize = 16;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.blob_count);
        w.put(&self.total_bytes);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            blob_count: r.take(),
            total_bytes: r.take(),
        }
    }
}

/// A live heap view over an anchor, a change flag and an allocator.
pub struct Heap<'v, 'a, F: VfsFile> {
    anchor: &'v mut HeapAnchor,
    flag: &'v AnchorFlag,
    alloc: &'v Allocator<'a, F>,
}

impl<'v, 'a, F: VfsFile> Heap<'v, 'a, F> {
    /// Open the heap on its persistent anchor.
    pub fn open(
        anchor: &'v mut HeapAnchor,
        flag: &'v AnchorFlag,
        alloc: &'v Allocator<'a, F>,
    ) -> Self {
        Self {
            anchor,
            flag,
            alloc,
        }
    }

    fn engine(&self) -> &'a TransactionEngine<F> {
        self.alloc.engine()
    }

    /// Store a blob and return a reference to it.
    pub fn allocate(&mut self, data: &[u8]) -> Result<HeapRef> {
        if data.len() > u32::MAX as usize {
            return Err(BlabberError::StringTooLarge);
        }

        let blocks = (8 + data.len()).div_ceil(BLOCK_SIZE) as u64;
        let first = self.alloc.allocate(blocks)?;
        let engine = self.engine();

        let head_len = data.len().min(FIRST_BLOCK_DATA);
        {
            let handle = engine.overwrite_zero(first)?;
            handle.set(0, &(data.len() as u64))?;
            handle.write_bytes(8, &data[..head_len])?;
        }

        let mut written = head_len;
        let mut block = first.offset(1);
        while written < data.len() {
            let chunk = (data.len() - written).min(BLOCK_SIZE);
            let handle = engine.overwrite_zero(block)?;
            handle.write_bytes(0, &data[written..written + chunk])?;
            written += chunk;
            block = block.offset(1);
        }

        self.anchor.blob_count += 1;
        self.anchor.total_bytes += data.len() as u64;
        self.flag.mark();
        Ok(HeapRef(first.get()))
    }

    /// Payload size of a blob in bytes.
    pub fn size(&self, blob: HeapRef) -> Result<u64> {
        let handle = self.engine().read(blob.block())?;
        handle.get(0)
    }

    /// Load a blob's payload.
    pub fn load(&self, blob: HeapRef) -> Result<Vec<u8>> {
        let engine = self.engine();
        let len = {
            let handle = engine.read(blob.block())?;
            handle.get::<u64>(0)? as usize
        };

        let mut data = vec![0u8; len];
        let head_len = len.min(FIRST_BLOCK_DATA);
        {
            let handle = engine.read(blob.block())?;
            handle.read_bytes(8, &mut data[..head_len])?;
        }

        let mut read = head_len;
        let mut block = blob.block().offset(1);
        while read < len {
            let chunk = (len - read).min(BLOCK_SIZE);
            let handle = engine.read(block)?;
            handle.read_bytes(0, &mut data[read..read + chunk])?;
            read += chunk;
            block = block.offset(1);
        }
        Ok(data)
    }

    /// Write a deterministic description of the heap to `out`.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "heap: {} blobs, {} bytes",
            self.anchor.blob_count, self.anchor.total_bytes
        )?;
        Ok(())
    }
}
