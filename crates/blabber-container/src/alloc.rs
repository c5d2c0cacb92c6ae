//! Block allocator.
//!
//! Hands out blocks and contiguous multi-block extents from the engine.
//! Freed single blocks go onto an intrusive free list (each free block
//! stores the index of the next free block in its first eight bytes);
//! allocation pops the free list before growing the file. Extents are
//! always carved from fresh growth so they stay contiguous.

use std::cell::RefCell;
use std::io::Write;

use blabber_engine::TransactionEngine;
use blabber_error::{BlabberError, Result};
use blabber_types::{AnchorFlag, BinaryFormat, BlockIndex, FieldReader, FieldWriter};
use blabber_vfs::VfsFile;

/// Persistent state of the allocator, stored in the master block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorAnchor {
    /// First block of the free list, 0 if the list is empty.
    free_head: u64,
    /// Number of blocks on the free list.
    free_blocks: u64,
    /// Number of blocks currently handed out.
    total_allocated: u64,
}

impl BinaryFormat for AllocatorAnchor {
    const SERIALIZED_SIZE: usize = 24;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.free_head);
        w.put(&self.free_blocks);
        w.put(&self.total_allocated);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            free_head: r.take(),
            free_blocks: r.take(),
            total_allocated: r.take(),
        }
    }
}

/// A live allocator view over an anchor and the engine.
///
/// Methods take `&self` so the tree, list and heap views of one
/// transaction can share the allocator; the anchor sits behind a
/// `RefCell` and every mutation fires the shared [`AnchorFlag`].
pub struct Allocator<'a, F: VfsFile> {
    anchor: RefCell<&'a mut AllocatorAnchor>,
    flag: &'a AnchorFlag,
    engine: &'a TransactionEngine<F>,
}

impl<'a, F: VfsFile> Allocator<'a, F> {
    /// Open the allocator on its persistent anchor.
    pub fn open(
        anchor: &'a mut AllocatorAnchor,
        flag: &'a AnchorFlag,
        engine: &'a TransactionEngine<F>,
    ) -> Self {
        Self {
            anchor: RefCell::new(anchor),
            flag,
            engine,
        }
    }

    /// The engine this allocator draws blocks from.
    #[must_use]
    pub fn engine(&self) -> &'a TransactionEngine<F> {
        self.engine
    }

    /// Allocate `n` contiguous blocks and return the first index.
    ///
    /// Single-block requests are served from the free list when
    /// possible; everything else grows the file.
    pub fn allocate(&self, n: u64) -> Result<BlockIndex> {
        if n == 0 {
            return Err(BlabberError::invariant("allocation of zero blocks"));
        }

        let mut anchor = self.anchor.borrow_mut();
        if n == 1 && anchor.free_head != 0 {
            let block = BlockIndex::new(anchor.free_head);
            let next = {
                let handle = self.engine.read(block)?;
                handle.get::<u64>(0)?
            };
            anchor.free_head = next;
            anchor.free_blocks -= 1;
            anchor.total_allocated += 1;
            self.flag.mark();
            return Ok(block);
        }

        let first = self.engine.grow(n)?;
        anchor.total_allocated += n;
        self.flag.mark();
        Ok(first)
    }

    /// Return an extent of `n` blocks starting at `first` to the free
    /// list. The extent's contents become undefined.
    pub fn free(&self, first: BlockIndex, n: u64) -> Result<()> {
        if n == 0 {
            return Err(BlabberError::invariant("free of zero blocks"));
        }

        let mut anchor = self.anchor.borrow_mut();
        for i in 0..n {
            let block = first.offset(i);
            let handle = self.engine.read(block)?;
            handle.set(0, &anchor.free_head)?;
            anchor.free_head = block.get();
            anchor.free_blocks += 1;
        }
        anchor.total_allocated -= n;
        self.flag.mark();
        Ok(())
    }

    /// Write a deterministic description of the allocator state.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let anchor = self.anchor.borrow();
        writeln!(out, "free list head: {}", anchor.free_head)?;
        writeln!(out, "free blocks:    {}", anchor.free_blocks)?;
        writeln!(out, "allocated:      {}", anchor.total_allocated)?;
        writeln!(out, "engine size:    {} blocks", self.engine.size()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_engine;

    #[test]
    fn grows_for_fresh_allocations() {
        let engine = test_engine();
        let mut anchor = AllocatorAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut anchor, &flag, &engine);

        let a = alloc.allocate(1).unwrap();
        let b = alloc.allocate(1).unwrap();
        assert_eq!(b, a.offset(1));
        assert!(flag.is_set());
    }

    #[test]
    fn extents_are_contiguous() {
        let engine = test_engine();
        let mut anchor = AllocatorAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut anchor, &flag, &engine);

        let extent = alloc.allocate(4).unwrap();
        let next = alloc.allocate(1).unwrap();
        assert_eq!(next, extent.offset(4));
    }

    #[test]
    fn freed_blocks_are_reused_lifo() {
        let engine = test_engine();
        let mut anchor = AllocatorAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut anchor, &flag, &engine);

        let a = alloc.allocate(1).unwrap();
        let b = alloc.allocate(1).unwrap();
        alloc.free(a, 1).unwrap();
        alloc.free(b, 1).unwrap();

        assert_eq!(alloc.allocate(1).unwrap(), b);
        assert_eq!(alloc.allocate(1).unwrap(), a);
        // Free list exhausted: the next allocation grows again.
        assert_eq!(alloc.allocate(1).unwrap(), b.offset(1));
    }

    #[test]
    fn anchor_round_trips() {
        let anchor = AllocatorAnchor {
            free_head: 5,
            free_blocks: 2,
            total_allocated: 9,
        };
        let mut buf = [0u8; AllocatorAnchor::SERIALIZED_SIZE];
        anchor.write_to(&mut buf);
        assert_eq!(AllocatorAnchor::read_from(&buf), anchor);
    }

    #[test]
    fn dump_is_deterministic() {
        let engine = test_engine();
        let mut anchor = AllocatorAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut anchor, &flag, &engine);
        alloc.allocate(2).unwrap();

        let mut first = Vec::new();
        alloc.dump(&mut first).unwrap();
        let mut second = Vec::new();
        alloc.dump(&mut second).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
