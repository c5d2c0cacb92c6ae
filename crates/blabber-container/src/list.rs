//! Doubly linked list of fixed-size records.
//!
//! Records are packed into linked blocks; the anchor keeps the head and
//! tail block indices and the record count. The only mutation the store
//! needs is appending at the tail, and the only traversal is walking
//! backwards from the tail, so that is the whole surface.
//!
//! Node layout:
//! ```text
//! prev (8) | next (8) | count (2) | pad (6) | entries...
//! ```

use std::marker::PhantomData;

use blabber_engine::{BlockHandle, TransactionEngine};
use blabber_error::{BlabberError, Result};
use blabber_types::{AnchorFlag, BinaryFormat, BlockIndex, FieldReader, FieldWriter, BLOCK_SIZE};
use blabber_vfs::VfsFile;

use crate::alloc::Allocator;

/// Persistent state of a [`List`], stored inline in the owner's record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListAnchor {
    /// First node block, 0 if the list is empty.
    head: u64,
    /// Last node block, 0 if the list is empty.
    tail: u64,
    /// Number of records in the list.
    len: u64,
}

impl BinaryFormat for ListAnchor {
    const SERIALIZED_SIZE: usize = 24;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.head);
        w.put(&self.tail);
        w.put(&self.len);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            head: r.take(),
            tail: r.take(),
            len: r.take(),
        }
    }
}

const NODE_HEADER: usize = 24;
const OFFSET_PREV: usize = 0;
const OFFSET_NEXT: usize = 8;
const OFFSET_COUNT: usize = 16;

fn node_cap<T: BinaryFormat>() -> usize {
    (BLOCK_SIZE - NODE_HEADER) / T::SERIALIZED_SIZE
}

fn entry_offset<T: BinaryFormat>(slot: usize) -> usize {
    NODE_HEADER + slot * T::SERIALIZED_SIZE
}

fn read_entry<T: BinaryFormat, F: VfsFile>(
    engine: &TransactionEngine<F>,
    block: u64,
    slot: usize,
) -> Result<T> {
    let handle = engine.read(BlockIndex::new(block))?;
    handle.get(entry_offset::<T>(slot))
}

fn node_header<F: VfsFile>(handle: &BlockHandle<'_, F>) -> Result<(u64, u64, usize)> {
    let prev = handle.get::<u64>(OFFSET_PREV)?;
    let next = handle.get::<u64>(OFFSET_NEXT)?;
    let count = handle.get::<u16>(OFFSET_COUNT)? as usize;
    Ok((prev, next, count))
}

/// A live list view over an anchor, a change flag and an allocator.
pub struct List<'v, 'a, T: BinaryFormat, F: VfsFile> {
    anchor: &'v mut ListAnchor,
    flag: &'v AnchorFlag,
    alloc: &'v Allocator<'a, F>,
    _marker: PhantomData<T>,
}

impl<'v, 'a, T: BinaryFormat, F: VfsFile> List<'v, 'a, T, F> {
    /// Open a list on its persistent anchor.
    pub fn open(
        anchor: &'v mut ListAnchor,
        flag: &'v AnchorFlag,
        alloc: &'v Allocator<'a, F>,
    ) -> Self {
        Self {
            anchor,
            flag,
            alloc,
            _marker: PhantomData,
        }
    }

    fn engine(&self) -> &'a TransactionEngine<F> {
        self.alloc.engine()
    }

    /// Number of records in the list.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.anchor.len
    }

    /// Whether the list holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchor.len == 0
    }

    /// Append a record at the tail.
    pub fn push_back(&mut self, value: &T) -> Result<()> {
        let engine = self.engine();

        if self.anchor.tail == 0 {
            let block = self.alloc.allocate(1)?;
            let handle = engine.overwrite_zero(block)?;
            handle.set(entry_offset::<T>(0), value)?;
            handle.set(OFFSET_COUNT, &1u16)?;
            self.anchor.head = block.get();
            self.anchor.tail = block.get();
        } else {
            let tail = self.anchor.tail;
            let handle = engine.read(BlockIndex::new(tail))?;
            let (_, _, count) = node_header(&handle)?;

            if count < node_cap::<T>() {
                handle.set(entry_offset::<T>(count), value)?;
                handle.set(OFFSET_COUNT, &(count as u16 + 1))?;
            } else {
                // Tail node is full: link a fresh one.
                let block = self.alloc.allocate(1)?;
                {
                    let fresh = engine.overwrite_zero(block)?;
                    fresh.set(OFFSET_PREV, &tail)?;
                    fresh.set(entry_offset::<T>(0), value)?;
                    fresh.set(OFFSET_COUNT, &1u16)?;
                }
                handle.set(OFFSET_NEXT, &block.get())?;
                self.anchor.tail = block.get();
            }
        }

        self.anchor.len += 1;
        self.flag.mark();
        Ok(())
    }

    /// A cursor on the last record; invalid if the list is empty.
    pub fn cursor_last(&self) -> Result<ListCursor<'a, T, F>> {
        if self.anchor.tail == 0 {
            return Ok(ListCursor {
                engine: self.engine(),
                block: 0,
                slot: 0,
                valid: false,
                _marker: PhantomData,
            });
        }
        let count = {
            let handle = self.engine().read(BlockIndex::new(self.anchor.tail))?;
            let (_, _, count) = node_header(&handle)?;
            count
        };
        if count == 0 {
            return Err(BlabberError::invariant("list tail node is empty"));
        }
        Ok(ListCursor {
            engine: self.engine(),
            block: self.anchor.tail,
            slot: count - 1,
            valid: true,
            _marker: PhantomData,
        })
    }
}

/// A stateful position inside a [`List`].
///
/// Like the tree cursor, it holds only the engine and a block/slot pair,
/// so it survives the list view it came from.
pub struct ListCursor<'e, T: BinaryFormat, F: VfsFile> {
    engine: &'e TransactionEngine<F>,
    block: u64,
    slot: usize,
    valid: bool,
    _marker: PhantomData<T>,
}

impl<T: BinaryFormat, F: VfsFile> ListCursor<'_, T, F> {
    /// Whether the cursor is positioned on a record.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Read the record under the cursor.
    pub fn get(&self) -> Result<T> {
        if !self.valid {
            return Err(BlabberError::invariant("cursor is not positioned"));
        }
        read_entry(self.engine, self.block, self.slot)
    }

    /// Move towards the head; invalidates past the first record.
    pub fn move_prev(&mut self) -> Result<()> {
        if !self.valid {
            return Err(BlabberError::invariant("cursor is not positioned"));
        }
        if self.slot > 0 {
            self.slot -= 1;
            return Ok(());
        }

        let prev = {
            let handle = self.engine.read(BlockIndex::new(self.block))?;
            let (prev, _, _) = node_header(&handle)?;
            prev
        };
        if prev == 0 {
            self.valid = false;
            return Ok(());
        }

        let count = {
            let handle = self.engine.read(BlockIndex::new(prev))?;
            let (_, _, count) = node_header(&handle)?;
            count
        };
        if count == 0 {
            return Err(BlabberError::invariant("list node is empty"));
        }
        self.block = prev;
        self.slot = count - 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocatorAnchor;
    use crate::testutil::test_engine;

    /// 512-byte records: 7 per node, so a handful of pushes span nodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Note(u64);

    impl BinaryFormat for Note {
        const SERIALIZED_SIZE: usize = 512;

        fn write_to(&self, buf: &mut [u8]) {
            self.0.write_to(&mut buf[..8]);
            buf[8..].fill(0);
        }

        fn read_from(buf: &[u8]) -> Self {
            Self(u64::read_from(&buf[..8]))
        }
    }

    #[test]
    fn node_capacity_matches_layout() {
        assert_eq!(node_cap::<Note>(), 7);
    }

    #[test]
    fn push_and_walk_backwards() {
        let engine = test_engine();
        let mut alloc_anchor = AllocatorAnchor::default();
        let mut anchor = ListAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut list = List::<Note, _>::open(&mut anchor, &flag, &alloc);

        for i in 0..20u64 {
            list.push_back(&Note(i)).unwrap();
        }
        assert_eq!(list.len(), 20);

        let mut cursor = list.cursor_last().unwrap();
        let mut seen = Vec::new();
        while cursor.is_valid() {
            seen.push(cursor.get().unwrap().0);
            cursor.move_prev().unwrap();
        }
        assert_eq!(seen, (0..20u64).rev().collect::<Vec<_>>());
    }

    #[test]
    fn every_push_fires_the_flag() {
        let engine = test_engine();
        let mut alloc_anchor = AllocatorAnchor::default();
        let mut anchor = ListAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut list = List::<Note, _>::open(&mut anchor, &flag, &alloc);

        assert!(!flag.is_set());
        list.push_back(&Note(0)).unwrap();
        assert!(flag.is_set());
    }

    #[test]
    fn empty_list_cursor_is_invalid() {
        let engine = test_engine();
        let mut alloc_anchor = AllocatorAnchor::default();
        let mut anchor = ListAnchor::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let list = List::<Note, _>::open(&mut anchor, &flag, &alloc);

        assert!(list.is_empty());
        let cursor = list.cursor_last().unwrap();
        assert!(!cursor.is_valid());
        assert!(cursor.get().is_err());
    }

    #[test]
    fn anchor_round_trips() {
        let anchor = ListAnchor {
            head: 3,
            tail: 9,
            len: 40,
        };
        let mut buf = [0u8; ListAnchor::SERIALIZED_SIZE];
        anchor.write_to(&mut buf);
        assert_eq!(ListAnchor::read_from(&buf), anchor);
    }

    #[test]
    fn reopening_from_anchor_sees_records() {
        let engine = test_engine();
        let mut alloc_anchor = AllocatorAnchor::default();
        let mut anchor = ListAnchor::default();
        let flag = AnchorFlag::new();

        {
            let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
            let mut list = List::<Note, _>::open(&mut anchor, &flag, &alloc);
            list.push_back(&Note(1)).unwrap();
            list.push_back(&Note(2)).unwrap();
        }

        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let list = List::<Note, _>::open(&mut anchor, &flag, &alloc);
        assert_eq!(list.len(), 2);
        let cursor = list.cursor_last().unwrap();
        assert_eq!(cursor.get().unwrap(), Note(2));
    }
}
