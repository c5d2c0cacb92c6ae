//! Ordered index over fixed-size records.
//!
//! A B-tree keyed by a field of the stored record. Leaf nodes hold the
//! records themselves; internal nodes hold child pointers and separator
//! keys, where separator `i` is the smallest key reachable through child
//! `i + 1`. Every node is exactly one block.
//!
//! Node layout:
//! ```text
//! leaf:     kind (1) | pad (1) | count (2) | pad (4) | entries...
//! internal: kind (1) | pad (1) | count (2) | pad (4) | children[max] | keys[max-1]
//! ```
//! `count` is the number of entries (leaf) or children (internal).
//! Nodes are rewritten wholesale from an in-memory image, so unused tail
//! bytes are always zero and node images are deterministic.

use std::io::Write;
use std::marker::PhantomData;

use blabber_engine::TransactionEngine;
use blabber_error::{BlabberError, Result};
use blabber_types::{AnchorFlag, BinaryFormat, BlockIndex, FieldReader, FieldWriter, BLOCK_SIZE};
use blabber_vfs::VfsFile;

use crate::alloc::Allocator;

/// A record that can live in a [`BTree`], ordered by an extracted key.
pub trait TreeRecord: BinaryFormat + Clone {
    /// The key type the tree is ordered by.
    type Key: BinaryFormat + Ord + Copy;

    /// Extract this record's key.
    fn key(&self) -> Self::Key;
}

/// Persistent state of a [`BTree`], stored inline in the owner's record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BTreeAnchor {
    /// Root node block, 0 for an empty tree.
    root: u64,
    /// Number of node levels; 0 for an empty tree, 1 for a lone leaf.
    height: u32,
    /// Number of records in the tree.
    len: u64,
}

impl BinaryFormat for BTreeAnchor {
    const SERIALIZED_SIZE: usize = 20;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.root);
        w.put(&self.height);
        w.put(&self.len);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            root: r.take(),
            height: r.take(),
            len: r.take(),
        }
    }
}

const NODE_HEADER: usize = 8;
const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;

fn leaf_cap<T: TreeRecord>() -> usize {
    (BLOCK_SIZE - NODE_HEADER) / T::SERIALIZED_SIZE
}

/// Maximum child count of an internal node.
fn internal_cap<T: TreeRecord>() -> usize {
    let key = <T::Key as BinaryFormat>::SERIALIZED_SIZE;
    (BLOCK_SIZE - NODE_HEADER + key) / (8 + key)
}

fn node_kind(image: &[u8]) -> u8 {
    image[0]
}

fn node_count(image: &[u8]) -> usize {
    u16::read_from(&image[2..4]) as usize
}

fn decode_leaf<T: TreeRecord>(image: &[u8]) -> Vec<T> {
    let count = node_count(image);
    let mut entries = Vec::with_capacity(count);
    let mut offset = NODE_HEADER;
    for _ in 0..count {
        entries.push(T::read_from(&image[offset..offset + T::SERIALIZED_SIZE]));
        offset += T::SERIALIZED_SIZE;
    }
    entries
}

fn encode_leaf<T: TreeRecord>(entries: &[T]) -> Vec<u8> {
    debug_assert!(entries.len() <= leaf_cap::<T>());
    let mut image = vec![0u8; BLOCK_SIZE];
    image[0] = KIND_LEAF;
    (entries.len() as u16).write_to(&mut image[2..4]);
    let mut offset = NODE_HEADER;
    for entry in entries {
        entry.write_to(&mut image[offset..offset + T::SERIALIZED_SIZE]);
        offset += T::SERIALIZED_SIZE;
    }
    image
}

fn decode_internal<T: TreeRecord>(image: &[u8]) -> (Vec<u64>, Vec<T::Key>) {
    let count = node_count(image);
    let max = internal_cap::<T>();
    let key_size = <T::Key as BinaryFormat>::SERIALIZED_SIZE;
    let key_base = NODE_HEADER + 8 * max;

    let mut children = Vec::with_capacity(count);
    for i in 0..count {
        let offset = NODE_HEADER + 8 * i;
        children.push(u64::read_from(&image[offset..offset + 8]));
    }
    let mut keys = Vec::with_capacity(count.saturating_sub(1));
    for i in 0..count.saturating_sub(1) {
        let offset = key_base + key_size * i;
        keys.push(<T::Key as BinaryFormat>::read_from(
            &image[offset..offset + key_size],
        ));
    }
    (children, keys)
}

fn encode_internal<T: TreeRecord>(children: &[u64], keys: &[T::Key]) -> Vec<u8> {
    let max = internal_cap::<T>();
    debug_assert!(children.len() <= max);
    debug_assert_eq!(keys.len() + 1, children.len());
    let key_size = <T::Key as BinaryFormat>::SERIALIZED_SIZE;
    let key_base = NODE_HEADER + 8 * max;

    let mut image = vec![0u8; BLOCK_SIZE];
    image[0] = KIND_INTERNAL;
    (children.len() as u16).write_to(&mut image[2..4]);
    for (i, child) in children.iter().enumerate() {
        let offset = NODE_HEADER + 8 * i;
        child.write_to(&mut image[offset..offset + 8]);
    }
    for (i, key) in keys.iter().enumerate() {
        let offset = key_base + key_size * i;
        key.write_to(&mut image[offset..offset + key_size]);
    }
    image
}

fn load_node<F: VfsFile>(engine: &TransactionEngine<F>, block: u64) -> Result<Vec<u8>> {
    let handle = engine.read(BlockIndex::new(block))?;
    let mut image = vec![0u8; BLOCK_SIZE];
    handle.read_bytes(0, &mut image)?;
    Ok(image)
}

fn store_node<F: VfsFile>(engine: &TransactionEngine<F>, block: u64, image: &[u8]) -> Result<()> {
    debug_assert_eq!(image.len(), BLOCK_SIZE);
    let handle = engine.read(BlockIndex::new(block))?;
    handle.write_bytes(0, image)
}

/// Which child to descend into for `key`: the number of separators
/// less than or equal to it.
fn descend_index<K: Ord>(keys: &[K], key: &K) -> usize {
    keys.partition_point(|sep| sep <= key)
}

/// A live B-tree view over an anchor, a change flag and an allocator.
pub struct BTree<'v, 'a, T: TreeRecord, F: VfsFile> {
    anchor: &'v mut BTreeAnchor,
    flag: &'v AnchorFlag,
    alloc: &'v Allocator<'a, F>,
    _marker: PhantomData<T>,
}

impl<'v, 'a, T: TreeRecord, F: VfsFile> BTree<'v, 'a, T, F> {
    /// Open a tree on its persistent anchor.
    pub fn open(
        anchor: &'v mut BTreeAnchor,
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

    /// Number of records in the tree.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.anchor.len
    }

    /// Whether the tree holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchor.len == 0
    }

    /// Insert a record. The key must not already be present.
    pub fn insert(&mut self, value: &T) -> Result<()> {
        if self.anchor.root == 0 {
            let block = self.alloc.allocate(1)?;
            let image = encode_leaf(std::slice::from_ref(value));
            store_node(self.engine(), block.get(), &image)?;
            self.anchor.root = block.get();
            self.anchor.height = 1;
            self.anchor.len = 1;
            self.flag.mark();
            return Ok(());
        }

        if let Some((sep, right)) = self.insert_rec(self.anchor.root, value)? {
            // Root split: grow the tree by one level.
            let block = self.alloc.allocate(1)?;
            let image = encode_internal::<T>(&[self.anchor.root, right], &[sep]);
            store_node(self.engine(), block.get(), &image)?;
            self.anchor.root = block.get();
            self.anchor.height += 1;
        }
        self.anchor.len += 1;
        self.flag.mark();
        Ok(())
    }

    /// Recursive insert; returns the separator and new right sibling if
    /// the visited node split.
    fn insert_rec(&self, block: u64, value: &T) -> Result<Option<(T::Key, u64)>> {
        let image = load_node(self.engine(), block)?;
        match node_kind(&image) {
            KIND_LEAF => {
                let mut entries = decode_leaf::<T>(&image);
                let pos = match entries.binary_search_by(|e| e.key().cmp(&value.key())) {
                    Ok(_) => {
                        return Err(BlabberError::invariant(
                            "duplicate key inserted into tree",
                        ))
                    }
                    Err(pos) => pos,
                };
                entries.insert(pos, value.clone());

                if entries.len() <= leaf_cap::<T>() {
                    store_node(self.engine(), block, &encode_leaf(&entries))?;
                    return Ok(None);
                }

                let right_entries = entries.split_off(entries.len() / 2);
                let sep = right_entries[0].key();
                let right = self.alloc.allocate(1)?;
                store_node(self.engine(), right.get(), &encode_leaf(&right_entries))?;
                store_node(self.engine(), block, &encode_leaf(&entries))?;
                Ok(Some((sep, right.get())))
            }
            KIND_INTERNAL => {
                let (mut children, mut keys) = decode_internal::<T>(&image);
                let idx = descend_index(&keys, &value.key());
                let Some((sep, new_child)) = self.insert_rec(children[idx], value)? else {
                    return Ok(None);
                };

                keys.insert(idx, sep);
                children.insert(idx + 1, new_child);

                if children.len() <= internal_cap::<T>() {
                    store_node(self.engine(), block, &encode_internal::<T>(&children, &keys))?;
                    return Ok(None);
                }

                let split = children.len() / 2;
                let right_children = children.split_off(split);
                let right_keys = keys.split_off(split);
                let promoted = keys
                    .pop()
                    .ok_or_else(|| BlabberError::invariant("internal split without keys"))?;

                let right = self.alloc.allocate(1)?;
                store_node(
                    self.engine(),
                    right.get(),
                    &encode_internal::<T>(&right_children, &right_keys),
                )?;
                store_node(self.engine(), block, &encode_internal::<T>(&children, &keys))?;
                Ok(Some((promoted, right.get())))
            }
            other => Err(BlabberError::corrupt(format!(
                "tree node {block} has unknown kind {other}"
            ))),
        }
    }

    /// Position a cursor on the record with `key`, if present.
    pub fn find(&self, key: T::Key) -> Result<Option<TreeCursor<'a, T, F>>> {
        if self.anchor.root == 0 {
            return Ok(None);
        }

        let mut path = Vec::with_capacity(self.anchor.height as usize);
        let mut block = self.anchor.root;
        loop {
            let image = load_node(self.engine(), block)?;
            match node_kind(&image) {
                KIND_LEAF => {
                    let entries = decode_leaf::<T>(&image);
                    return match entries.binary_search_by(|e| e.key().cmp(&key)) {
                        Ok(pos) => {
                            path.push((block, pos));
                            Ok(Some(TreeCursor::positioned(self.engine(), path)))
                        }
                        Err(_) => Ok(None),
                    };
                }
                KIND_INTERNAL => {
                    let (children, keys) = decode_internal::<T>(&image);
                    let idx = descend_index(&keys, &key);
                    path.push((block, idx));
                    block = children[idx];
                }
                other => {
                    return Err(BlabberError::corrupt(format!(
                        "tree node {block} has unknown kind {other}"
                    )))
                }
            }
        }
    }

    /// A cursor on the smallest key; invalid if the tree is empty.
    pub fn cursor_min(&self) -> Result<TreeCursor<'a, T, F>> {
        self.cursor_at_edge(false)
    }

    /// A cursor on the largest key; invalid if the tree is empty.
    pub fn cursor_max(&self) -> Result<TreeCursor<'a, T, F>> {
        self.cursor_at_edge(true)
    }

    fn cursor_at_edge(&self, max: bool) -> Result<TreeCursor<'a, T, F>> {
        if self.anchor.root == 0 {
            return Ok(TreeCursor::invalid(self.engine()));
        }
        let mut path = Vec::with_capacity(self.anchor.height as usize);
        descend_edge::<T, F>(self.engine(), self.anchor.root, max, &mut path)?;
        Ok(TreeCursor::positioned(self.engine(), path))
    }

    /// Write a deterministic description of the tree to `out`.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "tree: len {} height {} root {}",
            self.anchor.len, self.anchor.height, self.anchor.root
        )?;
        Ok(())
    }
}

/// Descend from `block` to the leftmost or rightmost leaf entry,
/// appending to `path`.
fn descend_edge<T: TreeRecord, F: VfsFile>(
    engine: &TransactionEngine<F>,
    mut block: u64,
    max: bool,
    path: &mut Vec<(u64, usize)>,
) -> Result<()> {
    loop {
        let image = load_node(engine, block)?;
        let count = node_count(&image);
        match node_kind(&image) {
            KIND_LEAF => {
                let idx = if max { count - 1 } else { 0 };
                path.push((block, idx));
                return Ok(());
            }
            KIND_INTERNAL => {
                let (children, _) = decode_internal::<T>(&image);
                let idx = if max { count - 1 } else { 0 };
                path.push((block, idx));
                block = children[idx];
            }
            other => {
                return Err(BlabberError::corrupt(format!(
                    "tree node {block} has unknown kind {other}"
                )))
            }
        }
    }
}

fn encode_value<T: BinaryFormat>(value: &T) -> Vec<u8> {
    let mut buf = vec![0u8; T::SERIALIZED_SIZE];
    value.write_to(&mut buf);
    buf
}

/// A stateful position inside a [`BTree`].
///
/// The cursor records the root-to-leaf path and re-reads nodes through
/// the engine as it moves, so it stays usable after the tree view that
/// created it is dropped (the transaction is still the same).
pub struct TreeCursor<'e, T: TreeRecord, F: VfsFile> {
    engine: &'e TransactionEngine<F>,
    /// `(block, index)` per level; the last element is the leaf entry.
    path: Vec<(u64, usize)>,
    valid: bool,
    _marker: PhantomData<T>,
}

impl<'e, T: TreeRecord, F: VfsFile> TreeCursor<'e, T, F> {
    fn positioned(engine: &'e TransactionEngine<F>, path: Vec<(u64, usize)>) -> Self {
        Self {
            engine,
            path,
            valid: true,
            _marker: PhantomData,
        }
    }

    fn invalid(engine: &'e TransactionEngine<F>) -> Self {
        Self {
            engine,
            path: Vec::new(),
            valid: false,
            _marker: PhantomData,
        }
    }

    /// Whether the cursor is positioned on a record.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn leaf_position(&self) -> Result<(u64, usize)> {
        if !self.valid {
            return Err(BlabberError::invariant("cursor is not positioned"));
        }
        self.path
            .last()
            .copied()
            .ok_or_else(|| BlabberError::invariant("cursor has an empty path"))
    }

    /// Read the record under the cursor.
    pub fn get(&self) -> Result<T> {
        let (block, idx) = self.leaf_position()?;
        let image = load_node(self.engine, block)?;
        let offset = NODE_HEADER + idx * T::SERIALIZED_SIZE;
        Ok(T::read_from(&image[offset..offset + T::SERIALIZED_SIZE]))
    }

    /// Overwrite the record under the cursor. The replacement must have
    /// the same key; the tree's ordering is not re-established.
    pub fn set(&self, value: &T) -> Result<()> {
        let (block, idx) = self.leaf_position()?;
        let current = self.get()?;
        if current.key() != value.key() {
            return Err(BlabberError::invariant(
                "cursor set() must keep the record key",
            ));
        }
        let offset = NODE_HEADER + idx * T::SERIALIZED_SIZE;
        let handle = self.engine.read(BlockIndex::new(block))?;
        handle.write_bytes(offset, &encode_value(value))
    }

    /// Move to the next record in key order; invalidates at the end.
    pub fn move_next(&mut self) -> Result<()> {
        self.step(true)
    }

    /// Move to the previous record in key order; invalidates at the
    /// beginning.
    pub fn move_prev(&mut self) -> Result<()> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Result<()> {
        let (leaf, idx) = self.leaf_position()?;
        let image = load_node(self.engine, leaf)?;
        let count = node_count(&image);

        if forward && idx + 1 < count {
            self.path.last_mut().expect("leaf on path").1 = idx + 1;
            return Ok(());
        }
        if !forward && idx > 0 {
            self.path.last_mut().expect("leaf on path").1 = idx - 1;
            return Ok(());
        }

        // Climb until an ancestor has a sibling child in the move
        // direction, then descend its edge.
        self.path.pop();
        while let Some(&(block, child_idx)) = self.path.last() {
            let image = load_node(self.engine, block)?;
            let count = node_count(&image);
            let sibling = if forward {
                (child_idx + 1 < count).then_some(child_idx + 1)
            } else {
                child_idx.checked_sub(1)
            };

            if let Some(next_idx) = sibling {
                self.path.last_mut().expect("ancestor on path").1 = next_idx;
                let (children, _) = decode_internal::<T>(&image);
                descend_edge::<T, F>(self.engine, children[next_idx], !forward, &mut self.path)?;
                return Ok(());
            }
            self.path.pop();
        }

        self.valid = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_engine;
    use proptest::prelude::*;

    /// A deliberately fat record so a few dozen inserts force splits:
    /// 1024 serialized bytes gives a leaf capacity of 3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Item {
        key: u64,
        fill: u8,
    }

    impl BinaryFormat for Item {
        const SERIALIZED_SIZE: usize = 1024;

        fn write_to(&self, buf: &mut [u8]) {
            self.key.write_to(&mut buf[..8]);
            buf[8..].fill(self.fill);
        }

        fn read_from(buf: &[u8]) -> Self {
            Self {
                key: u64::read_from(&buf[..8]),
                fill: buf[8],
            }
        }
    }

    impl TreeRecord for Item {
        type Key = u64;

        fn key(&self) -> u64 {
            self.key
        }
    }

    fn item(key: u64) -> Item {
        Item {
            key,
            fill: (key % 251) as u8,
        }
    }

    #[test]
    fn capacities_match_the_block_size() {
        assert_eq!(leaf_cap::<Item>(), 3);
        assert_eq!(internal_cap::<Item>(), 256);
    }

    #[test]
    fn insert_and_find_across_splits() {
        let engine = test_engine();
        let mut anchor = BTreeAnchor::default();
        let mut alloc_anchor = Default::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

        for key in 0..200u64 {
            tree.insert(&item(key * 3)).unwrap();
        }
        assert_eq!(tree.len(), 200);

        for key in 0..200u64 {
            let cursor = tree.find(key * 3).unwrap().expect("inserted key");
            assert_eq!(cursor.get().unwrap(), item(key * 3));
        }
        assert!(tree.find(1).unwrap().is_none());
        assert!(tree.find(601).unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let engine = test_engine();
        let mut anchor = BTreeAnchor::default();
        let mut alloc_anchor = Default::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

        tree.insert(&item(7)).unwrap();
        assert!(matches!(
            tree.insert(&item(7)),
            Err(BlabberError::InternalInvariant { .. })
        ));
    }

    #[test]
    fn cursor_walks_descending_from_max() {
        let engine = test_engine();
        let mut anchor = BTreeAnchor::default();
        let mut alloc_anchor = Default::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

        // Insertion order is shuffled; iteration order must not be.
        for key in [5u64, 1, 9, 3, 7, 2, 8, 6, 4, 0, 10, 12, 11] {
            tree.insert(&item(key)).unwrap();
        }

        let mut cursor = tree.cursor_max().unwrap();
        let mut seen = Vec::new();
        while cursor.is_valid() {
            seen.push(cursor.get().unwrap().key);
            cursor.move_prev().unwrap();
        }
        assert_eq!(seen, (0..=12u64).rev().collect::<Vec<_>>());
    }

    #[test]
    fn cursor_walks_ascending_from_min() {
        let engine = test_engine();
        let mut anchor = BTreeAnchor::default();
        let mut alloc_anchor = Default::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

        for key in 0..50u64 {
            tree.insert(&item(49 - key)).unwrap();
        }

        let mut cursor = tree.cursor_min().unwrap();
        let mut seen = Vec::new();
        while cursor.is_valid() {
            seen.push(cursor.get().unwrap().key);
            cursor.move_next().unwrap();
        }
        assert_eq!(seen, (0..50u64).collect::<Vec<_>>());
    }

    #[test]
    fn cursor_set_overwrites_in_place() {
        let engine = test_engine();
        let mut anchor = BTreeAnchor::default();
        let mut alloc_anchor = Default::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let mut tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

        for key in 0..20u64 {
            tree.insert(&item(key)).unwrap();
        }

        let cursor = tree.find(11).unwrap().unwrap();
        cursor.set(&Item { key: 11, fill: 0xEE }).unwrap();
        assert!(cursor.set(&item(12)).is_err(), "key change must be rejected");

        let again = tree.find(11).unwrap().unwrap();
        assert_eq!(again.get().unwrap().fill, 0xEE);
        assert_eq!(tree.len(), 20);
    }

    #[test]
    fn empty_tree_has_invalid_cursors() {
        let engine = test_engine();
        let mut anchor = BTreeAnchor::default();
        let mut alloc_anchor = Default::default();
        let flag = AnchorFlag::new();
        let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
        let tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

        assert!(tree.is_empty());
        assert!(!tree.cursor_max().unwrap().is_valid());
        assert!(!tree.cursor_min().unwrap().is_valid());
        assert!(tree.find(0).unwrap().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn iteration_is_sorted_for_any_insertion_order(
            mut keys in proptest::collection::hash_set(0u64..10_000, 1..120)
        ) {
            let engine = test_engine();
            let mut anchor = BTreeAnchor::default();
            let mut alloc_anchor = Default::default();
            let flag = AnchorFlag::new();
            let alloc = Allocator::open(&mut alloc_anchor, &flag, &engine);
            let mut tree = BTree::<Item, _>::open(&mut anchor, &flag, &alloc);

            for &key in &keys {
                tree.insert(&item(key)).unwrap();
            }

            let mut walked = Vec::new();
            let mut cursor = tree.cursor_min().unwrap();
            while cursor.is_valid() {
                walked.push(cursor.get().unwrap().key);
                cursor.move_next().unwrap();
            }

            let mut expected: Vec<u64> = keys.drain().collect();
            expected.sort_unstable();
            prop_assert_eq!(walked, expected);
        }
    }
}
