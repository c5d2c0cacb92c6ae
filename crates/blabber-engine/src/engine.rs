//! Single-writer transaction engine.
//!
//! The engine composes the block device (a VFS file of 4096-byte
//! blocks), the write-ahead [`Journal`] and the committed
//! [`BlockCache`]. One transaction runs at a time; its writes are
//! copy-on-write block images in a private write-set. Commit appends the
//! write-set to the journal as one frame and publishes it to the cache;
//! the database file itself only changes during checkpoint and recovery.
//!
//! Block access goes through pinned [`BlockHandle`]s. The engine counts
//! pins and refuses to commit or roll back while any handle is alive;
//! callers keep handle lifetimes in strictly nested scopes so the count
//! is zero by construction when the transaction ends.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use blabber_error::{BlabberError, Result};
use blabber_types::{BinaryFormat, BlockIndex, BLOCK_SIZE};
use blabber_vfs::VfsFile;
use tracing::{debug, info};

use crate::cache::BlockCache;
use crate::journal::Journal;

/// Engine construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Number of committed blocks kept in memory.
    pub cache_blocks: u32,
    /// Sync the journal on every commit. Disabling trades durability of
    /// the latest commits for speed; atomicity is unaffected.
    pub sync_on_commit: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_blocks: 512,
            sync_on_commit: true,
        }
    }
}

/// State of the currently running transaction.
struct TxnState {
    /// Copy-on-write after-images, ordered so journal frames are
    /// deterministic.
    write_set: BTreeMap<u64, Vec<u8>>,
    /// Logical database size in blocks as seen by this transaction.
    size: u64,
}

struct EngineInner<F: VfsFile> {
    db_file: F,
    journal: Journal<F>,
    cache: BlockCache,
    /// Journal byte offset of the newest committed after-image per block.
    journal_index: BTreeMap<u64, u64>,
    /// Size in blocks after the last committed transaction.
    committed_size: u64,
    /// Size in blocks of the database file on disk (last checkpoint).
    file_blocks: u64,
    txn: Option<TxnState>,
    /// Outstanding block handles.
    pins: usize,
    sync_on_commit: bool,
}

impl<F: VfsFile> EngineInner<F> {
    fn txn(&mut self) -> Result<&mut TxnState> {
        self.txn
            .as_mut()
            .ok_or_else(|| BlabberError::invariant("no transaction is active"))
    }

    /// Newest committed image of a block, bypassing the write-set.
    fn committed_image(&mut self, index: u64) -> Result<Vec<u8>> {
        if let Some(image) = self.cache.get(index) {
            return Ok(image.to_vec());
        }
        if let Some(&offset) = self.journal_index.get(&index) {
            let mut image = vec![0u8; BLOCK_SIZE];
            self.journal.read_image(offset, &mut image)?;
            self.cache.insert(index, image.clone());
            return Ok(image);
        }
        if index < self.file_blocks {
            let mut image = vec![0u8; BLOCK_SIZE];
            self.db_file
                .read_at(&mut image, index * BLOCK_SIZE as u64)?;
            self.cache.insert(index, image.clone());
            return Ok(image);
        }
        // Grown but never written: all zeroes.
        Ok(vec![0u8; BLOCK_SIZE])
    }

    fn read_block_at(&mut self, index: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        if let Some(txn) = &self.txn {
            if let Some(image) = txn.write_set.get(&index) {
                buf.copy_from_slice(&image[offset..offset + buf.len()]);
                return Ok(());
            }
        }
        let image = self.committed_image(index)?;
        buf.copy_from_slice(&image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_block_at(&mut self, index: u64, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.txn.is_none() {
            return Err(BlabberError::invariant("write outside of a transaction"));
        }
        if !self
            .txn
            .as_ref()
            .is_some_and(|t| t.write_set.contains_key(&index))
        {
            let image = self.committed_image(index)?;
            self.txn()?.write_set.insert(index, image);
        }
        let txn = self.txn()?;
        let image = txn
            .write_set
            .get_mut(&index)
            .ok_or_else(|| BlabberError::invariant("write-set entry vanished"))?;
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// The transaction engine over a database file and its journal.
///
/// Methods take `&self`; the mutable state lives behind a mutex so the
/// allocator and container views of one transaction can share the
/// engine freely. The engine is still single-writer; the database
/// driver serializes whole operations above this layer.
pub struct TransactionEngine<F: VfsFile> {
    inner: Mutex<EngineInner<F>>,
}

impl<F: VfsFile> TransactionEngine<F> {
    /// Open the engine over a database file and journal file.
    ///
    /// If the journal holds committed frames from an unclean shutdown
    /// they are replayed into the database file here, before anything
    /// else sees it.
    pub fn new(mut db_file: F, journal_file: F, options: EngineOptions) -> Result<Self> {
        let mut journal = Journal::open(journal_file)?;
        let recovered = journal.recover_into(&mut db_file)?;

        let len = db_file.len()?;
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(BlabberError::corrupt(format!(
                "database length {len} is not a multiple of the block size"
            )));
        }
        let blocks = len / BLOCK_SIZE as u64;

        info!(
            blocks,
            recovered_frames = recovered.frames,
            cache_blocks = options.cache_blocks,
            "transaction engine opened"
        );

        Ok(Self {
            inner: Mutex::new(EngineInner {
                db_file,
                journal,
                cache: BlockCache::new(options.cache_blocks as usize),
                journal_index: BTreeMap::new(),
                committed_size: blocks,
                file_blocks: blocks,
                txn: None,
                pins: 0,
                sync_on_commit: options.sync_on_commit,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineInner<F>>> {
        self.inner
            .lock()
            .map_err(|_| BlabberError::invariant("engine lock poisoned"))
    }

    /// Database size in blocks, as seen by the current transaction if
    /// one is active.
    pub fn size(&self) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .txn
            .as_ref()
            .map_or(inner.committed_size, |txn| txn.size))
    }

    /// Start a transaction.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.txn.is_some() {
            return Err(BlabberError::invariant("transaction already active"));
        }
        let size = inner.committed_size;
        inner.txn = Some(TxnState {
            write_set: BTreeMap::new(),
            size,
        });
        debug!(size, "transaction started");
        Ok(())
    }

    /// Extend the database by `n` blocks, returning the first new index.
    pub fn grow(&self, n: u64) -> Result<BlockIndex> {
        let mut inner = self.lock()?;
        let txn = inner.txn()?;
        let first = txn.size;
        txn.size += n;
        Ok(BlockIndex::new(first))
    }

    /// Pin a block for reading and writing within the transaction.
    pub fn read(&self, index: BlockIndex) -> Result<BlockHandle<'_, F>> {
        let mut inner = self.lock()?;
        let size = inner.txn()?.size;
        if index.get() >= size {
            return Err(BlabberError::invariant(format!(
                "block {index} out of range (size {size})"
            )));
        }
        inner.pins += 1;
        Ok(BlockHandle {
            engine: self,
            index,
        })
    }

    /// Pin a block after replacing its content with zeroes.
    pub fn overwrite_zero(&self, index: BlockIndex) -> Result<BlockHandle<'_, F>> {
        let mut inner = self.lock()?;
        let size = inner.txn()?.size;
        if index.get() >= size {
            return Err(BlabberError::invariant(format!(
                "block {index} out of range (size {size})"
            )));
        }
        inner
            .txn()?
            .write_set
            .insert(index.get(), vec![0u8; BLOCK_SIZE]);
        inner.pins += 1;
        Ok(BlockHandle {
            engine: self,
            index,
        })
    }

    /// Commit the current transaction: append its write-set to the
    /// journal as one frame and publish it to the committed cache.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.txn.is_none() {
            return Err(BlabberError::invariant("no transaction to commit"));
        }
        if inner.pins > 0 {
            return Err(BlabberError::invariant(format!(
                "{} block handles still pinned at commit",
                inner.pins
            )));
        }

        let txn = inner
            .txn
            .take()
            .ok_or_else(|| BlabberError::invariant("transaction vanished"))?;
        if txn.write_set.is_empty() && txn.size == inner.committed_size {
            debug!("read-only transaction committed");
            return Ok(());
        }

        let sync = inner.sync_on_commit;
        let append_result = {
            let frame: Vec<(u64, &[u8])> = txn
                .write_set
                .iter()
                .map(|(&index, image)| (index, image.as_slice()))
                .collect();
            inner.journal.append_frame(&frame, txn.size, sync)
        };
        let offsets = match append_result {
            Ok(offsets) => offsets,
            Err(err) => {
                // The frame has no commit record, so recovery will discard
                // it; restore the transaction so the caller can roll back.
                inner.txn = Some(txn);
                return Err(err);
            }
        };

        for (index, offset) in offsets {
            inner.journal_index.insert(index, offset);
        }
        let block_count = txn.write_set.len();
        for (index, image) in txn.write_set {
            inner.cache.insert(index, image);
        }
        inner.committed_size = txn.size;
        debug!(
            blocks = block_count,
            size = inner.committed_size,
            "transaction committed"
        );
        Ok(())
    }

    /// Discard the current transaction's writes.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.txn.is_none() {
            return Err(BlabberError::invariant("no transaction to roll back"));
        }
        if inner.pins > 0 {
            return Err(BlabberError::invariant(format!(
                "{} block handles still pinned at rollback",
                inner.pins
            )));
        }
        inner.txn = None;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Fold every journaled block into the database file and truncate
    /// the journal. Must run between transactions.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.txn.is_some() {
            return Err(BlabberError::invariant(
                "checkpoint during an active transaction",
            ));
        }

        let EngineInner {
            db_file,
            journal,
            cache,
            journal_index,
            committed_size,
            file_blocks,
            ..
        } = &mut *inner;

        let mut written = 0usize;
        for (&index, &offset) in journal_index.iter() {
            if let Some(image) = cache.get(index) {
                db_file.write_at(image, index * BLOCK_SIZE as u64)?;
            } else {
                let mut image = vec![0u8; BLOCK_SIZE];
                journal.read_image(offset, &mut image)?;
                db_file.write_at(&image, index * BLOCK_SIZE as u64)?;
            }
            written += 1;
        }

        db_file.truncate(*committed_size * BLOCK_SIZE as u64)?;
        db_file.sync()?;
        journal.reset()?;
        journal_index.clear();
        *file_blocks = *committed_size;

        info!(blocks = written, size = *committed_size, "checkpoint complete");
        Ok(())
    }

    /// Current journal length in bytes.
    pub fn journal_size(&self) -> Result<u64> {
        Ok(self.lock()?.journal.size())
    }

    /// Whether the journal holds records that a checkpoint would fold
    /// back into the database file.
    pub fn journal_has_changes(&self) -> Result<bool> {
        Ok(self.lock()?.journal.has_changes())
    }
}

/// A pinned reference to one block within the active transaction.
///
/// Reads see the transaction's own writes. The pin is released on drop;
/// the engine refuses to end a transaction while pins are outstanding.
pub struct BlockHandle<'e, F: VfsFile> {
    engine: &'e TransactionEngine<F>,
    index: BlockIndex,
}

impl<F: VfsFile> BlockHandle<'_, F> {
    /// The block this handle is pinned to.
    #[must_use]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Decode a value at `offset` inside the block.
    pub fn get<T: BinaryFormat>(&self, offset: usize) -> Result<T> {
        let mut buf = vec![0u8; T::SERIALIZED_SIZE];
        self.read_bytes(offset, &mut buf)?;
        Ok(T::read_from(&buf))
    }

    /// Encode a value at `offset` inside the block.
    pub fn set<T: BinaryFormat>(&self, offset: usize, value: &T) -> Result<()> {
        let mut buf = vec![0u8; T::SERIALIZED_SIZE];
        value.write_to(&mut buf);
        self.write_bytes(offset, &buf)
    }

    /// Copy raw bytes out of the block.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_span(offset, buf.len())?;
        self.engine
            .lock()?
            .read_block_at(self.index.get(), offset, buf)
    }

    /// Copy raw bytes into the block, marking it dirty.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_span(offset, bytes.len())?;
        self.engine
            .lock()?
            .write_block_at(self.index.get(), offset, bytes)
    }
}

fn check_span(offset: usize, len: usize) -> Result<()> {
    if offset + len > BLOCK_SIZE {
        return Err(BlabberError::invariant(format!(
            "access of {len} bytes at offset {offset} exceeds the block size"
        )));
    }
    Ok(())
}

impl<F: VfsFile> Drop for BlockHandle<'_, F> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.engine.inner.lock() {
            inner.pins = inner.pins.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blabber_vfs::{MemoryVfs, Vfs};
    use std::path::Path;

    fn engine(vfs: &MemoryVfs) -> TransactionEngine<blabber_vfs::MemoryFile> {
        engine_with(vfs, EngineOptions::default())
    }

    fn engine_with(
        vfs: &MemoryVfs,
        options: EngineOptions,
    ) -> TransactionEngine<blabber_vfs::MemoryFile> {
        let db = vfs.open(Path::new("db")).unwrap();
        let journal = vfs.open(Path::new("db-journal")).unwrap();
        TransactionEngine::new(db, journal, options).unwrap()
    }

    #[test]
    fn committed_writes_are_visible_to_later_transactions() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        let first = engine.grow(2).unwrap();
        assert_eq!(first, BlockIndex::new(0));
        {
            let handle = engine.read(BlockIndex::new(1)).unwrap();
            handle.set(16, &0xFEED_F00D_u64).unwrap();
            assert_eq!(handle.get::<u64>(16).unwrap(), 0xFEED_F00D);
        }
        engine.commit().unwrap();

        engine.begin().unwrap();
        {
            let handle = engine.read(BlockIndex::new(1)).unwrap();
            assert_eq!(handle.get::<u64>(16).unwrap(), 0xFEED_F00D);
        }
        engine.commit().unwrap();
        assert_eq!(engine.size().unwrap(), 2);
    }

    #[test]
    fn rollback_discards_writes_and_growth() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        engine.grow(1).unwrap();
        {
            let handle = engine.read(BlockIndex::new(0)).unwrap();
            handle.set(0, &1u64).unwrap();
        }
        engine.commit().unwrap();

        engine.begin().unwrap();
        engine.grow(5).unwrap();
        {
            let handle = engine.read(BlockIndex::new(0)).unwrap();
            handle.set(0, &2u64).unwrap();
        }
        engine.rollback().unwrap();

        engine.begin().unwrap();
        assert_eq!(engine.size().unwrap(), 1);
        {
            let handle = engine.read(BlockIndex::new(0)).unwrap();
            assert_eq!(handle.get::<u64>(0).unwrap(), 1);
        }
        engine.commit().unwrap();
    }

    #[test]
    fn pinned_handle_blocks_commit() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        engine.grow(1).unwrap();
        let handle = engine.read(BlockIndex::new(0)).unwrap();
        assert!(matches!(
            engine.commit(),
            Err(BlabberError::InternalInvariant { .. })
        ));
        drop(handle);
        engine.commit().unwrap();
    }

    #[test]
    fn reads_see_own_transaction_writes_before_commit() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        engine.grow(1).unwrap();
        {
            let writer = engine.read(BlockIndex::new(0)).unwrap();
            writer.set(100, &42u32).unwrap();
        }
        {
            let reader = engine.read(BlockIndex::new(0)).unwrap();
            assert_eq!(reader.get::<u32>(100).unwrap(), 42);
        }
        engine.commit().unwrap();
    }

    #[test]
    fn checkpoint_folds_journal_into_database_file() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        engine.grow(3).unwrap();
        {
            let handle = engine.read(BlockIndex::new(2)).unwrap();
            handle.set(0, &0xABCD_u16).unwrap();
        }
        engine.commit().unwrap();
        assert!(engine.journal_has_changes().unwrap());

        engine.checkpoint().unwrap();
        assert!(!engine.journal_has_changes().unwrap());
        assert_eq!(
            engine.journal_size().unwrap(),
            crate::journal::JOURNAL_HEADER_SIZE as u64
        );

        let mut db = vfs.open(Path::new("db")).unwrap();
        assert_eq!(db.len().unwrap(), 3 * BLOCK_SIZE as u64);
        let mut buf = [0u8; 2];
        db.read_at(&mut buf, 2 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(u16::from_le_bytes(buf), 0xABCD);
    }

    #[test]
    fn reopen_recovers_committed_but_uncheckpointed_state() {
        let vfs = MemoryVfs::new();
        {
            let engine = engine(&vfs);
            engine.begin().unwrap();
            engine.grow(2).unwrap();
            {
                let handle = engine.read(BlockIndex::new(1)).unwrap();
                handle.set(8, &777u64).unwrap();
            }
            engine.commit().unwrap();
            // No checkpoint: simulate a crash by dropping the engine.
        }

        let engine = engine(&vfs);
        assert_eq!(engine.size().unwrap(), 2);
        engine.begin().unwrap();
        {
            let handle = engine.read(BlockIndex::new(1)).unwrap();
            assert_eq!(handle.get::<u64>(8).unwrap(), 777);
        }
        engine.commit().unwrap();
    }

    #[test]
    fn grown_blocks_read_as_zeroes() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        engine.grow(2).unwrap();
        {
            let handle = engine.read(BlockIndex::new(1)).unwrap();
            assert_eq!(handle.get::<u64>(0).unwrap(), 0);
            assert_eq!(handle.get::<u64>(4088).unwrap(), 0);
        }
        engine.commit().unwrap();
    }

    #[test]
    fn out_of_range_block_access_is_rejected() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);
        engine.begin().unwrap();
        assert!(engine.read(BlockIndex::new(0)).is_err());
        engine.grow(1).unwrap();
        assert!(engine.read(BlockIndex::new(1)).is_err());
        engine.rollback().unwrap();
    }

    #[test]
    fn zero_cache_still_serves_reads() {
        let vfs = MemoryVfs::new();
        let engine = engine_with(
            &vfs,
            EngineOptions {
                cache_blocks: 0,
                sync_on_commit: true,
            },
        );

        engine.begin().unwrap();
        engine.grow(1).unwrap();
        {
            let handle = engine.read(BlockIndex::new(0)).unwrap();
            handle.set(0, &31u64).unwrap();
        }
        engine.commit().unwrap();

        engine.begin().unwrap();
        {
            let handle = engine.read(BlockIndex::new(0)).unwrap();
            assert_eq!(handle.get::<u64>(0).unwrap(), 31);
        }
        engine.commit().unwrap();
    }

    #[test]
    fn overwrite_zero_clears_previous_content() {
        let vfs = MemoryVfs::new();
        let engine = engine(&vfs);

        engine.begin().unwrap();
        engine.grow(1).unwrap();
        {
            let handle = engine.read(BlockIndex::new(0)).unwrap();
            handle.set(0, &u64::MAX).unwrap();
        }
        engine.commit().unwrap();

        engine.begin().unwrap();
        {
            let handle = engine.overwrite_zero(BlockIndex::new(0)).unwrap();
            assert_eq!(handle.get::<u64>(0).unwrap(), 0);
        }
        engine.commit().unwrap();
    }
}
