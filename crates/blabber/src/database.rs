//! The public database object and its transaction driver.
//!
//! Every public operation runs inside a transaction: the driver begins,
//! materializes the master block from block 0, opens the allocator and
//! the store on its anchors, runs the operation, flushes the master back
//! if any anchor changed, and commits (or rolls back on any error).
//! Handle lifetimes are strictly nested so no block is pinned when the
//! transaction ends.
//!
//! The engine is not re-entrant, so one mutex serializes whole
//! operations; hosts must not call back into the database from within an
//! operation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use blabber_container::Allocator;
use blabber_engine::{EngineOptions, TransactionEngine};
use blabber_error::{BlabberError, Result};
use blabber_types::{AnchorFlag, BlockIndex};
use blabber_vfs::{UnixVfs, Vfs, VfsFile};
use tracing::{debug, error, info};

use crate::master::MasterBlock;
use crate::store::{FrontpageResult, PostResult, Store};

/// A checkpoint runs automatically after a commit once the journal has
/// grown to this many bytes.
const JOURNAL_CHECKPOINT_THRESHOLD: u64 = 1 << 20;

/// Open-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseOptions {
    /// Number of blocks held in the engine's cache. Larger means more
    /// RAM and fewer reads.
    pub cache_blocks: u32,
    /// Sync the journal on every commit (default). Turning this off
    /// trades durability of the most recent commits for speed.
    pub sync_on_commit: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            cache_blocks: 512,
            sync_on_commit: true,
        }
    }
}

struct DatabaseInner<V: Vfs> {
    vfs: V,
    journal_path: PathBuf,
    /// `None` after a clean shutdown.
    engine: Option<TransactionEngine<V::File>>,
}

/// The top-level database handle.
///
/// All operations are atomic and strictly serialized; the handle itself
/// is neither clonable nor copyable.
pub struct Database<V: Vfs> {
    inner: Mutex<DatabaseInner<V>>,
}

impl<V: Vfs> std::fmt::Debug for Database<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// `<db-path>-journal`, next to the database file.
fn journal_path(db_path: &Path) -> PathBuf {
    let mut path = db_path.to_path_buf().into_os_string();
    path.push("-journal");
    PathBuf::from(path)
}

impl Database<UnixVfs> {
    /// Open or create a database file on the real filesystem.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        Self::open_with(UnixVfs::new(), path, options)
    }
}

impl<V: Vfs> Database<V> {
    /// Open or create a database through an explicit VFS.
    ///
    /// Recovery of an uncheckpointed journal happens inside the engine;
    /// a virgin file is initialized with a master block, an existing one
    /// has its header verified.
    pub fn open_with(vfs: V, path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let journal_path = journal_path(&db_path);

        let db_file = vfs.open(&db_path)?;
        let journal_file = vfs.open(&journal_path)?;
        let engine = TransactionEngine::new(
            db_file,
            journal_file,
            EngineOptions {
                cache_blocks: options.cache_blocks,
                sync_on_commit: options.sync_on_commit,
            },
        )?;

        if engine.size()? == 0 {
            init_master_block(&engine)?;
        } else {
            check_master_block(&engine)?;
        }

        info!(path = %db_path.display(), "database opened");
        Ok(Self {
            inner: Mutex::new(DatabaseInner {
                vfs,
                journal_path,
                engine: Some(engine),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, DatabaseInner<V>>> {
        self.inner
            .lock()
            .map_err(|_| BlabberError::invariant("database lock poisoned"))
    }

    /// Create a post and return its id (always ≥ 1).
    pub fn create_post(&self, user: &str, title: &str, content: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        inner.run_in_transaction(|store| store.create_post(user, title, content))
    }

    /// Append a comment to the post with `post_id`.
    pub fn create_comment(&self, post_id: u64, user: &str, content: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.run_in_transaction(|store| store.create_comment(post_id, user, content))
    }

    /// The newest `max_posts` posts, newest first.
    pub fn fetch_frontpage(&self, max_posts: usize) -> Result<FrontpageResult> {
        let mut inner = self.lock()?;
        inner.run_in_transaction(|store| store.fetch_frontpage(max_posts))
    }

    /// A post and its newest `max_comments` comments, newest first.
    pub fn fetch_post(&self, post_id: u64, max_comments: usize) -> Result<PostResult> {
        let mut inner = self.lock()?;
        inner.run_in_transaction(|store| store.fetch_post(post_id, max_comments))
    }

    /// Write a human-readable snapshot of the allocator and store state.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let mut inner = self.lock()?;
        inner.run_in_transaction(|store| store.dump(out))
    }

    /// Shut down cleanly: checkpoint the journal, close the files and
    /// remove the journal file. No operation may follow.
    pub fn finish(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let engine = inner.engine.take().ok_or(BlabberError::AlreadyClosed)?;

        if engine.journal_has_changes()? {
            engine.checkpoint()?;
        }
        drop(engine);

        // Safe to remove only after a successful checkpoint drained it.
        inner.vfs.remove(&inner.journal_path)?;
        info!("database closed");
        Ok(())
    }
}

impl<V: Vfs> DatabaseInner<V> {
    /// Run `op` inside a transaction, flushing the master block back to
    /// block 0 if any anchor changed.
    fn run_in_transaction<R>(
        &mut self,
        op: impl FnOnce(&mut Store<'_, '_, V::File>) -> Result<R>,
    ) -> Result<R> {
        let engine = self.engine.as_ref().ok_or(BlabberError::AlreadyClosed)?;

        engine.begin()?;
        let result = (|| {
            let master_handle = engine.read(BlockIndex::MASTER)?;
            let mut master: MasterBlock = master_handle.get(0)?;
            let changed = AnchorFlag::new();

            let out = {
                let MasterBlock {
                    alloc: alloc_anchor,
                    store: store_anchor,
                    ..
                } = &mut master;
                let alloc = Allocator::open(alloc_anchor, &changed, engine);
                let mut store = Store::open(store_anchor, &changed, &alloc);
                op(&mut store)?
            };

            if changed.is_set() {
                master_handle.set(0, &master)?;
            }
            Ok(out)
        })();

        match result {
            Ok(out) => {
                engine.commit()?;
                if engine.journal_size()? > JOURNAL_CHECKPOINT_THRESHOLD {
                    engine.checkpoint()?;
                }
                Ok(out)
            }
            Err(err) => {
                debug!(error = %err, "transaction failed, rolling back");
                if let Err(rollback_err) = engine.rollback() {
                    error!(error = %rollback_err, "rollback after failed transaction also failed");
                }
                Err(err)
            }
        }
    }
}

/// First transaction of a virgin file: grow to one block and write the
/// master, then checkpoint immediately so the file stands on its own.
fn init_master_block<F: VfsFile>(engine: &TransactionEngine<F>) -> Result<()> {
    engine.begin()?;
    let result = (|| {
        engine.grow(1)?;
        let handle = engine.overwrite_zero(BlockIndex::MASTER)?;
        handle.set(0, &MasterBlock::initial())
    })();

    match result {
        Ok(()) => {
            engine.commit()?;
            engine.checkpoint()?;
            info!("database initialized");
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = engine.rollback() {
                error!(error = %rollback_err, "rollback of initialization failed");
            }
            Err(err)
        }
    }
}

/// Verify the header of an existing file before anything else touches
/// its blocks.
fn check_master_block<F: VfsFile>(engine: &TransactionEngine<F>) -> Result<()> {
    engine.begin()?;
    let result = (|| {
        let handle = engine.read(BlockIndex::MASTER)?;
        let header: crate::master::FileHeader = handle.get(0)?;
        header.check()
    })();

    match result {
        Ok(()) => engine.commit(),
        Err(err) => {
            if let Err(rollback_err) = engine.rollback() {
                error!(error = %rollback_err, "rollback of verification failed");
            }
            Err(err)
        }
    }
}
