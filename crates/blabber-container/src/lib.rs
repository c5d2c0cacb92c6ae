pub mod alloc;
pub mod btree;
pub mod heap;
pub mod list;

pub use alloc::{Allocator, AllocatorAnchor};
pub use btree::{BTree, BTreeAnchor, TreeCursor, TreeRecord};
pub use heap::{Heap, HeapAnchor, HeapRef};
pub use list::{List, ListAnchor, ListCursor};

#[cfg(test)]
pub(crate) mod testutil {
    use blabber_engine::{EngineOptions, TransactionEngine};
    use blabber_vfs::{MemoryFile, MemoryVfs, Vfs};
    use std::path::Path;

    /// An in-memory engine with an open transaction, ready for container
    /// tests.
    pub fn test_engine() -> TransactionEngine<MemoryFile> {
        let vfs = MemoryVfs::new();
        let db = vfs.open(Path::new("db")).unwrap();
        let journal = vfs.open(Path::new("db-journal")).unwrap();
        let engine = TransactionEngine::new(db, journal, EngineOptions::default()).unwrap();
        engine.begin().unwrap();
        // Reserve a stand-in master block so the allocator never hands
        // out block 0.
        engine.grow(1).unwrap();
        engine
    }
}
