pub mod anchor;
pub mod binfmt;

pub use anchor::AnchorFlag;
pub use binfmt::{BinaryFormat, FieldReader, FieldWriter};

use std::fmt;

/// Size of a single storage block in bytes.
///
/// Every on-disk structure (master block, container nodes, heap extents)
/// is laid out in units of this size, and the block cache works at the
/// same granularity.
pub const BLOCK_SIZE: usize = 4096;

/// Index of a block inside the database file.
///
/// Block indices are 0-based. Block 0 is the master block; every other
/// block is owned by the allocator. The byte offset of a block is
/// `index * BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BlockIndex(u64);

impl BlockIndex {
    /// The master block, always at the start of the file.
    pub const MASTER: Self = Self(0);

    /// Create a block index from a raw block number.
    #[inline]
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// The raw block number.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Byte offset of this block inside the database file.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.0 * BLOCK_SIZE as u64
    }

    /// The `n`-th block after this one.
    #[inline]
    #[must_use]
    pub const fn offset(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}
