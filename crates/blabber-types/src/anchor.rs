//! Change tracking for persistent container anchors.
//!
//! An anchor is the small serialized header from which a container (tree,
//! list, heap, allocator) can be reopened. Anchors live inside an owning
//! record (the master block, or a post for its comment list), and the
//! owner must be rewritten whenever a nested anchor changes. Views share
//! an [`AnchorFlag`] with their owner and mark it on every anchor
//! mutation; after closing the views, the owner checks the flag and
//! rewrites itself if it fired.

use std::cell::Cell;

/// A shared dirty marker for one owning record and its nested anchors.
///
/// Transactions are single-threaded, so a `Cell` is all the sharing this
/// needs; the flag is passed by reference to every view opened on the
/// owner's anchors.
#[derive(Debug, Default)]
pub struct AnchorFlag(Cell<bool>);

impl AnchorFlag {
    /// A fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an anchor guarded by this flag was mutated.
    pub fn mark(&self) {
        self.0.set(true);
    }

    /// Whether any guarded anchor has been mutated.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.get()
    }
}
