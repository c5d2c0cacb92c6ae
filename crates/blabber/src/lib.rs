//! A small single-writer, transactional on-disk object store backing a
//! posts-with-comments demo.
//!
//! The interesting part is the persistence substrate underneath the
//! demo schema: fixed-size blocks over a file, a write-ahead journal
//! with checkpointing, a committed-block cache, a block allocator and
//! on-block containers (a B-tree of posts keyed by id, a linked list of
//! comments per post, a blob heap for long strings), all rooted in a
//! master block and driven by atomic transactions.
//!
//! ```no_run
//! use blabber::{Database, DatabaseOptions};
//!
//! # fn main() -> blabber::Result<()> {
//! let db = Database::open("blog.db", DatabaseOptions::default())?;
//! let id = db.create_post("alice", "hi", "hello world")?;
//! db.create_comment(id, "bob", "welcome!")?;
//! let post = db.fetch_post(id, 10)?;
//! assert_eq!(post.comments.len(), 1);
//! db.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod master;
pub mod store;
pub mod strings;

pub use blabber_error::{BlabberError, Result};

pub use database::{Database, DatabaseOptions};
pub use master::{FILE_FORMAT_MAGIC, FILE_FORMAT_VERSION};
pub use store::{CommentEntry, FrontpageEntry, FrontpageResult, PostResult};
pub use strings::{FixedString, OptimizedString};
