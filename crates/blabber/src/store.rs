//! The domain schema and its operations.
//!
//! A [`Store`] is a per-transaction view over the store anchor: the posts
//! tree, the strings heap and the monotonic id counter. Posts live in a
//! B-tree keyed by id; each post embeds the anchor of its own comment
//! list, so appending a comment mutates the post record and the store
//! writes it back through the tree cursor.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use blabber_container::{
    Allocator, BTree, BTreeAnchor, Heap, HeapAnchor, HeapRef, List, ListAnchor, TreeRecord,
};
use blabber_error::{BlabberError, Result};
use blabber_types::{AnchorFlag, BinaryFormat, FieldReader, FieldWriter};
use blabber_vfs::VfsFile;
use tracing::debug;

use crate::strings::{FixedString, OptimizedString};

/// Inline capacity of user names.
pub const USER_INLINE_CAP: usize = 15;

/// Inline capacity of post titles.
pub const TITLE_INLINE_CAP: usize = 31;

/// Persistent roots of the store, embedded in the master block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoreAnchor {
    /// Next id to hand out; ids start at 1 and only ever grow.
    next_post_id: u64,
    /// The posts tree, keyed by post id.
    posts: BTreeAnchor,
    /// Long strings live here.
    strings: HeapAnchor,
}

impl Default for StoreAnchor {
    fn default() -> Self {
        Self {
            next_post_id: 1,
            posts: BTreeAnchor::default(),
            strings: HeapAnchor::default(),
        }
    }
}

impl BinaryFormat for StoreAnchor {
    const SERIALIZED_SIZE: usize =
        8 + BTreeAnchor::SERIALIZED_SIZE + HeapAnchor::SERIALIZED_SIZE;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.next_post_id);
        w.put(&self.posts);
        w.put(&self.strings);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            next_post_id: r.take(),
            posts: r.take(),
            strings: r.take(),
        }
    }
}

/// The on-disk format of a post.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Post {
    /// Unique, monotonically assigned id.
    id: u64,
    /// Unix timestamp (seconds, UTC).
    created_at: u64,
    user: OptimizedString<USER_INLINE_CAP>,
    title: OptimizedString<TITLE_INLINE_CAP>,
    /// Content is unbounded and always lives in the heap.
    content: HeapRef,
    /// Comments in insertion order, not indexed by anything.
    comments: ListAnchor,
}

impl BinaryFormat for Post {
    const SERIALIZED_SIZE: usize = 8
        + 8
        + OptimizedString::<USER_INLINE_CAP>::SERIALIZED_SIZE
        + OptimizedString::<TITLE_INLINE_CAP>::SERIALIZED_SIZE
        + HeapRef::SERIALIZED_SIZE
        + ListAnchor::SERIALIZED_SIZE;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.id);
        w.put(&self.created_at);
        w.put(&self.user);
        w.put(&self.title);
        w.put(&self.content);
        w.put(&self.comments);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            id: r.take(),
            created_at: r.take(),
            user: r.take(),
            title: r.take(),
            content: r.take(),
            comments: r.take(),
        }
    }
}

impl TreeRecord for Post {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }
}

/// The on-disk format of a comment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Comment {
    created_at: u64,
    user: OptimizedString<USER_INLINE_CAP>,
    content: HeapRef,
}

impl BinaryFormat for Comment {
    const SERIALIZED_SIZE: usize = 8
        + OptimizedString::<USER_INLINE_CAP>::SERIALIZED_SIZE
        + HeapRef::SERIALIZED_SIZE;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.created_at);
        w.put(&self.user);
        w.put(&self.content);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            created_at: r.take(),
            user: r.take(),
            content: r.take(),
        }
    }
}

/// One post as shown on the front page. Content and comments are not
/// loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontpageEntry {
    pub id: u64,
    pub created_at: u64,
    pub user: String,
    pub title: String,
}

/// The front page: newest post first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontpageResult {
    pub entries: Vec<FrontpageEntry>,
}

/// One comment of a fetched post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEntry {
    pub created_at: u64,
    pub user: String,
    pub content: String,
}

/// A fully loaded post. Comments are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostResult {
    pub id: u64,
    pub created_at: u64,
    pub user: String,
    pub title: String,
    pub content: String,
    pub comments: Vec<CommentEntry>,
}

/// Seconds since the Unix epoch, UTC.
fn current_timestamp() -> Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| BlabberError::ClockError)?;
    Ok(now.as_secs())
}

/// Store a string in the heap and return its reference.
fn store_string<F: VfsFile>(heap: &mut Heap<'_, '_, F>, value: &str) -> Result<HeapRef> {
    if value.len() > u32::MAX as usize {
        return Err(BlabberError::StringTooLarge);
    }
    heap.allocate(value.as_bytes())
}

/// Load a heap string back.
fn load_string<F: VfsFile>(heap: &Heap<'_, '_, F>, blob: HeapRef) -> Result<String> {
    String::from_utf8(heap.load(blob)?)
        .map_err(|_| BlabberError::corrupt("heap string is not valid UTF-8"))
}

/// Store a string inline if it fits, in the heap otherwise.
fn store_optimized_string<const CAP: usize, F: VfsFile>(
    heap: &mut Heap<'_, '_, F>,
    value: &str,
) -> Result<OptimizedString<CAP>> {
    if value.len() > u32::MAX as usize {
        return Err(BlabberError::StringTooLarge);
    }
    if value.len() <= CAP {
        return Ok(OptimizedString::Inline(FixedString::new(value.as_bytes())?));
    }
    Ok(OptimizedString::Spilled(store_string(heap, value)?))
}

/// Load an optimized string, dereferencing the heap if necessary.
fn load_optimized_string<const CAP: usize, F: VfsFile>(
    heap: &Heap<'_, '_, F>,
    value: &OptimizedString<CAP>,
) -> Result<String> {
    match value {
        OptimizedString::Inline(s) => String::from_utf8(s.as_bytes().to_vec())
            .map_err(|_| BlabberError::corrupt("inline string is not valid UTF-8")),
        OptimizedString::Spilled(blob) => load_string(heap, *blob),
    }
}

/// A live store view for the duration of one transaction.
pub(crate) struct Store<'v, 'a, F: VfsFile> {
    anchor: &'v mut StoreAnchor,
    flag: &'v AnchorFlag,
    alloc: &'v Allocator<'a, F>,
}

impl<'v, 'a, F: VfsFile> Store<'v, 'a, F> {
    /// Open the store on its persistent anchor.
    pub(crate) fn open(
        anchor: &'v mut StoreAnchor,
        flag: &'v AnchorFlag,
        alloc: &'v Allocator<'a, F>,
    ) -> Self {
        Self {
            anchor,
            flag,
            alloc,
        }
    }

    /// Create a post and return its id.
    pub(crate) fn create_post(&mut self, user: &str, title: &str, content: &str) -> Result<u64> {
        let id = self.anchor.next_post_id;
        if id == 0 {
            // 64-bit wrap-around; practically unreachable.
            return Err(BlabberError::IdSpaceExhausted);
        }

        let StoreAnchor {
            next_post_id,
            posts,
            strings,
        } = &mut *self.anchor;

        let mut heap = Heap::open(strings, self.flag, self.alloc);
        let post = Post {
            id,
            created_at: current_timestamp()?,
            user: store_optimized_string::<USER_INLINE_CAP, F>(&mut heap, user)?,
            title: store_optimized_string::<TITLE_INLINE_CAP, F>(&mut heap, title)?,
            content: store_string(&mut heap, content)?,
            comments: ListAnchor::default(),
        };

        let mut tree = BTree::open(posts, self.flag, self.alloc);
        tree.insert(&post)?;

        *next_post_id = id + 1;
        self.flag.mark();
        debug!(id, "post created");
        Ok(id)
    }

    /// Append a comment to a post's list.
    pub(crate) fn create_comment(
        &mut self,
        post_id: u64,
        user: &str,
        content: &str,
    ) -> Result<()> {
        let StoreAnchor {
            posts, strings, ..
        } = &mut *self.anchor;

        let tree = BTree::<Post, F>::open(posts, self.flag, self.alloc);
        let cursor = tree.find(post_id)?.ok_or(BlabberError::NotFound)?;
        let mut post = cursor.get()?;

        let mut heap = Heap::open(strings, self.flag, self.alloc);
        let post_changed = AnchorFlag::new();
        {
            let mut comments = List::open(&mut post.comments, &post_changed, self.alloc);
            let comment = Comment {
                created_at: current_timestamp()?,
                user: store_optimized_string::<USER_INLINE_CAP, F>(&mut heap, user)?,
                content: store_string(&mut heap, content)?,
            };
            comments.push_back(&comment)?;
        }

        // The append changed the list anchor embedded in the post, so the
        // post record must be written back under the same key.
        if post_changed.is_set() {
            cursor.set(&post)?;
        }
        debug!(post_id, "comment created");
        Ok(())
    }

    /// The newest `max_posts` posts, newest first. Does not load content
    /// or comments.
    pub(crate) fn fetch_frontpage(&mut self, max_posts: usize) -> Result<FrontpageResult> {
        let StoreAnchor {
            posts, strings, ..
        } = &mut *self.anchor;

        let tree = BTree::<Post, F>::open(posts, self.flag, self.alloc);
        let mut found = Vec::new();
        let mut cursor = tree.cursor_max()?;
        while cursor.is_valid() && found.len() < max_posts {
            found.push(cursor.get()?);
            cursor.move_prev()?;
        }

        let heap = Heap::open(strings, self.flag, self.alloc);
        let mut result = FrontpageResult::default();
        for post in &found {
            result.entries.push(FrontpageEntry {
                id: post.id,
                created_at: post.created_at,
                user: load_optimized_string(&heap, &post.user)?,
                title: load_optimized_string(&heap, &post.title)?,
            });
        }
        Ok(result)
    }

    /// A post with its newest `max_comments` comments, newest first.
    pub(crate) fn fetch_post(&mut self, post_id: u64, max_comments: usize) -> Result<PostResult> {
        let StoreAnchor {
            posts, strings, ..
        } = &mut *self.anchor;

        let tree = BTree::<Post, F>::open(posts, self.flag, self.alloc);
        let cursor = tree.find(post_id)?.ok_or(BlabberError::NotFound)?;
        let mut post = cursor.get()?;

        let post_changed = AnchorFlag::new();
        let mut found_comments = Vec::new();
        {
            let comments = List::<Comment, F>::open(&mut post.comments, &post_changed, self.alloc);
            let mut c = comments.cursor_last()?;
            while c.is_valid() && found_comments.len() < max_comments {
                found_comments.push(c.get()?);
                c.move_prev()?;
            }
        }
        if post_changed.is_set() {
            return Err(BlabberError::invariant(
                "read-only fetch mutated the comment list",
            ));
        }

        // Comment strings are dereferenced in list order. That walks the
        // heap in insertion order rather than disk order; without
        // deletion the two mostly coincide, so the simple path is kept.
        let heap = Heap::open(strings, self.flag, self.alloc);
        let mut comments = Vec::with_capacity(found_comments.len());
        for comment in &found_comments {
            comments.push(CommentEntry {
                created_at: comment.created_at,
                user: load_optimized_string(&heap, &comment.user)?,
                content: load_string(&heap, comment.content)?,
            });
        }

        Ok(PostResult {
            id: post.id,
            created_at: post.created_at,
            user: load_optimized_string(&heap, &post.user)?,
            title: load_optimized_string(&heap, &post.title)?,
            content: load_string(&heap, post.content)?,
            comments,
        })
    }

    /// Write a deterministic snapshot of the allocator and store state.
    pub(crate) fn dump(&mut self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "Allocator state:")?;
        self.alloc.dump(out)?;
        writeln!(out)?;

        writeln!(out, "Store state:")?;
        writeln!(out, "next post id: {}", self.anchor.next_post_id)?;

        let StoreAnchor {
            posts, strings, ..
        } = &mut *self.anchor;
        let tree = BTree::<Post, F>::open(posts, self.flag, self.alloc);
        let heap = Heap::open(strings, self.flag, self.alloc);
        tree.dump(out)?;
        heap.dump(out)?;

        let mut cursor = tree.cursor_min()?;
        while cursor.is_valid() {
            let mut post = cursor.get()?;
            let user = load_optimized_string(&heap, &post.user)?;
            let title = load_optimized_string(&heap, &post.title)?;
            let ignored = AnchorFlag::new();
            let comment_count = {
                let comments = List::<Comment, F>::open(&mut post.comments, &ignored, self.alloc);
                comments.len()
            };
            writeln!(
                out,
                "post {}: created {} user '{}' title '{}' ({} comments)",
                post.id, post.created_at, user, title, comment_count
            )?;
            cursor.move_next()?;
        }
        Ok(())
    }
}
