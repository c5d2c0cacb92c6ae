//! Append-only write-ahead journal.
//!
//! The journal makes commits atomic and durable: a transaction's dirty
//! blocks are appended as full after-images, terminated by a commit
//! record carrying a checksum over the frame. The database file itself is
//! only touched by checkpoints, which fold every journaled block back
//! into it and truncate the journal to its header.
//!
//! On-disk layout:
//! ```text
//! [Journal header: 16 bytes]
//! [Frame: N block records + 1 commit record]
//! [Frame: ...]
//! ```
//! A block record is `tag (1) | block index (8) | after-image (4096)`.
//! A commit record is `tag (1) | record count (4) | db size in blocks (8)
//! | xxh3-64 checksum (8)`. A torn or checksum-failing tail frame is
//! discarded during recovery.

use blabber_error::{BlabberError, Result};
use blabber_types::{BinaryFormat, FieldReader, FieldWriter, BLOCK_SIZE};
use blabber_vfs::VfsFile;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

/// Magic bytes at the start of every journal file.
pub const JOURNAL_MAGIC: [u8; 8] = *b"BLBR_JNL";

/// Journal format version.
pub const JOURNAL_VERSION: u32 = 1;

/// Size of the journal file header in bytes.
pub const JOURNAL_HEADER_SIZE: usize = 16;

const TAG_BLOCK: u8 = 1;
const TAG_COMMIT: u8 = 2;

const BLOCK_RECORD_SIZE: usize = 1 + 8 + BLOCK_SIZE;
const COMMIT_RECORD_SIZE: usize = 1 + 4 + 8 + 8;

/// What recovery found in a journal left behind by a previous process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Complete commit frames applied to the database file.
    pub frames: usize,
    /// Block images written back.
    pub blocks: usize,
    /// Database size in blocks after the last applied frame, if any
    /// frame was applied.
    pub final_size: Option<u64>,
}

/// The write-ahead journal over a VFS file.
///
/// Tracks the current append offset; all appends go through
/// [`append_frame`](Self::append_frame) and the only other mutation is
/// [`reset`](Self::reset) after a checkpoint.
pub struct Journal<F: VfsFile> {
    file: F,
    /// Current append offset == file length in bytes.
    size: u64,
}

impl<F: VfsFile> Journal<F> {
    /// Open a journal file: write a fresh header into an empty file, or
    /// validate the header of an existing one.
    pub fn open(mut file: F) -> Result<Self> {
        let len = file.len()?;
        if len == 0 {
            let mut header = [0u8; JOURNAL_HEADER_SIZE];
            let mut w = FieldWriter::new(&mut header);
            w.put(&JOURNAL_MAGIC);
            w.put(&JOURNAL_VERSION);
            w.put(&(BLOCK_SIZE as u32));
            file.write_at(&header, 0)?;
            return Ok(Self {
                file,
                size: JOURNAL_HEADER_SIZE as u64,
            });
        }

        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        file.read_at(&mut header, 0)?;
        let mut r = FieldReader::new(&header);
        let magic: [u8; 8] = r.take();
        let version: u32 = r.take();
        let block_size: u32 = r.take();

        if magic != JOURNAL_MAGIC {
            return Err(BlabberError::corrupt("journal has wrong magic header"));
        }
        if version != JOURNAL_VERSION {
            return Err(BlabberError::corrupt(format!(
                "journal version is {version}, expected {JOURNAL_VERSION}"
            )));
        }
        if block_size as usize != BLOCK_SIZE {
            return Err(BlabberError::corrupt(format!(
                "journal block size is {block_size}, expected {BLOCK_SIZE}"
            )));
        }

        Ok(Self { file, size: len })
    }

    /// Current journal length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the journal holds any records beyond its header.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.size > JOURNAL_HEADER_SIZE as u64
    }

    /// Append one commit frame.
    ///
    /// `blocks` must be sorted by block index (the engine's write-set is a
    /// `BTreeMap`, so frames are deterministic). Returns, per block, the
    /// journal byte offset of its after-image so the engine can index the
    /// journal for reads. Syncs the file before returning when `sync` is
    /// set; the commit is the last write, so a torn frame can never be
    /// mistaken for a complete one.
    pub fn append_frame(
        &mut self,
        blocks: &[(u64, &[u8])],
        new_size: u64,
        sync: bool,
    ) -> Result<Vec<(u64, u64)>> {
        let mut offsets = Vec::with_capacity(blocks.len());
        let mut hasher = Xxh3::new();
        let mut pos = self.size;

        let mut record = vec![0u8; BLOCK_RECORD_SIZE];
        for &(index, data) in blocks {
            debug_assert_eq!(data.len(), BLOCK_SIZE);
            let mut w = FieldWriter::new(&mut record);
            w.put(&TAG_BLOCK);
            w.put(&index);
            record[9..].copy_from_slice(data);
            self.file.write_at(&record, pos)?;

            hasher.update(&index.to_le_bytes());
            hasher.update(data);
            offsets.push((index, pos + 9));
            pos += BLOCK_RECORD_SIZE as u64;
        }

        let mut commit = [0u8; COMMIT_RECORD_SIZE];
        let mut w = FieldWriter::new(&mut commit);
        w.put(&TAG_COMMIT);
        w.put(&(blocks.len() as u32));
        w.put(&new_size);
        w.put(&hasher.digest());
        self.file.write_at(&commit, pos)?;
        pos += COMMIT_RECORD_SIZE as u64;

        if sync {
            self.file.sync()?;
        }

        debug!(
            blocks = blocks.len(),
            new_size,
            journal_bytes = pos,
            "journal commit frame appended"
        );
        self.size = pos;
        Ok(offsets)
    }

    /// Read one block after-image at a byte offset previously returned by
    /// [`append_frame`](Self::append_frame).
    pub fn read_image(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        self.file.read_at(buf, offset)
    }

    /// Truncate the journal back to its header after a checkpoint.
    pub fn reset(&mut self) -> Result<()> {
        self.file.truncate(JOURNAL_HEADER_SIZE as u64)?;
        self.file.sync()?;
        self.size = JOURNAL_HEADER_SIZE as u64;
        Ok(())
    }

    /// Replay every complete commit frame into the database file.
    ///
    /// Called once on open, before anything reads the database. Frames
    /// are applied in append order; the scan stops at the first torn or
    /// checksum-failing frame and the journal is truncated back to its
    /// header afterwards, leaving the database file authoritative.
    pub fn recover_into(&mut self, db_file: &mut impl VfsFile) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        if !self.has_changes() {
            return Ok(stats);
        }

        info!(journal_bytes = self.size, "replaying journal after unclean shutdown");

        let mut pos = JOURNAL_HEADER_SIZE as u64;
        let mut frame: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut hasher = Xxh3::new();

        while pos < self.size {
            let mut tag = [0u8; 1];
            if pos + 1 > self.size {
                break;
            }
            self.file.read_at(&mut tag, pos)?;

            match tag[0] {
                TAG_BLOCK => {
                    if pos + BLOCK_RECORD_SIZE as u64 > self.size {
                        warn!(offset = pos, "torn block record at journal tail, discarding");
                        break;
                    }
                    let mut record = vec![0u8; BLOCK_RECORD_SIZE];
                    self.file.read_at(&mut record, pos)?;
                    let index = u64::read_from(&record[1..9]);
                    hasher.update(&index.to_le_bytes());
                    hasher.update(&record[9..]);
                    frame.push((index, record.split_off(9)));
                    pos += BLOCK_RECORD_SIZE as u64;
                }
                TAG_COMMIT => {
                    if pos + COMMIT_RECORD_SIZE as u64 > self.size {
                        warn!(offset = pos, "torn commit record at journal tail, discarding");
                        break;
                    }
                    let mut record = [0u8; COMMIT_RECORD_SIZE];
                    self.file.read_at(&mut record, pos)?;
                    let mut r = FieldReader::new(&record[1..]);
                    let count: u32 = r.take();
                    let new_size: u64 = r.take();
                    let checksum: u64 = r.take();

                    if count as usize != frame.len() || checksum != hasher.digest() {
                        warn!(
                            offset = pos,
                            "commit record fails verification, discarding journal tail"
                        );
                        break;
                    }

                    for (index, image) in frame.drain(..) {
                        db_file.write_at(&image, index * BLOCK_SIZE as u64)?;
                        stats.blocks += 1;
                    }
                    stats.frames += 1;
                    stats.final_size = Some(new_size);
                    hasher.reset();
                    pos += COMMIT_RECORD_SIZE as u64;
                }
                other => {
                    warn!(offset = pos, tag = other, "unknown journal record tag, discarding tail");
                    break;
                }
            }
        }

        if let Some(size) = stats.final_size {
            db_file.truncate(size * BLOCK_SIZE as u64)?;
            db_file.sync()?;
        }
        self.reset()?;

        info!(
            frames = stats.frames,
            blocks = stats.blocks,
            "journal replay finished"
        );
        Ok(stats)
    }
}
