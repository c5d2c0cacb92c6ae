use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for blabber operations.
///
/// One structured enum for the whole workspace: the engine, the
/// containers and the domain layer all speak this type, so `?` composes
/// across crate boundaries without adapter layers.
#[derive(Error, Debug)]
pub enum BlabberError {
    // === I/O and file format ===
    /// Underlying file read/write/grow failed. Fatal for the transaction.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file cannot be opened.
    #[error("unable to open file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// The file is not a blabber database (wrong magic header).
    #[error("invalid file format (wrong magic header)")]
    InvalidFormat,

    /// The file was written by an incompatible format version.
    #[error("unsupported version: file version is {found} but only version {supported} is supported")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// On-disk state that should be well formed is not.
    #[error("database is corrupt: {detail}")]
    Corrupt { detail: String },

    // === Domain ===
    /// The referenced post does not exist.
    #[error("post not found")]
    NotFound,

    /// String length exceeds the heap's 2^32 - 1 byte object limit.
    #[error("string is too large")]
    StringTooLarge,

    /// The system clock reported a time before the Unix epoch.
    #[error("system clock is before the Unix epoch")]
    ClockError,

    /// `next_post_id` wrapped around. Practically unreachable.
    #[error("post id space exhausted")]
    IdSpaceExhausted,

    // === Lifecycle / invariants ===
    /// Operation attempted after `finish()`.
    #[error("database is closed")]
    AlreadyClosed,

    /// An internal invariant was violated; indicates a bug.
    #[error("internal invariant violated: {detail}")]
    InternalInvariant { detail: String },
}

impl BlabberError {
    /// Shorthand for an [`InternalInvariant`](Self::InternalInvariant)
    /// with a formatted detail message.
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InternalInvariant {
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`Corrupt`](Self::Corrupt) error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

/// Result alias used throughout the workspace.
pub type Result<T, E = BlabberError> = std::result::Result<T, E>;
