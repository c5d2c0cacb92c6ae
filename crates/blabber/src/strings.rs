//! Small-string-optimized storage.
//!
//! Strings up to `CAP` bytes are stored inline in the owning record;
//! longer ones move to the strings heap and the record keeps a
//! reference. The inline form is not NUL-terminated: all `CAP` bytes are
//! usable, and shorter strings zero-pad the tail, so the decoded length
//! is the offset of the first zero byte.

use blabber_container::HeapRef;
use blabber_error::{BlabberError, Result};
use blabber_types::BinaryFormat;

/// A fixed-capacity inline string of at most `CAP` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedString<const CAP: usize> {
    data: [u8; CAP],
}

impl<const CAP: usize> FixedString<CAP> {
    /// Wrap a byte string of at most `CAP` bytes.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > CAP {
            return Err(BlabberError::invariant(format!(
                "string of {} bytes does not fit inline capacity {CAP}",
                bytes.len()
            )));
        }
        let mut data = [0u8; CAP];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { data })
    }

    /// Length in bytes: the offset of the first zero byte, or `CAP`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.iter().position(|&b| b == 0).unwrap_or(CAP)
    }

    /// Whether the string is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The string content, without the zero padding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl<const CAP: usize> PartialOrd for FixedString<CAP> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const CAP: usize> Ord for FixedString<CAP> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl<const CAP: usize> BinaryFormat for FixedString<CAP> {
    const SERIALIZED_SIZE: usize = CAP;

    fn write_to(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut data = [0u8; CAP];
        data.copy_from_slice(buf);
        Self { data }
    }
}

const TAG_INLINE: u8 = 0;
const TAG_HEAP: u8 = 1;

/// A string stored either inline or in the strings heap, chosen by
/// length at encode time.
///
/// Serialized as one tag byte followed by `CAP` payload bytes, so both
/// variants occupy the same fixed footprint inside a record. `CAP` must
/// be at least the size of a heap reference (the domain uses 15 and 31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizedString<const CAP: usize> {
    /// Stored directly in the record.
    Inline(FixedString<CAP>),
    /// Spilled to the strings heap.
    Spilled(HeapRef),
}

impl<const CAP: usize> BinaryFormat for OptimizedString<CAP> {
    const SERIALIZED_SIZE: usize = 1 + CAP;

    fn write_to(&self, buf: &mut [u8]) {
        buf.fill(0);
        match self {
            Self::Inline(s) => {
                buf[0] = TAG_INLINE;
                s.write_to(&mut buf[1..1 + CAP]);
            }
            Self::Spilled(blob) => {
                buf[0] = TAG_HEAP;
                blob.write_to(&mut buf[1..1 + HeapRef::SERIALIZED_SIZE]);
            }
        }
    }

    fn read_from(buf: &[u8]) -> Self {
        debug_assert!(buf[0] <= TAG_HEAP, "unknown optimized string tag");
        if buf[0] == TAG_HEAP {
            Self::Spilled(HeapRef::read_from(&buf[1..1 + HeapRef::SERIALIZED_SIZE]))
        } else {
            Self::Inline(FixedString::read_from(&buf[1..1 + CAP]))
        }
    }
}
