//! Byte ranges.
//!
//! A [`ByteRange`] is a half-open interval `[offset, offset + length)` within a backing object.
//! Every chunk and super-chunk transfer is expressed as one byte range.
//!
//! [`extract_byte_range`] is a convenience function for extracting a byte range from a slice of bytes.

use std::ops::{Bound, Range, RangeBounds};

use thiserror::Error;

/// A byte offset.
pub type ByteOffset = u64;

/// A byte length.
pub type ByteLength = u64;

/// A byte range with a known offset and length.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    offset: ByteOffset,
    length: ByteLength,
}

impl From<Range<u64>> for ByteRange {
    fn from(range: Range<u64>) -> Self {
        Self::new(range)
    }
}

impl ByteRange {
    /// Create a new byte range from an offset and a length.
    #[must_use]
    pub const fn from_offset_length(offset: ByteOffset, length: ByteLength) -> Self {
        Self { offset, length }
    }

    /// Create a new byte range from bounded [`RangeBounds<u64>`].
    ///
    /// An unbounded start is treated as offset zero.
    ///
    /// # Panics
    /// Panics if the end is unbounded or precedes the start.
    pub fn new(bounds: impl RangeBounds<u64>) -> Self {
        let start = match bounds.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start + 1,
            Bound::Unbounded => 0,
        };
        let end = match bounds.end_bound() {
            Bound::Included(end) => end + 1,
            Bound::Excluded(end) => *end,
            Bound::Unbounded => panic!("a byte range must have a bounded end"),
        };
        assert!(end >= start, "byte range end {end} precedes start {start}");
        Self {
            offset: start,
            length: end - start,
        }
    }

    /// Return the offset of the first byte.
    #[must_use]
    pub const fn offset(&self) -> ByteOffset {
        self.offset
    }

    /// Return the number of bytes in the range.
    #[must_use]
    pub const fn length(&self) -> ByteLength {
        self.length
    }

    /// Return the exclusive end of the range.
    #[must_use]
    pub const fn end(&self) -> ByteOffset {
        self.offset + self.length
    }

    /// Returns true if the range holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns true if `other` lies entirely within this range.
    #[must_use]
    pub const fn contains(&self, other: &ByteRange) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Convert the byte range to a [`Range<u64>`].
    #[must_use]
    pub const fn to_range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    /// Convert the byte range to a [`Range<usize>`].
    ///
    /// # Panics
    ///
    /// Panics if the byte range exceeds [`usize::MAX`].
    #[must_use]
    pub fn to_range_usize(&self) -> Range<usize> {
        self.offset.try_into().unwrap()..self.end().try_into().unwrap()
    }

    /// Return the range relative to `origin`, or [`None`] if the range starts before `origin`.
    #[must_use]
    pub fn relative_to(&self, origin: ByteOffset) -> Option<ByteRange> {
        self.offset
            .checked_sub(origin)
            .map(|offset| Self::from_offset_length(offset, self.length))
    }

    /// Return the value of an HTTP `Range` request header for this range.
    ///
    /// Returns [`None`] for an empty range, which has no inclusive representation.
    #[must_use]
    pub fn http_range_header(&self) -> Option<String> {
        (!self.is_empty()).then(|| format!("bytes={self}"))
    }
}

/// Formats as the inclusive `first-last` form used by range requests.
impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        if self.is_empty() {
            write!(f, "{}-", self.offset)
        } else {
            write!(f, "{}-{}", self.offset, self.end() - 1)
        }
    }
}

/// An invalid byte range error.
#[derive(Copy, Clone, Debug, Error)]
#[error("invalid byte range {0} for bytes of length {1}")]
pub struct InvalidByteRangeError(ByteRange, u64);

impl InvalidByteRangeError {
    /// Create a new [`InvalidByteRangeError`].
    #[must_use]
    pub fn new(byte_range: ByteRange, bytes_len: u64) -> Self {
        Self(byte_range, bytes_len)
    }

    /// Return the offending byte range.
    #[must_use]
    pub const fn byte_range(&self) -> ByteRange {
        self.0
    }
}

/// Extract a byte range from bytes.
///
/// # Errors
/// Returns [`InvalidByteRangeError`] if any bytes are requested beyond the end of `bytes`.
pub fn extract_byte_range(
    bytes: &[u8],
    byte_range: ByteRange,
) -> Result<&[u8], InvalidByteRangeError> {
    let bytes_len = bytes.len() as u64;
    if byte_range.end() > bytes_len {
        return Err(InvalidByteRangeError(byte_range, bytes_len));
    }
    Ok(&bytes[byte_range.to_range_usize()])
}
