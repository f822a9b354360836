use auto_impl::auto_impl;
use itertools::Itertools;

use super::{byte_range::ByteRange, Bytes, SourceLocator, StorageError};

/// Chunk fetcher traits.
///
/// A fetcher retrieves an arbitrary byte range of a backing object named by a [`SourceLocator`].
/// Fetches are synchronous and may block on local or network I/O.
/// Implementations must be safe to call from several transfer threads at once.
#[auto_impl(&, Arc)]
pub trait ChunkFetcher: Send + Sync {
    /// Retrieve exactly `byte_range.length()` bytes starting at `byte_range.offset()` of `locator`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if the object does not exist,
    /// [`StorageError::ShortRead`] if the object ends before the range does,
    /// or another [`StorageError`] if there is an underlying transport error.
    fn fetch(&self, locator: &SourceLocator, byte_range: ByteRange) -> Result<Bytes, StorageError>;

    /// Retrieve several byte ranges of `locator`, in the order given.
    ///
    /// The default implementation issues one [`fetch`](ChunkFetcher::fetch) per range.
    ///
    /// # Errors
    /// Returns the first [`StorageError`] encountered.
    fn fetch_many(
        &self,
        locator: &SourceLocator,
        byte_ranges: &[ByteRange],
    ) -> Result<Vec<Bytes>, StorageError> {
        byte_ranges
            .iter()
            .map(|byte_range| self.fetch(locator, *byte_range))
            .try_collect()
    }

    /// Return the size in bytes of the object at `locator`.
    ///
    /// Returns [`None`] if the object does not exist.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying transport error.
    fn size(&self, locator: &SourceLocator) -> Result<Option<u64>, StorageError>;
}

/// Check that a fetcher returned the number of bytes requested.
///
/// # Errors
/// Returns [`StorageError::ShortRead`] if `bytes` is shorter than `byte_range`.
pub fn check_fetched_length(
    locator: &SourceLocator,
    byte_range: ByteRange,
    bytes: Bytes,
) -> Result<Bytes, StorageError> {
    let got = bytes.len() as u64;
    if got < byte_range.length() {
        Err(StorageError::ShortRead {
            locator: locator.clone(),
            byte_range,
            got,
        })
    } else if got > byte_range.length() {
        Ok(bytes.slice(..usize::try_from(byte_range.length()).unwrap_or(bytes.len())))
    } else {
        Ok(bytes)
    }
}
