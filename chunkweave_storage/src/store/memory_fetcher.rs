//! A synchronous in-memory fetcher.

use std::collections::HashMap;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::byte_range::ByteRange;
use crate::{Bytes, ChunkFetcher, SourceLocator, StorageError};

/// A synchronous in-memory fetcher.
///
/// Objects are named by [`SourceLocator`] and held in memory.
/// Useful for tests and for serving objects that were already downloaded whole.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    objects: Mutex<HashMap<SourceLocator, Bytes>>,
}

impl MemoryFetcher {
    /// Create a new, empty memory fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` as the object at `locator`, replacing any existing object.
    pub fn set(&self, locator: &SourceLocator, value: impl Into<Bytes>) {
        self.objects.lock().insert(locator.clone(), value.into());
    }

    /// Write `value` at `offset` of the object at `locator`, growing it with zeros as needed.
    pub fn set_partial(&self, locator: &SourceLocator, offset: u64, value: &[u8]) {
        let mut objects = self.objects.lock();
        let mut data = objects
            .remove(locator)
            .map_or_else(BytesMut::new, |bytes| BytesMut::from(bytes.as_ref()));
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = offset.saturating_add(value.len());
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(value);
        objects.insert(locator.clone(), data.freeze());
    }

    /// Remove the object at `locator`.
    pub fn erase(&self, locator: &SourceLocator) {
        self.objects.lock().remove(locator);
    }
}

impl ChunkFetcher for MemoryFetcher {
    fn fetch(&self, locator: &SourceLocator, byte_range: ByteRange) -> Result<Bytes, StorageError> {
        let data = self
            .objects
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(locator.clone()))?;
        let len = data.len() as u64;
        if byte_range.end() > len {
            return Err(StorageError::ShortRead {
                locator: locator.clone(),
                byte_range,
                got: len.saturating_sub(byte_range.offset()),
            });
        }
        Ok(data.slice(byte_range.to_range_usize()))
    }

    fn size(&self, locator: &SourceLocator) -> Result<Option<u64>, StorageError> {
        Ok(self
            .objects
            .lock()
            .get(locator)
            .map(|data| data.len() as u64))
    }
}
