//! Chunks.
//!
//! A [`ChunkDescriptor`] is one record of a chunk manifest.
//! A [`Chunk`] is the runtime unit built from it: it owns the chunk's bytes from fetch, through filtering, until they are scattered into the destination.

use std::fmt::Display;

use chunkweave_storage::{
    ChunkFetcher, SourceLocator, byte_range::ByteRange, check_fetched_length,
};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    ReconstructError,
    element::{ByteOrder, ElementType, UnsupportedElementTypeError},
    filter::{FilterError, FilterPipeline},
    index_math::ArrayIndices,
    options::ReadOptions,
};

/// A fill value that cannot tile a chunk.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("fill value of {fill_value_len} bytes cannot tile a chunk of {byte_size} bytes")]
pub struct FillValueUndersizedError {
    fill_value_len: usize,
    byte_size: u64,
}

impl FillValueUndersizedError {
    /// Create a new fill value undersized error.
    #[must_use]
    pub fn new(fill_value_len: usize, byte_size: u64) -> Self {
        Self {
            fill_value_len,
            byte_size,
        }
    }
}

/// An invalid chunk position error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid chunk position {0}")]
pub struct InvalidPositionError(String);

/// Parse a chunk position of the bracketed form `[1,2,3]`.
///
/// Whitespace around elements is ignored.
///
/// # Errors
/// Returns [`InvalidPositionError`] if `position` is not bracketed or an element is not an unsigned integer.
pub fn parse_position_in_array(position: &str) -> Result<ArrayIndices, InvalidPositionError> {
    let err = || InvalidPositionError(position.to_string());
    let inner = position
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(err)?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|element| element.trim().parse::<u64>().map_err(|_| err()))
        .collect()
}

/// A chunk manifest record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// The offset of the stored chunk in its object.
    pub byte_offset: u64,
    /// The stored size of the chunk.
    pub byte_size: u64,
    /// The byte order of stored elements, or [`None`] for the byte order of the array.
    pub byte_order: Option<ByteOrder>,
    /// The element coordinates of the chunk origin.
    pub position_in_array: ArrayIndices,
    /// The object holding the chunk, or [`None`] for a chunk of pure fill value.
    pub source_locator: Option<SourceLocator>,
    /// Set if the chunk is never written and takes the fill value, even if it has a source locator.
    pub uses_fill_value: bool,
    /// The fill value pattern.
    pub fill_value: Vec<u8>,
    /// The position of the block in a linked block layout.
    pub linked_block_index: Option<u32>,
}

impl ChunkDescriptor {
    /// Create a descriptor for a stored chunk.
    #[must_use]
    pub fn new(
        source_locator: SourceLocator,
        byte_offset: u64,
        byte_size: u64,
        position_in_array: ArrayIndices,
    ) -> Self {
        Self {
            byte_offset,
            byte_size,
            byte_order: None,
            position_in_array,
            source_locator: Some(source_locator),
            uses_fill_value: false,
            fill_value: Vec::new(),
            linked_block_index: None,
        }
    }

    /// Create a descriptor for a chunk of `byte_size` bytes with no stored bytes.
    ///
    /// The chunk is filled by repeating `fill_value`.
    #[must_use]
    pub fn new_fill(byte_size: u64, position_in_array: ArrayIndices, fill_value: Vec<u8>) -> Self {
        Self {
            byte_offset: 0,
            byte_size,
            byte_order: None,
            position_in_array,
            source_locator: None,
            uses_fill_value: true,
            fill_value,
            linked_block_index: None,
        }
    }

    /// Set the byte order of the stored elements, overriding the byte order of the array.
    #[must_use]
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = Some(byte_order);
        self
    }

    /// Mark the chunk as never written, so it takes `fill_value` whatever its source locator.
    #[must_use]
    pub fn with_uses_fill_value(mut self, fill_value: Vec<u8>) -> Self {
        self.uses_fill_value = true;
        self.fill_value = fill_value;
        self
    }

    /// Set the linked block index.
    #[must_use]
    pub fn with_linked_block_index(mut self, linked_block_index: u32) -> Self {
        self.linked_block_index = Some(linked_block_index);
        self
    }

    /// Returns true if the chunk takes the fill value instead of stored bytes.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        self.uses_fill_value || self.source_locator.is_none()
    }

    /// The stored byte range of the chunk.
    #[must_use]
    pub fn byte_range(&self) -> ByteRange {
        ByteRange::from_offset_length(self.byte_offset, self.byte_size)
    }
}

/// A chunk being reconstructed.
#[derive(Debug)]
pub struct Chunk {
    descriptor: ChunkDescriptor,
    raw_buffer: Vec<u8>,
    is_read: bool,
    bytes_read: u64,
}

impl From<ChunkDescriptor> for Chunk {
    fn from(descriptor: ChunkDescriptor) -> Self {
        Self::new(descriptor)
    }
}

impl Chunk {
    /// Create an unread chunk.
    #[must_use]
    pub fn new(descriptor: ChunkDescriptor) -> Self {
        Self {
            descriptor,
            raw_buffer: Vec::new(),
            is_read: false,
            bytes_read: 0,
        }
    }

    /// The manifest record of the chunk.
    #[must_use]
    pub fn descriptor(&self) -> &ChunkDescriptor {
        &self.descriptor
    }

    /// The stored byte offset.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        self.descriptor.byte_offset
    }

    /// The stored size.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.descriptor.byte_size
    }

    /// The end of the stored byte range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.descriptor.byte_offset + self.descriptor.byte_size
    }

    /// The object holding the chunk, [`None`] if it takes the fill value.
    #[must_use]
    pub fn source_locator(&self) -> Option<&SourceLocator> {
        if self.descriptor.uses_fill_value {
            None
        } else {
            self.descriptor.source_locator.as_ref()
        }
    }

    /// The element coordinates of the chunk origin.
    #[must_use]
    pub fn position_in_array(&self) -> &[u64] {
        &self.descriptor.position_in_array
    }

    /// Returns true if the chunk has no stored bytes.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        self.descriptor.is_fill()
    }

    /// Returns true once the chunk bytes are held.
    #[must_use]
    pub fn is_read(&self) -> bool {
        self.is_read
    }

    /// The number of bytes read.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// The chunk bytes.
    #[must_use]
    pub fn raw_buffer(&self) -> &[u8] {
        &self.raw_buffer
    }

    /// Take the chunk bytes, leaving the chunk empty.
    #[must_use]
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.raw_buffer)
    }

    /// Fetch the stored bytes of the chunk, or synthesise them from the fill value.
    ///
    /// Does nothing if the chunk has already been read.
    ///
    /// # Errors
    /// Returns [`ReconstructError::StorageError`] if the fetch fails or returns too few bytes,
    /// or [`ReconstructError::FillValueUndersizedError`] if the fill value cannot tile the chunk.
    pub fn read_into(&mut self, fetcher: &dyn ChunkFetcher) -> Result<(), ReconstructError> {
        if self.is_read {
            log::trace!("{self} already read");
            return Ok(());
        }
        let Some(locator) = self.source_locator() else {
            self.load_fill_value()?;
            return Ok(());
        };
        let byte_range = self.descriptor.byte_range();
        let bytes = fetcher.fetch(locator, byte_range)?;
        let bytes = check_fetched_length(locator, byte_range, bytes)?;
        self.set_read_buffer(Vec::from(bytes))?;
        log::trace!("read {self}");
        Ok(())
    }

    /// Hand the chunk bytes fetched elsewhere, such as by a super-chunk.
    ///
    /// # Errors
    /// Returns [`ReconstructError::ChunkSizeMismatch`] if `bytes` is not the stored size of the chunk.
    pub fn set_read_buffer(&mut self, bytes: Vec<u8>) -> Result<(), ReconstructError> {
        let got = bytes.len() as u64;
        if got != self.descriptor.byte_size {
            return Err(ReconstructError::ChunkSizeMismatch {
                offset: self.descriptor.byte_offset,
                expected: self.descriptor.byte_size,
                got,
            });
        }
        self.raw_buffer = bytes;
        self.bytes_read = got;
        self.is_read = true;
        Ok(())
    }

    /// Fill the chunk by repeating its fill value.
    ///
    /// # Errors
    /// Returns [`FillValueUndersizedError`] if the fill value is empty or its length does not divide the chunk size.
    pub fn load_fill_value(&mut self) -> Result<(), FillValueUndersizedError> {
        let fill_value = &self.descriptor.fill_value;
        let byte_size = self.descriptor.byte_size;
        let err = || FillValueUndersizedError::new(fill_value.len(), byte_size);
        if fill_value.is_empty() || byte_size % fill_value.len() as u64 != 0 {
            return Err(err());
        }
        let repeats = usize::try_from(byte_size / fill_value.len() as u64).map_err(|_| err())?;
        self.raw_buffer = fill_value.repeat(repeats);
        self.bytes_read = byte_size;
        self.is_read = true;
        Ok(())
    }

    /// Decode the chunk bytes in place.
    ///
    /// Fill chunks and identity pipelines are left untouched.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if decoding fails.
    pub fn apply_filters(
        &mut self,
        pipeline: &dyn FilterPipeline,
        elements_per_chunk: u64,
        bytes_per_element: usize,
        options: &ReadOptions,
    ) -> Result<(), FilterError> {
        if self.is_fill() || pipeline.is_identity() {
            return Ok(());
        }
        let encoded = self.take_buffer();
        self.raw_buffer = pipeline.decode(encoded, elements_per_chunk, bytes_per_element, options)?;
        Ok(())
    }

    /// Convert the decoded elements to `byte_order` if the chunk declares a different one.
    ///
    /// Fill chunks already hold the fill value in the byte order of the array.
    ///
    /// # Errors
    /// Returns [`UnsupportedElementTypeError`] if elements of `element_type` cannot be swapped.
    pub fn convert_byte_order(
        &mut self,
        element_type: ElementType,
        byte_order: ByteOrder,
    ) -> Result<(), UnsupportedElementTypeError> {
        match self.descriptor.byte_order {
            Some(stored) if stored != byte_order && !self.is_fill() => {
                element_type.swap_byte_order(&mut self.raw_buffer)?;
                log::trace!("swapped {self} from {stored} to {byte_order}");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source_locator() {
            Some(locator) => write!(f, "Chunk[locator={locator}]")?,
            None => write!(f, "Chunk[locator=fill]")?,
        }
        write!(
            f,
            "[offset={}][size={}][chunk_position_in_array=({})][is_read={}]",
            self.byte_offset(),
            self.byte_size(),
            self.position_in_array().iter().join(","),
            self.is_read
        )
    }
}

#[cfg(test)]
mod tests {
    use chunkweave_storage::{StorageError, store::MemoryFetcher};

    use super::*;
    use crate::filter::FilterChain;

    fn locator() -> SourceLocator {
        SourceLocator::new("/data/array.h5").unwrap()
    }

    #[test]
    fn position_in_array() {
        assert_eq!(parse_position_in_array("[1,2,3]").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_position_in_array(" [0, 40] ").unwrap(), vec![0, 40]);
        assert_eq!(parse_position_in_array("[]").unwrap(), Vec::<u64>::new());
        assert!(parse_position_in_array("1,2").is_err());
        assert_eq!(
            parse_position_in_array("[1,x]").unwrap_err().to_string(),
            "invalid chunk position [1,x]"
        );
    }

    #[test]
    fn chunk_read_into() {
        let fetcher = MemoryFetcher::new();
        fetcher.set(&locator(), (0..200u8).collect::<Vec<_>>());
        let mut chunk = Chunk::new(ChunkDescriptor::new(locator(), 100, 50, vec![25]));
        assert_eq!(
            chunk.to_string(),
            "Chunk[locator=/data/array.h5][offset=100][size=50][chunk_position_in_array=(25)][is_read=false]"
        );
        chunk.read_into(&fetcher).unwrap();
        assert!(chunk.is_read());
        assert_eq!(chunk.bytes_read(), 50);
        assert_eq!(chunk.raw_buffer(), (100..150u8).collect::<Vec<_>>());

        // an already read chunk is not fetched again
        fetcher.erase(&locator());
        chunk.read_into(&fetcher).unwrap();

        let mut missing = Chunk::new(ChunkDescriptor::new(locator(), 0, 10, vec![0]));
        assert!(matches!(
            missing.read_into(&fetcher),
            Err(ReconstructError::StorageError(StorageError::NotFound(_)))
        ));
        assert!(!missing.is_read());
    }

    #[test]
    fn chunk_short_read() {
        let fetcher = MemoryFetcher::new();
        fetcher.set(&locator(), vec![0u8; 120]);
        let mut chunk = Chunk::new(ChunkDescriptor::new(locator(), 100, 50, vec![0]));
        assert!(matches!(
            chunk.read_into(&fetcher),
            Err(ReconstructError::StorageError(StorageError::ShortRead { got: 20, .. }))
        ));
    }

    #[test]
    fn chunk_fill_value() {
        let fetcher = MemoryFetcher::new();
        let mut chunk = Chunk::new(ChunkDescriptor::new_fill(8, vec![4], vec![1, 2]));
        assert!(chunk.is_fill());
        chunk.read_into(&fetcher).unwrap();
        assert_eq!(chunk.raw_buffer(), &[1, 2, 1, 2, 1, 2, 1, 2]);
        // fill bytes are never decoded
        let chain = FilterChain::parse("deflate").unwrap();
        chunk
            .apply_filters(&chain, 4, 2, &ReadOptions::default())
            .unwrap();
        assert_eq!(chunk.raw_buffer().len(), 8);

        let mut chunk = Chunk::new(ChunkDescriptor::new_fill(9, vec![0], vec![1, 2]));
        assert!(matches!(
            chunk.read_into(&fetcher),
            Err(ReconstructError::FillValueUndersizedError(_))
        ));
        let mut chunk = Chunk::new(ChunkDescriptor::new_fill(4, vec![0], vec![]));
        assert_eq!(
            chunk.load_fill_value().unwrap_err().to_string(),
            "fill value of 0 bytes cannot tile a chunk of 4 bytes"
        );
    }

    #[test]
    fn chunk_uses_fill_value_without_fetching() {
        let fetcher = MemoryFetcher::new();
        let absent = SourceLocator::new("/data/absent.h5").unwrap();
        let descriptor = ChunkDescriptor::new(absent, 0, 4, vec![0]).with_uses_fill_value(vec![9]);
        assert!(descriptor.is_fill());
        let mut chunk = Chunk::new(descriptor);
        assert!(chunk.is_fill());
        assert!(chunk.source_locator().is_none());
        chunk.read_into(&fetcher).unwrap();
        assert_eq!(chunk.raw_buffer(), [9, 9, 9, 9]);
    }

    #[test]
    fn chunk_byte_order_conversion() {
        let descriptor = ChunkDescriptor::new(locator(), 0, 4, vec![0]);
        assert_eq!(descriptor.byte_order, None);

        // a chunk without its own order is left alone
        let mut inherited = Chunk::new(descriptor.clone());
        inherited.set_read_buffer(vec![1, 2, 3, 4]).unwrap();
        inherited.convert_byte_order(ElementType::UInt16, ByteOrder::Big).unwrap();
        assert_eq!(inherited.raw_buffer(), [1, 2, 3, 4]);

        let mut same = Chunk::new(descriptor.clone().with_byte_order(ByteOrder::Big));
        same.set_read_buffer(vec![1, 2, 3, 4]).unwrap();
        same.convert_byte_order(ElementType::UInt16, ByteOrder::Big).unwrap();
        assert_eq!(same.raw_buffer(), [1, 2, 3, 4]);

        let mut swapped = Chunk::new(descriptor.with_byte_order(ByteOrder::Little));
        swapped.set_read_buffer(vec![1, 2, 3, 4]).unwrap();
        swapped.convert_byte_order(ElementType::UInt16, ByteOrder::Big).unwrap();
        assert_eq!(swapped.raw_buffer(), [2, 1, 4, 3]);
    }

    #[test]
    fn chunk_set_read_buffer_size_check() {
        let mut chunk = Chunk::new(ChunkDescriptor::new(locator(), 10, 4, vec![0]));
        assert!(matches!(
            chunk.set_read_buffer(vec![0; 3]),
            Err(ReconstructError::ChunkSizeMismatch {
                offset: 10,
                expected: 4,
                got: 3
            })
        ));
        chunk.set_read_buffer(vec![7; 4]).unwrap();
        assert_eq!(chunk.take_buffer(), vec![7; 4]);
        assert!(chunk.raw_buffer().is_empty());
    }
}
