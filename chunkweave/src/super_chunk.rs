//! Super-chunks.
//!
//! A [`SuperChunk`] groups chunks of one backing object so they are fetched with a single transfer.
//!
//! Two batching modes are supported:
//!  - contiguous ([`batch_contiguous`]): members are exactly byte adjacent,
//!  - bounded ([`compute_bounded_buffer_end_positions`] then [`batch_bounded`]): members lie within one staging buffer of bounded size, gaps included.
//!
//! A chunk of pure fill value has no stored bytes and always forms a super-chunk of its own.

use std::fmt::Display;

use chunkweave_storage::{
    ChunkFetcher, SourceLocator, byte_range::ByteRange, check_fetched_length,
};
use thiserror::Error;

use crate::{ReconstructError, chunk::Chunk};

/// A chunk could not be placed in any super-chunk.
///
/// Indicates corrupt chunk offsets or sizes, or end positions that do not match the chunks being batched.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("chunk at offset {offset} of {byte_size} bytes could not be batched: {reason}")]
pub struct BatchingInvariantViolation {
    offset: u64,
    byte_size: u64,
    reason: &'static str,
}

impl BatchingInvariantViolation {
    fn new(chunk: &Chunk, reason: &'static str) -> Self {
        Self {
            offset: chunk.byte_offset(),
            byte_size: chunk.byte_size(),
            reason,
        }
    }
}

/// The batching mode of a [`SuperChunk`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// Members are byte adjacent.
    Contiguous,
    /// Members lie within a bounded staging buffer.
    Bounded,
}

/// A batch of chunks fetched with one transfer.
#[derive(Debug)]
pub struct SuperChunk {
    chunks: Vec<Chunk>,
    offset: u64,
    max_end: u64,
    buffer_end: u64,
    mode: BatchMode,
}

impl SuperChunk {
    /// Create an empty super-chunk.
    #[must_use]
    pub fn new(mode: BatchMode) -> Self {
        Self {
            chunks: Vec::new(),
            offset: 0,
            max_end: 0,
            buffer_end: 0,
            mode,
        }
    }

    /// The member chunks.
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Give back the member chunks.
    #[must_use]
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    /// The number of member chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if the super-chunk has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The batching mode.
    #[must_use]
    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    /// The smallest member offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The largest member end.
    #[must_use]
    pub fn max_end(&self) -> u64 {
        self.max_end
    }

    /// The byte range covering every member.
    #[must_use]
    pub fn byte_range(&self) -> ByteRange {
        ByteRange::from_offset_length(self.offset, self.max_end - self.offset)
    }

    /// The backing object of the members, or [`None`] for fill value or an empty super-chunk.
    #[must_use]
    pub fn source_locator(&self) -> Option<&SourceLocator> {
        self.chunks.first().and_then(Chunk::source_locator)
    }

    /// Returns true if the super-chunk holds a chunk of pure fill value.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        self.chunks.first().is_some_and(Chunk::is_fill)
    }

    fn start(&mut self, chunk: Chunk, buffer_end: u64) {
        self.offset = chunk.byte_offset();
        self.max_end = chunk.end();
        self.buffer_end = buffer_end.max(chunk.end());
        self.chunks.push(chunk);
    }

    fn accepts_source(&self, chunk: &Chunk) -> bool {
        !chunk.is_fill() && !self.is_fill() && chunk.source_locator() == self.source_locator()
    }

    /// Add a chunk that starts exactly where the last member ends.
    ///
    /// An empty super-chunk accepts any chunk.
    ///
    /// # Errors
    /// Returns the chunk if it is not byte adjacent, comes from another object, or either it or the super-chunk is fill value.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<(), Chunk> {
        if self.chunks.is_empty() {
            let end = chunk.end();
            self.start(chunk, end);
            return Ok(());
        }
        if self.accepts_source(&chunk) && chunk.byte_offset() == self.max_end {
            self.max_end = chunk.end();
            self.buffer_end = self.max_end;
            self.chunks.push(chunk);
            Ok(())
        } else {
            Err(chunk)
        }
    }

    /// Add a chunk that lies within the staging buffer `[offset, buffer_end)`.
    ///
    /// `buffer_end` is taken from the first chunk added; an empty super-chunk accepts any chunk,
    /// growing its buffer if a single chunk is larger than the budget.
    ///
    /// # Errors
    /// Returns the chunk if it starts before the first member, ends after the buffer, comes from another object,
    /// or either it or the super-chunk is fill value.
    pub fn add_chunk_non_contiguous(&mut self, chunk: Chunk, buffer_end: u64) -> Result<(), Chunk> {
        if self.chunks.is_empty() {
            self.start(chunk, buffer_end);
            return Ok(());
        }
        if self.accepts_source(&chunk)
            && chunk.byte_offset() >= self.offset
            && chunk.end() <= self.buffer_end
        {
            self.max_end = self.max_end.max(chunk.end());
            self.chunks.push(chunk);
            Ok(())
        } else {
            Err(chunk)
        }
    }

    /// Fetch the covering byte range once and hand each member its bytes.
    ///
    /// Members of a fill super-chunk are filled instead.
    ///
    /// # Errors
    /// Returns a [`ReconstructError`] if the fetch fails or a member cannot be filled.
    pub fn read_into(&mut self, fetcher: &dyn ChunkFetcher) -> Result<(), ReconstructError> {
        let Some(locator) = self.source_locator().cloned() else {
            for chunk in &mut self.chunks {
                chunk.read_into(fetcher)?;
            }
            return Ok(());
        };
        let byte_range = self.byte_range();
        let fetched = fetcher.fetch(&locator, byte_range)?;
        let staging = check_fetched_length(&locator, byte_range, fetched)?;
        log::trace!("read {self}");
        for chunk in &mut self.chunks {
            if chunk.is_read() {
                continue;
            }
            let start = usize::try_from(chunk.byte_offset() - self.offset).unwrap_or(usize::MAX);
            let size = usize::try_from(chunk.byte_size()).unwrap_or(usize::MAX);
            let end = start.saturating_add(size);
            let bytes = staging.get(start..end).ok_or(ReconstructError::ChunkSizeMismatch {
                offset: chunk.byte_offset(),
                expected: chunk.byte_size(),
                got: staging.len().saturating_sub(start) as u64,
            })?;
            chunk.set_read_buffer(bytes.to_vec())?;
        }
        Ok(())
    }
}

impl Display for SuperChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source_locator() {
            Some(locator) => write!(f, "SuperChunk[locator={locator}]")?,
            None => write!(f, "SuperChunk[locator=fill]")?,
        }
        write!(
            f,
            "[offset={}][size={}][chunks={}][mode={:?}]",
            self.offset,
            self.max_end - self.offset,
            self.chunks.len(),
            self.mode
        )
    }
}

/// Batch chunks into super-chunks of byte adjacent members, preserving order.
///
/// # Errors
/// Returns [`BatchingInvariantViolation`] if a chunk is rejected by a fresh super-chunk.
pub fn batch_contiguous(
    chunks: impl IntoIterator<Item = Chunk>,
) -> Result<Vec<SuperChunk>, BatchingInvariantViolation> {
    let mut batches = Vec::new();
    let mut current = SuperChunk::new(BatchMode::Contiguous);
    for chunk in chunks {
        if let Err(chunk) = current.add_chunk(chunk) {
            batches.push(std::mem::replace(
                &mut current,
                SuperChunk::new(BatchMode::Contiguous),
            ));
            current.add_chunk(chunk).map_err(|chunk| {
                BatchingInvariantViolation::new(&chunk, "rejected by an empty super-chunk")
            })?;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    log::debug!("batched into {} contiguous super-chunks", batches.len());
    Ok(batches)
}

/// Compute the staging buffer end of each bounded super-chunk for the needed chunks.
///
/// Needed chunks are visited in order. A batch grows while the next chunk starts at or after the batch start,
/// shares its object, and keeps the batch span within `max_buffer_size`.
/// Otherwise the batch closes and the chunk starts a new one.
/// A chunk of pure fill value closes the current batch and has end position `0`.
///
/// `needed` has one flag per chunk.
#[must_use]
pub fn compute_bounded_buffer_end_positions(
    chunks: &[Chunk],
    needed: &[bool],
    max_buffer_size: u64,
) -> Vec<u64> {
    struct Batch<'a> {
        start: u64,
        end: u64,
        locator: Option<&'a SourceLocator>,
    }

    let mut end_positions = Vec::new();
    let mut batch: Option<Batch<'_>> = None;
    for (chunk, _) in chunks.iter().zip(needed).filter(|(_, needed)| **needed) {
        if chunk.is_fill() {
            if let Some(batch) = batch.take() {
                end_positions.push(batch.end);
            }
            end_positions.push(0);
            continue;
        }
        match &mut batch {
            Some(current)
                if chunk.source_locator() == current.locator
                    && chunk.byte_offset() >= current.start
                    && current.end.max(chunk.end()) - current.start <= max_buffer_size =>
            {
                current.end = current.end.max(chunk.end());
            }
            _ => {
                if let Some(closed) = batch.take() {
                    end_positions.push(closed.end);
                }
                batch = Some(Batch {
                    start: chunk.byte_offset(),
                    end: chunk.end(),
                    locator: chunk.source_locator(),
                });
            }
        }
    }
    if let Some(batch) = batch {
        end_positions.push(batch.end);
    }
    end_positions
}

/// Batch chunks into bounded super-chunks, consuming `end_positions` in order.
///
/// `chunks` are the needed chunks, in the order used by [`compute_bounded_buffer_end_positions`].
///
/// # Errors
/// Returns [`BatchingInvariantViolation`] if the end positions run out, a chunk does not fit the buffer it is assigned,
/// or end positions are left over.
pub fn batch_bounded(
    chunks: impl IntoIterator<Item = Chunk>,
    end_positions: &[u64],
) -> Result<Vec<SuperChunk>, BatchingInvariantViolation> {
    let mut end_positions = end_positions.iter().copied();
    let mut next_super_chunk = |chunk: Chunk| -> Result<SuperChunk, BatchingInvariantViolation> {
        let Some(buffer_end) = end_positions.next() else {
            return Err(BatchingInvariantViolation::new(&chunk, "no buffer end position left"));
        };
        if !chunk.is_fill() && chunk.end() > buffer_end {
            return Err(BatchingInvariantViolation::new(&chunk, "chunk ends after its buffer"));
        }
        let mut super_chunk = SuperChunk::new(BatchMode::Bounded);
        super_chunk
            .add_chunk_non_contiguous(chunk, buffer_end)
            .map_err(|chunk| {
                BatchingInvariantViolation::new(&chunk, "rejected by an empty super-chunk")
            })?;
        Ok(super_chunk)
    };

    let mut batches = Vec::new();
    let mut current: Option<SuperChunk> = None;
    for chunk in chunks {
        let chunk = match current.as_mut() {
            Some(super_chunk) => {
                let buffer_end = super_chunk.buffer_end;
                match super_chunk.add_chunk_non_contiguous(chunk, buffer_end) {
                    Ok(()) => continue,
                    Err(chunk) => chunk,
                }
            }
            None => chunk,
        };
        if let Some(full) = current.replace(next_super_chunk(chunk)?) {
            batches.push(full);
        }
    }
    batches.extend(current);
    if let Some(chunk) = batches.last().and_then(|batch| batch.chunks.last())
        && end_positions.next().is_some()
    {
        return Err(BatchingInvariantViolation::new(chunk, "unused buffer end positions"));
    }
    log::debug!("batched into {} bounded super-chunks", batches.len());
    Ok(batches)
}

/// Returns true if the stored chunks fall into more than one byte adjacent run.
///
/// Chunks of pure fill value are ignored.
#[must_use]
pub fn prefers_bounded_batching(chunks: &[Chunk]) -> bool {
    let mut runs = 0;
    let mut previous: Option<&Chunk> = None;
    for chunk in chunks.iter().filter(|chunk| !chunk.is_fill()) {
        let adjacent = previous.is_some_and(|previous| {
            previous.end() == chunk.byte_offset()
                && previous.source_locator() == chunk.source_locator()
        });
        if !adjacent {
            runs += 1;
        }
        previous = Some(chunk);
    }
    runs > 1
}
