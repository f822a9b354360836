//! Hyperslab planning and chunk scatter.
//!
//! Decides which chunks a [`Hyperslab`] request touches and copies the selected elements of each chunk into the destination.
//!
//! Dimensions are walked with an explicit odometer over an [`IndexStack`] rather than by recursion.
//! The last (fastest varying) dimension is copied as a single run when its stride is one, and element by element otherwise.

use thiserror::Error;

use crate::{
    destination::{DestinationError, DisjointDestination},
    hyperslab::{DimensionSlice, Hyperslab},
    index_math::{ArrayIndicesTinyVec, IndexMathError, flat_index},
};

/// A planning or scatter error.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlannerError {
    /// Index math failed.
    #[error(transparent)]
    IndexMath(#[from] IndexMathError),
    /// A destination write failed.
    #[error(transparent)]
    Destination(#[from] DestinationError),
    /// The chunk buffer is smaller than its shape implies.
    #[error("chunk buffer has {got} bytes, but at least {needed} are required")]
    ChunkBufferTooSmall {
        /// The number of bytes required.
        needed: usize,
        /// The number of bytes available.
        got: usize,
    },
}

/// The location and extent of a chunk within an array.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlacement<'a> {
    /// The element coordinates of the chunk's first element.
    pub origin: &'a [u64],
    /// The chunk shape in elements.
    pub shape: &'a [u64],
}

impl<'a> ChunkPlacement<'a> {
    /// Create a new chunk placement.
    #[must_use]
    pub fn new(origin: &'a [u64], shape: &'a [u64]) -> Self {
        Self { origin, shape }
    }

    fn rank(&self) -> usize {
        self.origin.len()
    }

    fn check_rank(&self, rank: usize) -> Result<(), IndexMathError> {
        for len in [self.origin.len(), self.shape.len()] {
            if len != rank {
                return Err(IndexMathError::RankMismatch {
                    coord_rank: len,
                    shape_rank: rank,
                });
            }
        }
        Ok(())
    }
}

/// Returns true if a chunk spanning `[chunk_origin, chunk_origin + chunk_extent)` along one dimension overlaps `[slice.start, slice.stop]`.
#[must_use]
pub fn chunk_intersects_request(
    chunk_origin: u64,
    chunk_extent: u64,
    slice: &DimensionSlice,
) -> bool {
    if chunk_extent == 0 {
        return false;
    }
    let chunk_end = chunk_origin + chunk_extent - 1;
    !(slice.start() > chunk_end || slice.stop() < chunk_origin)
}

/// Returns the chunk-local index of the first element of a chunk starting at `chunk_origin` that lands on the stride of `slice`.
///
/// When the request starts inside the chunk this is simply the distance to the start.
/// When it starts before the chunk, the offset steps forward to the next stride aligned element,
/// without assuming the stride divides the chunk extent.
/// The result may lie beyond the chunk.
#[must_use]
pub fn first_usable_element_offset(chunk_origin: u64, slice: &DimensionSlice) -> u64 {
    if slice.start() < chunk_origin {
        if slice.is_unit_stride() {
            0
        } else {
            let remainder = (chunk_origin - slice.start()) % slice.stride();
            if remainder == 0 {
                0
            } else {
                slice.stride() - remainder
            }
        }
    } else {
        slice.start() - chunk_origin
    }
}

/// The inclusive chunk-local index range selected along one dimension, or [`None`] if nothing is selected.
fn selected_range(
    chunk_origin: u64,
    chunk_extent: u64,
    slice: &DimensionSlice,
) -> Option<(u64, u64)> {
    if !chunk_intersects_request(chunk_origin, chunk_extent, slice) {
        return None;
    }
    let first = first_usable_element_offset(chunk_origin, slice);
    let last = std::cmp::min(chunk_extent - 1, slice.stop() - chunk_origin);
    (first <= last).then_some((first, last))
}

/// Returns true if the chunk at `placement` holds at least one element selected by `request`.
///
/// # Errors
/// Returns [`IndexMathError::RankMismatch`] if the placement and request ranks differ.
pub fn find_needed_chunk(
    placement: ChunkPlacement<'_>,
    request: &Hyperslab,
) -> Result<bool, IndexMathError> {
    placement.check_rank(request.rank())?;
    Ok(request.iter().enumerate().all(|(dim, slice)| {
        selected_range(placement.origin[dim], placement.shape[dim], slice).is_some()
    }))
}

/// Returns the indices of the chunks in `placements` needed by `request`, in order.
///
/// # Errors
/// Returns [`IndexMathError::RankMismatch`] if any placement and the request ranks differ.
pub fn select_needed_chunks<'a>(
    placements: impl IntoIterator<Item = ChunkPlacement<'a>>,
    request: &Hyperslab,
) -> Result<Vec<usize>, IndexMathError> {
    let mut needed = Vec::new();
    for (index, placement) in placements.into_iter().enumerate() {
        if find_needed_chunk(placement, request)? {
            needed.push(index);
        }
    }
    Ok(needed)
}

/// Per-dimension chunk-local index ranges and the current position within them.
///
/// The last dimension is never advanced by [`IndexStack::advance_outer`]; it is handled as a run by the caller.
#[derive(Clone, Debug)]
pub(crate) struct IndexStack {
    first: ArrayIndicesTinyVec,
    last: ArrayIndicesTinyVec,
    step: ArrayIndicesTinyVec,
    current: ArrayIndicesTinyVec,
}

impl IndexStack {
    pub(crate) fn new(
        first: ArrayIndicesTinyVec,
        last: ArrayIndicesTinyVec,
        step: ArrayIndicesTinyVec,
    ) -> Self {
        debug_assert_eq!(first.len(), last.len());
        debug_assert_eq!(first.len(), step.len());
        let current = first.clone();
        Self {
            first,
            last,
            step,
            current,
        }
    }

    pub(crate) fn current(&self) -> &[u64] {
        &self.current
    }

    /// Advance every dimension but the last, odometer style.
    ///
    /// Returns false once all positions have been visited.
    pub(crate) fn advance_outer(&mut self) -> bool {
        let rank = self.current.len();
        for dim in (0..rank.saturating_sub(1)).rev() {
            self.current[dim] += self.step[dim];
            if self.current[dim] <= self.last[dim] {
                return true;
            }
            self.current[dim] = self.first[dim];
        }
        false
    }

    /// The number of positions along the last dimension.
    fn last_dimension_count(&self) -> u64 {
        self.current.last().map_or(1, |_| {
            let dim = self.current.len() - 1;
            (self.last[dim] - self.first[dim]) / self.step[dim] + 1
        })
    }

    fn last_dimension_step(&self) -> u64 {
        self.step.last().copied().unwrap_or(1)
    }
}

fn source_elements(
    chunk_bytes: &[u8],
    element_offset: u64,
    num_elements: u64,
    element_size: usize,
) -> Result<&[u8], PlannerError> {
    let start = usize::try_from(element_offset).unwrap_or(usize::MAX).saturating_mul(element_size);
    let len = usize::try_from(num_elements).unwrap_or(usize::MAX).saturating_mul(element_size);
    let end = start.saturating_add(len);
    chunk_bytes
        .get(start..end)
        .ok_or(PlannerError::ChunkBufferTooSmall {
            needed: end,
            got: chunk_bytes.len(),
        })
}

/// Copy the elements of a chunk selected by `request` into `destination`.
///
/// `destination` has the constrained shape of `request`.
/// A selected element at chunk-local index `i` of dimension `d` lands at destination index `(i + origin[d] - start[d]) / stride[d]`.
///
/// # Errors
/// Returns a [`PlannerError`] if the ranks differ, `chunk_bytes` is smaller than the chunk shape implies, or a write falls outside `destination`.
pub fn insert_chunk(
    placement: ChunkPlacement<'_>,
    chunk_bytes: &[u8],
    request: &Hyperslab,
    destination: &DisjointDestination<'_>,
) -> Result<(), PlannerError> {
    placement.check_rank(request.rank())?;
    let element_size = destination.element_size();
    if placement.rank() == 0 {
        return Ok(destination.write_bytes(0, source_elements(chunk_bytes, 0, 1, element_size)?)?);
    }

    let mut first = ArrayIndicesTinyVec::with_capacity(request.rank());
    let mut last = ArrayIndicesTinyVec::with_capacity(request.rank());
    let mut step = ArrayIndicesTinyVec::with_capacity(request.rank());
    for (dim, slice) in request.iter().enumerate() {
        let Some((first_dim, last_dim)) =
            selected_range(placement.origin[dim], placement.shape[dim], slice)
        else {
            return Ok(());
        };
        first.push(first_dim);
        last.push(last_dim);
        step.push(slice.stride());
    }

    let mut stack = IndexStack::new(first, last, step);
    let mut dest_coord = ArrayIndicesTinyVec::with_capacity(request.rank());
    let count = stack.last_dimension_count();
    let stride = stack.last_dimension_step();
    loop {
        dest_coord.clear();
        let coords = stack.current().iter().zip(placement.origin);
        for ((&index, &origin), slice) in coords.zip(request.iter()) {
            debug_assert_eq!((index + origin - slice.start()) % slice.stride(), 0);
            dest_coord.push((index + origin - slice.start()) / slice.stride());
        }
        let src_offset = flat_index(stack.current(), placement.shape)?;
        let dest_offset = flat_index(&dest_coord, destination.shape())?;
        if stride == 1 {
            let src = source_elements(chunk_bytes, src_offset, count, element_size)?;
            destination.write_elements(dest_offset, src)?;
        } else {
            for k in 0..count {
                let src = source_elements(chunk_bytes, src_offset + k * stride, 1, element_size)?;
                destination.write_elements(dest_offset + k, src)?;
            }
        }
        if !stack.advance_outer() {
            return Ok(());
        }
    }
}

/// Copy a whole chunk into `destination`, which has the full array shape.
///
/// Elements of a chunk overhanging the array bounds are skipped.
///
/// # Errors
/// Returns a [`PlannerError`] if the ranks differ, `chunk_bytes` is smaller than the chunk shape implies, or a write falls outside `destination`.
pub fn insert_chunk_unconstrained(
    placement: ChunkPlacement<'_>,
    chunk_bytes: &[u8],
    destination: &DisjointDestination<'_>,
) -> Result<(), PlannerError> {
    let array_shape = destination.shape();
    placement.check_rank(array_shape.len())?;
    let element_size = destination.element_size();
    if placement.rank() == 0 {
        let src = source_elements(chunk_bytes, 0, 1, element_size)?;
        return Ok(destination.write_bytes(0, src)?);
    }

    if placement.shape == array_shape && placement.origin.iter().all(|&origin| origin == 0) {
        let count = crate::index_math::element_count(array_shape);
        let src = source_elements(chunk_bytes, 0, count, element_size)?;
        return Ok(destination.write_bytes(0, src)?);
    }

    let mut first = ArrayIndicesTinyVec::with_capacity(placement.rank());
    let mut last = ArrayIndicesTinyVec::with_capacity(placement.rank());
    let mut step = ArrayIndicesTinyVec::with_capacity(placement.rank());
    let extents = placement.origin.iter().zip(placement.shape);
    for ((&origin, &extent), &array_extent) in extents.zip(array_shape) {
        if extent == 0 || origin >= array_extent {
            return Ok(());
        }
        first.push(0);
        last.push(std::cmp::min(origin + extent - 1, array_extent - 1) - origin);
        step.push(1);
    }

    let mut stack = IndexStack::new(first, last, step);
    let mut dest_coord = ArrayIndicesTinyVec::with_capacity(placement.rank());
    let count = stack.last_dimension_count();
    loop {
        dest_coord.clear();
        dest_coord.extend(
            stack
                .current()
                .iter()
                .zip(placement.origin)
                .map(|(index, origin)| index + origin),
        );
        let src_offset = flat_index(stack.current(), placement.shape)?;
        let dest_offset = flat_index(&dest_coord, array_shape)?;
        let src = source_elements(chunk_bytes, src_offset, count, element_size)?;
        destination.write_elements(dest_offset, src)?;
        if !stack.advance_outer() {
            return Ok(());
        }
    }
}
