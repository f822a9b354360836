//! Row-major index arithmetic.
//!
//! Pure functions mapping between N-dimensional element coordinates and flat row-major offsets.
//! Every scatter routine in [`planner`](crate::planner) and [`reconstructor`](crate::reconstructor) addresses the destination through these.

use thiserror::Error;

/// An array shape. Dimensions are ordered slowest varying first.
pub type ArrayShape = Vec<u64>;

/// Element coordinates within an array.
pub type ArrayIndices = Vec<u64>;

/// Element coordinates within an array.
///
/// Uses [`TinyVec`](tinyvec::TinyVec) for stack allocation up to 4 dimensions.
pub type ArrayIndicesTinyVec = tinyvec::TinyVec<[u64; 4]>;

/// An index math error.
///
/// These indicate malformed chunk metadata or a planning bug, never a transport problem.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum IndexMathError {
    /// The coordinates and shape have different ranks.
    #[error("coordinates have rank {coord_rank}, expected rank {shape_rank}")]
    RankMismatch {
        /// The rank of the coordinates.
        coord_rank: usize,
        /// The rank of the shape.
        shape_rank: usize,
    },
    /// A coordinate lies outside its dimension.
    #[error("coordinate {coord} is out of bounds for dimension {dim} of extent {extent}")]
    CoordOutOfBounds {
        /// The dimension.
        dim: usize,
        /// The offending coordinate.
        coord: u64,
        /// The extent of the dimension.
        extent: u64,
    },
    /// A dimension multiplier was requested for the last (or a nonexistent) dimension.
    #[error("dimension {dim} has no faster varying dimensions in an array of rank {rank}")]
    DimensionOutOfRange {
        /// The dimension.
        dim: usize,
        /// The array rank.
        rank: usize,
    },
}

/// Returns the row-major flat offset of `coord` within an array of `shape`.
///
/// Dimensions are walked from the last (fastest varying) to the first.
/// The first dimension is not bounds checked, so a flat offset past the end of `shape` can be computed for a leading dimension that grows.
///
/// # Errors
/// Returns [`IndexMathError::RankMismatch`] if `coord` and `shape` differ in length,
/// or [`IndexMathError::CoordOutOfBounds`] if `coord[i] >= shape[i]` for any dimension after the first.
pub fn flat_index(coord: &[u64], shape: &[u64]) -> Result<u64, IndexMathError> {
    if coord.len() != shape.len() {
        return Err(IndexMathError::RankMismatch {
            coord_rank: coord.len(),
            shape_rank: shape.len(),
        });
    }
    let mut offset = 0;
    let mut multiplier = 1;
    for (dim, (&c, &extent)) in coord.iter().zip(shape).enumerate().rev() {
        if dim > 0 && c >= extent {
            return Err(IndexMathError::CoordOutOfBounds {
                dim,
                coord: c,
                extent,
            });
        }
        offset += c * multiplier;
        multiplier *= extent;
    }
    Ok(offset)
}

/// Returns the product of the extents of the dimensions after `dim`.
///
/// This is the flat distance between consecutive elements along `dim`.
///
/// # Errors
/// Returns [`IndexMathError::DimensionOutOfRange`] if `dim + 1 >= shape.len()`.
pub fn dimension_multiplier(shape: &[u64], dim: usize) -> Result<u64, IndexMathError> {
    if dim + 1 >= shape.len() {
        return Err(IndexMathError::DimensionOutOfRange {
            dim,
            rank: shape.len(),
        });
    }
    Ok(shape[dim + 1..].iter().product())
}

/// The inverse of [`flat_index`].
///
/// # Errors
/// Returns [`IndexMathError::CoordOutOfBounds`] if a dimension after the first has zero extent.
pub fn coord_from_flat(
    mut index: u64,
    shape: &[u64],
) -> Result<ArrayIndicesTinyVec, IndexMathError> {
    let mut coord = ArrayIndicesTinyVec::new();
    coord.resize(shape.len(), 0);
    for (dim, &extent) in shape.iter().enumerate().skip(1).rev() {
        if extent == 0 {
            return Err(IndexMathError::CoordOutOfBounds {
                dim,
                coord: index,
                extent,
            });
        }
        coord[dim] = index % extent;
        index /= extent;
    }
    if let Some(first) = coord.first_mut() {
        *first = index;
    }
    Ok(coord)
}

/// Returns the number of elements in an array of `shape`.
#[must_use]
pub fn element_count(shape: &[u64]) -> u64 {
    shape.iter().product()
}
