//! Hyperslab requests.
//!
//! A [`Hyperslab`] selects a strided, per-dimension subset of an array with inclusive `start`/`stop` bounds.

use derive_more::Deref;
use thiserror::Error;

use crate::index_math::{ArrayShape, element_count};

/// An invalid hyperslab error.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidHyperslabError {
    /// The start of a dimension slice is after its stop.
    #[error("hyperslab start {start} exceeds stop {stop}")]
    StartAfterStop {
        /// The start.
        start: u64,
        /// The stop.
        stop: u64,
    },
    /// A stride of zero.
    #[error("hyperslab stride must be at least 1")]
    ZeroStride,
    /// The hyperslab rank differs from the array rank.
    #[error("hyperslab has rank {0}, expected rank {1}")]
    RankMismatch(usize, usize),
    /// A dimension slice extends beyond the array.
    #[error("hyperslab stop {stop} is out of bounds for dimension {dim} of extent {extent}")]
    OutOfBounds {
        /// The dimension.
        dim: usize,
        /// The stop.
        stop: u64,
        /// The extent of the dimension.
        extent: u64,
    },
}

/// The selection along one dimension: every `stride`-th element from `start` up to and including `stop`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DimensionSlice {
    start: u64,
    stride: u64,
    stop: u64,
}

impl DimensionSlice {
    /// Create a new dimension slice.
    ///
    /// # Errors
    /// Returns [`InvalidHyperslabError`] if `start > stop` or `stride == 0`.
    pub fn new(start: u64, stride: u64, stop: u64) -> Result<Self, InvalidHyperslabError> {
        if stride == 0 {
            Err(InvalidHyperslabError::ZeroStride)
        } else if start > stop {
            Err(InvalidHyperslabError::StartAfterStop { start, stop })
        } else {
            Ok(Self {
                start,
                stride,
                stop,
            })
        }
    }

    /// Create a unit stride slice covering a dimension of `extent` elements.
    ///
    /// Returns [`None`] if `extent` is zero.
    #[must_use]
    pub fn full(extent: u64) -> Option<Self> {
        (extent > 0).then(|| Self {
            start: 0,
            stride: 1,
            stop: extent - 1,
        })
    }

    /// The first selected element.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// The step between selected elements.
    #[must_use]
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    /// The inclusive upper bound of the selection.
    #[must_use]
    pub const fn stop(&self) -> u64 {
        self.stop
    }

    /// Returns true for a stride of one.
    #[must_use]
    pub const fn is_unit_stride(&self) -> bool {
        self.stride == 1
    }

    /// The number of selected elements.
    #[must_use]
    pub const fn count(&self) -> u64 {
        (self.stop - self.start) / self.stride + 1
    }

    /// Returns true if element `index` is selected.
    #[must_use]
    pub const fn contains(&self, index: u64) -> bool {
        index >= self.start && index <= self.stop && (index - self.start) % self.stride == 0
    }
}

impl std::fmt::Display for DimensionSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}:{}]", self.start, self.stride, self.stop)
    }
}

/// A hyperslab: one [`DimensionSlice`] per array dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deref)]
pub struct Hyperslab(Vec<DimensionSlice>);

impl Hyperslab {
    /// Create a hyperslab from dimension slices.
    #[must_use]
    pub fn new(slices: Vec<DimensionSlice>) -> Self {
        Self(slices)
    }

    /// Create a hyperslab from `(start, stride, stop)` tuples.
    ///
    /// # Errors
    /// Returns [`InvalidHyperslabError`] if any tuple is not a valid [`DimensionSlice`].
    pub fn from_triples(
        triples: impl IntoIterator<Item = (u64, u64, u64)>,
    ) -> Result<Self, InvalidHyperslabError> {
        triples
            .into_iter()
            .map(|(start, stride, stop)| DimensionSlice::new(start, stride, stop))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Create a hyperslab selecting every element of an array of `shape`.
    ///
    /// Returns [`None`] if any dimension has zero extent.
    #[must_use]
    pub fn full(shape: &[u64]) -> Option<Self> {
        shape
            .iter()
            .map(|&extent| DimensionSlice::full(extent))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// The number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// The shape of the selection.
    #[must_use]
    pub fn constrained_shape(&self) -> ArrayShape {
        self.0.iter().map(DimensionSlice::count).collect()
    }

    /// The number of selected elements.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        element_count(&self.constrained_shape())
    }

    /// Returns true if the hyperslab selects every element of an array of `shape`.
    #[must_use]
    pub fn is_full(&self, shape: &[u64]) -> bool {
        self.rank() == shape.len()
            && self
                .0
                .iter()
                .zip(shape)
                .all(|(slice, &extent)| {
                    slice.start == 0 && slice.stride == 1 && slice.stop + 1 == extent
                })
    }

    /// Check that the hyperslab lies within an array of `shape`.
    ///
    /// # Errors
    /// Returns [`InvalidHyperslabError`] if the ranks differ or any `stop` is beyond its dimension.
    pub fn validate_against(&self, shape: &[u64]) -> Result<(), InvalidHyperslabError> {
        if self.rank() != shape.len() {
            return Err(InvalidHyperslabError::RankMismatch(self.rank(), shape.len()));
        }
        for (dim, (slice, &extent)) in self.0.iter().zip(shape).enumerate() {
            if slice.stop >= extent {
                return Err(InvalidHyperslabError::OutOfBounds {
                    dim,
                    stop: slice.stop,
                    extent,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Hyperslab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for slice in &self.0 {
            write!(f, "{slice}")?;
        }
        Ok(())
    }
}
