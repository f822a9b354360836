use chunkweave_storage::StorageError;
use thiserror::Error;

use crate::{
    chunk::{FillValueUndersizedError, InvalidPositionError},
    destination::DestinationError,
    element::UnsupportedElementTypeError,
    filter::FilterError,
    hyperslab::InvalidHyperslabError,
    index_math::IndexMathError,
    planner::PlannerError,
    super_chunk::BatchingInvariantViolation,
};

/// A reconstruction error.
///
/// Any error aborts the whole read. The destination is left partially written and the variable is not marked as read.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ReconstructError {
    /// A chunk fetch failed.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// A filter failed.
    #[error(transparent)]
    FilterError(#[from] FilterError),
    /// Index math failed.
    #[error(transparent)]
    IndexMathError(#[from] IndexMathError),
    /// Scattering a chunk failed.
    #[error(transparent)]
    PlannerError(#[from] PlannerError),
    /// A destination write failed.
    #[error(transparent)]
    DestinationError(#[from] DestinationError),
    /// The hyperslab does not fit the array.
    #[error(transparent)]
    InvalidHyperslabError(#[from] InvalidHyperslabError),
    /// A chunk could not be placed in any super-chunk.
    #[error(transparent)]
    BatchingInvariantViolation(#[from] BatchingInvariantViolation),
    /// A fill value cannot tile a chunk.
    #[error(transparent)]
    FillValueUndersizedError(#[from] FillValueUndersizedError),
    /// A chunk position could not be parsed.
    #[error(transparent)]
    InvalidPositionError(#[from] InvalidPositionError),
    /// The array layout or element type is not supported.
    #[error("unsupported layout: {_0}")]
    UnsupportedLayout(String),
    /// A transfer task panicked.
    #[error("transfer task {_0} panicked")]
    TaskPanicked(String),
    /// A chunk holds a different number of bytes than its descriptor declares.
    #[error("chunk at offset {offset} has {got} bytes, expected {expected}")]
    ChunkSizeMismatch {
        /// The chunk byte offset.
        offset: u64,
        /// The declared size.
        expected: u64,
        /// The actual size.
        got: u64,
    },
    /// The chunk manifest could not be loaded.
    #[error("failed to load the chunk manifest: {_0}")]
    ManifestError(String),
}

impl From<UnsupportedElementTypeError> for ReconstructError {
    fn from(err: UnsupportedElementTypeError) -> Self {
        Self::UnsupportedLayout(err.to_string())
    }
}
