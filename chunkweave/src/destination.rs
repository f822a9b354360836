//! The destination buffer written by concurrent transfer tasks.

use thiserror::Error;
use unsafe_cell_slice::UnsafeCellSlice;

use crate::index_math::{IndexMathError, element_count, flat_index};

/// A destination write error.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DestinationError {
    /// A write extends past the end of the destination.
    #[error("write of {len} bytes at offset {offset} exceeds destination of {capacity} bytes")]
    OutOfBounds {
        /// The byte offset of the write.
        offset: usize,
        /// The length of the write.
        len: usize,
        /// The destination length in bytes.
        capacity: usize,
    },
    /// The destination length does not match its shape.
    #[error("destination has {0} bytes, expected {1}")]
    InvalidLength(usize, usize),
    /// Index math failed while addressing the destination.
    #[error(transparent)]
    IndexMath(#[from] IndexMathError),
}

/// A shared, bounds-checked view of a dense destination array.
///
/// Many tasks may hold copies of the same view and write through it concurrently.
/// The view performs no locking: correctness relies on every task writing a byte range that no other task writes.
#[derive(Clone, Copy)]
pub struct DisjointDestination<'a> {
    bytes: UnsafeCellSlice<'a, u8>,
    element_size: usize,
    shape: &'a [u64],
}

impl std::fmt::Debug for DisjointDestination<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisjointDestination")
            .field("len", &self.bytes.len())
            .field("element_size", &self.element_size)
            .field("shape", &self.shape)
            .finish()
    }
}

impl<'a> DisjointDestination<'a> {
    /// Create a view of `bytes` holding an array of `shape` with `element_size` bytes per element.
    ///
    /// # Errors
    /// Returns [`DestinationError::InvalidLength`] if the length of `bytes` is not the element count of `shape` multiplied by `element_size`.
    ///
    /// # Safety
    /// While any copy of the view is alive, no two writers may write overlapping byte ranges concurrently,
    /// and `bytes` must not be read or written other than through the view.
    pub unsafe fn new(
        bytes: UnsafeCellSlice<'a, u8>,
        element_size: usize,
        shape: &'a [u64],
    ) -> Result<Self, DestinationError> {
        let expected = usize::try_from(element_count(shape))
            .ok()
            .and_then(|count| count.checked_mul(element_size))
            .unwrap_or(usize::MAX);
        if bytes.len() != expected {
            return Err(DestinationError::InvalidLength(bytes.len(), expected));
        }
        Ok(Self {
            bytes,
            element_size,
            shape,
        })
    }

    /// The shape of the destination array.
    #[must_use]
    pub fn shape(&self) -> &'a [u64] {
        self.shape
    }

    /// The size of one element in bytes.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// The destination length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the destination holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.len() == 0
    }

    /// Copy `src` to the destination starting at `byte_offset`.
    ///
    /// # Errors
    /// Returns [`DestinationError::OutOfBounds`] if the write extends past the end of the destination.
    pub fn write_bytes(&self, byte_offset: usize, src: &[u8]) -> Result<(), DestinationError> {
        let end = byte_offset
            .checked_add(src.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DestinationError::OutOfBounds {
                offset: byte_offset,
                len: src.len(),
                capacity: self.bytes.len(),
            })?;
        // SAFETY: in bounds, and writers target disjoint ranges per the constructor contract
        unsafe {
            self.bytes.index_mut(byte_offset..end).copy_from_slice(src);
        }
        Ok(())
    }

    /// Copy whole elements in `src` to the destination starting at the flat element offset `element_offset`.
    ///
    /// # Errors
    /// Returns [`DestinationError::OutOfBounds`] if the write extends past the end of the destination.
    pub fn write_elements(&self, element_offset: u64, src: &[u8]) -> Result<(), DestinationError> {
        let byte_offset = usize::try_from(element_offset)
            .ok()
            .and_then(|offset| offset.checked_mul(self.element_size))
            .ok_or(DestinationError::OutOfBounds {
                offset: usize::MAX,
                len: src.len(),
                capacity: self.bytes.len(),
            })?;
        self.write_bytes(byte_offset, src)
    }

    /// Copy whole elements in `src` to the destination starting at element coordinates `coord`.
    ///
    /// # Errors
    /// Returns a [`DestinationError`] if `coord` is not a valid coordinate of the destination or the write is out of bounds.
    pub fn write_at(&self, coord: &[u64], src: &[u8]) -> Result<(), DestinationError> {
        let element_offset = flat_index(coord, self.shape)?;
        self.write_elements(element_offset, src)
    }
}
