//! Chunk filters.
//!
//! A [`FilterChain`] lists the filters a writer applied to each chunk, in the order it applied them.
//! Decoding runs the chain from the last declared filter to the first.
//!
//! Supported filters:
//!  - `deflate`: a zlib stream, see [`inflate`].
//!  - `shuffle`: the HDF5 byte shuffle, see [`unshuffle`].
//!  - `fletcher32`: a trailing HDF5 fletcher32 checksum, see [`fletcher32`].

use std::str::FromStr;

use derive_more::{Deref, Display};
use flate2::{Decompress, FlushDecompress, Status};
use thiserror::Error;

use crate::options::ReadOptions;

/// The size of the trailing fletcher32 checksum.
const CHECKSUM_SIZE: usize = size_of::<u32>();

/// The smallest output buffer [`inflate`] starts with.
const MIN_INFLATE_CAPACITY: usize = 64;

/// A filter decode error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FilterError {
    /// The compressed stream is corrupt.
    #[error("{codec} failed to decode {input_len} bytes: {message}")]
    Inflate {
        /// The codec name.
        codec: &'static str,
        /// The encoded length.
        input_len: usize,
        /// The decoder message.
        message: String,
    },
    /// The shuffled length is not a whole number of elements.
    #[error("{codec} expects a multiple of the {element_size} byte element size, got {input_len} bytes")]
    Shuffle {
        /// The codec name.
        codec: &'static str,
        /// The encoded length.
        input_len: usize,
        /// The element size.
        element_size: usize,
    },
    /// A stored checksum does not match the data.
    #[error("{codec} checksum mismatch over {input_len} bytes: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        /// The codec name.
        codec: &'static str,
        /// The length of the checksummed data.
        input_len: usize,
        /// The stored checksum.
        stored: u32,
        /// The computed checksum.
        computed: u32,
    },
    /// The encoded data ended early.
    #[error("{codec} input of {input_len} bytes is truncated after producing {output_len} bytes")]
    Truncated {
        /// The codec name.
        codec: &'static str,
        /// The encoded length.
        input_len: usize,
        /// The decoded length produced before the input ran out.
        output_len: usize,
    },
}

/// A filter declared on a chunked array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum Filter {
    /// zlib DEFLATE.
    #[display("deflate")]
    Deflate,
    /// HDF5 byte shuffle.
    #[display("shuffle")]
    Shuffle,
    /// HDF5 fletcher32 checksum.
    #[display("fletcher32")]
    Fletcher32,
}

/// An unknown filter name error.
#[derive(Clone, Debug, Error)]
#[error("unknown filter {0}")]
pub struct UnknownFilterError(String);

impl FromStr for Filter {
    type Err = UnknownFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deflate" => Ok(Self::Deflate),
            "shuffle" => Ok(Self::Shuffle),
            "fletcher32" => Ok(Self::Fletcher32),
            _ => Err(UnknownFilterError(s.to_string())),
        }
    }
}

/// Decodes the raw bytes of a chunk.
pub trait FilterPipeline: Send + Sync {
    /// Returns true if decoding leaves bytes unchanged.
    fn is_identity(&self) -> bool;

    /// Decode `encoded`, the stored bytes of one chunk.
    ///
    /// A chunk decodes to `elements_per_chunk * bytes_per_element` bytes.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if any filter fails.
    fn decode(
        &self,
        encoded: Vec<u8>,
        elements_per_chunk: u64,
        bytes_per_element: usize,
        options: &ReadOptions,
    ) -> Result<Vec<u8>, FilterError>;
}

/// Filters in the order the writer applied them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deref)]
pub struct FilterChain(Vec<Filter>);

impl FilterChain {
    /// Create a filter chain from filters in encoding order.
    #[must_use]
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    /// Parse a space separated filter declaration such as `"shuffle deflate"`.
    ///
    /// # Errors
    /// Returns [`UnknownFilterError`] for an unrecognised filter name.
    pub fn parse(declaration: &str) -> Result<Self, UnknownFilterError> {
        declaration
            .split_whitespace()
            .map(Filter::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl std::fmt::Display for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for filter in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{filter}")?;
            first = false;
        }
        Ok(())
    }
}

impl FilterPipeline for FilterChain {
    fn is_identity(&self) -> bool {
        self.0.is_empty()
    }

    fn decode(
        &self,
        encoded: Vec<u8>,
        elements_per_chunk: u64,
        bytes_per_element: usize,
        options: &ReadOptions,
    ) -> Result<Vec<u8>, FilterError> {
        let decoded_len = usize::try_from(elements_per_chunk)
            .unwrap_or(usize::MAX)
            .saturating_mul(bytes_per_element);
        let mut bytes = encoded;
        for filter in self.0.iter().rev() {
            let input_len = bytes.len();
            bytes = match filter {
                Filter::Deflate => inflate(&bytes, decoded_len)?,
                Filter::Shuffle => unshuffle(&bytes, bytes_per_element)?,
                Filter::Fletcher32 => strip_fletcher32(bytes, options.validate_checksums())?,
            };
            log::trace!("{filter} decoded {input_len} bytes to {}", bytes.len());
        }
        Ok(bytes)
    }
}

/// Statistics from [`inflate_with_stats`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InflateStats {
    /// The number of times the output buffer was doubled.
    pub growths: usize,
    /// The decoded length reported by the decoder.
    pub total_out: u64,
}

/// Inflate a zlib stream.
///
/// `initial_capacity` is a guess of the decoded length.
///
/// # Errors
/// Returns [`FilterError::Inflate`] if the stream is corrupt or [`FilterError::Truncated`] if it ends early.
pub fn inflate(src: &[u8], initial_capacity: usize) -> Result<Vec<u8>, FilterError> {
    inflate_with_stats(src, initial_capacity).map(|(bytes, _)| bytes)
}

/// Inflate a zlib stream, also returning [`InflateStats`].
///
/// The output buffer starts at `initial_capacity` bytes and is doubled whenever it fills before the end of the stream.
/// The result is truncated to the decoder's `total_out`.
///
/// # Errors
/// Returns [`FilterError::Inflate`] if the stream is corrupt or [`FilterError::Truncated`] if it ends early.
pub fn inflate_with_stats(
    src: &[u8],
    initial_capacity: usize,
) -> Result<(Vec<u8>, InflateStats), FilterError> {
    const CODEC: &str = "deflate";
    let mut decompress = Decompress::new(true);
    let mut out = Vec::with_capacity(initial_capacity.max(MIN_INFLATE_CAPACITY));
    let mut growths = 0;
    loop {
        let consumed = usize::try_from(decompress.total_in()).unwrap_or(src.len());
        let total_out_before = decompress.total_out();
        let status = decompress
            .decompress_vec(&src[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|err| FilterError::Inflate {
                codec: CODEC,
                input_len: src.len(),
                message: err.to_string(),
            })?;
        if status == Status::StreamEnd {
            break;
        }
        if out.len() == out.capacity() {
            out.reserve_exact(out.capacity());
            growths += 1;
            continue;
        }
        let consumed_all = decompress.total_in() == src.len() as u64;
        let stalled = decompress.total_in() == consumed as u64
            && decompress.total_out() == total_out_before;
        if consumed_all || stalled {
            return Err(FilterError::Truncated {
                codec: CODEC,
                input_len: src.len(),
                output_len: out.len(),
            });
        }
    }
    let total_out = decompress.total_out();
    out.truncate(usize::try_from(total_out).unwrap_or(out.len()));
    Ok((out, InflateStats { growths, total_out }))
}

/// Undo the HDF5 byte shuffle over elements of `element_size` bytes.
///
/// # Errors
/// Returns [`FilterError::Shuffle`] if the length of `encoded` is not a multiple of `element_size`.
pub fn unshuffle(encoded: &[u8], element_size: usize) -> Result<Vec<u8>, FilterError> {
    check_shuffle_length(encoded, element_size)?;
    if element_size <= 1 {
        return Ok(encoded.to_vec());
    }
    let mut decoded = encoded.to_vec();
    let count = decoded.len() / element_size;
    for i in 0..element_size {
        let offset = i * count;
        for byte_index in 0..count {
            let j = byte_index * element_size + i;
            decoded[j] = encoded[offset + byte_index];
        }
    }
    Ok(decoded)
}

/// Apply the HDF5 byte shuffle over elements of `element_size` bytes.
///
/// # Errors
/// Returns [`FilterError::Shuffle`] if the length of `decoded` is not a multiple of `element_size`.
pub fn shuffle(decoded: &[u8], element_size: usize) -> Result<Vec<u8>, FilterError> {
    check_shuffle_length(decoded, element_size)?;
    if element_size <= 1 {
        return Ok(decoded.to_vec());
    }
    let mut encoded = decoded.to_vec();
    let count = encoded.len() / element_size;
    for i in 0..count {
        let offset = i * element_size;
        for byte_index in 0..element_size {
            let j = byte_index * count + i;
            encoded[j] = decoded[offset + byte_index];
        }
    }
    Ok(encoded)
}

fn check_shuffle_length(bytes: &[u8], element_size: usize) -> Result<(), FilterError> {
    if element_size > 1 && !bytes.len().is_multiple_of(element_size) {
        Err(FilterError::Shuffle {
            codec: "shuffle",
            input_len: bytes.len(),
            element_size,
        })
    } else {
        Ok(())
    }
}

/// The HDF5 fletcher32 checksum of `data`.
///
/// Bytes are summed as big endian 16-bit words; an odd trailing byte is the high byte of a final word.
#[must_use]
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let (words, remainder) = data.as_chunks::<2>();
    for block in words.chunks(360) {
        for word in block {
            sum1 += u32::from(u16::from_be_bytes(*word));
            sum2 += sum1;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    if let [last] = remainder {
        sum1 += u32::from(*last) << 8;
        sum2 += sum1;
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

/// Strip the trailing fletcher32 checksum from `encoded`, validating it if `validate` is set.
///
/// # Errors
/// Returns [`FilterError::Truncated`] if `encoded` is shorter than a checksum
/// or [`FilterError::Checksum`] if validation fails.
pub fn strip_fletcher32(mut encoded: Vec<u8>, validate: bool) -> Result<Vec<u8>, FilterError> {
    let Some(data_len) = encoded.len().checked_sub(CHECKSUM_SIZE) else {
        return Err(FilterError::Truncated {
            codec: "fletcher32",
            input_len: encoded.len(),
            output_len: 0,
        });
    };
    if validate {
        let (data, checksum) = encoded.split_at(data_len);
        let mut stored = [0; CHECKSUM_SIZE];
        stored.copy_from_slice(checksum);
        let stored = u32::from_le_bytes(stored);
        let computed = fletcher32(data);
        if stored != computed {
            return Err(FilterError::Checksum {
                codec: "fletcher32",
                input_len: data_len,
                stored,
                computed,
            });
        }
    }
    encoded.truncate(data_len);
    Ok(encoded)
}
