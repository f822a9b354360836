//! The fetch API for the [`chunkweave`](https://docs.rs/chunkweave/latest/chunkweave/index.html) crate.
//!
//! Array data reconstructed by `chunkweave` lives as byte ranges of one or more backing objects: local files or remote objects.
//! This crate defines how those byte ranges are named ([`ByteRange`](byte_range::ByteRange), [`SourceLocator`]),
//! the [`ChunkFetcher`] trait that retrieves them, and the [`StorageError`] transport error taxonomy.
//!
//! This crate includes an in-memory fetcher and fetcher adapters.
//! See `chunkweave_filesystem` and `chunkweave_http` for local file and HTTP fetchers.
//!
//! ## Licence
//! `chunkweave_storage` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod byte_range;
pub mod fetcher_adapter;
mod fetcher;
mod locator;
pub mod store;


use std::sync::Arc;

use thiserror::Error;

use byte_range::{ByteLength, ByteRange, InvalidByteRangeError};

pub use fetcher::{check_fetched_length, ChunkFetcher};
pub use locator::{SourceLocator, SourceLocatorError};

/// [`Arc`] wrapped chunk fetcher.
pub type ReadableFetcher = Arc<dyn ChunkFetcher>;

/// The type for bytes returned by fetchers.
///
/// An alias for [`bytes::Bytes`].
pub type Bytes = bytes::Bytes;

/// A transport error.
///
/// Raised when a fetcher cannot retrieve a requested byte range.
/// The reconstruction engine never retries; any [`StorageError`] aborts the read in progress.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] Arc<std::io::Error>),
    /// The backing object does not exist.
    #[error("source object {0} not found")]
    NotFound(SourceLocator),
    /// Fewer bytes than requested were returned.
    #[error("short read of {byte_range} from {locator}: expected {} bytes, got {got}", byte_range.length())]
    ShortRead {
        /// The backing object.
        locator: SourceLocator,
        /// The requested byte range.
        byte_range: ByteRange,
        /// The number of bytes returned.
        got: ByteLength,
    },
    /// An invalid byte range.
    #[error("invalid byte range {0}")]
    InvalidByteRangeError(#[from] InvalidByteRangeError),
    /// An invalid source locator.
    #[error(transparent)]
    SourceLocatorError(#[from] SourceLocatorError),
    /// The requested method or locator kind is not supported.
    #[error("{0}")]
    Unsupported(String),
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}
