//! A fetcher adapter which records transfer metrics.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{byte_range::ByteRange, Bytes, ChunkFetcher, SourceLocator, StorageError};

/// The fetch metrics adapter. Accumulates the number of fetches and bytes read.
///
/// It is intended to let an application validate that transfer counts match expectations,
/// e.g. that super-chunk batching collapsed many chunk reads into a few range requests.
///
/// ### Example
/// ```rust
/// # use std::sync::Arc;
/// # use chunkweave_storage::store::MemoryFetcher;
/// # use chunkweave_storage::fetcher_adapter::fetch_metrics::FetchMetricsAdapter;
/// let fetcher = Arc::new(MemoryFetcher::new());
/// let fetcher = Arc::new(FetchMetricsAdapter::new(fetcher));
/// // do some fetches...
/// // assert_eq!(fetcher.fetches(), ...);
/// // assert_eq!(fetcher.bytes_read(), ...);
/// ```
#[derive(Debug)]
pub struct FetchMetricsAdapter<TFetcher: ?Sized> {
    fetcher: Arc<TFetcher>,
    bytes_read: AtomicUsize,
    fetches: AtomicUsize,
    failures: AtomicUsize,
}

impl<TFetcher: ?Sized> FetchMetricsAdapter<TFetcher> {
    /// Create a new fetch metrics adapter.
    #[must_use]
    pub fn new(fetcher: Arc<TFetcher>) -> Self {
        Self {
            fetcher,
            bytes_read: AtomicUsize::default(),
            fetches: AtomicUsize::default(),
            failures: AtomicUsize::default(),
        }
    }

    /// Reset the metrics.
    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.fetches.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Returns the number of bytes read.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns the number of fetch requests, including failed ones.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Returns the number of failed fetch requests.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

impl<TFetcher: ?Sized + ChunkFetcher> ChunkFetcher for FetchMetricsAdapter<TFetcher> {
    fn fetch(&self, locator: &SourceLocator, byte_range: ByteRange) -> Result<Bytes, StorageError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let value = self.fetcher.fetch(locator, byte_range);
        match &value {
            Ok(bytes) => {
                self.bytes_read.fetch_add(bytes.len(), Ordering::Relaxed);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        value
    }

    fn size(&self, locator: &SourceLocator) -> Result<Option<u64>, StorageError> {
        self.fetcher.size(locator)
    }
}
