//! A fetcher adapter which injects latency and failures.

use std::{sync::Arc, time::Duration};

use crate::{byte_range::ByteRange, Bytes, ChunkFetcher, SourceLocator, StorageError};

type FailurePredicate = dyn Fn(&SourceLocator, ByteRange) -> bool + Send + Sync;

/// The fault injection adapter.
///
/// Delays every fetch by a fixed latency and fails fetches selected by a predicate.
/// Intended for exercising concurrent transfer and failure handling against a local fetcher.
pub struct FaultInjectionAdapter<TFetcher: ?Sized> {
    fetcher: Arc<TFetcher>,
    latency: Duration,
    fail_when: Option<Box<FailurePredicate>>,
}

impl<TFetcher: ?Sized> std::fmt::Debug for FaultInjectionAdapter<TFetcher> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectionAdapter")
            .field("latency", &self.latency)
            .field("fail_when", &self.fail_when.is_some())
            .finish_non_exhaustive()
    }
}

impl<TFetcher: ?Sized> FaultInjectionAdapter<TFetcher> {
    /// Create a new fault injection adapter with no latency and no failures.
    #[must_use]
    pub fn new(fetcher: Arc<TFetcher>) -> Self {
        Self {
            fetcher,
            latency: Duration::ZERO,
            fail_when: None,
        }
    }

    /// Delay every fetch by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every fetch for which `predicate` returns true.
    ///
    /// Failing fetches still observe the configured latency.
    #[must_use]
    pub fn with_failure(
        mut self,
        predicate: impl Fn(&SourceLocator, ByteRange) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }
}

impl<TFetcher: ?Sized + ChunkFetcher> ChunkFetcher for FaultInjectionAdapter<TFetcher> {
    fn fetch(&self, locator: &SourceLocator, byte_range: ByteRange) -> Result<Bytes, StorageError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if self
            .fail_when
            .as_ref()
            .is_some_and(|fail_when| fail_when(locator, byte_range))
        {
            return Err(StorageError::Other(format!(
                "injected failure fetching {byte_range} of {locator}"
            )));
        }
        self.fetcher.fetch(locator, byte_range)
    }

    fn size(&self, locator: &SourceLocator) -> Result<Option<u64>, StorageError> {
        self.fetcher.size(locator)
    }
}
