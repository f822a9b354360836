use crate::config::global_config;

/// Options for a read.
///
/// The default options are taken from the global [`Config`](crate::config::Config):
/// - `use_transfer_threads`
/// - `contiguous_concurrent_threshold`
/// - `use_compute_threads`
/// - `max_compute_threads`
/// - `use_buffer_chunk_heuristic`
/// - `super_chunk_buffer_budget`
/// - `validate_checksums`
///
/// The transfer concurrency limit and poll timeout belong to the [`SchedulerContext`](crate::scheduler::SchedulerContext), which is shared between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    use_transfer_threads: bool,
    contiguous_concurrent_threshold: u64,
    use_compute_threads: bool,
    max_compute_threads: usize,
    use_buffer_chunk_heuristic: bool,
    super_chunk_buffer_budget: u64,
    validate_checksums: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        let config = global_config();
        Self {
            use_transfer_threads: config.use_transfer_threads(),
            contiguous_concurrent_threshold: config.contiguous_concurrent_threshold(),
            use_compute_threads: config.use_compute_threads(),
            max_compute_threads: config.max_compute_threads(),
            use_buffer_chunk_heuristic: config.use_buffer_chunk_heuristic(),
            super_chunk_buffer_budget: config.super_chunk_buffer_budget(),
            validate_checksums: config.validate_checksums(),
        }
    }
}

impl ReadOptions {
    /// Return the use transfer threads setting.
    #[must_use]
    pub fn use_transfer_threads(&self) -> bool {
        self.use_transfer_threads
    }

    /// Set whether or not transfers run concurrently.
    pub fn set_use_transfer_threads(&mut self, use_transfer_threads: bool) -> &mut Self {
        self.use_transfer_threads = use_transfer_threads;
        self
    }

    /// Set whether or not transfers run concurrently.
    #[must_use]
    pub fn with_use_transfer_threads(mut self, use_transfer_threads: bool) -> Self {
        self.use_transfer_threads = use_transfer_threads;
        self
    }

    /// Return the contiguous concurrent threshold in bytes.
    #[must_use]
    pub fn contiguous_concurrent_threshold(&self) -> u64 {
        self.contiguous_concurrent_threshold
    }

    /// Set the contiguous concurrent threshold in bytes.
    pub fn set_contiguous_concurrent_threshold(
        &mut self,
        contiguous_concurrent_threshold: u64,
    ) -> &mut Self {
        self.contiguous_concurrent_threshold = contiguous_concurrent_threshold;
        self
    }

    /// Set the contiguous concurrent threshold in bytes.
    #[must_use]
    pub fn with_contiguous_concurrent_threshold(
        mut self,
        contiguous_concurrent_threshold: u64,
    ) -> Self {
        self.contiguous_concurrent_threshold = contiguous_concurrent_threshold;
        self
    }

    /// Return the use compute threads setting.
    #[must_use]
    pub fn use_compute_threads(&self) -> bool {
        self.use_compute_threads
    }

    /// Set whether or not super-chunk members are decoded in parallel.
    pub fn set_use_compute_threads(&mut self, use_compute_threads: bool) -> &mut Self {
        self.use_compute_threads = use_compute_threads;
        self
    }

    /// Set whether or not super-chunk members are decoded in parallel.
    #[must_use]
    pub fn with_use_compute_threads(mut self, use_compute_threads: bool) -> Self {
        self.use_compute_threads = use_compute_threads;
        self
    }

    /// Return the max compute threads.
    #[must_use]
    pub fn max_compute_threads(&self) -> usize {
        self.max_compute_threads
    }

    /// Set the max compute threads. Zero is raised to one.
    pub fn set_max_compute_threads(&mut self, max_compute_threads: usize) -> &mut Self {
        self.max_compute_threads = max_compute_threads.max(1);
        self
    }

    /// Set the max compute threads. Zero is raised to one.
    #[must_use]
    pub fn with_max_compute_threads(mut self, max_compute_threads: usize) -> Self {
        self.max_compute_threads = max_compute_threads.max(1);
        self
    }

    /// Return the use buffer chunk heuristic setting.
    #[must_use]
    pub fn use_buffer_chunk_heuristic(&self) -> bool {
        self.use_buffer_chunk_heuristic
    }

    /// Set whether or not sparse layouts use bounded-buffer batching.
    pub fn set_use_buffer_chunk_heuristic(
        &mut self,
        use_buffer_chunk_heuristic: bool,
    ) -> &mut Self {
        self.use_buffer_chunk_heuristic = use_buffer_chunk_heuristic;
        self
    }

    /// Set whether or not sparse layouts use bounded-buffer batching.
    #[must_use]
    pub fn with_use_buffer_chunk_heuristic(mut self, use_buffer_chunk_heuristic: bool) -> Self {
        self.use_buffer_chunk_heuristic = use_buffer_chunk_heuristic;
        self
    }

    /// Return the super-chunk buffer budget in bytes.
    #[must_use]
    pub fn super_chunk_buffer_budget(&self) -> u64 {
        self.super_chunk_buffer_budget
    }

    /// Set the super-chunk buffer budget in bytes.
    pub fn set_super_chunk_buffer_budget(&mut self, super_chunk_buffer_budget: u64) -> &mut Self {
        self.super_chunk_buffer_budget = super_chunk_buffer_budget;
        self
    }

    /// Set the super-chunk buffer budget in bytes.
    #[must_use]
    pub fn with_super_chunk_buffer_budget(mut self, super_chunk_buffer_budget: u64) -> Self {
        self.super_chunk_buffer_budget = super_chunk_buffer_budget;
        self
    }

    /// Return the validate checksums setting.
    #[must_use]
    pub fn validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    /// Set whether or not to validate checksums.
    pub fn set_validate_checksums(&mut self, validate_checksums: bool) -> &mut Self {
        self.validate_checksums = validate_checksums;
        self
    }

    /// Set whether or not to validate checksums.
    #[must_use]
    pub fn with_validate_checksums(mut self, validate_checksums: bool) -> Self {
        self.validate_checksums = validate_checksums;
        self
    }
}
