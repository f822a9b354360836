//! Chunkweave global configuration options.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Global configuration options for the chunkweave crate.
///
/// Retrieve the global [`Config`] with [`global_config`] and modify it with [`global_config_mut`].
/// A serving process can also load a [`Config`] from JSON with [`Config::from_json_str`]; missing fields take their defaults.
///
/// # Transfer Configuration Options
///
/// ## Use Transfer Threads
/// > default: [`true`]
///
/// If enabled, chunk and super-chunk transfers of one read run concurrently, otherwise they run serially in submission order.
///
/// ## Max Transfer Threads
/// > default: `8`
///
/// The maximum number of transfer tasks in flight at once.
/// This bound is shared by every read that uses the same [`SchedulerContext`](crate::scheduler::SchedulerContext).
///
/// ## Contiguous Concurrent Threshold
/// > default: `2097152` (2 MiB)
///
/// A contiguous array larger than this many bytes is split into child byte ranges transferred concurrently.
///
/// ## Poll Timeout
/// > default: `50` ms
///
/// The longest the scheduler waits for a transfer to complete before polling again.
///
/// # Compute Configuration Options
///
/// ## Use Compute Threads
/// > default: [`true`]
///
/// If enabled, the member chunks of a super-chunk are filtered and scattered in parallel with [`rayon`].
///
/// ## Max Compute Threads
/// > default: [`rayon::current_num_threads`]`()`
///
/// The concurrent limit for filtering and scattering the members of one super-chunk.
///
/// # Batching Configuration Options
///
/// ## Use Buffer Chunk Heuristic
/// > default: [`false`]
///
/// If enabled, chunks of a sparse layout are batched into bounded staging buffers that may span gaps, rather than strictly contiguous runs.
///
/// ## Super Chunk Buffer Budget
/// > default: `16777216` (16 MiB)
///
/// The largest staging buffer a bounded super-chunk may span.
///
/// # Miscellaneous Configuration Options
///
/// ## Validate Checksums
/// > default: [`true`]
///
/// If enabled, the `fletcher32` filter validates stored checksums, otherwise it only strips them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    use_transfer_threads: bool,
    max_transfer_threads: usize,
    contiguous_concurrent_threshold: u64,
    use_compute_threads: bool,
    max_compute_threads: usize,
    use_buffer_chunk_heuristic: bool,
    super_chunk_buffer_budget: u64,
    poll_timeout_ms: u64,
    validate_checksums: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_transfer_threads: true,
            max_transfer_threads: 8,
            contiguous_concurrent_threshold: 2 * 1024 * 1024,
            use_compute_threads: true,
            max_compute_threads: rayon::current_num_threads(),
            use_buffer_chunk_heuristic: false,
            super_chunk_buffer_budget: 16 * 1024 * 1024,
            poll_timeout_ms: 50,
            validate_checksums: true,
        }
    }
}

impl Config {
    /// Parse a configuration from JSON.
    ///
    /// Fields that are absent take their default value. Zero thread counts are raised to one.
    ///
    /// # Errors
    /// Returns a [`serde_json::Error`] if `json` is not a valid configuration.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(json)?;
        let max_transfer_threads = config.max_transfer_threads;
        let max_compute_threads = config.max_compute_threads;
        config.set_max_transfer_threads(max_transfer_threads);
        config.set_max_compute_threads(max_compute_threads);
        Ok(config)
    }

    /// Get the [use transfer threads](#use-transfer-threads) configuration.
    #[must_use]
    pub fn use_transfer_threads(&self) -> bool {
        self.use_transfer_threads
    }

    /// Set the [use transfer threads](#use-transfer-threads) configuration.
    pub fn set_use_transfer_threads(&mut self, use_transfer_threads: bool) {
        self.use_transfer_threads = use_transfer_threads;
    }

    /// Get the [max transfer threads](#max-transfer-threads) configuration.
    #[must_use]
    pub fn max_transfer_threads(&self) -> usize {
        self.max_transfer_threads
    }

    /// Set the [max transfer threads](#max-transfer-threads) configuration.
    ///
    /// Zero is raised to one.
    pub fn set_max_transfer_threads(&mut self, max_transfer_threads: usize) {
        if max_transfer_threads == 0 {
            log::warn!("max_transfer_threads of 0 raised to 1");
        }
        self.max_transfer_threads = max_transfer_threads.max(1);
    }

    /// Get the [contiguous concurrent threshold](#contiguous-concurrent-threshold) configuration.
    #[must_use]
    pub fn contiguous_concurrent_threshold(&self) -> u64 {
        self.contiguous_concurrent_threshold
    }

    /// Set the [contiguous concurrent threshold](#contiguous-concurrent-threshold) configuration.
    pub fn set_contiguous_concurrent_threshold(&mut self, contiguous_concurrent_threshold: u64) {
        self.contiguous_concurrent_threshold = contiguous_concurrent_threshold;
    }

    /// Get the [use compute threads](#use-compute-threads) configuration.
    #[must_use]
    pub fn use_compute_threads(&self) -> bool {
        self.use_compute_threads
    }

    /// Set the [use compute threads](#use-compute-threads) configuration.
    pub fn set_use_compute_threads(&mut self, use_compute_threads: bool) {
        self.use_compute_threads = use_compute_threads;
    }

    /// Get the [max compute threads](#max-compute-threads) configuration.
    #[must_use]
    pub fn max_compute_threads(&self) -> usize {
        self.max_compute_threads
    }

    /// Set the [max compute threads](#max-compute-threads) configuration.
    ///
    /// Zero is raised to one.
    pub fn set_max_compute_threads(&mut self, max_compute_threads: usize) {
        if max_compute_threads == 0 {
            log::warn!("max_compute_threads of 0 raised to 1");
        }
        self.max_compute_threads = max_compute_threads.max(1);
    }

    /// Get the [use buffer chunk heuristic](#use-buffer-chunk-heuristic) configuration.
    #[must_use]
    pub fn use_buffer_chunk_heuristic(&self) -> bool {
        self.use_buffer_chunk_heuristic
    }

    /// Set the [use buffer chunk heuristic](#use-buffer-chunk-heuristic) configuration.
    pub fn set_use_buffer_chunk_heuristic(&mut self, use_buffer_chunk_heuristic: bool) {
        self.use_buffer_chunk_heuristic = use_buffer_chunk_heuristic;
    }

    /// Get the [super chunk buffer budget](#super-chunk-buffer-budget) configuration.
    #[must_use]
    pub fn super_chunk_buffer_budget(&self) -> u64 {
        self.super_chunk_buffer_budget
    }

    /// Set the [super chunk buffer budget](#super-chunk-buffer-budget) configuration.
    pub fn set_super_chunk_buffer_budget(&mut self, super_chunk_buffer_budget: u64) {
        self.super_chunk_buffer_budget = super_chunk_buffer_budget;
    }

    /// Get the [poll timeout](#poll-timeout) configuration in milliseconds.
    #[must_use]
    pub fn poll_timeout_ms(&self) -> u64 {
        self.poll_timeout_ms
    }

    /// Set the [poll timeout](#poll-timeout) configuration in milliseconds.
    pub fn set_poll_timeout_ms(&mut self, poll_timeout_ms: u64) {
        self.poll_timeout_ms = poll_timeout_ms;
    }

    /// Get the [validate checksums](#validate-checksums) configuration.
    #[must_use]
    pub fn validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    /// Set the [validate checksums](#validate-checksums) configuration.
    pub fn set_validate_checksums(&mut self, validate_checksums: bool) {
        self.validate_checksums = validate_checksums;
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Returns a reference to the global chunkweave configuration.
///
/// Holding the guard while calling [`global_config_mut`] on the same thread deadlocks.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default())).read()
}

/// Returns a mutable reference to the global chunkweave configuration.
///
/// Holding the guard while calling [`global_config`] on the same thread deadlocks.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default())).write()
}
