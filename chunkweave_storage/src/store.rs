//! Fetchers included with [`chunkweave_storage`](crate).

mod memory_fetcher;

pub use memory_fetcher::MemoryFetcher;
