//! `chunkweave` is a Rust library for reconstructing multidimensional arrays from chunks stored as byte ranges of local or remote objects.
//!
//! An array is described by a chunk manifest: one [`ChunkDescriptor`](chunk::ChunkDescriptor) per stored chunk,
//! giving the object holding it, its byte range and the element coordinates of its origin.
//! `chunkweave` fetches the chunks a request needs, decodes them and scatters their elements into one dense, row-major buffer.
//!
//! ## Features
//! - Full reads and strided [hyperslab](hyperslab::Hyperslab) reads of contiguous, chunked and linked block layouts.
//! - Batching of byte adjacent chunks into single transfers, and bounded batching across small gaps for sparse layouts.
//! - Concurrent transfers bounded by a [`SchedulerContext`](scheduler::SchedulerContext) shared by every reader in a process.
//! - Large contiguous reads split into parallel sub-range transfers.
//! - `deflate`, `shuffle` and `fletcher32` [filters](filter).
//! - Fill values, byte order conversion and direct IO (undecoded chunk bytes).
//!
//! ## Crate Features
//! - `filesystem` (default): re-export `chunkweave_filesystem` as [`chunkweave::filesystem`](crate::filesystem).
//! - `http`: re-export `chunkweave_http` as `chunkweave::http`.
//!
//! ## Example
//! ```rust
//! # use std::sync::Arc;
//! use chunkweave::{
//!     ReadOptions,
//!     chunk::ChunkDescriptor,
//!     element::ElementType,
//!     hyperslab::Hyperslab,
//!     reconstructor::{ArrayReconstructor, ArrayVariable, StorageLayout},
//!     scheduler::SchedulerContext,
//!     storage::{SourceLocator, store::MemoryFetcher},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Two chunks of four bytes, stored back to back
//! let locator: SourceLocator = "array.bin".parse()?;
//! let fetcher = Arc::new(MemoryFetcher::new());
//! fetcher.set(&locator, (0u8..8).collect::<Vec<_>>());
//!
//! let mut variable = ArrayVariable::new(
//!     "v",
//!     ElementType::UInt8,
//!     vec![8],
//!     StorageLayout::Chunked { chunk_shape: vec![4] },
//! )
//! .with_chunks(vec![
//!     ChunkDescriptor::new(locator.clone(), 0, 4, vec![0]),
//!     ChunkDescriptor::new(locator, 4, 4, vec![4]),
//! ])
//! .with_hyperslab(Hyperslab::from_triples([(1, 3, 7)])?);
//!
//! let reconstructor = ArrayReconstructor::new(
//!     fetcher,
//!     Arc::new(SchedulerContext::default()),
//!     ReadOptions::default(),
//! );
//! reconstructor.read(&mut variable)?;
//! assert_eq!(variable.data(), Some([1u8, 4, 7].as_slice()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//! `chunkweave` logs through the [`log`] facade and installs no logger.
//! Strategy and batching decisions are logged at `debug`, per-chunk events at `trace`.
//!
//! ## Licence
//! `chunkweave` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod chunk;
pub mod config;
pub mod destination;
pub mod element;
pub mod filter;
pub mod hyperslab;
pub mod index_math;
pub mod planner;
pub mod reconstructor;
pub mod scheduler;
pub mod super_chunk;

mod error;
mod options;

pub use error::ReconstructError;
pub use options::ReadOptions;

#[cfg(feature = "filesystem")]
pub use chunkweave_filesystem as filesystem;
#[cfg(feature = "http")]
pub use chunkweave_http as http;
pub use chunkweave_storage as storage;
