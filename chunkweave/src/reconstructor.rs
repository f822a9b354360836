//! Array reconstruction.
//!
//! An [`ArrayReconstructor`] materialises an [`ArrayVariable`] from the byte ranges listed in its chunk manifest.
//! Each [`read`](ArrayReconstructor::read) derives a [`ReadPlan`] from the variable and runs one of a small set of strategies.
//! Every strategy is assembled from the same steps:
//!  - select the needed chunks with the [`planner`](crate::planner),
//!  - group them into super-chunks with the [`super_chunk`](crate::super_chunk) batchers,
//!  - fetch the super-chunks through the [`scheduler`](crate::scheduler), and
//!  - decode and scatter each chunk into a [`DisjointDestination`].

use std::sync::Arc;

use chunkweave_storage::{
    ChunkFetcher, ReadableFetcher, byte_range::ByteRange, check_fetched_length,
};
use itertools::Itertools;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rayon_iter_concurrent_limit::iter_concurrent_limit;
use unsafe_cell_slice::UnsafeCellSlice;

use crate::{
    ReadOptions, ReconstructError,
    chunk::{Chunk, ChunkDescriptor, FillValueUndersizedError},
    destination::DisjointDestination,
    element::{ByteOrder, ElementType},
    filter::{FilterChain, FilterPipeline},
    hyperslab::Hyperslab,
    index_math::{ArrayIndices, ArrayShape, element_count},
    planner::{
        ChunkPlacement, PlannerError, insert_chunk, insert_chunk_unconstrained,
        select_needed_chunks,
    },
    scheduler::{SchedulerContext, TransferMode, TransferTask, run_batch},
    super_chunk::{
        SuperChunk, batch_bounded, batch_contiguous, compute_bounded_buffer_end_positions,
        prefers_bounded_batching,
    },
};

/// How the chunks of an array are laid out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLayout {
    /// The whole array is stored as a single chunk.
    Contiguous,
    /// The array is split into chunks of `chunk_shape` on a regular grid.
    Chunked {
        /// The shape of every chunk. Edge chunks may overhang the array.
        chunk_shape: ArrayShape,
    },
    /// The whole array is stored as one stream split across blocks, ordered by their linked block index.
    LinkedBlocks,
}

/// The stored bytes of one chunk, kept without decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectIoChunk {
    /// The element coordinates of the chunk origin.
    pub position_in_array: ArrayIndices,
    /// The byte offset of the chunk in its object.
    pub byte_offset: u64,
    /// The undecoded chunk bytes.
    pub bytes: Vec<u8>,
}

impl From<Chunk> for DirectIoChunk {
    fn from(mut chunk: Chunk) -> Self {
        let bytes = chunk.take_buffer();
        let descriptor = chunk.descriptor();
        Self {
            position_in_array: descriptor.position_in_array.clone(),
            byte_offset: descriptor.byte_offset,
            bytes,
        }
    }
}

/// The materialised data of an [`ArrayVariable`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrayOutput {
    /// Decoded elements in row-major order and host byte order.
    Dense(Vec<u8>),
    /// Undecoded chunks in manifest order.
    DirectIo(Vec<DirectIoChunk>),
}

/// Supplies the chunk manifest of a variable on first read.
pub trait ManifestLoader: Send + Sync {
    /// Load the chunk descriptors of the variable named `variable_name`.
    ///
    /// # Errors
    /// Returns a [`ReconstructError`], typically [`ReconstructError::ManifestError`], if the manifest is unavailable.
    fn load_chunks(&self, variable_name: &str) -> Result<Vec<ChunkDescriptor>, ReconstructError>;
}

/// An array to be reconstructed, and its data once read.
pub struct ArrayVariable {
    name: String,
    element_type: ElementType,
    shape: ArrayShape,
    layout: StorageLayout,
    filters: FilterChain,
    byte_order: ByteOrder,
    hyperslab: Option<Hyperslab>,
    chunks: Vec<ChunkDescriptor>,
    manifest_loaded: bool,
    manifest_loader: Option<Arc<dyn ManifestLoader>>,
    fill_value: Option<Vec<u8>>,
    direct_io: bool,
    output: Option<ArrayOutput>,
    read_p: bool,
}

impl std::fmt::Debug for ArrayVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayVariable")
            .field("name", &self.name)
            .field("element_type", &self.element_type)
            .field("shape", &self.shape)
            .field("layout", &self.layout)
            .field("filters", &self.filters)
            .field("byte_order", &self.byte_order)
            .field("hyperslab", &self.hyperslab)
            .field("chunks", &self.chunks.len())
            .field("direct_io", &self.direct_io)
            .field("read_p", &self.read_p)
            .finish_non_exhaustive()
    }
}

impl ArrayVariable {
    /// Create an unread variable with no chunks, no filters and host byte order.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        element_type: ElementType,
        shape: ArrayShape,
        layout: StorageLayout,
    ) -> Self {
        Self {
            name: name.into(),
            element_type,
            shape,
            layout,
            filters: FilterChain::default(),
            byte_order: ByteOrder::native(),
            hyperslab: None,
            chunks: Vec::new(),
            manifest_loaded: false,
            manifest_loader: None,
            fill_value: None,
            direct_io: false,
            output: None,
            read_p: false,
        }
    }

    /// Set the chunk descriptors. The manifest loader, if any, is then never consulted.
    #[must_use]
    pub fn with_chunks(mut self, chunks: Vec<ChunkDescriptor>) -> Self {
        self.chunks = chunks;
        self.manifest_loaded = true;
        self
    }

    /// Set the loader consulted for chunk descriptors on first read.
    #[must_use]
    pub fn with_manifest_loader(mut self, manifest_loader: Arc<dyn ManifestLoader>) -> Self {
        self.manifest_loader = Some(manifest_loader);
        self
    }

    /// Set the filters the writer applied, in the order they were applied.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    /// Set the byte order of the stored elements.
    #[must_use]
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Set the array fill value, in the stored byte order.
    ///
    /// Regions of the array that no chunk covers are filled with it.
    #[must_use]
    pub fn with_fill_value(mut self, fill_value: Vec<u8>) -> Self {
        self.fill_value = Some(fill_value);
        self
    }

    /// Keep the stored chunk bytes undecoded on unconstrained reads.
    #[must_use]
    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    /// Constrain reads to `hyperslab`.
    #[must_use]
    pub fn with_hyperslab(mut self, hyperslab: Hyperslab) -> Self {
        self.hyperslab = Some(hyperslab);
        self
    }

    /// Change the read constraint, discarding any data already read.
    pub fn set_hyperslab(&mut self, hyperslab: Option<Hyperslab>) {
        self.hyperslab = hyperslab;
        self.output = None;
        self.read_p = false;
    }

    /// The variable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The element type.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The full array shape.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The storage layout.
    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// The declared filters.
    #[must_use]
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// The stored byte order.
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// The read constraint.
    #[must_use]
    pub fn hyperslab(&self) -> Option<&Hyperslab> {
        self.hyperslab.as_ref()
    }

    /// The chunk descriptors.
    #[must_use]
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    /// The array fill value.
    #[must_use]
    pub fn fill_value(&self) -> Option<&[u8]> {
        self.fill_value.as_deref()
    }

    /// Returns true if direct IO is requested.
    #[must_use]
    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    /// Returns true once the variable has been read.
    #[must_use]
    pub fn read_p(&self) -> bool {
        self.read_p
    }

    /// The materialised data.
    #[must_use]
    pub fn output(&self) -> Option<&ArrayOutput> {
        self.output.as_ref()
    }

    /// The decoded elements, if the variable has been read without direct IO.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match &self.output {
            Some(ArrayOutput::Dense(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Take the materialised data. The variable is no longer marked as read.
    pub fn take_output(&mut self) -> Option<ArrayOutput> {
        self.read_p = false;
        self.output.take()
    }

    /// The shape of the dense output: the constrained shape if a hyperslab is set, otherwise the full shape.
    #[must_use]
    pub fn output_shape(&self) -> ArrayShape {
        self.hyperslab
            .as_ref()
            .map_or_else(|| self.shape.clone(), Hyperslab::constrained_shape)
    }

    fn load_manifest(&mut self) -> Result<(), ReconstructError> {
        if self.manifest_loaded {
            return Ok(());
        }
        if let Some(loader) = &self.manifest_loader {
            self.chunks = loader.load_chunks(&self.name)?;
            log::debug!("loaded {} chunk descriptors for {}", self.chunks.len(), self.name);
        }
        self.manifest_loaded = true;
        Ok(())
    }
}

/// The read strategy chosen for a variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Read the single chunk, split into parallel sub-range transfers when large, then decode.
    Contiguous,
    /// Read the single chunk without decoding.
    OneChunkDirectIo,
    /// Read every chunk without decoding.
    ChunksDirectIo,
    /// Read, decode and scatter every chunk into the full array.
    ChunksUnconstrained,
    /// Read, decode and scatter the chunks a hyperslab touches.
    ChunksConstrained,
    /// Concatenate the blocks, decode them and keep the whole array.
    LinkedBlocks,
    /// Concatenate the blocks, decode them and select a hyperslab.
    LinkedBlocksConstrained,
}

impl ReadStrategy {
    /// Returns true if the stored bytes are kept undecoded.
    #[must_use]
    pub fn is_direct_io(self) -> bool {
        matches!(self, Self::OneChunkDirectIo | Self::ChunksDirectIo)
    }
}

/// How a variable will be read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPlan {
    strategy: ReadStrategy,
    request: Option<Hyperslab>,
}

impl ReadPlan {
    /// Derive the plan for `variable`.
    ///
    /// A hyperslab selecting the whole array is treated as no constraint.
    /// Direct IO is only honoured for unconstrained reads of contiguous and chunked layouts.
    /// A chunked array with exactly one chunk is read like a contiguous one.
    ///
    /// # Errors
    /// Returns [`ReconstructError::InvalidHyperslabError`] if the hyperslab does not fit the array,
    /// or [`ReconstructError::UnsupportedLayout`] if a contiguous layout does not have exactly one chunk.
    pub fn new(variable: &ArrayVariable) -> Result<Self, ReconstructError> {
        let request = match &variable.hyperslab {
            Some(hyperslab) => {
                hyperslab.validate_against(&variable.shape)?;
                (!hyperslab.is_full(&variable.shape)).then(|| hyperslab.clone())
            }
            None => None,
        };
        let constrained = request.is_some();
        let direct_io = variable.direct_io && !constrained;
        if variable.direct_io && constrained {
            log::debug!(
                "{}: direct IO is not possible for a constrained read, decoding",
                variable.name
            );
        }
        let one_chunk = if direct_io {
            ReadStrategy::OneChunkDirectIo
        } else {
            ReadStrategy::Contiguous
        };
        let strategy = match &variable.layout {
            StorageLayout::Contiguous => {
                if variable.chunks.len() != 1 {
                    return Err(ReconstructError::UnsupportedLayout(format!(
                        "contiguous layout of {} requires one chunk, found {}",
                        variable.name,
                        variable.chunks.len()
                    )));
                }
                one_chunk
            }
            StorageLayout::Chunked { .. } if variable.chunks.len() == 1 => one_chunk,
            StorageLayout::Chunked { .. } if direct_io => ReadStrategy::ChunksDirectIo,
            StorageLayout::Chunked { .. } if constrained => ReadStrategy::ChunksConstrained,
            StorageLayout::Chunked { .. } => ReadStrategy::ChunksUnconstrained,
            StorageLayout::LinkedBlocks if constrained => ReadStrategy::LinkedBlocksConstrained,
            StorageLayout::LinkedBlocks => ReadStrategy::LinkedBlocks,
        };
        Ok(Self { strategy, request })
    }

    /// The chosen strategy.
    #[must_use]
    pub fn strategy(&self) -> ReadStrategy {
        self.strategy
    }

    /// The effective hyperslab, [`None`] for an unconstrained read.
    #[must_use]
    pub fn request(&self) -> Option<&Hyperslab> {
        self.request.as_ref()
    }

    /// Returns true if only part of the array is read.
    #[must_use]
    pub fn is_constrained(&self) -> bool {
        self.request.is_some()
    }
}

/// Reads array variables through a fetcher.
///
/// The [`SchedulerContext`] may be shared with other reconstructors so that their transfers are bounded together.
pub struct ArrayReconstructor {
    fetcher: ReadableFetcher,
    context: Arc<SchedulerContext>,
    options: ReadOptions,
}

impl std::fmt::Debug for ArrayReconstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayReconstructor")
            .field("context", &self.context)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ArrayReconstructor {
    /// Create a reconstructor.
    #[must_use]
    pub fn new(
        fetcher: ReadableFetcher,
        context: Arc<SchedulerContext>,
        options: ReadOptions,
    ) -> Self {
        Self {
            fetcher,
            context,
            options,
        }
    }

    /// The fetcher.
    #[must_use]
    pub fn fetcher(&self) -> &ReadableFetcher {
        &self.fetcher
    }

    /// The scheduler context.
    #[must_use]
    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.context
    }

    /// The read options.
    #[must_use]
    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// Read `variable`.
    ///
    /// The chunk manifest is loaded first if needed. Reading an already read variable does nothing,
    /// and an array with no elements reads as empty.
    /// On success the output of the variable is set and it is marked as read.
    /// On failure the variable is left unread and its previous output is untouched.
    ///
    /// Direct IO reads accept structure elements, which are kept as opaque bytes.
    ///
    /// # Errors
    /// Returns a [`ReconstructError`] if the manifest cannot be loaded, the layout or element type is unsupported,
    /// or any fetch, filter or scatter fails.
    pub fn read(&self, variable: &mut ArrayVariable) -> Result<(), ReconstructError> {
        variable.load_manifest()?;
        if variable.read_p {
            return Ok(());
        }
        if variable.shape.contains(&0) {
            variable.output = Some(ArrayOutput::Dense(Vec::new()));
            variable.read_p = true;
            return Ok(());
        }
        let plan = ReadPlan::new(variable)?;
        let element_size = if plan.strategy.is_direct_io() {
            variable.element_type.direct_io_size()?
        } else {
            variable.element_type.supported_size()?
        };
        log::debug!(
            "reading {} ({} chunks of {element_size} byte elements) with {:?}",
            variable.name,
            variable.chunks.len(),
            plan.strategy
        );

        let output = match (plan.strategy, &variable.layout) {
            (ReadStrategy::OneChunkDirectIo, _) => {
                let chunk = self.read_contiguous_chunk(only_chunk(variable)?)?;
                ArrayOutput::DirectIo(vec![chunk.into()])
            }
            (ReadStrategy::Contiguous, StorageLayout::Chunked { chunk_shape }) => {
                let bytes = self.read_chunked(variable, chunk_shape, plan.request(), element_size)?;
                ArrayOutput::Dense(bytes)
            }
            (ReadStrategy::Contiguous, _) => {
                let mut chunk = self.read_contiguous_chunk(only_chunk(variable)?)?;
                chunk.apply_filters(
                    &variable.filters,
                    element_count(&variable.shape),
                    element_size,
                    &self.options,
                )?;
                chunk.convert_byte_order(variable.element_type, variable.byte_order)?;
                let bytes = chunk.take_buffer();
                ArrayOutput::Dense(select_whole(variable, &bytes, plan.request(), element_size)?)
            }
            (ReadStrategy::ChunksDirectIo, _) => {
                ArrayOutput::DirectIo(self.read_chunks_direct_io(variable)?)
            }
            (
                ReadStrategy::ChunksUnconstrained | ReadStrategy::ChunksConstrained,
                StorageLayout::Chunked { chunk_shape },
            ) => {
                let bytes = self.read_chunked(variable, chunk_shape, plan.request(), element_size)?;
                ArrayOutput::Dense(bytes)
            }
            (ReadStrategy::ChunksUnconstrained | ReadStrategy::ChunksConstrained, _) => {
                return Err(ReconstructError::UnsupportedLayout(format!(
                    "{} is not chunked",
                    variable.name
                )));
            }
            (ReadStrategy::LinkedBlocks | ReadStrategy::LinkedBlocksConstrained, _) => {
                let bytes = self.read_linked_blocks(variable, element_size)?;
                ArrayOutput::Dense(select_whole(variable, &bytes, plan.request(), element_size)?)
            }
        };

        let output = match output {
            ArrayOutput::Dense(mut bytes) => {
                variable
                    .element_type
                    .swap_to_native(&mut bytes, variable.byte_order)?;
                ArrayOutput::Dense(bytes)
            }
            direct_io => direct_io,
        };
        variable.output = Some(output);
        variable.read_p = true;
        Ok(())
    }

    /// Read one chunk on its own, splitting large reads into parallel sub-range transfers.
    fn read_contiguous_chunk(
        &self,
        descriptor: &ChunkDescriptor,
    ) -> Result<Chunk, ReconstructError> {
        let mut chunk = Chunk::new(descriptor.clone());
        let children = self.contiguous_children(&chunk);
        if children < 2 {
            chunk.read_into(self.fetcher.as_ref())?;
            return Ok(chunk);
        }
        let Some(locator) = chunk.source_locator().cloned() else {
            chunk.read_into(self.fetcher.as_ref())?;
            return Ok(chunk);
        };

        let size = chunk.byte_size();
        log::debug!(
            "splitting contiguous read of {size} bytes from {locator} into {children} transfers"
        );
        let mut staging = vec![0u8; to_usize(size)?];
        {
            let fetcher: &dyn ChunkFetcher = self.fetcher.as_ref();
            let locator = &locator;
            let child_size = size / children;
            let mut rest: &mut [u8] = &mut staging;
            let mut tasks = Vec::with_capacity(to_usize(children)?);
            for index in 0..children {
                let offset = index * child_size;
                let length = if index + 1 == children {
                    size - offset
                } else {
                    child_size
                };
                let (target, tail) = std::mem::take(&mut rest).split_at_mut(to_usize(length)?);
                rest = tail;
                let byte_range =
                    ByteRange::from_offset_length(chunk.byte_offset() + offset, length);
                tasks.push(TransferTask::new(
                    format!("{locator}[{byte_range}]"),
                    move || {
                        let fetched = fetcher.fetch(locator, byte_range)?;
                        let bytes = check_fetched_length(locator, byte_range, fetched)?;
                        target.copy_from_slice(&bytes);
                        Ok(())
                    },
                ));
            }
            run_batch(&self.context, tasks, TransferMode::Concurrent)?;
        }
        chunk.set_read_buffer(staging)?;
        Ok(chunk)
    }

    /// The number of sub-range transfers for a contiguous chunk, `1` if it is read in one.
    fn contiguous_children(&self, chunk: &Chunk) -> u64 {
        let threshold = self.options.contiguous_concurrent_threshold();
        if !self.options.use_transfer_threads()
            || chunk.is_fill()
            || threshold == 0
            || chunk.byte_size() <= threshold
        {
            return 1;
        }
        (chunk.byte_size() / threshold).min(self.context.max_workers() as u64)
    }

    /// Group chunks into super-chunks, using bounded batching when enabled and the chunks are not one byte adjacent run.
    fn batch(&self, chunks: Vec<Chunk>) -> Result<Vec<SuperChunk>, ReconstructError> {
        if self.options.use_buffer_chunk_heuristic() && prefers_bounded_batching(&chunks) {
            let needed = vec![true; chunks.len()];
            let end_positions = compute_bounded_buffer_end_positions(
                &chunks,
                &needed,
                self.options.super_chunk_buffer_budget(),
            );
            Ok(batch_bounded(chunks, &end_positions)?)
        } else {
            Ok(batch_contiguous(chunks)?)
        }
    }

    /// Fetch every member of `batches`, one transfer task per super-chunk.
    fn fetch_batches(&self, batches: &mut [SuperChunk]) -> Result<(), ReconstructError> {
        let fetcher: &dyn ChunkFetcher = self.fetcher.as_ref();
        let tasks = batches
            .iter_mut()
            .map(|super_chunk| {
                TransferTask::new(super_chunk.to_string(), move || super_chunk.read_into(fetcher))
            })
            .collect_vec();
        let mode = TransferMode::select(self.options.use_transfer_threads(), tasks.len());
        run_batch(&self.context, tasks, mode)
    }

    fn read_chunks_direct_io(
        &self,
        variable: &ArrayVariable,
    ) -> Result<Vec<DirectIoChunk>, ReconstructError> {
        let chunks = variable.chunks.iter().cloned().map(Chunk::new).collect_vec();
        let mut batches = self.batch(chunks)?;
        self.fetch_batches(&mut batches)?;
        Ok(batches
            .into_iter()
            .flat_map(SuperChunk::into_chunks)
            .map(DirectIoChunk::from)
            .collect())
    }

    /// Concatenate and decode the blocks of a linked block array.
    ///
    /// The stream takes the byte order of its first block.
    fn read_linked_blocks(
        &self,
        variable: &ArrayVariable,
        element_size: usize,
    ) -> Result<Vec<u8>, ReconstructError> {
        let mut blocks = variable.chunks.iter().cloned().map(Chunk::new).collect_vec();
        blocks.sort_by_key(|block| block.descriptor().linked_block_index);
        let stored_order = blocks.first().and_then(|block| block.descriptor().byte_order);
        let mut batches = self.batch(blocks)?;
        self.fetch_batches(&mut batches)?;

        let mut encoded = Vec::new();
        for mut block in batches.into_iter().flat_map(SuperChunk::into_chunks) {
            encoded.append(&mut block.take_buffer());
        }
        log::debug!(
            "{}: concatenated {} linked blocks into {} bytes",
            variable.name,
            variable.chunks.len(),
            encoded.len()
        );
        let mut decoded = if variable.filters.is_identity() {
            encoded
        } else {
            variable.filters.decode(
                encoded,
                element_count(&variable.shape),
                element_size,
                &self.options,
            )?
        };
        if let Some(stored_order) = stored_order
            && stored_order != variable.byte_order
        {
            variable.element_type.swap_byte_order(&mut decoded)?;
        }
        Ok(decoded)
    }

    fn read_chunked(
        &self,
        variable: &ArrayVariable,
        chunk_shape: &[u64],
        request: Option<&Hyperslab>,
        element_size: usize,
    ) -> Result<Vec<u8>, ReconstructError> {
        let covered = validate_chunk_grid(&variable.shape, chunk_shape, &variable.chunks)?;
        let needed = match request {
            Some(request) => select_needed_chunks(
                variable
                    .chunks
                    .iter()
                    .map(|chunk| ChunkPlacement::new(&chunk.position_in_array, chunk_shape)),
                request,
            )?,
            None => (0..variable.chunks.len()).collect(),
        };
        log::debug!(
            "{}: {} of {} chunks needed",
            variable.name,
            needed.len(),
            variable.chunks.len()
        );

        let output_shape =
            request.map_or_else(|| variable.shape.clone(), Hyperslab::constrained_shape);
        let len = byte_len(&output_shape, element_size)?;
        let fill_value = if covered {
            None
        } else {
            variable.fill_value.as_deref()
        };
        let mut data = reserve_destination(len, fill_value)?;
        {
            // SAFETY: chunk positions are unique and on the chunk grid, so chunks write disjoint elements.
            let destination = unsafe {
                DisjointDestination::new(
                    UnsafeCellSlice::new(&mut data),
                    element_size,
                    &output_shape,
                )
            }?;
            let scatter = Scatter {
                fetcher: self.fetcher.as_ref(),
                filters: &variable.filters,
                options: self.options,
                element_type: variable.element_type,
                byte_order: variable.byte_order,
                chunk_shape,
                elements_per_chunk: element_count(chunk_shape),
                request,
                destination,
            };
            if let [index] = needed[..] {
                let chunk = self.read_contiguous_chunk(&variable.chunks[index])?;
                scatter.scatter_chunk(chunk)?;
            } else {
                let chunks = needed
                    .into_iter()
                    .map(|index| Chunk::new(variable.chunks[index].clone()))
                    .collect_vec();
                let tasks = self
                    .batch(chunks)?
                    .into_iter()
                    .map(|super_chunk| {
                        TransferTask::new(super_chunk.to_string(), move || {
                            scatter.run(super_chunk)
                        })
                    })
                    .collect_vec();
                let mode = TransferMode::select(self.options.use_transfer_threads(), tasks.len());
                run_batch(&self.context, tasks, mode)?;
            }
        }
        Ok(data)
    }
}

/// Everything a transfer task needs to decode and scatter the members of one super-chunk.
#[derive(Clone, Copy)]
struct Scatter<'a> {
    fetcher: &'a dyn ChunkFetcher,
    filters: &'a dyn FilterPipeline,
    options: ReadOptions,
    element_type: ElementType,
    byte_order: ByteOrder,
    chunk_shape: &'a [u64],
    elements_per_chunk: u64,
    request: Option<&'a Hyperslab>,
    destination: DisjointDestination<'a>,
}

impl Scatter<'_> {
    fn run(self, mut super_chunk: SuperChunk) -> Result<(), ReconstructError> {
        super_chunk.read_into(self.fetcher)?;
        let chunks = super_chunk.into_chunks();
        if self.options.use_compute_threads() && chunks.len() > 1 {
            iter_concurrent_limit!(
                self.options.max_compute_threads(),
                chunks,
                try_for_each,
                |chunk| self.scatter_chunk(chunk)
            )
        } else {
            chunks.into_iter().try_for_each(|chunk| self.scatter_chunk(chunk))
        }
    }

    fn scatter_chunk(&self, mut chunk: Chunk) -> Result<(), ReconstructError> {
        chunk.apply_filters(
            self.filters,
            self.elements_per_chunk,
            self.destination.element_size(),
            &self.options,
        )?;
        chunk.convert_byte_order(self.element_type, self.byte_order)?;
        let placement = ChunkPlacement::new(chunk.position_in_array(), self.chunk_shape);
        let bytes = chunk.raw_buffer();
        match self.request {
            Some(request) => insert_chunk(placement, bytes, request, &self.destination)?,
            None => insert_chunk_unconstrained(placement, bytes, &self.destination)?,
        }
        log::trace!("scattered {chunk}");
        Ok(())
    }
}

/// Decoded bytes of a whole array, reduced to `request` if given.
fn select_whole(
    variable: &ArrayVariable,
    bytes: &[u8],
    request: Option<&Hyperslab>,
    element_size: usize,
) -> Result<Vec<u8>, ReconstructError> {
    let expected = byte_len(&variable.shape, element_size)?;
    if bytes.len() < expected {
        return Err(PlannerError::ChunkBufferTooSmall {
            needed: expected,
            got: bytes.len(),
        }
        .into());
    }
    let Some(request) = request else {
        return Ok(bytes[..expected].to_vec());
    };
    let output_shape = request.constrained_shape();
    let mut data = vec![0; byte_len(&output_shape, element_size)?];
    let origin = vec![0; variable.shape.len()];
    // SAFETY: the view is the only writer of `data` and is dropped before `data` is returned.
    let destination = unsafe {
        DisjointDestination::new(UnsafeCellSlice::new(&mut data), element_size, &output_shape)
    }?;
    insert_chunk(
        ChunkPlacement::new(&origin, &variable.shape),
        bytes,
        request,
        &destination,
    )?;
    Ok(data)
}

/// Check that every chunk sits on its own cell of the chunk grid.
///
/// Returns true if the chunks cover every cell.
fn validate_chunk_grid(
    shape: &[u64],
    chunk_shape: &[u64],
    chunks: &[ChunkDescriptor],
) -> Result<bool, ReconstructError> {
    if chunk_shape.len() != shape.len() || chunk_shape.contains(&0) {
        return Err(ReconstructError::UnsupportedLayout(format!(
            "chunk shape {chunk_shape:?} does not fit array shape {shape:?}"
        )));
    }
    for chunk in chunks {
        let position = &chunk.position_in_array;
        let on_grid = position.len() == shape.len()
            && itertools::izip!(position, chunk_shape, shape)
                .all(|(&origin, &extent, &size)| origin % extent == 0 && origin < size);
        if !on_grid {
            return Err(ReconstructError::UnsupportedLayout(format!(
                "chunk at {position:?} is not on the {chunk_shape:?} chunk grid of array {shape:?}"
            )));
        }
    }
    if !chunks.iter().map(|chunk| &chunk.position_in_array).all_unique() {
        return Err(ReconstructError::UnsupportedLayout(
            "chunk positions are not unique".to_string(),
        ));
    }
    let grid_cells: u64 = shape
        .iter()
        .zip(chunk_shape)
        .map(|(&size, &extent)| size.div_ceil(extent))
        .product();
    Ok(chunks.len() as u64 == grid_cells)
}

/// The only chunk of a single chunk array.
fn only_chunk(variable: &ArrayVariable) -> Result<&ChunkDescriptor, ReconstructError> {
    match variable.chunks.as_slice() {
        [descriptor] => Ok(descriptor),
        chunks => Err(ReconstructError::UnsupportedLayout(format!(
            "{} requires one chunk, found {}",
            variable.name,
            chunks.len()
        ))),
    }
}

/// Allocate a destination of `len` bytes, tiled with `fill_value` or zeroed.
fn reserve_destination(
    len: usize,
    fill_value: Option<&[u8]>,
) -> Result<Vec<u8>, FillValueUndersizedError> {
    match fill_value {
        None => Ok(vec![0; len]),
        Some(fill_value) if !fill_value.is_empty() && len % fill_value.len() == 0 => {
            Ok(fill_value.repeat(len / fill_value.len()))
        }
        Some(fill_value) => Err(FillValueUndersizedError::new(fill_value.len(), len as u64)),
    }
}

/// The byte length of an array of `shape` with `element_size` byte elements.
fn byte_len(shape: &[u64], element_size: usize) -> Result<usize, ReconstructError> {
    shape
        .iter()
        .try_fold(1u64, |count, &extent| count.checked_mul(extent))
        .and_then(|count| usize::try_from(count).ok())
        .and_then(|count| count.checked_mul(element_size))
        .ok_or_else(|| {
            ReconstructError::UnsupportedLayout(format!(
                "{shape:?} elements of {element_size} bytes exceed the address space"
            ))
        })
}

fn to_usize(value: u64) -> Result<usize, ReconstructError> {
    usize::try_from(value).map_err(|_| {
        ReconstructError::UnsupportedLayout(format!("{value} exceeds the address space"))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chunkweave_storage::{SourceLocator, store::MemoryFetcher};

    use super::*;

    fn locator() -> SourceLocator {
        SourceLocator::File("array.bin".into())
    }

    fn reconstructor(fetcher: Arc<MemoryFetcher>, options: ReadOptions) -> ArrayReconstructor {
        ArrayReconstructor::new(
            fetcher,
            Arc::new(SchedulerContext::new(4, Duration::from_millis(5))),
            options,
        )
    }

    fn chunked(shape: ArrayShape, chunk_shape: ArrayShape) -> ArrayVariable {
        ArrayVariable::new(
            "v",
            ElementType::UInt8,
            shape,
            StorageLayout::Chunked { chunk_shape },
        )
    }

    #[test]
    fn plan_dispatch() {
        let chunk = ChunkDescriptor::new(locator(), 0, 4, vec![0]);
        let contiguous =
            ArrayVariable::new("v", ElementType::UInt8, vec![4], StorageLayout::Contiguous)
                .with_chunks(vec![chunk.clone()]);
        assert_eq!(
            ReadPlan::new(&contiguous).unwrap().strategy(),
            ReadStrategy::Contiguous
        );

        let direct_io = contiguous.with_direct_io(true);
        assert_eq!(
            ReadPlan::new(&direct_io).unwrap().strategy(),
            ReadStrategy::OneChunkDirectIo
        );
        let constrained = direct_io.with_hyperslab(Hyperslab::from_triples([(1, 1, 2)]).unwrap());
        let plan = ReadPlan::new(&constrained).unwrap();
        assert_eq!(plan.strategy(), ReadStrategy::Contiguous);
        assert!(plan.is_constrained());

        let full = chunked(vec![4], vec![2]).with_hyperslab(Hyperslab::full(&[4]).unwrap());
        let plan = ReadPlan::new(&full).unwrap();
        assert_eq!(plan.strategy(), ReadStrategy::ChunksUnconstrained);
        assert!(!plan.is_constrained());

        // one chunk on a grid reads like a contiguous array
        let one_chunk = chunked(vec![4], vec![4]).with_chunks(vec![chunk]);
        assert_eq!(
            ReadPlan::new(&one_chunk).unwrap().strategy(),
            ReadStrategy::Contiguous
        );
        let one_chunk = one_chunk.with_direct_io(true);
        let plan = ReadPlan::new(&one_chunk).unwrap();
        assert_eq!(plan.strategy(), ReadStrategy::OneChunkDirectIo);
        assert!(plan.strategy().is_direct_io());
        let constrained = one_chunk.with_hyperslab(Hyperslab::from_triples([(0, 2, 2)]).unwrap());
        assert_eq!(
            ReadPlan::new(&constrained).unwrap().strategy(),
            ReadStrategy::Contiguous
        );

        let linked =
            ArrayVariable::new("v", ElementType::UInt8, vec![4], StorageLayout::LinkedBlocks)
                .with_hyperslab(Hyperslab::from_triples([(0, 2, 2)]).unwrap());
        assert_eq!(
            ReadPlan::new(&linked).unwrap().strategy(),
            ReadStrategy::LinkedBlocksConstrained
        );

        let missing =
            ArrayVariable::new("v", ElementType::UInt8, vec![4], StorageLayout::Contiguous);
        assert!(matches!(
            ReadPlan::new(&missing),
            Err(ReconstructError::UnsupportedLayout(_))
        ));
        let oversized = chunked(vec![4], vec![2])
            .with_hyperslab(Hyperslab::from_triples([(0, 1, 4)]).unwrap());
        assert!(matches!(
            ReadPlan::new(&oversized),
            Err(ReconstructError::InvalidHyperslabError(_))
        ));
    }

    #[test]
    fn chunk_grid_validation() {
        let at = |position: Vec<u64>| ChunkDescriptor::new(locator(), 0, 4, position);
        let grid = [at(vec![0, 0]), at(vec![0, 2]), at(vec![2, 0]), at(vec![2, 2])];
        assert!(validate_chunk_grid(&[4, 4], &[2, 2], &grid).unwrap());
        assert!(!validate_chunk_grid(&[5], &[2], &[at(vec![0]), at(vec![2])]).unwrap());
        assert!(validate_chunk_grid(&[5], &[2], &[at(vec![0]), at(vec![1])]).is_err());
        assert!(validate_chunk_grid(&[4], &[2], &[at(vec![2]), at(vec![2])]).is_err());
        assert!(validate_chunk_grid(&[4], &[2], &[at(vec![4])]).is_err());
        assert!(validate_chunk_grid(&[4], &[2, 2], &[]).is_err());
    }

    #[test]
    fn destination_reservation() {
        assert_eq!(reserve_destination(4, None).unwrap(), vec![0; 4]);
        assert_eq!(reserve_destination(4, Some(&[1, 2])).unwrap(), vec![1, 2, 1, 2]);
        assert!(reserve_destination(5, Some(&[1, 2])).is_err());
        assert!(reserve_destination(4, Some(&[])).is_err());
    }

    #[test]
    fn destination_length_overflow() {
        assert_eq!(byte_len(&[3, 4], 8).unwrap(), 96);
        assert_eq!(byte_len(&[], 2).unwrap(), 2);
        assert!(matches!(
            byte_len(&[u64::MAX, 2], 1),
            Err(ReconstructError::UnsupportedLayout(_))
        ));
        assert!(matches!(
            byte_len(&[u64::MAX / 2], 4),
            Err(ReconstructError::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn huge_arrays_are_rejected_before_allocation() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.set(&locator(), vec![0u8; 4]);
        let reconstructor = reconstructor(fetcher, ReadOptions::default());
        let shape = vec![1 << 32, 1 << 32, 1 << 32];
        let mut variable = ArrayVariable::new(
            "v",
            ElementType::Float64,
            shape.clone(),
            StorageLayout::Chunked { chunk_shape: shape },
        )
        .with_chunks(vec![ChunkDescriptor::new(locator(), 0, 4, vec![0, 0, 0])]);
        assert!(matches!(
            reconstructor.read(&mut variable),
            Err(ReconstructError::UnsupportedLayout(_))
        ));
        assert!(!variable.read_p());
    }

    #[test]
    fn read_marks_variable_read() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.set(&locator(), vec![0u8, 1, 2, 3, 4, 5]);
        let reconstructor = reconstructor(fetcher.clone(), ReadOptions::default());
        let mut variable = chunked(vec![6], vec![3]).with_chunks(vec![
            ChunkDescriptor::new(locator(), 0, 3, vec![0]),
            ChunkDescriptor::new(locator(), 3, 3, vec![3]),
        ]);
        reconstructor.read(&mut variable).unwrap();
        assert!(variable.read_p());
        assert_eq!(variable.data(), Some([0u8, 1, 2, 3, 4, 5].as_slice()));

        // already read, the erased object is not fetched again
        fetcher.erase(&locator());
        reconstructor.read(&mut variable).unwrap();

        variable.set_hyperslab(Some(Hyperslab::from_triples([(1, 2, 5)]).unwrap()));
        assert!(!variable.read_p());
        assert!(reconstructor.read(&mut variable).is_err());
        assert!(!variable.read_p());
        assert!(variable.output().is_none());
    }

    #[test]
    fn uncovered_regions_use_fill_value() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.set(&locator(), vec![7u8, 7]);
        let reconstructor = reconstructor(fetcher, ReadOptions::default());
        let mut variable = chunked(vec![6], vec![2])
            .with_fill_value(vec![9])
            .with_chunks(vec![ChunkDescriptor::new(locator(), 0, 2, vec![2])]);
        reconstructor.read(&mut variable).unwrap();
        assert_eq!(variable.data(), Some([9u8, 9, 7, 7, 9, 9].as_slice()));
    }

    #[test]
    fn empty_array_reads_empty() {
        let reconstructor = reconstructor(Arc::new(MemoryFetcher::new()), ReadOptions::default());
        let mut variable = chunked(vec![0, 4], vec![2, 2]);
        reconstructor.read(&mut variable).unwrap();
        assert!(variable.read_p());
        assert_eq!(variable.data(), Some([].as_slice()));
    }
}
