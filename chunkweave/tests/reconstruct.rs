#![allow(missing_docs)]

use std::{
    error::Error,
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chunkweave::{
    ReadOptions, ReconstructError,
    chunk::ChunkDescriptor,
    destination::DisjointDestination,
    element::{ByteOrder, ElementType},
    filter::{FilterChain, FilterError, fletcher32, shuffle},
    hyperslab::Hyperslab,
    planner::{ChunkPlacement, insert_chunk, select_needed_chunks},
    reconstructor::{
        ArrayOutput, ArrayReconstructor, ArrayVariable, ManifestLoader, StorageLayout,
    },
    scheduler::SchedulerContext,
    storage::{
        ChunkFetcher, SourceLocator, StorageError,
        fetcher_adapter::{
            fault_injection::FaultInjectionAdapter, fetch_metrics::FetchMetricsAdapter,
        },
        store::MemoryFetcher,
    },
};
use flate2::{Compression, write::ZlibEncoder};
use unsafe_cell_slice::UnsafeCellSlice;

/// A linear congruential generator for reproducible random requests.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }

    fn hyperslab(&mut self, shape: &[u64]) -> Hyperslab {
        Hyperslab::from_triples(shape.iter().map(|&extent| {
            let start = self.below(extent);
            let stop = start + self.below(extent - start);
            (start, 1 + self.below(4), stop)
        }))
        .unwrap()
    }
}

fn context(max_workers: usize) -> Arc<SchedulerContext> {
    Arc::new(SchedulerContext::new(max_workers, Duration::from_millis(5)))
}

fn options() -> ReadOptions {
    ReadOptions::default()
        .with_use_transfer_threads(true)
        .with_use_compute_threads(true)
        .with_max_compute_threads(2)
        .with_use_buffer_chunk_heuristic(false)
        .with_validate_checksums(true)
}

fn value(row: u64, col: u64, shape: [u64; 2]) -> u16 {
    (row * shape[1] + col) as u16
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Big endian u16 chunks of a 2D array, stored in row-major chunk order with `gap` padding bytes after each.
///
/// Element `(r, c)` holds `r * shape[1] + c`. Overhanging elements hold `0xFFFF`.
struct ChunkedU16 {
    stored: Vec<u8>,
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkedU16 {
    fn new(
        locator: &SourceLocator,
        shape: [u64; 2],
        chunk_shape: [u64; 2],
        gap: usize,
        encode: impl Fn(Vec<u8>) -> Vec<u8>,
    ) -> Self {
        let mut stored = Vec::new();
        let mut chunks = Vec::new();
        for row0 in (0..shape[0]).step_by(chunk_shape[0] as usize) {
            for col0 in (0..shape[1]).step_by(chunk_shape[1] as usize) {
                let mut raw = Vec::new();
                for row in row0..row0 + chunk_shape[0] {
                    for col in col0..col0 + chunk_shape[1] {
                        let element = if row < shape[0] && col < shape[1] {
                            value(row, col, shape)
                        } else {
                            0xFFFF
                        };
                        raw.extend_from_slice(&element.to_be_bytes());
                    }
                }
                let encoded = encode(raw);
                chunks.push(
                    ChunkDescriptor::new(
                        locator.clone(),
                        stored.len() as u64,
                        encoded.len() as u64,
                        vec![row0, col0],
                    )
                    .with_byte_order(ByteOrder::Big),
                );
                stored.extend_from_slice(&encoded);
                stored.extend(std::iter::repeat_n(0xAA, gap));
            }
        }
        Self { stored, chunks }
    }

    fn variable(&self, shape: [u64; 2], chunk_shape: [u64; 2]) -> ArrayVariable {
        ArrayVariable::new(
            "chunked",
            ElementType::UInt16,
            shape.to_vec(),
            StorageLayout::Chunked {
                chunk_shape: chunk_shape.to_vec(),
            },
        )
        .with_byte_order(ByteOrder::Big)
        .with_chunks(self.chunks.clone())
    }
}

fn expected(shape: [u64; 2], request: Option<&Hyperslab>) -> Vec<u16> {
    let full = Hyperslab::full(&shape).unwrap();
    let request = request.unwrap_or(&full);
    let mut values = Vec::new();
    for row in (request[0].start()..=request[0].stop()).step_by(request[0].stride() as usize) {
        for col in (request[1].start()..=request[1].stop()).step_by(request[1].stride() as usize) {
            values.push(value(row, col, shape));
        }
    }
    values
}

fn as_u16(variable: &ArrayVariable) -> Vec<u16> {
    variable
        .data()
        .unwrap()
        .chunks_exact(2)
        .map(|bytes| u16::from_ne_bytes([bytes[0], bytes[1]]))
        .collect()
}

fn memory(locator: &SourceLocator, stored: Vec<u8>) -> Arc<MemoryFetcher> {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.set(locator, stored);
    fetcher
}

#[test]
fn chunked_unconstrained_with_overhang() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("chunked.h5")?;
    let (shape, chunk_shape) = ([5, 7], [2, 3]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 0, |raw| raw);
    let mut variable = fixture.variable(shape, chunk_shape);
    ArrayReconstructor::new(memory(&locator, fixture.stored), context(4), options())
        .read(&mut variable)?;
    assert!(variable.read_p());
    assert_eq!(as_u16(&variable), expected(shape, None));
    Ok(())
}

#[test]
fn chunked_constrained_strided() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("chunked.h5")?;
    let (shape, chunk_shape) = ([6, 9], [4, 4]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 0, |raw| raw);
    let fetcher = memory(&locator, fixture.stored.clone());
    let reconstructor = ArrayReconstructor::new(fetcher, context(4), options());

    let request = Hyperslab::from_triples([(1, 2, 5), (0, 3, 8)])?;
    let mut variable = fixture.variable(shape, chunk_shape).with_hyperslab(request.clone());
    reconstructor.read(&mut variable)?;
    assert_eq!(variable.output_shape(), vec![3, 3]);
    assert_eq!(as_u16(&variable), expected(shape, Some(&request)));
    assert_eq!(as_u16(&variable), vec![9, 12, 15, 27, 30, 33, 45, 48, 51]);

    let single = Hyperslab::from_triples([(4, 1, 4), (8, 1, 8)])?;
    variable.set_hyperslab(Some(single));
    reconstructor.read(&mut variable)?;
    assert_eq!(as_u16(&variable), vec![44]);
    Ok(())
}

#[test]
fn filtered_chunks() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("filtered.h5")?;
    let (shape, chunk_shape) = ([8, 8], [4, 4]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 0, |raw| {
        let mut encoded = deflate(&shuffle(&raw, 2).unwrap());
        let checksum = fletcher32(&encoded);
        encoded.extend_from_slice(&checksum.to_le_bytes());
        encoded
    });
    let filters = FilterChain::parse("shuffle deflate fletcher32")?;

    let request = Hyperslab::from_triples([(1, 3, 7), (2, 1, 6)])?;
    let mut variable = fixture
        .variable(shape, chunk_shape)
        .with_filters(filters.clone())
        .with_hyperslab(request.clone());
    ArrayReconstructor::new(memory(&locator, fixture.stored.clone()), context(4), options())
        .read(&mut variable)?;
    assert_eq!(as_u16(&variable), expected(shape, Some(&request)));

    // corrupt one byte of the first chunk
    let mut corrupted = fixture.stored.clone();
    corrupted[0] ^= 0xFF;
    let mut variable = fixture.variable(shape, chunk_shape).with_filters(filters);
    let err = ArrayReconstructor::new(memory(&locator, corrupted), context(4), options())
        .read(&mut variable)
        .unwrap_err();
    assert!(matches!(
        err,
        ReconstructError::FilterError(FilterError::Checksum { .. })
    ));
    assert!(!variable.read_p());
    assert!(variable.output().is_none());
    Ok(())
}

#[test]
fn fill_chunks_and_fill_value() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("fill.h5")?;
    let memory = memory(&locator, vec![1, 0, 2, 0, 3, 0, 4, 0]);
    let variable = || {
        ArrayVariable::new(
            "fill",
            ElementType::UInt16,
            vec![12],
            StorageLayout::Chunked {
                chunk_shape: vec![4],
            },
        )
        .with_byte_order(ByteOrder::Little)
    };

    // an explicit fill chunk and a missing chunk
    let mut sparse = variable()
        .with_fill_value(vec![0xFF, 0xFF])
        .with_chunks(vec![
            ChunkDescriptor::new(locator.clone(), 0, 8, vec![4]),
            ChunkDescriptor::new_fill(8, vec![8], vec![7, 0]),
        ]);
    ArrayReconstructor::new(memory.clone(), context(2), options()).read(&mut sparse)?;
    let elements: Vec<u16> = sparse
        .data()
        .unwrap()
        .chunks_exact(2)
        .map(|bytes| u16::from_ne_bytes([bytes[0], bytes[1]]))
        .collect();
    assert_eq!(elements, [[0xFFFF; 4], [1, 2, 3, 4], [7; 4]].concat());

    let mut undersized = variable()
        .with_fill_value(vec![1, 2, 3, 4, 5])
        .with_chunks(vec![ChunkDescriptor::new(locator, 0, 8, vec![0])]);
    assert!(matches!(
        ArrayReconstructor::new(memory, context(2), options()).read(&mut undersized),
        Err(ReconstructError::FillValueUndersizedError(_))
    ));
    Ok(())
}

#[test]
fn never_written_chunks_are_not_fetched() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("written.h5")?;
    let absent = SourceLocator::new("absent.h5")?;
    let fetcher = Arc::new(FetchMetricsAdapter::new(memory(&locator, vec![1, 2, 3, 4])));
    let reconstructor = ArrayReconstructor::new(fetcher.clone(), context(2), options());

    // the only chunk names an object that does not exist
    let mut contiguous =
        ArrayVariable::new("unwritten", ElementType::UInt8, vec![4], StorageLayout::Contiguous)
            .with_chunks(vec![
                ChunkDescriptor::new(absent.clone(), 0, 4, vec![0]).with_uses_fill_value(vec![9]),
            ]);
    reconstructor.read(&mut contiguous)?;
    assert_eq!(contiguous.data(), Some([9u8, 9, 9, 9].as_slice()));
    assert_eq!(fetcher.fetches(), 0);

    let mut chunked = ArrayVariable::new(
        "partly",
        ElementType::UInt8,
        vec![8],
        StorageLayout::Chunked {
            chunk_shape: vec![4],
        },
    )
    .with_chunks(vec![
        ChunkDescriptor::new(locator, 0, 4, vec![0]),
        ChunkDescriptor::new(absent, 4, 4, vec![4]).with_uses_fill_value(vec![9]),
    ]);
    reconstructor.read(&mut chunked)?;
    assert_eq!(chunked.data(), Some([1u8, 2, 3, 4, 9, 9, 9, 9].as_slice()));
    assert_eq!(fetcher.fetches(), 1);
    Ok(())
}

#[test]
fn chunks_override_the_array_byte_order() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("mixed.h5")?;
    // chunk 0 in the array order, chunk 1 little endian, chunk 2 explicitly big endian
    let stored = [
        [1u16, 2].map(u16::to_be_bytes).concat(),
        [3u16, 4].map(u16::to_le_bytes).concat(),
        [5u16, 6].map(u16::to_be_bytes).concat(),
    ]
    .concat();
    let reconstructor = ArrayReconstructor::new(memory(&locator, stored), context(2), options());
    let chunks = vec![
        ChunkDescriptor::new(locator.clone(), 0, 4, vec![0]),
        ChunkDescriptor::new(locator.clone(), 4, 4, vec![2]).with_byte_order(ByteOrder::Little),
        ChunkDescriptor::new(locator.clone(), 8, 4, vec![4]).with_byte_order(ByteOrder::Big),
    ];
    let mut variable = ArrayVariable::new(
        "mixed",
        ElementType::UInt16,
        vec![6],
        StorageLayout::Chunked {
            chunk_shape: vec![2],
        },
    )
    .with_byte_order(ByteOrder::Big)
    .with_chunks(chunks);
    reconstructor.read(&mut variable)?;
    assert_eq!(as_u16(&variable), vec![1, 2, 3, 4, 5, 6]);

    variable.set_hyperslab(Some(Hyperslab::from_triples([(1, 2, 5)])?));
    reconstructor.read(&mut variable)?;
    assert_eq!(as_u16(&variable), vec![2, 4, 6]);

    // a contiguous chunk stored little endian in a big endian array
    let mut contiguous =
        ArrayVariable::new("le", ElementType::UInt16, vec![2], StorageLayout::Contiguous)
            .with_byte_order(ByteOrder::Big)
            .with_chunks(vec![
                ChunkDescriptor::new(locator, 4, 4, vec![0]).with_byte_order(ByteOrder::Little),
            ]);
    reconstructor.read(&mut contiguous)?;
    assert_eq!(as_u16(&contiguous), vec![3, 4]);
    Ok(())
}

#[test]
fn direct_io() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("direct.h5")?;
    let (shape, chunk_shape) = ([4, 4], [2, 4]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 3, |raw| deflate(&raw));
    let fetcher = memory(&locator, fixture.stored.clone());
    let reconstructor = ArrayReconstructor::new(fetcher, context(4), options());
    let filters = FilterChain::parse("deflate")?;

    let mut variable = fixture
        .variable(shape, chunk_shape)
        .with_filters(filters.clone())
        .with_direct_io(true);
    reconstructor.read(&mut variable)?;
    let Some(ArrayOutput::DirectIo(chunks)) = variable.output() else {
        panic!("expected direct IO output");
    };
    assert_eq!(chunks.len(), 2);
    for (chunk, descriptor) in chunks.iter().zip(&fixture.chunks) {
        assert_eq!(chunk.position_in_array, descriptor.position_in_array);
        assert_eq!(chunk.byte_offset, descriptor.byte_offset);
        let range = descriptor.byte_range().to_range_usize();
        assert_eq!(chunk.bytes, fixture.stored[range]);
    }

    // constrained direct IO decodes
    let request = Hyperslab::from_triples([(1, 1, 2), (0, 2, 3)])?;
    variable.set_hyperslab(Some(request.clone()));
    reconstructor.read(&mut variable)?;
    assert_eq!(as_u16(&variable), expected(shape, Some(&request)));

    // one contiguous chunk
    let mut contiguous =
        ArrayVariable::new("one", ElementType::UInt8, vec![3], StorageLayout::Contiguous)
            .with_filters(filters)
            .with_direct_io(true)
            .with_chunks(vec![fixture.chunks[1].clone()]);
    reconstructor.read(&mut contiguous)?;
    let Some(ArrayOutput::DirectIo(chunks)) = contiguous.output() else {
        panic!("expected direct IO output");
    };
    assert_eq!(chunks.len(), 1);
    let range = fixture.chunks[1].byte_range().to_range_usize();
    assert_eq!(chunks[0].bytes, fixture.stored[range]);
    Ok(())
}

#[test]
fn direct_io_keeps_structures_opaque() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("compound.h5")?;
    let stored: Vec<u8> = (0u8..48).collect();
    let reconstructor =
        ArrayReconstructor::new(memory(&locator, stored.clone()), context(2), options());
    let variable = |layout: StorageLayout, chunks: Vec<ChunkDescriptor>| {
        ArrayVariable::new("compound", ElementType::Structure(12), vec![4], layout)
            .with_direct_io(true)
            .with_chunks(chunks)
    };

    let mut contiguous = variable(
        StorageLayout::Contiguous,
        vec![ChunkDescriptor::new(locator.clone(), 0, 48, vec![0])],
    );
    reconstructor.read(&mut contiguous)?;
    let Some(ArrayOutput::DirectIo(chunks)) = contiguous.output() else {
        panic!("expected direct IO output");
    };
    assert_eq!(chunks[0].bytes, stored);

    let mut chunked = variable(
        StorageLayout::Chunked {
            chunk_shape: vec![2],
        },
        vec![
            ChunkDescriptor::new(locator.clone(), 0, 24, vec![0]),
            ChunkDescriptor::new(locator.clone(), 24, 24, vec![2]),
        ],
    );
    reconstructor.read(&mut chunked)?;
    let Some(ArrayOutput::DirectIo(chunks)) = chunked.output() else {
        panic!("expected direct IO output");
    };
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].bytes, stored[24..]);

    // decoding a structure is still unsupported
    let mut constrained = variable(
        StorageLayout::Contiguous,
        vec![ChunkDescriptor::new(locator, 0, 48, vec![0])],
    )
    .with_hyperslab(Hyperslab::from_triples([(1, 1, 2)])?);
    assert!(matches!(
        reconstructor.read(&mut constrained),
        Err(ReconstructError::UnsupportedLayout(_))
    ));
    assert!(!constrained.read_p());
    Ok(())
}

#[test]
fn contiguous_constrained() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("contiguous.h5")?;
    let stored: Vec<u8> = (0u8..24).collect();
    let encoded = deflate(&stored);
    let chunk = ChunkDescriptor::new(locator.clone(), 0, encoded.len() as u64, vec![0, 0, 0]);
    let mut variable =
        ArrayVariable::new("c", ElementType::UInt8, vec![2, 3, 4], StorageLayout::Contiguous)
            .with_filters(FilterChain::parse("deflate")?)
            .with_chunks(vec![chunk])
            .with_hyperslab(Hyperslab::from_triples([(1, 1, 1), (0, 2, 2), (1, 2, 3)])?);
    ArrayReconstructor::new(memory(&locator, encoded), context(2), options()).read(&mut variable)?;
    assert_eq!(variable.data(), Some([13u8, 15, 21, 23].as_slice()));
    Ok(())
}

#[test]
fn linked_blocks() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("linked.hdf")?;
    let decoded: Vec<u8> = (0u8..60).collect();
    let encoded = deflate(&decoded);
    let third = encoded.len() / 3;
    let blocks = [&encoded[..third], &encoded[third..2 * third], &encoded[2 * third..]];

    // stored in file order 2, 0, 1 with gaps
    let mut stored = Vec::new();
    let mut descriptors = Vec::new();
    for index in [2usize, 0, 1] {
        stored.extend_from_slice(&[0xEE; 5]);
        let (offset, size) = (stored.len() as u64, blocks[index].len() as u64);
        descriptors.push(
            ChunkDescriptor::new(locator.clone(), offset, size, vec![0, 0])
                .with_linked_block_index(index as u32),
        );
        stored.extend_from_slice(blocks[index]);
    }
    let fetcher = memory(&locator, stored);
    let reconstructor = ArrayReconstructor::new(fetcher, context(4), options());
    let variable = || {
        ArrayVariable::new("linked", ElementType::UInt8, vec![6, 10], StorageLayout::LinkedBlocks)
            .with_filters(FilterChain::parse("deflate").unwrap())
            .with_chunks(descriptors.clone())
    };

    let mut full = variable();
    reconstructor.read(&mut full)?;
    assert_eq!(full.data(), Some(decoded.as_slice()));

    let mut constrained =
        variable().with_hyperslab(Hyperslab::from_triples([(1, 4, 5), (7, 1, 9)])?);
    reconstructor.read(&mut constrained)?;
    assert_eq!(constrained.data(), Some([17u8, 18, 19, 57, 58, 59].as_slice()));
    Ok(())
}

#[test]
fn bounded_batching_reduces_transfers() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("sparse.h5")?;
    let (shape, chunk_shape) = ([8, 8], [2, 2]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 4, |raw| raw);
    let memory = memory(&locator, fixture.stored.clone());

    let read = |options: ReadOptions| -> Result<(ArrayVariable, usize, usize), ReconstructError> {
        let fetcher = Arc::new(FetchMetricsAdapter::new(memory.clone()));
        let mut variable = fixture.variable(shape, chunk_shape);
        ArrayReconstructor::new(fetcher.clone(), context(4), options).read(&mut variable)?;
        Ok((variable, fetcher.fetches(), fetcher.bytes_read()))
    };

    let (contiguous, contiguous_fetches, contiguous_bytes) = read(options())?;
    assert_eq!(contiguous_fetches, 16);
    assert_eq!(contiguous_bytes, 16 * 8);

    let bounded_options = options()
        .with_use_buffer_chunk_heuristic(true)
        .with_super_chunk_buffer_budget(4 * 12);
    let (bounded, bounded_fetches, bounded_bytes) = read(bounded_options)?;
    // each buffer spans four chunks and the three gaps between them
    assert_eq!(bounded_fetches, 4);
    assert_eq!(bounded_bytes, 4 * (4 * 8 + 3 * 4));
    assert_eq!(bounded.data(), contiguous.data());
    assert_eq!(as_u16(&bounded), expected(shape, None));
    Ok(())
}

#[derive(Default)]
struct CountingLoader {
    chunks: Vec<ChunkDescriptor>,
    loads: AtomicUsize,
}

impl ManifestLoader for CountingLoader {
    fn load_chunks(&self, variable_name: &str) -> Result<Vec<ChunkDescriptor>, ReconstructError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if variable_name == "missing" {
            return Err(ReconstructError::ManifestError(format!("no manifest for {variable_name}")));
        }
        Ok(self.chunks.clone())
    }
}

#[test]
fn manifest_loaded_on_first_read() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("manifest.h5")?;
    let (shape, chunk_shape) = ([4, 4], [2, 2]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 0, |raw| raw);
    let loader = Arc::new(CountingLoader {
        chunks: fixture.chunks.clone(),
        ..Default::default()
    });
    let fetcher = memory(&locator, fixture.stored.clone());
    let reconstructor = ArrayReconstructor::new(fetcher, context(2), options());

    let mut variable = ArrayVariable::new(
        "v",
        ElementType::UInt16,
        shape.to_vec(),
        StorageLayout::Chunked {
            chunk_shape: chunk_shape.to_vec(),
        },
    )
    .with_byte_order(ByteOrder::Big)
    .with_manifest_loader(loader.clone());
    reconstructor.read(&mut variable)?;
    reconstructor.read(&mut variable)?;
    variable.set_hyperslab(Some(Hyperslab::from_triples([(0, 1, 1), (0, 1, 3)])?));
    reconstructor.read(&mut variable)?;
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(variable.chunks().len(), 4);
    assert_eq!(as_u16(&variable), vec![0, 1, 2, 3, 4, 5, 6, 7]);

    let mut missing =
        ArrayVariable::new("missing", ElementType::UInt8, vec![4], StorageLayout::Contiguous)
            .with_manifest_loader(loader);
    assert!(matches!(
        reconstructor.read(&mut missing),
        Err(ReconstructError::ManifestError(_))
    ));
    assert!(!missing.read_p());
    Ok(())
}

#[test]
fn transfer_failure_aborts_read() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("failing.h5")?;
    let (shape, chunk_shape) = ([8, 8], [2, 2]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 1, |raw| raw);
    let failing_offset = fixture.chunks[5].byte_offset;
    let fetcher = Arc::new(
        FaultInjectionAdapter::new(memory(&locator, fixture.stored.clone()))
            .with_latency(Duration::from_millis(2))
            .with_failure(move |_, byte_range| byte_range.offset() == failing_offset),
    );
    let context = context(3);
    let reconstructor = ArrayReconstructor::new(fetcher, context.clone(), options());

    let mut variable = fixture.variable(shape, chunk_shape);
    let err = reconstructor.read(&mut variable).unwrap_err();
    assert!(matches!(err, ReconstructError::StorageError(StorageError::Other(_))));
    assert!(!variable.read_p());
    assert!(variable.output().is_none());
    assert_eq!(context.active_workers(), 0);

    // a request avoiding the failing chunk still succeeds
    let request = Hyperslab::from_triples([(4, 1, 7), (0, 1, 7)])?;
    variable.set_hyperslab(Some(request.clone()));
    reconstructor.read(&mut variable)?;
    assert_eq!(as_u16(&variable), expected(shape, Some(&request)));
    Ok(())
}

#[test]
fn short_read_is_reported() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("short.h5")?;
    let mut variable =
        ArrayVariable::new("s", ElementType::UInt8, vec![16], StorageLayout::Contiguous)
            .with_chunks(vec![ChunkDescriptor::new(locator.clone(), 0, 16, vec![0])]);
    let err = ArrayReconstructor::new(memory(&locator, vec![0; 10]), context(2), options())
        .read(&mut variable)
        .unwrap_err();
    assert!(matches!(err, ReconstructError::StorageError(StorageError::ShortRead { .. })));
    Ok(())
}

#[test]
fn unsupported_element_types() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("strings.h5")?;
    let reconstructor =
        ArrayReconstructor::new(memory(&locator, vec![0; 8]), context(2), options());
    let variable = |element_type: ElementType| {
        ArrayVariable::new("s", element_type, vec![1], StorageLayout::Contiguous)
            .with_chunks(vec![ChunkDescriptor::new(locator.clone(), 0, 8, vec![0])])
    };
    for element_type in [ElementType::VariableString, ElementType::Structure(8)] {
        assert!(matches!(
            reconstructor.read(&mut variable(element_type)),
            Err(ReconstructError::UnsupportedLayout(_))
        ));
    }
    // variable length strings have no width to keep undecoded either
    assert!(matches!(
        reconstructor.read(&mut variable(ElementType::VariableString).with_direct_io(true)),
        Err(ReconstructError::UnsupportedLayout(_))
    ));
    Ok(())
}

/// Every selected destination element is written by exactly one chunk.
#[test]
fn disjoint_scatter_coverage() -> Result<(), Box<dyn Error>> {
    let shape = [13u64, 7, 10];
    let chunk_shape = [4u64, 3, 5];
    let mut origins = Vec::new();
    for i in (0..shape[0]).step_by(4) {
        for j in (0..shape[1]).step_by(3) {
            for k in (0..shape[2]).step_by(5) {
                origins.push(vec![i, j, k]);
            }
        }
    }
    let ones = vec![1u8; 4 * 3 * 5];
    let mut lcg = Lcg(7);
    for _ in 0..200 {
        let request = lcg.hyperslab(&shape);
        let output_shape = request.constrained_shape();
        let len = output_shape.iter().product::<u64>() as usize;
        let needed = select_needed_chunks(
            origins.iter().map(|origin| ChunkPlacement::new(origin, &chunk_shape)),
            &request,
        )?;
        let mut coverage = vec![0u8; len];
        for &index in &needed {
            let mut written = vec![0u8; len];
            let destination = unsafe {
                DisjointDestination::new(UnsafeCellSlice::new(&mut written), 1, &output_shape)
            }?;
            let placement = ChunkPlacement::new(&origins[index], &chunk_shape);
            insert_chunk(placement, &ones, &request, &destination)?;
            assert!(
                written.iter().any(|&byte| byte == 1),
                "needed chunk {index} wrote nothing for {request:?}"
            );
            for (count, byte) in coverage.iter_mut().zip(&written) {
                *count += byte;
            }
        }
        assert!(
            coverage.iter().all(|&count| count == 1),
            "coverage of {request:?}: {coverage:?}"
        );
    }
    Ok(())
}

/// Serial and concurrent transfers produce identical output.
#[test]
fn serial_concurrent_equivalence() -> Result<(), Box<dyn Error>> {
    let locator = SourceLocator::new("equivalence.h5")?;
    let (shape, chunk_shape) = ([20, 30], [3, 7]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 2, |raw| deflate(&raw));
    let fetcher: Arc<dyn ChunkFetcher> = Arc::new(
        FaultInjectionAdapter::new(memory(&locator, fixture.stored.clone()))
            .with_latency(Duration::from_millis(1)),
    );
    let serial = ArrayReconstructor::new(
        fetcher.clone(),
        context(1),
        options().with_use_transfer_threads(false).with_use_compute_threads(false),
    );
    let concurrent = ArrayReconstructor::new(
        fetcher,
        context(4),
        options().with_use_buffer_chunk_heuristic(true),
    );

    let mut lcg = Lcg(42);
    for _ in 0..10 {
        let request = lcg.hyperslab(&shape);
        let read = |reconstructor: &ArrayReconstructor| -> Result<Vec<u8>, ReconstructError> {
            let mut variable = fixture
                .variable(shape, chunk_shape)
                .with_filters(FilterChain::parse("deflate").unwrap())
                .with_hyperslab(request.clone());
            reconstructor.read(&mut variable)?;
            Ok(variable.data().unwrap().to_vec())
        };
        let serial_bytes = read(&serial)?;
        assert_eq!(serial_bytes, read(&concurrent)?, "{request:?}");
        let values: Vec<u16> = serial_bytes
            .chunks_exact(2)
            .map(|bytes| u16::from_ne_bytes([bytes[0], bytes[1]]))
            .collect();
        assert_eq!(values, expected(shape, Some(&request)));
    }
    Ok(())
}

#[test]
fn filesystem_fetcher() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("array.bin");
    let locator = SourceLocator::File(path.clone());
    let (shape, chunk_shape) = ([6, 6], [3, 3]);
    let fixture = ChunkedU16::new(&locator, shape, chunk_shape, 0, |raw| deflate(&raw));
    std::fs::write(&path, &fixture.stored)?;

    let fetcher = Arc::new(chunkweave_filesystem::FilesystemFetcher::new());
    let request = Hyperslab::from_triples([(1, 2, 5), (2, 1, 4)])?;
    let mut variable = fixture
        .variable(shape, chunk_shape)
        .with_filters(FilterChain::parse("deflate")?)
        .with_hyperslab(request.clone());
    ArrayReconstructor::new(fetcher, context(4), options()).read(&mut variable)?;
    assert_eq!(as_u16(&variable), expected(shape, Some(&request)));
    Ok(())
}
