//! A local file chunk fetcher for the [`chunkweave`](https://docs.rs/chunkweave/latest/chunkweave/index.html) crate.
//!
//! [`FilesystemFetcher`] serves [`SourceLocator::File`] byte ranges with positional reads,
//! so concurrent transfer threads can read different ranges of one file without a seek lock.
//! Open file handles are kept in a bounded least recently used cache.
//!
//! ## Licence
//! `chunkweave_filesystem` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.

use chunkweave_storage::{byte_range::ByteRange, Bytes, ChunkFetcher, SourceLocator, StorageError};

use bytes::BytesMut;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use std::{
    fs::File,
    io::ErrorKind,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The default number of open file handles kept by a [`FilesystemFetcher`].
pub const DEFAULT_FILE_HANDLE_CAPACITY: usize = 64;

/// Options for use with [`FilesystemFetcher`]
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct FilesystemFetcherOptions {
    base_path: Option<PathBuf>,
    cache_file_handles: bool,
    file_handle_capacity: NonZeroUsize,
}

impl Default for FilesystemFetcherOptions {
    fn default() -> Self {
        Self {
            base_path: None,
            cache_file_handles: true,
            file_handle_capacity: NonZeroUsize::new(DEFAULT_FILE_HANDLE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl FilesystemFetcherOptions {
    /// Set the directory that relative locator paths are resolved against.
    pub fn base_path(&mut self, base_path: impl Into<PathBuf>) -> &mut Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Set whether open file handles are kept for reuse across fetches.
    pub fn cache_file_handles(&mut self, cache_file_handles: bool) -> &mut Self {
        self.cache_file_handles = cache_file_handles;
        self
    }

    /// Set the maximum number of open file handles kept for reuse.
    ///
    /// The least recently used handle is closed when the cache is full.
    pub fn file_handle_capacity(&mut self, file_handle_capacity: NonZeroUsize) -> &mut Self {
        self.file_handle_capacity = file_handle_capacity;
        self
    }
}

/// A synchronous local file fetcher.
#[derive(Debug)]
pub struct FilesystemFetcher {
    options: FilesystemFetcherOptions,
    files: Mutex<LruCache<PathBuf, Arc<File>>>,
}

impl Default for FilesystemFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemFetcher {
    /// Create a new filesystem fetcher that resolves relative paths against the working directory.
    #[must_use]
    pub fn new() -> Self {
        let options = FilesystemFetcherOptions::default();
        Self {
            files: Mutex::new(LruCache::new(options.file_handle_capacity)),
            options,
        }
    }

    /// Create a new filesystem fetcher with `options`.
    ///
    /// # Errors
    /// Returns a [`FilesystemFetcherCreateError`] if the base path:
    ///   - is not valid, or
    ///   - does not point to an existing directory.
    pub fn new_with_options(
        options: FilesystemFetcherOptions,
    ) -> Result<Self, FilesystemFetcherCreateError> {
        if let Some(base_path) = &options.base_path {
            if base_path.to_str().is_none() {
                return Err(FilesystemFetcherCreateError::InvalidBasePath(
                    base_path.clone(),
                ));
            }
            let md = std::fs::metadata(base_path)?;
            if !md.is_dir() {
                return Err(FilesystemFetcherCreateError::InvalidBasePath(
                    base_path.clone(),
                ));
            }
        }
        Ok(Self {
            files: Mutex::new(LruCache::new(options.file_handle_capacity)),
            options,
        })
    }

    /// Maps a [`SourceLocator`] to a filesystem [`PathBuf`].
    ///
    /// # Errors
    /// Returns [`StorageError::Unsupported`] if `locator` is not a file locator.
    pub fn locator_to_fspath(&self, locator: &SourceLocator) -> Result<PathBuf, StorageError> {
        let path = locator.as_path().ok_or_else(|| {
            StorageError::Unsupported(format!(
                "the filesystem fetcher cannot fetch remote object {locator}"
            ))
        })?;
        Ok(match &self.options.base_path {
            Some(base_path) if path.is_relative() => base_path.join(path),
            _ => path.to_path_buf(),
        })
    }

    /// Returns the number of open file handles held for reuse.
    #[must_use]
    pub fn cached_file_handles(&self) -> usize {
        self.files.lock().len()
    }

    /// Returns true if a handle to the file of `locator` is held for reuse.
    #[must_use]
    pub fn is_file_handle_cached(&self, locator: &SourceLocator) -> bool {
        self.locator_to_fspath(locator)
            .is_ok_and(|path| self.files.lock().contains(&path))
    }

    /// Close every cached file handle.
    ///
    /// Handles still in use by an in-flight fetch are closed when that fetch completes.
    pub fn clear_file_handle_cache(&self) {
        let mut files = self.files.lock();
        log::debug!("closing {} cached file handles", files.len());
        files.clear();
    }

    fn open(&self, locator: &SourceLocator) -> Result<Option<Arc<File>>, StorageError> {
        let path = self.locator_to_fspath(locator)?;
        if self.options.cache_file_handles {
            if let Some(file) = self.files.lock().get(&path) {
                return Ok(Some(file.clone()));
            }
        }
        let file = match File::open(&path) {
            Ok(file) => Arc::new(file),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if self.options.cache_file_handles {
            let evicted = self.files.lock().push(path.clone(), file.clone());
            if let Some((evicted, _)) = evicted.filter(|(evicted, _)| *evicted != path) {
                log::trace!("closing the least recently used file handle {}", evicted.display());
            }
        }
        Ok(Some(file))
    }
}

/// Read up to `buf.len()` bytes at `offset`, stopping early only at end of file.
fn read_fully_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

impl ChunkFetcher for FilesystemFetcher {
    fn fetch(&self, locator: &SourceLocator, byte_range: ByteRange) -> Result<Bytes, StorageError> {
        let file = self
            .open(locator)?
            .ok_or_else(|| StorageError::NotFound(locator.clone()))?;
        let length = usize::try_from(byte_range.length())
            .map_err(|_| StorageError::Other(format!("byte range {byte_range} is too large")))?;
        let mut buf = BytesMut::zeroed(length);
        let got = read_fully_at(&file, &mut buf, byte_range.offset())?;
        if got < length {
            return Err(StorageError::ShortRead {
                locator: locator.clone(),
                byte_range,
                got: got as u64,
            });
        }
        log::trace!("read {byte_range} of {}", locator);
        Ok(buf.freeze())
    }

    fn size(&self, locator: &SourceLocator) -> Result<Option<u64>, StorageError> {
        let path = self.locator_to_fspath(locator)?;
        match std::fs::metadata(&path) {
            Ok(md) if md.is_file() => Ok(Some(md.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl FilesystemFetcher {
    /// Returns true if `path` resolves to an existing file.
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.locator_to_fspath(&SourceLocator::File(path.to_path_buf()))
            .is_ok_and(|path| path.is_file())
    }
}

/// A filesystem fetcher creation error.
#[derive(Debug, Error)]
pub enum FilesystemFetcherCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The path is not valid on this system.
    #[error("base path {0} is not valid")]
    InvalidBasePath(PathBuf),
}
