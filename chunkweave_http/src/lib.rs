//! A synchronous HTTP chunk fetcher for the [`chunkweave`](https://docs.rs/chunkweave/latest/chunkweave/index.html) crate.
//!
//! [`HTTPFetcher`] serves [`SourceLocator::Url`] byte ranges with single-part HTTP range requests.
//! Authentication, URL signing and retries are left to the serving process.
//!
//! ## Licence
//! `chunkweave_http` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.

use std::str::FromStr;

use chunkweave_storage::{
    byte_range::ByteRange, check_fetched_length, Bytes, ChunkFetcher, SourceLocator, StorageError,
};
use reqwest::{
    header::{HeaderValue, CONTENT_LENGTH, RANGE},
    StatusCode,
};
use thiserror::Error;
use url::Url;

/// A synchronous HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HTTPFetcher {
    client: reqwest::blocking::Client,
}

impl HTTPFetcher {
    /// Create a new HTTP fetcher with a default client.
    ///
    /// # Errors
    /// Returns a [`HTTPFetcherCreateError`] if the HTTP client cannot be initialised.
    pub fn new() -> Result<Self, HTTPFetcherCreateError> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self { client })
    }

    /// Create a new HTTP fetcher from a preconfigured `client`.
    ///
    /// Use this to attach default headers, timeouts or proxies.
    #[must_use]
    pub fn new_with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }

    fn locator_to_url(locator: &SourceLocator) -> Result<&Url, StorageError> {
        match locator.as_url() {
            Some(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
            _ => Err(StorageError::Unsupported(format!(
                "the http fetcher cannot fetch {locator}"
            ))),
        }
    }
}

fn http_error(err: &reqwest::Error) -> StorageError {
    StorageError::Other(err.to_string())
}

/// Interpret the response to a single-part range request for `byte_range` of `locator`.
///
/// A `206 Partial Content` body is the requested range.
/// A `200 OK` body is the whole object, which is sliced to the requested range.
///
/// # Errors
/// Returns [`StorageError::NotFound`] for `404`, [`StorageError::ShortRead`] if the body is shorter than the range,
/// and [`StorageError::Other`] for any other status.
pub fn range_response_bytes(
    locator: &SourceLocator,
    byte_range: ByteRange,
    status: StatusCode,
    body: Bytes,
) -> Result<Bytes, StorageError> {
    match status {
        StatusCode::PARTIAL_CONTENT => check_fetched_length(locator, byte_range, body),
        StatusCode::OK => {
            let len = body.len() as u64;
            if byte_range.end() > len {
                return Err(StorageError::ShortRead {
                    locator: locator.clone(),
                    byte_range,
                    got: len.saturating_sub(byte_range.offset()),
                });
            }
            Ok(body.slice(byte_range.to_range_usize()))
        }
        StatusCode::NOT_FOUND => Err(StorageError::NotFound(locator.clone())),
        StatusCode::RANGE_NOT_SATISFIABLE => Err(StorageError::ShortRead {
            locator: locator.clone(),
            byte_range,
            got: 0,
        }),
        _ => Err(StorageError::Other(format!(
            "the http server responded with status {status} for the byte range request {byte_range} of {locator}"
        ))),
    }
}

impl ChunkFetcher for HTTPFetcher {
    fn fetch(&self, locator: &SourceLocator, byte_range: ByteRange) -> Result<Bytes, StorageError> {
        let url = Self::locator_to_url(locator)?;
        let Some(range) = byte_range.http_range_header() else {
            return Ok(Bytes::new());
        };
        let range =
            HeaderValue::from_str(&range).map_err(|err| StorageError::Other(err.to_string()))?;
        log::trace!("GET {url} Range: {byte_range}");
        let response = self
            .client
            .get(url.clone())
            .header(RANGE, range)
            .send()
            .map_err(|err| http_error(&err))?;
        let status = response.status();
        let body = response.bytes().map_err(|err| http_error(&err))?;
        range_response_bytes(locator, byte_range, status, body)
    }

    fn size(&self, locator: &SourceLocator) -> Result<Option<u64>, StorageError> {
        let url = Self::locator_to_url(locator)?;
        let response = self
            .client
            .head(url.clone())
            .send()
            .map_err(|err| http_error(&err))?;
        match response.status() {
            StatusCode::OK => {
                let length = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|header_value| header_value.to_str().ok())
                    .and_then(|header_str| u64::from_str(header_str).ok())
                    .ok_or_else(|| StorageError::from("content length response is invalid"))?;
                Ok(Some(length))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StorageError::from(format!(
                "http size request for {locator} has status code {status}"
            ))),
        }
    }
}

/// A HTTP fetcher creation error.
#[derive(Debug, Error)]
pub enum HTTPFetcherCreateError {
    /// The HTTP client could not be built.
    #[error(transparent)]
    ClientError(#[from] reqwest::Error),
}
