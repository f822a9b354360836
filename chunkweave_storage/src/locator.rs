use std::path::{Path, PathBuf};

use derive_more::{Display, From};
use thiserror::Error;
use url::Url;

/// The backing object a chunk's bytes live in.
///
/// A locator is either a local file path or a URL of a remote object.
/// Local `file://` URLs are normalised to [`SourceLocator::File`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display, From)]
pub enum SourceLocator {
    /// A local file.
    #[display("{}", _0.display())]
    File(PathBuf),
    /// A remote object addressed by URL.
    #[display("{_0}")]
    Url(Url),
}

/// An invalid source locator.
#[derive(Clone, Debug, From, Error)]
#[error("invalid source locator {0}")]
pub struct SourceLocatorError(String);

impl SourceLocator {
    /// Parse a locator from a path or URL string.
    ///
    /// Strings with a URL scheme (other than single letter schemes, which are drive letters) are URLs.
    /// `file://` URLs and everything else are treated as local paths.
    ///
    /// # Errors
    /// Returns [`SourceLocatorError`] if `locator` is empty or is a `file://` URL that is not a valid path.
    pub fn new(locator: &str) -> Result<Self, SourceLocatorError> {
        if locator.is_empty() {
            return Err(SourceLocatorError(locator.to_string()));
        }
        match Url::parse(locator) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Self::File)
                .map_err(|()| SourceLocatorError(locator.to_string())),
            Ok(url) if url.scheme().len() > 1 => Ok(Self::Url(url)),
            _ => Ok(Self::File(PathBuf::from(locator))),
        }
    }

    /// Returns the file path if this is a local locator.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Url(_) => None,
        }
    }

    /// Returns the URL if this is a remote locator.
    #[must_use]
    pub fn as_url(&self) -> Option<&Url> {
        match self {
            Self::File(_) => None,
            Self::Url(url) => Some(url),
        }
    }
}

impl TryFrom<&str> for SourceLocator {
    type Error = SourceLocatorError;

    fn try_from(locator: &str) -> Result<Self, Self::Error> {
        Self::new(locator)
    }
}

impl std::str::FromStr for SourceLocator {
    type Err = SourceLocatorError;

    fn from_str(locator: &str) -> Result<Self, Self::Err> {
        Self::new(locator)
    }
}
