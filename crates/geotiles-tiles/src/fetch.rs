//! The byte-fetching seam and a filesystem implementation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FetchError;

/// Bytes returned by a [`Fetcher`].
#[derive(Clone, Debug, Default)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    /// How long the content stays valid; `None` never expires.
    pub expire_after: Option<Duration>,
}

impl FetchedContent {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            expire_after: None,
        }
    }

    pub fn expiring(bytes: Vec<u8>, expire_after: Duration) -> Self {
        Self {
            bytes,
            expire_after: Some(expire_after),
        }
    }
}

/// Resolves a URL to bytes. Called from fetch worker threads.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError>;
}

/// Reads tiles from a directory on disk. Query strings are ignored.
#[derive(Clone, Debug)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, url: &str) -> PathBuf {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let path = path.strip_prefix("file://").unwrap_or(path);
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let path = self.path_for(url);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(FetchedContent::new(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FetchError::NotFound(url.to_owned())),
            Err(source) => Err(FetchError::Io {
                url: url.to_owned(),
                source,
            }),
        }
    }
}
