//! Upstream archive sources.

pub mod http;

pub use http::HttpArchiveSource;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A downloaded archive and the version token that came with it.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    /// Raw archive bytes.
    pub body: Bytes,
    /// Version token (ETag) of the body, if the upstream sent one.
    pub version: Option<String>,
}

/// Where blocklist archives come from.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Fetch only the current version token of the archive.
    async fn head(&self) -> Result<Option<String>>;

    /// Download the archive, failing once the body grows past `max_bytes`.
    async fn fetch(&self, max_bytes: usize) -> Result<FetchedArchive>;

    /// Location of the archive, for logging.
    fn location(&self) -> &str;
}

/// Turn a raw version header into a token; blank values count as absent.
pub(crate) fn version_token(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
