//! HTTP archive source.

use super::{version_token, ArchiveSource, FetchedArchive};
use crate::error::{LoadError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, ETAG};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;

/// Initial buffer size when the upstream does not announce a length.
const INITIAL_BUFFER: usize = 64 * 1024;

/// Fetches a blocklist archive over HTTP(S).
pub struct HttpArchiveSource {
    url: String,
    client: Client,
}

impl HttpArchiveSource {
    /// Create a new source with its own client.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("badip-service/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(url, client))
    }

    /// Create a new source with a custom client.
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    fn check_status(&self, response: &Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LoadError::UnexpectedStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            })
        }
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn head(&self) -> Result<Option<String>> {
        let response = self.client.head(&self.url).send().await?;
        self.check_status(&response)?;
        Ok(etag(response.headers()))
    }

    async fn fetch(&self, max_bytes: usize) -> Result<FetchedArchive> {
        let mut response = self.client.get(&self.url).send().await?;
        self.check_status(&response)?;

        let declared = response.content_length();
        if declared.is_some_and(|len| len > max_bytes as u64) {
            return Err(LoadError::DownloadTooLarge { limit: max_bytes });
        }

        let version = etag(response.headers());

        // The declared length is only a hint; chunked responses have none
        // and the limit is enforced on the bytes actually received.
        let mut body = BoundedBody::new(max_bytes, declared);
        while let Some(chunk) = response.chunk().await? {
            body.push(&chunk)?;
        }
        let body = body.finish();

        debug!(url = %self.url, bytes = body.len(), "Archive downloaded");

        Ok(FetchedArchive { body, version })
    }

    fn location(&self) -> &str {
        &self.url
    }
}

fn etag(headers: &HeaderMap) -> Option<String> {
    version_token(headers.get(ETAG).and_then(|v| v.to_str().ok()))
}

/// Accumulates a response body up to a hard byte limit.
struct BoundedBody {
    buf: BytesMut,
    limit: usize,
}

impl BoundedBody {
    fn new(limit: usize, hint: Option<u64>) -> Self {
        let initial = hint
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(INITIAL_BUFFER)
            .min(limit);
        Self {
            buf: BytesMut::with_capacity(initial),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(LoadError::DownloadTooLarge { limit: self.limit });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
