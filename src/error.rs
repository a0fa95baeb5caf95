//! Errors raised while refreshing the blocklist.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for load operations.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Reasons a refresh can fail. None of them leave the store modified.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Transport failure on HEAD or GET, including body read failures.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-success status.
    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        /// Status code returned by the upstream.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The archive body grew past the configured maximum.
    #[error("download exceeded the {limit} byte limit")]
    DownloadTooLarge {
        /// Configured maximum download size.
        limit: usize,
    },

    /// The body is not a readable ZIP archive.
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The whole load did not finish in time.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    /// Whether the failure is a transport condition worth retrying on the
    /// next refresh, as opposed to a problem with the archive contents.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoadError::Http(_) | LoadError::UnexpectedStatus { .. } | LoadError::Timeout(_)
        )
    }
}
