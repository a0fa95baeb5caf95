//! Configuration types for the bad IP service.

use crate::loader::DEFAULT_MAX_DOWNLOAD_BYTES;
use crate::store::DEFAULT_CAPACITY;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Upstream archive settings.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Refresh schedule.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Blocklist store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Lookup service settings.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Upstream archive settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveConfig {
    /// URL of the ZIP archive (supports ${ENV_VAR} syntax).
    #[serde(default = "default_archive_url")]
    pub url: String,

    /// Only archive entries ending with one of these suffixes are parsed.
    #[serde(default = "default_file_suffixes")]
    pub file_suffixes: Vec<String>,

    /// Hard cap on the downloaded archive size.
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: usize,

    /// Timeout for a single HTTP request, body included (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url: default_archive_url(),
            file_suffixes: default_file_suffixes(),
            max_download_bytes: default_max_download_bytes(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ArchiveConfig {
    /// Timeout for a single HTTP request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_archive_url() -> String {
    "https://github.com/firehol/blocklist-ipsets/archive/refs/heads/master.zip".to_string()
}

fn default_file_suffixes() -> Vec<String> {
    vec![".netset".to_string(), ".ipset".to_string()]
}

fn default_max_download_bytes() -> usize {
    DEFAULT_MAX_DOWNLOAD_BYTES
}

fn default_request_timeout() -> u64 {
    120
}

/// Refresh schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// Time between refreshes (seconds).
    #[serde(default = "default_refresh_interval")]
    pub interval_seconds: u64,

    /// Bound on a whole refresh: check, download, parse and replace (seconds).
    #[serde(default = "default_load_timeout")]
    pub load_timeout_seconds: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_refresh_interval(),
            load_timeout_seconds: default_load_timeout(),
        }
    }
}

impl RefreshConfig {
    /// Time between refreshes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Bound on a whole refresh.
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_seconds)
    }
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_load_timeout() -> u64 {
    240
}

/// Blocklist store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Maximum number of ranges kept. Extra ranges are dropped.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

/// Lookup service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Report unhealthy when the last refresh is older than this (seconds).
    /// Defaults to twice the refresh interval.
    #[serde(default)]
    pub stale_after_seconds: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            stale_after_seconds: None,
        }
    }
}

impl ServerConfig {
    /// Staleness window for the health check.
    pub fn stale_after(&self, refresh: &RefreshConfig) -> Duration {
        match self.stale_after_seconds {
            Some(seconds) => Duration::from_secs(seconds),
            None => refresh.interval().saturating_mul(2),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.archive.url)
            .map_err(|e| anyhow::anyhow!("Invalid archive url '{}': {}", self.archive.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Archive url must use http or https: {}", self.archive.url);
        }

        if self.archive.file_suffixes.is_empty() {
            anyhow::bail!("At least one file suffix is required");
        }
        if self.archive.file_suffixes.iter().any(|s| s.is_empty()) {
            anyhow::bail!("File suffixes must not be empty");
        }

        if self.archive.max_download_bytes == 0 {
            anyhow::bail!("max_download_bytes must be greater than 0");
        }
        if self.archive.request_timeout_seconds == 0 {
            anyhow::bail!("request_timeout_seconds must be greater than 0");
        }

        if self.refresh.interval_seconds == 0 {
            anyhow::bail!("Refresh interval_seconds must be greater than 0");
        }
        if self.refresh.load_timeout_seconds == 0 {
            anyhow::bail!("load_timeout_seconds must be greater than 0");
        }

        if self.store.capacity == 0 {
            anyhow::bail!("Store capacity must be greater than 0");
        }

        if self.server.stale_after_seconds == Some(0) {
            anyhow::bail!("stale_after_seconds must be greater than 0");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Bad IP Service Configuration

# Upstream blocklist archive
archive:
  url: "https://github.com/firehol/blocklist-ipsets/archive/refs/heads/master.zip"
  file_suffixes:               # only these archive entries are parsed
    - ".netset"
    - ".ipset"
  max_download_bytes: 50000000 # abort downloads larger than 50MB
  request_timeout_seconds: 120

# Refresh schedule
refresh:
  interval_seconds: 300        # check the upstream every 5 minutes
  load_timeout_seconds: 240    # give up on a refresh after 4 minutes

# In-memory store
store:
  capacity: 1000000            # ranges beyond this are dropped

# Lookup service
server:
  listen: "0.0.0.0:8080"
  # stale_after_seconds: 600   # defaults to twice the refresh interval
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(content, |caps: &Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}
