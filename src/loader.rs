//! Archive loader.
//!
//! A load checks the upstream version, downloads the archive when it has
//! changed, parses every matching entry on its own blocking worker, merges
//! the workers' output and swaps the result into the store in one step.

use crate::config::Config;
use crate::error::{LoadError, Result};
use crate::network::parse_network;
use crate::source::{ArchiveSource, HttpArchiveSource};
use crate::store::BlocklistStore;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use ipnet::IpNet;
use std::io::{BufRead, BufReader, Cursor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use zip::ZipArchive;

/// Default cap on the archive download size.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: usize = 50_000_000;

/// Default bound on a whole load.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Buffered ranges per worker before it waits for the aggregator.
const WORKER_CHANNEL_CAPACITY: usize = 100;

type Archive = ZipArchive<Cursor<Bytes>>;

/// Result of a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The upstream version matches the stored one; nothing was downloaded.
    Unchanged {
        /// Version token shared by upstream and store.
        version: String,
    },
    /// A new generation was installed.
    Replaced {
        /// Ranges parsed from the archive. May exceed `stored`.
        found: usize,
        /// Ranges kept by the store.
        stored: usize,
        /// Version token recorded for the new generation.
        version: Option<String>,
    },
}

impl LoadOutcome {
    /// Returns true if the load was skipped because nothing changed.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, LoadOutcome::Unchanged { .. })
    }
}

/// Loads blocklist archives into a [`BlocklistStore`].
pub struct ArchiveLoader {
    source: Arc<dyn ArchiveSource>,
    file_suffixes: Arc<[String]>,
    max_download_bytes: usize,
    timeout: Duration,
}

impl ArchiveLoader {
    /// Create a loader reading from `source`. Only archive entries whose
    /// name ends with one of `file_suffixes` are parsed.
    pub fn new(
        source: Arc<dyn ArchiveSource>,
        file_suffixes: Vec<String>,
        max_download_bytes: usize,
    ) -> Self {
        Self {
            source,
            file_suffixes: file_suffixes.into(),
            max_download_bytes,
            timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    /// Build an HTTP-backed loader from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = HttpArchiveSource::new(&config.archive.url, config.archive.request_timeout())?;

        Ok(Self::new(
            Arc::new(source),
            config.archive.file_suffixes.clone(),
            config.archive.max_download_bytes,
        )
        .with_timeout(config.refresh.load_timeout()))
    }

    /// Set the bound on a whole load.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Refresh `store` from the upstream archive.
    ///
    /// The store is only touched by the final replace, or by marking it
    /// refreshed when the upstream version is unchanged. Any error leaves
    /// it exactly as it was.
    pub async fn load(&self, store: &BlocklistStore) -> Result<LoadOutcome> {
        match tokio::time::timeout(self.timeout, self.load_inner(store)).await {
            Ok(result) => result,
            Err(_) => Err(LoadError::Timeout(self.timeout)),
        }
    }

    async fn load_inner(&self, store: &BlocklistStore) -> Result<LoadOutcome> {
        let head_version = self.source.head().await?;

        if let Some(version) = head_version.as_deref() {
            if store.version().as_deref() == Some(version) {
                store.mark_refreshed();
                return Ok(LoadOutcome::Unchanged {
                    version: version.to_string(),
                });
            }
        }

        debug!(
            url = self.source.location(),
            version = ?head_version,
            "Blocklist version changed, downloading archive"
        );

        let archive = self.source.fetch(self.max_download_bytes).await?;
        // Later checks compare against HEAD, so its token is the one kept.
        let version = head_version.or(archive.version);

        let ranges = parse_archive(archive.body, Arc::clone(&self.file_suffixes)).await?;
        let found = ranges.len();
        let stored = store.replace(ranges, version.clone());

        Ok(LoadOutcome::Replaced {
            found,
            stored,
            version,
        })
    }
}

/// Parse every matching entry of a ZIP archive into network ranges.
async fn parse_archive(body: Bytes, file_suffixes: Arc<[String]>) -> Result<Vec<IpNet>> {
    let mut archive = ZipArchive::new(Cursor::new(body))?;

    let mut receivers = Vec::new();
    let mut workers = Vec::new();

    for index in 0..archive.len() {
        let name = match archive.by_index_raw(index) {
            Ok(entry) if !entry.is_dir() && matches_suffix(entry.name(), &file_suffixes) => {
                entry.name().to_string()
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(index, error = %e, "Failed to read archive entry header");
                continue;
            }
        };

        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let archive = archive.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            parse_entry(archive, index, &name, tx)
        }));
        receivers.push(ReceiverStream::new(rx));
    }

    debug!(files = receivers.len(), "Parsing blocklist files");

    // Merged fairly, so one large file does not hold back the others. Ends
    // once every worker has dropped its sender and its buffer is drained.
    let mut merged = stream::select_all(receivers);
    let mut collection = Vec::new();
    while let Some(net) = merged.next().await {
        collection.push(net);
    }

    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Blocklist file worker failed");
        }
    }

    Ok(collection)
}

fn matches_suffix(name: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
}

/// Worker body: parse one archive entry and send its ranges to `tx`.
fn parse_entry(mut archive: Archive, index: usize, name: &str, tx: mpsc::Sender<IpNet>) {
    let entry = match archive.by_index(index) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(file = name, error = %e, "Failed to open blocklist file");
            return;
        }
    };

    let summary = parse_lines(BufReader::new(entry), name, |net| tx.blocking_send(net).is_ok());

    debug!(
        file = name,
        parsed = summary.parsed,
        skipped = summary.skipped,
        "Blocklist file parsed"
    );
}

/// Counts for one parsed file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct EntrySummary {
    parsed: usize,
    skipped: usize,
}

/// Parse a line-oriented blocklist, handing each range to `emit`.
///
/// Blank lines and `#` comments are ignored; malformed lines are logged and
/// skipped. Stops early when `emit` returns false or the reader fails.
fn parse_lines<R, F>(mut reader: R, name: &str, mut emit: F) -> EntrySummary
where
    R: BufRead,
    F: FnMut(IpNet) -> bool,
{
    let mut summary = EntrySummary::default();
    let mut buf = Vec::new();
    let mut line_number = 0usize;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => line_number += 1,
            Err(e) => {
                warn!(file = name, line = line_number + 1, error = %e, "Failed to read blocklist file");
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_network(line) {
            Ok(net) => {
                summary.parsed += 1;
                if !emit(net) {
                    // Aggregator is gone; the load was abandoned.
                    break;
                }
            }
            Err(e) => {
                summary.skipped += 1;
                warn!(file = name, line = line_number, error = %e, "Skipping blocklist entry");
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::MockSource;
    use std::io::Write;
    use std::net::IpAddr;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const NETSET: &str = "\
# firehol_level1
#
1.2.3.0/24
10.0.0.1

not-an-address
300.1.1.1
  192.0.2.0/25
";

    const IPSET: &str = "5.6.7.8\n2001:db8::/32\r\n10.0.0.0/33\n9.9.9.9";

    fn build_archive(files: &[(&str, &str)]) -> Bytes {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in files {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    fn fixture() -> Bytes {
        build_archive(&[
            ("blocklist-ipsets-master/", ""),
            ("blocklist-ipsets-master/firehol_level1.netset", NETSET),
            ("blocklist-ipsets-master/bogons.ipset", IPSET),
            ("blocklist-ipsets-master/README.md", "8.8.8.8\n"),
            ("blocklist-ipsets-master/old.netset.bak", "4.4.4.4\n"),
            ("blocklist-ipsets-master/nested.netset/", ""),
        ])
    }

    fn suffixes() -> Vec<String> {
        vec![".netset".to_string(), ".ipset".to_string()]
    }

    fn loader(source: Arc<MockSource>) -> ArchiveLoader {
        ArchiveLoader::new(source, suffixes(), 1_000_000)
    }

    fn ip(value: &str) -> IpAddr {
        value.parse().unwrap()
    }

    #[test]
    fn test_matches_suffix() {
        let suffixes = suffixes();
        assert!(matches_suffix("repo/a.netset", &suffixes));
        assert!(matches_suffix("repo/b.ipset", &suffixes));
        assert!(!matches_suffix("repo/a.netset.bak", &suffixes));
        assert!(!matches_suffix("repo/README.md", &suffixes));
        assert!(!matches_suffix("repo/a.netset", &[]));
    }

    #[test]
    fn test_parse_lines_counts() {
        let mut out = Vec::new();
        let summary = parse_lines(NETSET.as_bytes(), "level1", |net| {
            out.push(net);
            true
        });

        assert_eq!(summary, EntrySummary { parsed: 3, skipped: 2 });
        assert_eq!(
            out,
            vec![
                "1.2.3.0/24".parse::<IpNet>().unwrap(),
                "10.0.0.1/32".parse().unwrap(),
                "192.0.2.0/25".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_lines_handles_invalid_utf8() {
        let data: &[u8] = b"1.1.1.1\n\xff\xfe\n2.2.2.2\n";
        let mut count = 0;
        let summary = parse_lines(data, "binary", |_| {
            count += 1;
            true
        });
        assert_eq!(count, 2);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_parse_lines_stops_when_receiver_is_gone() {
        let mut count = 0;
        let summary = parse_lines("1.1.1.1\n2.2.2.2\n3.3.3.3\n".as_bytes(), "x", |_| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
        assert_eq!(summary.parsed, 1);
    }

    #[tokio::test]
    async fn test_parse_archive_only_matching_files() {
        let ranges = parse_archive(fixture(), suffixes().into()).await.unwrap();
        assert_eq!(ranges.len(), 6);
        assert!(!ranges.contains(&"8.8.8.8/32".parse().unwrap()));
        assert!(!ranges.contains(&"4.4.4.4/32".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_parse_archive_many_files() {
        let contents: Vec<(String, String)> = (0..50)
            .map(|i| {
                let lines: String = (0..=255).map(|j| format!("10.{}.{}.0/24\n", i, j)).collect();
                (format!("repo/list{}.netset", i), lines)
            })
            .collect();
        let files: Vec<(&str, &str)> = contents
            .iter()
            .map(|(name, body)| (name.as_str(), body.as_str()))
            .collect();

        let ranges = parse_archive(build_archive(&files), suffixes().into()).await.unwrap();
        assert_eq!(ranges.len(), 50 * 256);
    }

    #[tokio::test]
    async fn test_parse_archive_empty_archive() {
        let ranges = parse_archive(build_archive(&[]), suffixes().into()).await.unwrap();
        assert!(ranges.is_empty());
    }

    #[tokio::test]
    async fn test_load_fixture() {
        let source = Arc::new(MockSource::new(fixture(), Some("\"v1\"")));
        let store = BlocklistStore::new(100);

        let outcome = loader(source.clone()).load(&store).await.unwrap();

        assert_eq!(
            outcome,
            LoadOutcome::Replaced {
                found: 6,
                stored: 6,
                version: Some("\"v1\"".to_string()),
            }
        );
        assert_eq!(store.len(), 6);
        assert_eq!(store.version().as_deref(), Some("\"v1\""));
        assert!(store.last_refresh().is_some());

        for addr in ["1.2.3.4", "10.0.0.1", "192.0.2.100", "5.6.7.8", "2001:db8::1", "9.9.9.9"] {
            assert!(store.contains(&ip(addr)), "{} should be listed", addr);
        }
        for addr in ["8.8.8.8", "4.4.4.4", "192.0.2.200", "10.0.0.2"] {
            assert!(!store.contains(&ip(addr)), "{} should not be listed", addr);
        }
    }

    #[tokio::test]
    async fn test_unchanged_version_skips_download() {
        let source = Arc::new(MockSource::new(fixture(), Some("\"v1\"")));
        let store = BlocklistStore::new(100);
        let loader = loader(source.clone());

        assert!(!loader.load(&store).await.unwrap().is_unchanged());
        let first_refresh = store.last_refresh().unwrap();

        let outcome = loader.load(&store).await.unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Unchanged {
                version: "\"v1\"".to_string()
            }
        );
        assert_eq!(source.head_calls(), 2);
        assert_eq!(source.fetch_calls(), 1);
        assert_eq!(store.len(), 6);
        assert!(store.last_refresh().unwrap() >= first_refresh);
    }

    #[tokio::test]
    async fn test_changed_version_downloads_again() {
        let source = Arc::new(MockSource::new(fixture(), Some("\"v1\"")));
        let store = BlocklistStore::new(100);
        let loader = loader(source.clone());

        loader.load(&store).await.unwrap();
        *source.body.lock().unwrap() = build_archive(&[("repo/new.netset", "7.7.7.7\n")]);
        source.set_version(Some("\"v2\""));

        let outcome = loader.load(&store).await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Replaced { found: 1, stored: 1, .. }));
        assert_eq!(source.fetch_calls(), 2);
        assert!(store.contains(&ip("7.7.7.7")));
        assert!(!store.contains(&ip("1.2.3.4")));
        assert_eq!(store.version().as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn test_missing_version_always_downloads() {
        let source = Arc::new(MockSource::new(fixture(), None));
        let store = BlocklistStore::new(100);
        let loader = loader(source.clone());

        assert!(!loader.load(&store).await.unwrap().is_unchanged());
        assert!(!loader.load(&store).await.unwrap().is_unchanged());
        assert_eq!(source.fetch_calls(), 2);
        assert!(store.version().is_none());
    }

    #[tokio::test]
    async fn test_head_version_kept_when_get_differs() {
        let source = Arc::new(MockSource::new(fixture(), Some("\"same-content\"")));
        *source.fetch_version.lock().unwrap() = Some("W/\"same-content\"".to_string());
        let store = BlocklistStore::new(100);
        let loader = loader(source.clone());

        assert!(!loader.load(&store).await.unwrap().is_unchanged());
        assert_eq!(store.version().as_deref(), Some("\"same-content\""));

        assert!(loader.load(&store).await.unwrap().is_unchanged());
        assert!(loader.load(&store).await.unwrap().is_unchanged());
        assert_eq!(source.head_calls(), 3);
        assert_eq!(source.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_version_used_without_head_version() {
        let source = Arc::new(MockSource::new(fixture(), None));
        *source.fetch_version.lock().unwrap() = Some("\"body\"".to_string());
        let store = BlocklistStore::new(100);

        loader(source).load(&store).await.unwrap();
        assert_eq!(store.version().as_deref(), Some("\"body\""));
    }

    #[tokio::test]
    async fn test_found_may_exceed_capacity() {
        let source = Arc::new(MockSource::new(fixture(), Some("\"v1\"")));
        let store = BlocklistStore::new(4);

        let outcome = loader(source).load(&store).await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Replaced { found: 6, stored: 4, .. }));
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_archive_leaves_store_untouched() {
        let store = BlocklistStore::new(100);
        store.replace(vec!["3.3.3.3/32".parse().unwrap()], Some("old".into()));
        let before = store.status();

        let source = Arc::new(MockSource::new(Bytes::from_static(b"definitely not a zip"), Some("new")));
        let err = loader(source).load(&store).await.unwrap_err();

        assert!(matches!(err, LoadError::Archive(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.status(), before);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_store_untouched() {
        let store = BlocklistStore::new(100);
        store.replace(vec!["3.3.3.3/32".parse().unwrap()], Some("old".into()));
        let before = store.status();

        let mut source = MockSource::new(fixture(), Some("new"));
        source.fail_fetch = true;
        let err = loader(Arc::new(source)).load(&store).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(store.status(), before);
    }

    #[tokio::test]
    async fn test_load_times_out() {
        let mut source = MockSource::new(fixture(), Some("v1"));
        source.fetch_delay = Some(Duration::from_secs(30));
        let store = BlocklistStore::new(100);

        let loader = loader(Arc::new(source)).with_timeout(Duration::from_millis(50));
        let err = loader.load(&store).await.unwrap_err();

        assert!(matches!(err, LoadError::Timeout(_)));
        assert!(store.is_empty());
        assert!(store.last_refresh().is_none());
    }

    #[tokio::test]
    async fn test_load_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/master.zip"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"abc\""))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/master.zip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .set_body_bytes(fixture().to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpArchiveSource::new(format!("{}/master.zip", server.uri()), Duration::from_secs(5)).unwrap();
        let loader = ArchiveLoader::new(Arc::new(source), suffixes(), 1_000_000);
        let store = BlocklistStore::new(100);

        assert!(matches!(loader.load(&store).await.unwrap(), LoadOutcome::Replaced { found: 6, .. }));
        assert!(loader.load(&store).await.unwrap().is_unchanged());
        assert!(store.contains(&ip("1.2.3.77")));
    }

    #[tokio::test]
    async fn test_oversized_download_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"big\""))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64 * 1024]))
            .mount(&server)
            .await;

        let source = HttpArchiveSource::new(format!("{}/master.zip", server.uri()), Duration::from_secs(5)).unwrap();
        let loader = ArchiveLoader::new(Arc::new(source), suffixes(), 16 * 1024);
        let store = BlocklistStore::new(100);

        let err = loader.load(&store).await.unwrap_err();
        assert!(matches!(err, LoadError::DownloadTooLarge { limit } if limit == 16 * 1024));
        assert!(store.is_empty());
        assert!(store.version().is_none());
    }
}
