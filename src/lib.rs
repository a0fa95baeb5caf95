//! Bad IP lookup service.
//!
//! Keeps an in-memory set of bad network ranges built from a remote ZIP
//! archive of blocklists (such as firehol's blocklist-ipsets) and answers
//! "is this address listed?" over HTTP.
//!
//! # Features
//!
//! - **Conditional refresh** - HEAD/ETag check skips unchanged archives
//! - **Bounded download** - Archives past a byte limit are rejected
//! - **Concurrent parsing** - One worker per archive entry, merged fairly
//! - **Atomic replace** - Lookups see either the old or the new list
//! - **IPv4 and IPv6** - Single addresses and CIDR blocks
//!
//! # Example Configuration
//!
//! ```yaml
//! archive:
//!   url: "https://github.com/firehol/blocklist-ipsets/archive/refs/heads/master.zip"
//!   file_suffixes: [".netset", ".ipset"]
//!   max_download_bytes: 50000000
//!
//! refresh:
//!   interval_seconds: 300
//!
//! store:
//!   capacity: 1000000
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod loader;
pub mod network;
pub mod scheduler;
pub mod source;
pub mod store;

pub use config::Config;
pub use error::LoadError;
pub use loader::{ArchiveLoader, LoadOutcome};
pub use network::{parse_network, AddressError};
pub use scheduler::RefreshScheduler;
pub use source::{ArchiveSource, FetchedArchive, HttpArchiveSource};
pub use store::{BlocklistStore, StoreStatus};
