//! Thread-safe store of bad network ranges.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Default number of ranges a store can hold.
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// One complete set of ranges together with the metadata describing it.
#[derive(Debug, Default)]
struct Generation {
    ranges: Vec<IpNet>,
    version: Option<String>,
    last_refresh: Option<DateTime<Utc>>,
}

/// Point-in-time view of the store used by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    /// Number of populated ranges.
    pub entries: usize,
    /// Maximum number of ranges the store keeps.
    pub capacity: usize,
    /// Version token of the current generation.
    pub version: Option<String>,
    /// When the contents were last confirmed current.
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Capacity-bounded set of bad network ranges.
///
/// Reads take a shared lock and scan the populated ranges linearly. A
/// refresh swaps in a whole generation (ranges, version and refresh time)
/// under the exclusive lock, so a reader sees either the old or the new
/// generation and never a mix of both.
#[derive(Debug)]
pub struct BlocklistStore {
    capacity: usize,
    inner: RwLock<Generation>,
}

impl BlocklistStore {
    /// Create an empty store that keeps at most `capacity` ranges.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Generation::default()),
        }
    }

    /// Maximum number of ranges kept per generation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of populated ranges.
    pub fn len(&self) -> usize {
        self.read().ranges.len()
    }

    /// Check if the store holds no ranges.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when `ip` falls inside any stored range.
    ///
    /// IPv4-mapped IPv6 addresses are matched against IPv4 ranges.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.read().ranges.iter().any(|net| net.contains(&ip))
    }

    /// Replace the whole set of ranges and record `version` as its version.
    ///
    /// Ranges beyond the store capacity are dropped. Returns the number of
    /// ranges actually stored.
    pub fn replace(&self, mut ranges: Vec<IpNet>, version: Option<String>) -> usize {
        let found = ranges.len();
        if found > self.capacity {
            warn!(
                found,
                capacity = self.capacity,
                dropped = found - self.capacity,
                "Blocklist exceeds store capacity, dropping excess ranges"
            );
            ranges.truncate(self.capacity);
        }
        let stored = ranges.len();

        let previous = {
            let mut generation = self.write();
            generation.last_refresh = Some(advance(generation.last_refresh));
            generation.version = version;
            std::mem::replace(&mut generation.ranges, ranges)
        };
        // The old generation is freed after the lock is released.
        drop(previous);

        stored
    }

    /// Record that the current contents were confirmed up to date.
    pub fn mark_refreshed(&self) {
        let mut generation = self.write();
        generation.last_refresh = Some(advance(generation.last_refresh));
    }

    /// Version token of the current generation.
    pub fn version(&self) -> Option<String> {
        self.read().version.clone()
    }

    /// Last time the contents were replaced or confirmed current.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.read().last_refresh
    }

    /// Consistent view of size and metadata.
    pub fn status(&self) -> StoreStatus {
        let generation = self.read();
        StoreStatus {
            entries: generation.ranges.len(),
            capacity: self.capacity,
            version: generation.version.clone(),
            last_refresh: generation.last_refresh,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Generation> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Generation> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BlocklistStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// Never moves the refresh time backwards, even if the wall clock does.
fn advance(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    previous.map_or(now, |prev| prev.max(now))
}
