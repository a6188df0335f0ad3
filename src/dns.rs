//! Resolved-address cache
//!
//! Maps a `host:port` key to the socket address that last accepted a
//! connection for it. The cache is shared by every session thread; entries
//! are evicted by the caller when a connect against a cached address fails.

use dashmap::DashMap;
use std::net::SocketAddr;

/// Concurrent map of resolved upstream addresses
#[derive(Debug, Default)]
pub struct AddrCache {
    entries: DashMap<String, SocketAddr>,
}

impl AddrCache {
    /// Create an empty cache
    pub fn new() -> Self {
        AddrCache {
            entries: DashMap::new(),
        }
    }

    /// Look up the cached address for a host key
    pub fn lookup(&self, key: &str) -> Option<SocketAddr> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Record the address that accepted a connection for a host key
    pub fn insert(&self, key: String, addr: SocketAddr) {
        self.entries.insert(key, addr);
    }

    /// Drop a stale entry
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
