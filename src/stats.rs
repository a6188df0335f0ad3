//! Proxy traffic counters
//!
//! Counters are monotonically increasing and shared across all session
//! threads. Sessions receive the sink by `Arc` rather than going through a
//! global, so tests can observe an isolated instance.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter sink for proxy traffic
///
/// All counters use relaxed ordering; they are statistics, not
/// synchronization.
#[derive(Debug, Default)]
pub struct ProxyStats {
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dns_queries: AtomicU64,
    dns_cache_hits: AtomicU64,
}

impl ProxyStats {
    /// Create a new counter sink with all counters at zero
    pub fn new() -> Self {
        ProxyStats::default()
    }

    /// Count one parsed client request
    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count bytes read from a client
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Count bytes written to a client
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one name-resolution request (cached or not)
    pub fn add_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one connect that succeeded against a cached address
    pub fn add_dns_cache_hit(&self) {
        self.dns_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            dns_cache_hits: self.dns_cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub dns_queries: u64,
    pub dns_cache_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ProxyStats::new();
        stats.add_request();
        stats.add_request();
        stats.add_bytes_in(100);
        stats.add_bytes_out(250);
        stats.add_bytes_out(50);
        stats.add_dns_query();
        stats.add_dns_cache_hit();

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.bytes_in, 100);
        assert_eq!(snap.bytes_out, 300);
        assert_eq!(snap.dns_queries, 1);
        assert_eq!(snap.dns_cache_hits, 1);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let stats = ProxyStats::new();
        stats.add_request();
        let before = stats.snapshot();
        stats.add_request();
        let after = stats.snapshot();

        assert_eq!(before.requests, 1);
        assert_eq!(after.requests, 2);
    }
}
