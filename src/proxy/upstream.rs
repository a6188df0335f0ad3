//! Upstream connection setup
//!
//! Turns a target [`Host`] into a connected socket. The resolved-address
//! cache is consulted first; a cached address that no longer accepts
//! connections is evicted and resolution starts over. On the full path the
//! candidates are tried in resolver order and the first one that accepts
//! wins its way into the cache.

use super::{Error, Host, Result};
use crate::dns::AddrCache;
use crate::net;
use crate::stats::ProxyStats;
use std::net::TcpStream;
use std::sync::Arc;
use tracing::debug;

/// Connects sessions to origin servers
#[derive(Clone)]
pub struct UpstreamResolver {
    cache: Arc<AddrCache>,
    stats: Arc<ProxyStats>,
}

impl UpstreamResolver {
    /// Create a resolver over a shared cache and counter sink
    pub fn new(cache: Arc<AddrCache>, stats: Arc<ProxyStats>) -> Self {
        UpstreamResolver { cache, stats }
    }

    /// Connect to `host`, preferring its cached address
    pub fn connect(&self, host: &Host) -> Result<TcpStream> {
        self.stats.add_dns_query();

        let key = host.cache_key();
        if let Some(addr) = self.cache.lookup(&key) {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    self.stats.add_dns_cache_hit();
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(host = %host, %addr, error = %e, "evicting stale cached address");
                    self.cache.remove(&key);
                }
            }
        }

        let addrs = net::resolve(&host.name, host.port)
            .map_err(|e| Error::Resolution(format!("resolve {}: {}", host, e)))?;

        for addr in addrs {
            if let Ok(stream) = TcpStream::connect(addr) {
                self.cache.insert(key, addr);
                return Ok(stream);
            }
        }

        Err(Error::Resolution(format!(
            "no reachable address for {}",
            host
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn resolver() -> (UpstreamResolver, Arc<AddrCache>, Arc<ProxyStats>) {
        let cache = Arc::new(AddrCache::new());
        let stats = Arc::new(ProxyStats::new());
        (
            UpstreamResolver::new(cache.clone(), stats.clone()),
            cache,
            stats,
        )
    }

    #[test]
    fn test_connect_populates_cache_then_hits_it() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = Host {
            name: "127.0.0.1".to_string(),
            port,
        };

        let (resolver, cache, stats) = resolver();

        let first = resolver.connect(&host).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(stats.snapshot().dns_queries, 1);
        assert_eq!(stats.snapshot().dns_cache_hits, 0);

        let second = resolver.connect(&host).unwrap();
        assert_eq!(stats.snapshot().dns_queries, 2);
        assert_eq!(stats.snapshot().dns_cache_hits, 1);

        drop((first, second));
    }

    #[test]
    fn test_stale_cache_entry_is_evicted() {
        let (resolver, cache, stats) = resolver();

        // Grab a port that nothing listens on
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let host = Host {
            name: "127.0.0.1".to_string(),
            port: dead_port,
        };
        cache.insert(
            host.cache_key(),
            format!("127.0.0.1:{}", dead_port).parse().unwrap(),
        );

        // Cached connect fails, the entry goes away, and the fresh attempt
        // fails too because nothing listens there
        let result = resolver.connect(&host);
        assert!(matches!(result, Err(Error::Resolution(_))));
        assert!(cache.is_empty());
        assert_eq!(stats.snapshot().dns_cache_hits, 0);
    }

    #[test]
    fn test_unresolvable_host() {
        let (resolver, _, _) = resolver();
        let host = Host {
            name: "host.invalid".to_string(),
            port: 80,
        };

        assert!(matches!(
            resolver.connect(&host),
            Err(Error::Resolution(_))
        ));
    }
}
