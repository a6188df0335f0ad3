//! Gangway binary entry point
//!
//! Binds the listener, then serves each accepted client on its own thread.
//! All sessions share one resolver cache and one statistics block; a
//! reporter thread logs the counters at a fixed interval.

use clap::Parser;
use gangway::dns::AddrCache;
use gangway::net;
use gangway::proxy::{RelaySession, UpstreamResolver};
use gangway::stats::ProxyStats;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Forward HTTP proxy with CONNECT tunneling")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Listen port
    #[arg(long, default_value_t = 1990)]
    port: u16,

    /// Seconds between statistics reports, zero disables them
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gangway=info")),
        )
        .init();

    let addr: SocketAddr = match format!("{}:{}", args.address, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(address = %args.address, port = args.port, error = %e, "invalid bind address");
            std::process::exit(3);
        }
    };

    let listener = match net::bind_listener(addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to establish listener");
            std::process::exit(3);
        }
    };
    info!(%addr, "listening");

    let stats = Arc::new(ProxyStats::new());
    let cache = Arc::new(AddrCache::new());

    if args.stats_interval > 0 {
        let stats = stats.clone();
        let interval = Duration::from_secs(args.stats_interval);
        thread::spawn(move || loop {
            thread::sleep(interval);
            let snapshot = stats.snapshot();
            info!(
                requests = snapshot.requests,
                bytes_in = snapshot.bytes_in,
                bytes_out = snapshot.bytes_out,
                dns_queries = snapshot.dns_queries,
                dns_cache_hits = snapshot.dns_cache_hits,
                "proxy statistics"
            );
        });
    }

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "accepted connection");

                let resolver = UpstreamResolver::new(cache.clone(), stats.clone());
                let stats = stats.clone();
                thread::spawn(move || {
                    let mut session = RelaySession::new(stream, resolver, stats, peer);
                    if let Err(e) = session.run() {
                        error!(%peer, error = %e, "session failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}
