//! Gangway - Forward HTTP Proxy
//!
//! This crate provides the relay engine behind the `gangway` binary: plain
//! HTTP forwarding with keep-alive reuse on both sides, and opaque tunnels
//! for `CONNECT`.

pub mod dns;
pub mod net;
pub mod proxy;
pub mod stats;
