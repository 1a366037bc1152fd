//! Shared infrastructure for the integration tests.
#![allow(dead_code)]

pub mod mock_upstream;

use std::net::SocketAddr;

use smtp_proxy::config::{self, Config};

pub use mock_upstream::{MockUpstream, UpstreamCommand};

pub const PROXY_USERNAME: &str = "proxyuser";
pub const PROXY_PASSWORD: &str = "proxypass";
pub const UPSTREAM_USERNAME: &str = "relay@example.com";
pub const UPSTREAM_PASSWORD: &str = "upstream-secret";

/// A configuration pointing at `upstream`, listening on an ephemeral port.
pub fn config_for(upstream: SocketAddr) -> Config {
    let host = upstream.ip().to_string();
    let port = upstream.port().to_string();

    Config::from_lookup(|key| {
        let value = match key {
            config::LISTEN_ADDR => "127.0.0.1:0",
            config::SERVER_DOMAIN => "proxy.test",
            config::PROXY_USERNAME => PROXY_USERNAME,
            config::PROXY_PASSWORD => PROXY_PASSWORD,
            config::DEST_HOST => &host,
            config::DEST_PORT => &port,
            config::DEST_USERNAME => UPSTREAM_USERNAME,
            config::DEST_PASSWORD => UPSTREAM_PASSWORD,
            config::DEST_FROM => "outbound@example.com",
            config::MAX_MESSAGE_SIZE => "4096",
            _ => return None,
        };
        Some(value.to_string())
    })
    .expect("Test configuration should be valid")
}
