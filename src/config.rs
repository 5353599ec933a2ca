//! Configuration surface consumed by the relay engine.
//!
//! The engine does not load configuration itself; the serving binary
//! (or an embedding application) builds a [`RelayConfig`] and hands it
//! to [`crate::server::RelayServer`].

use std::net::IpAddr;
use std::time::Duration;

/// Relay engine configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public-facing IP advertised in XOR-RELAYED-ADDRESS
    pub public_ip: IpAddr,
    /// UDP port the engine listens on (0 picks an ephemeral port)
    pub port: u16,
    /// Realm for the long-term credential mechanism
    pub realm: String,
    /// Shared secret for time-limited credentials
    pub shared_secret: String,
    /// Inclusive port range the relay endpoints are drawn from
    pub relay_ports: (u16, u16),
    /// Lifetime granted when a request carries no LIFETIME attribute
    pub default_lifetime: Duration,
    /// Upper bound on any granted allocation lifetime
    pub max_lifetime: Duration,
    /// Permission lifetime
    pub permission_lifetime: Duration,
    /// Channel binding lifetime
    pub channel_lifetime: Duration,
    /// Maximum age of a server-issued nonce
    pub nonce_lifetime: Duration,
    /// Optional SOFTWARE attribute value for responses
    pub software: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            public_ip: IpAddr::from([127, 0, 0, 1]),
            port: 3478,
            realm: "turn-relay".into(),
            shared_secret: String::new(),
            relay_ports: (49152, 65535),
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            permission_lifetime: Duration::from_secs(300),
            channel_lifetime: Duration::from_secs(600),
            nonce_lifetime: Duration::from_secs(3600),
            software: Some(concat!("turn-relay ", env!("CARGO_PKG_VERSION")).into()),
        }
    }
}
