//! TURN Relay Engine (lib.rs)
//!
//! Standalone TURN relay for WebRTC NAT traversal: STUN codec,
//! time-limited credential issuance, allocations, permissions, channel
//! bindings and the UDP relay data path.

#![warn(clippy::all)]

pub mod allocation;
pub mod auth;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stun;

// Re-export main types
pub use allocation::{Allocation, AllocationTable, ClientId, Transport};
pub use auth::{Credential, NonceManager};
pub use config::RelayConfig;
pub use error::{AllocationError, AuthError, RelayError, RelayResult, StunError};
pub use server::RelayServer;
pub use stun::{Attribute, Message, MessageClass, Method, TransactionId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        // Reduce verbosity of some dependencies
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true)
        )
        .with(filter)
        .init();
}
