//! # Bifrost
//!
//! A path-based HTTP router that forwards each inbound request to one of
//! several configured targets. Targets reachable over plain HTTP are proxied
//! directly; targets that live behind another bifrost node are reached
//! through a persistent tunnel that multiplexes many HTTP exchanges over a
//! single TCP link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    HTTP Front                        │
//! │          (axum router, regex path routes)            │
//! ├─────────────────────────────────────────────────────┤
//! │                    Forwarder                         │
//! │        (direct proxy  |  tunnel exchange)            │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Layer                        │
//! │   (hub, connections, pending replies, frames)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                      │
//! │          (TCP dial/accept, identity handshake)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum encoded frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
