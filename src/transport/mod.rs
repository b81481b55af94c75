//! Transport layer
//!
//! Tunnels ride on plain TCP:
//! - Dialing with a connect timeout
//! - Accepting inbound tunnel links
//! - Running one link from handshake to teardown

mod tcp;

pub use tcp::{dial, run_link, serve_tunnels};

use crate::protocol::ProtocolError;
use crate::tunnel::TunnelError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake error: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Timeout")]
    Timeout,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on tunnel sockets
    pub nodelay: bool,
    /// Maximum concurrent inbound tunnel links
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            max_connections: 64,
        }
    }
}
