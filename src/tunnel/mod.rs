//! Tunnel layer - multiplexed HTTP exchanges between router nodes
//!
//! Provides:
//! - Frame encoding/decoding
//! - Per-connection correlation of requests and replies
//! - The process-wide hub of live peer links
//! - Outbound client with reconnection
//! - The forwarder used by the HTTP front

mod client;
mod connection;
mod forwarder;
mod frame;
mod hub;
mod pending;

pub use client::{Backoff, Client, ClientHandle};
pub use connection::{ConnectionState, Direction, TunnelConnection};
pub use forwarder::Forwarder;
pub use frame::{Frame, FrameKind, Headers, FRAME_LENGTH_SIZE};
pub use hub::Hub;
pub use pending::{PendingReply, PendingTable};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection lost while waiting for reply")]
    ConnectionLost,

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(PeerId),

    #[error("Peer error: {0}")]
    PeerError(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity a router node announces during the tunnel handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Local handling path for Request frames arriving from a peer.
///
/// The returned frame must be a Response or Error frame; the connection
/// stamps it with the request's correlation id before sending it back.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Frame) -> Frame;
}
