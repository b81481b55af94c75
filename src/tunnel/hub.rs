//! Process-wide registry of live tunnel connections
//!
//! Holds at most one active connection per peer identity. A newer
//! connection for the same identity replaces the older one, which is closed
//! before the newer one becomes visible.

use super::{PeerId, TunnelConnection, TunnelError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of tunnel connections keyed by peer identity
#[derive(Default)]
pub struct Hub {
    connections: RwLock<HashMap<PeerId, Arc<TunnelConnection>>>,
}

impl Hub {
    /// Create the hub. One per process; share it by `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install `conn` as the link for its peer, closing any link it replaces.
    ///
    /// Fails with `ConnectionClosed` if `conn` died before admission.
    pub fn register(&self, conn: Arc<TunnelConnection>) -> Result<(), TunnelError> {
        let peer = conn.peer().clone();
        let mut connections = self.connections.write();

        if !conn.mark_active() && !conn.is_active() {
            return Err(TunnelError::ConnectionClosed);
        }

        if let Some(previous) = connections.remove(&peer) {
            if !Arc::ptr_eq(&previous, &conn) {
                info!(
                    "Replacing tunnel connection {} to {} with {}",
                    previous.id(),
                    peer,
                    conn.id()
                );
                previous.shutdown();
            }
        }

        info!(
            "Registered tunnel connection {} to {} ({:?})",
            conn.id(),
            peer,
            conn.direction()
        );
        connections.insert(peer, conn);
        Ok(())
    }

    /// Current active connection for `peer`
    pub fn lookup(&self, peer: &PeerId) -> Result<Arc<TunnelConnection>, TunnelError> {
        self.connections
            .read()
            .get(peer)
            .filter(|conn| conn.is_active())
            .cloned()
            .ok_or_else(|| TunnelError::PeerUnavailable(peer.clone()))
    }

    /// Remove the mapping for `peer` only if it still points at `conn`.
    ///
    /// Returns whether anything was removed.
    pub fn deregister(&self, peer: &PeerId, conn: &Arc<TunnelConnection>) -> bool {
        let mut connections = self.connections.write();

        match connections.get(peer) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(peer);
                debug!("Deregistered tunnel connection {} to {}", conn.id(), peer);
                true
            }
            _ => false,
        }
    }

    /// Peers that currently have a registered connection
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection
    pub fn close_all(&self) {
        let drained: Vec<Arc<TunnelConnection>> =
            self.connections.write().drain().map(|(_, conn)| conn).collect();

        for conn in drained {
            conn.close();
        }
    }
}
