//! Forwarding resolved requests to their targets
//!
//! Direct targets go to the local proxy. Peer targets are sent as a Request
//! frame on the peer's tunnel connection, and the caller waits for the
//! correlated reply, a timeout, or loss of the connection.

use super::{FrameKind, Hub, PeerId, TunnelConnection, TunnelError};
use crate::proxy::{LocalForwarder, ProxyError, Target};
use bytes::Bytes;
use http::{Request, Response, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Entry point used by the HTTP front
pub struct Forwarder {
    hub: Arc<Hub>,
    local: Arc<dyn LocalForwarder>,
    timeout: Duration,
}

/// Removes an exchange from its table if the waiting caller goes away
struct ExchangeGuard<'a> {
    conn: &'a TunnelConnection,
    id: u64,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.conn.abandon_exchange(self.id);
    }
}

impl Forwarder {
    pub fn new(hub: Arc<Hub>, local: Arc<dyn LocalForwarder>, timeout: Duration) -> Self {
        Self {
            hub,
            local,
            timeout,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Timeout applied to tunnelled exchanges
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to `target`, directly or through the tunnel
    pub async fn forward(
        &self,
        target: &Target,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        match target {
            Target::Direct(base) => self.forward_local(base, request).await,
            Target::Peer(peer) => Ok(self
                .forward_via_tunnel(peer, &request, self.timeout)
                .await?),
        }
    }

    /// Hand the request to the direct proxy
    pub async fn forward_local(
        &self,
        base: &Uri,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        self.local.forward(base, request).await
    }

    /// Issue `request` over the tunnel to `peer` and wait for its reply.
    ///
    /// `timeout` bounds the whole exchange, including waiting for room in
    /// the connection's write queue. No retries happen here; a failed
    /// exchange is reported to the caller.
    pub async fn forward_via_tunnel(
        &self,
        peer: &PeerId,
        request: &Request<Bytes>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, TunnelError> {
        let conn = self.hub.lookup(peer)?;

        let reply = conn.open_exchange().map_err(|e| match e {
            TunnelError::ConnectionClosed => TunnelError::PeerUnavailable(peer.clone()),
            other => other,
        })?;
        let id = reply.id();
        let _guard = ExchangeGuard {
            conn: conn.as_ref(),
            id,
        };

        let exchange = async {
            conn.send_request(id, request).await?;
            reply.wait().await
        };

        let frame = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(TunnelError::ConnectionLost | TunnelError::ConnectionClosed)) => {
                debug!("Exchange {} with {} lost with its connection", id, peer);
                return Err(TunnelError::PeerUnavailable(peer.clone()));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("Exchange {} with {} timed out after {:?}", id, peer, timeout);
                return Err(TunnelError::Timeout(timeout));
            }
        };

        match frame.kind {
            FrameKind::Response => frame.into_response().map_err(|e| {
                warn!("Malformed response to exchange {} from {}: {}", id, peer, e);
                TunnelError::PeerError("malformed response from peer".to_string())
            }),
            FrameKind::Error => Err(TunnelError::PeerError(
                frame.error_message().unwrap_or_default(),
            )),
            FrameKind::Request => {
                warn!("Request frame delivered as reply to exchange {} from {}", id, peer);
                Err(TunnelError::PeerError("unexpected request frame from peer".to_string()))
            }
        }
    }
}
