//! TCP transport for tunnel links

use super::{TransportConfig, TransportError};
use crate::protocol::{handshake, HandshakeRole};
use crate::tunnel::{Direction, Hub, PeerId, RequestHandler, TunnelConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Open a TCP connection to a peer
pub async fn dial(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Small frames (errors, empty responses) should not wait on Nagle
    stream.set_nodelay(config.nodelay).ok();

    Ok(stream)
}

/// Drive one tunnel link: handshake, hub admission, read loop, teardown.
///
/// `on_active` runs once the connection is registered and usable.
/// Returns when the link is gone.
pub async fn run_link<F>(
    mut stream: TcpStream,
    local: &PeerId,
    role: HandshakeRole,
    hub: &Arc<Hub>,
    handler: Arc<dyn RequestHandler>,
    on_active: F,
) -> Result<(), TransportError>
where
    F: FnOnce(&Arc<TunnelConnection>),
{
    let remote = handshake(&mut stream, local, role).await?;

    let direction = match role {
        HandshakeRole::Initiator => Direction::Outbound,
        HandshakeRole::Responder => Direction::Inbound,
    };

    let (read_half, write_half) = stream.into_split();
    let conn = TunnelConnection::new(remote, direction, write_half);
    hub.register(Arc::clone(&conn))?;
    on_active(&conn);

    conn.run(read_half, handler, hub).await?;
    Ok(())
}

/// Accept inbound tunnel links forever
pub async fn serve_tunnels(
    listener: TcpListener,
    local: PeerId,
    hub: Arc<Hub>,
    handler: Arc<dyn RequestHandler>,
    config: TransportConfig,
) -> Result<(), TransportError> {
    let limit = Arc::new(Semaphore::new(config.max_connections));
    info!("Accepting tunnel links on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Tunnel accept error: {}", e);
                // Persistent failures such as fd exhaustion would otherwise spin
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                continue;
            }
        };

        let permit = match Arc::clone(&limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Rejecting tunnel link from {}: {} links already open",
                    peer_addr, config.max_connections
                );
                continue;
            }
        };

        stream.set_nodelay(config.nodelay).ok();
        debug!("New tunnel link from {}", peer_addr);

        let local = local.clone();
        let hub = Arc::clone(&hub);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let _permit = permit;
            let result = run_link(
                stream,
                &local,
                HandshakeRole::Responder,
                &hub,
                handler,
                |conn| info!("Tunnel link from {} admitted as {}", peer_addr, conn.peer()),
            )
            .await;

            if let Err(e) = result {
                debug!("Tunnel link from {} ended: {}", peer_addr, e);
            }
        });
    }
}
