//! Outbound tunnel client
//!
//! Keeps one link alive to a statically configured peer address. Dial
//! failures and dead links are retried forever with exponential backoff;
//! an unreachable peer never stops the process.

use super::{Hub, PeerId, RequestHandler, TunnelConnection};
use crate::protocol::HandshakeRole;
use crate::transport::{dial, run_link, TransportConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Fraction of the current delay added as random jitter
const JITTER_FRACTION: f64 = 0.2;

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles on every call up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let jitter = self.current.mul_f64(rand::random::<f64>() * JITTER_FRACTION);
        let delay = (self.current + jitter).min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the initial delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Client that maintains the outbound link to one peer
pub struct Client {
    peer_addr: String,
    identity: PeerId,
    hub: Arc<Hub>,
    handler: Arc<dyn RequestHandler>,
    transport: TransportConfig,
    backoff: Backoff,
    attempts: Arc<AtomicU64>,
    current: Arc<Mutex<Option<Arc<TunnelConnection>>>>,
}

/// Handle to a running client task
pub struct ClientHandle {
    task: JoinHandle<()>,
    attempts: Arc<AtomicU64>,
    hub: Arc<Hub>,
    current: Arc<Mutex<Option<Arc<TunnelConnection>>>>,
}

impl ClientHandle {
    /// Connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Stop reconnecting and close the current link, if any
    pub fn abort(&self) {
        self.task.abort();

        if let Some(conn) = self.current.lock().take() {
            conn.close();
            self.hub.deregister(conn.peer(), &conn);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Client {
    /// Create a client dialing `peer_addr` and announcing `identity`
    pub fn new(
        peer_addr: impl Into<String>,
        identity: PeerId,
        hub: Arc<Hub>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            identity,
            hub,
            handler,
            transport: TransportConfig::default(),
            backoff: Backoff::default(),
            attempts: Arc::new(AtomicU64::new(0)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run the reconnect loop on a background task
    pub fn spawn(self) -> ClientHandle {
        let attempts = Arc::clone(&self.attempts);
        let hub = Arc::clone(&self.hub);
        let current = Arc::clone(&self.current);
        ClientHandle {
            task: tokio::spawn(self.run()),
            attempts,
            hub,
            current,
        }
    }

    /// Reconnect loop; never returns
    pub async fn run(mut self) {
        info!("Tunnel client for {} started", self.peer_addr);

        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;

            match dial(&self.peer_addr, &self.transport).await {
                Ok(stream) => {
                    let mut connected = false;
                    let result = run_link(
                        stream,
                        &self.identity,
                        HandshakeRole::Initiator,
                        &self.hub,
                        Arc::clone(&self.handler),
                        |conn| {
                            info!(
                                "Connected to {} as peer {} (attempt {})",
                                self.peer_addr,
                                conn.peer(),
                                attempt
                            );
                            *self.current.lock() = Some(Arc::clone(conn));
                            connected = true;
                        },
                    )
                    .await;

                    self.current.lock().take();

                    if connected {
                        self.backoff.reset();
                    }

                    match result {
                        Ok(()) => info!("Tunnel to {} closed", self.peer_addr),
                        Err(e) => warn!("Tunnel to {} failed: {}", self.peer_addr, e),
                    }
                }
                Err(e) => {
                    warn!("Dial {} failed (attempt {}): {}", self.peer_addr, attempt, e);
                }
            }

            let delay = self.backoff.next_delay();
            info!("Reconnecting to {} in {:?}", self.peer_addr, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
