//! Tunnel connection lifecycle
//!
//! Wraps one physical duplex link to exactly one peer:
//! - Write queue drained by a dedicated writer task, so concurrent senders
//!   never interleave bytes of different frames
//! - Read loop that dispatches requests to the local handler and replies to
//!   the pending-reply table
//! - Teardown that fails every outstanding exchange and leaves the hub

use super::{Frame, FrameKind, Hub, PeerId, PendingReply, PendingTable, RequestHandler, TunnelError};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Depth of the per-connection write queue
const WRITE_QUEUE_DEPTH: usize = 256;

/// Frames written before forcing a flush
const MAX_WRITE_BATCH: usize = 32;

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from a peer
    Inbound,
    /// Dialed to a peer
    Outbound,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake done, not yet admitted by the hub
    Connecting = 0,
    /// Registered and usable
    Active = 1,
    /// Torn down; never reused
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }
}

/// A tunnel connection to one peer
pub struct TunnelConnection {
    id: u64,
    peer: PeerId,
    direction: Direction,
    state: AtomicU8,
    write_tx: mpsc::Sender<Bytes>,
    pending: PendingTable,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelConnection {
    /// Create a connection over the write half of an established link.
    ///
    /// Spawns the writer task; the read half is driven later by [`run`](Self::run).
    pub fn new<W>(peer: PeerId, direction: Direction, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            direction,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            write_tx,
            pending: PendingTable::new(),
            shutdown_tx,
        });

        tokio::spawn(write_loop(
            BufWriter::new(writer),
            write_rx,
            shutdown_rx,
            Arc::downgrade(&conn),
        ));

        conn
    }

    /// Process-unique connection number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the remote node
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of exchanges waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Move from Connecting to Active. Fails if the link already died.
    pub(crate) fn mark_active(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Queue a frame for sending
    pub async fn send(&self, frame: &Frame) -> Result<(), TunnelError> {
        if !self.is_active() {
            return Err(TunnelError::ConnectionClosed);
        }

        let encoded = frame.encode()?.freeze();
        trace!(
            "Queueing {:?} frame {} to {} ({} bytes)",
            frame.kind,
            frame.id,
            self.peer,
            encoded.len()
        );

        self.write_tx
            .send(encoded)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Register a pending reply for a new exchange.
    ///
    /// The caller owns the slot from here on: it must either wait for the
    /// reply or call [`abandon_exchange`](Self::abandon_exchange).
    pub fn open_exchange(&self) -> Result<PendingReply, TunnelError> {
        if !self.is_active() {
            return Err(TunnelError::ConnectionClosed);
        }
        self.pending.register()
    }

    /// Send the request frame of exchange `id`.
    ///
    /// The body is shared with the caller's request, which stays intact.
    /// Waits for room in the write queue.
    pub async fn send_request(
        &self,
        id: u64,
        request: &http::Request<Bytes>,
    ) -> Result<(), TunnelError> {
        let frame = Frame::from_request(id, request);
        self.send(&frame).await?;

        debug!(
            "Sent {} {} to {} as exchange {}",
            frame.method, frame.path, self.peer, id
        );
        Ok(())
    }

    /// Forget an exchange whose caller stopped waiting.
    ///
    /// A reply arriving later is dropped by the read loop.
    pub fn abandon_exchange(&self, id: u64) -> bool {
        self.pending.remove(id)
    }

    /// Close the connection. Idempotent.
    ///
    /// Outstanding exchanges fail immediately; the read loop then exits and
    /// removes the connection from the hub.
    pub fn close(&self) {
        self.shutdown();
    }

    /// Transition to Closed and fail outstanding exchanges.
    ///
    /// Returns false if the connection was already closed.
    pub(crate) fn shutdown(&self) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if ConnectionState::from(previous) == ConnectionState::Closed {
            return false;
        }

        let failed = self.pending.fail_all();
        self.shutdown_tx.send_replace(true);

        info!(
            "Tunnel connection {} to {} ({:?}) closed, {} exchange(s) failed",
            self.id, self.peer, self.direction, failed
        );
        true
    }

    /// Run the read loop until the link dies or the connection is closed,
    /// then tear down and deregister from `hub`.
    pub async fn run<R>(
        self: Arc<Self>,
        reader: R,
        handler: Arc<dyn RequestHandler>,
        hub: &Hub,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self.read_loop(reader, &handler).await;

        match &result {
            Ok(()) => debug!("Read loop for {} ended", self.peer),
            Err(e) => warn!("Tunnel connection {} to {} failed: {}", self.id, self.peer, e),
        }

        self.shutdown();
        hub.deregister(&self.peer, &self);
        result
    }

    async fn read_loop<R>(
        self: &Arc<Self>,
        mut reader: R,
        handler: &Arc<dyn RequestHandler>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            while let Some(frame) = Frame::decode(&mut buf)? {
                self.dispatch(frame, handler);
            }

            if self.is_closed() {
                return Ok(());
            }

            tokio::select! {
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        if buf.is_empty() {
                            return Ok(());
                        }
                        return Err(TunnelError::InvalidFrame(format!(
                            "Link closed with {} bytes of a partial frame",
                            buf.len()
                        )));
                    }
                }
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, handler: &Arc<dyn RequestHandler>) {
        match frame.kind {
            FrameKind::Request => {
                let conn = Arc::clone(self);
                let handler = Arc::clone(handler);
                let mut shutdown_rx = self.shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let id = frame.id;
                    // Local work for a dead link is abandoned
                    let mut reply = tokio::select! {
                        reply = handler.handle(frame) => reply,
                        _ = closed(&mut shutdown_rx) => {
                            debug!("Dropping exchange {} from {}: connection closed", id, conn.peer);
                            return;
                        }
                    };
                    if !reply.is_terminal() {
                        reply = Frame::error(id, "handler produced a non-terminal frame");
                    }
                    reply.id = id;
                    conn.reply(reply).await;
                });
            }
            FrameKind::Response | FrameKind::Error => {
                let id = frame.id;
                if !self.pending.resolve(frame) {
                    debug!("Dropping reply for unknown exchange {} from {}", id, self.peer);
                }
            }
        }
    }
}

impl TunnelConnection {
    /// Send the terminal frame of an inbound exchange.
    ///
    /// A reply that cannot be encoded is replaced by an Error frame so the
    /// requesting side is never left waiting.
    async fn reply(&self, reply: Frame) {
        let id = reply.id;

        let result = match self.send(&reply).await {
            Err(e @ (TunnelError::FrameTooLarge(..) | TunnelError::InvalidFrame(_))) => {
                warn!("Reply to exchange {} from {} not sendable: {}", id, self.peer, e);
                self.send(&Frame::error(id, e.to_string())).await
            }
            other => other,
        };

        if let Err(e) = result {
            debug!("Could not reply to exchange {} from {}: {}", id, self.peer, e);
        }
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the connection is closed, including before the call
async fn closed(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|closed| *closed).await;
}

/// Drain the write queue into the link, coalescing queued frames per flush
async fn write_loop<W>(
    mut writer: BufWriter<W>,
    mut rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
    conn: Weak<TunnelConnection>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let first = tokio::select! {
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        if let Err(e) = write_batch(&mut writer, first, &mut rx).await {
            debug!("Tunnel write failed: {}", e);
            if let Some(conn) = conn.upgrade() {
                conn.shutdown();
            }
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_batch<W>(
    writer: &mut BufWriter<W>,
    first: Bytes,
    rx: &mut mpsc::Receiver<Bytes>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(&first).await?;

    for _ in 1..MAX_WRITE_BATCH {
        match rx.try_recv() {
            Ok(data) => writer.write_all(&data).await?,
            Err(_) => break,
        }
    }

    writer.flush().await
}
