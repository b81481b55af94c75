//! Correlation of outstanding requests with their replies
//!
//! Each tunnel connection owns one table. An entry is created when a
//! Request frame is about to be sent and is removed exactly once: by the
//! matching terminal frame, by the caller giving up, or by connection
//! teardown.

use super::{Frame, TunnelError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

type ReplySender = oneshot::Sender<Result<Frame, TunnelError>>;

struct PendingEntry {
    tx: ReplySender,
    created_at: Instant,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<u64, PendingEntry>,
    /// Set once by teardown; no entries may be added afterwards
    closed: bool,
}

/// Waiting side of a pending entry
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Result<Frame, TunnelError>>,
}

impl PendingReply {
    /// Correlation ID to stamp on the outgoing request
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the terminal frame or a connection failure
    pub async fn wait(self) -> Result<Frame, TunnelError> {
        // A dropped sender without delivery only happens if the table itself is gone
        self.rx.await.unwrap_or(Err(TunnelError::ConnectionLost))
    }
}

/// Pending-reply table for one connection
pub struct PendingTable {
    state: Mutex<TableState>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh correlation ID and register a waiter for it
    pub fn register(&self) -> Result<PendingReply, TunnelError> {
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();
        if state.closed {
            return Err(TunnelError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.entries.insert(
            id,
            PendingEntry {
                tx,
                created_at: Instant::now(),
            },
        );

        Ok(PendingReply { id, rx })
    }

    /// Deliver a terminal frame to its waiter.
    ///
    /// Returns false when no entry exists for the frame's ID (already timed
    /// out, already resolved, or never issued).
    pub fn resolve(&self, frame: Frame) -> bool {
        let entry = self.state.lock().entries.remove(&frame.id);

        match entry {
            Some(entry) => {
                trace!(
                    "Resolved exchange {} after {:?}",
                    frame.id,
                    entry.created_at.elapsed()
                );
                // The waiter may have been dropped concurrently; nothing to deliver to then
                entry.tx.send(Ok(frame)).is_ok()
            }
            None => false,
        }
    }

    /// Drop an entry without delivering anything
    pub fn remove(&self, id: u64) -> bool {
        self.state.lock().entries.remove(&id).is_some()
    }

    /// Fail every outstanding entry with `ConnectionLost` and refuse new ones.
    ///
    /// Returns the number of entries failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(TunnelError::ConnectionLost));
        }
        count
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
