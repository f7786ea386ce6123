//! Per-process table of live connections.
//!
//! Every connection gets a bounded mailbox and exactly one delivery task that
//! owns the transport. Producers only ever enqueue, so writes to one socket
//! can never interleave.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chorus_core::{ConnectionId, OutboundFrame};

/// Write failure on a client transport.
#[derive(Debug, thiserror::Error)]
#[error("transport write failed: {0}")]
pub struct TransportError(pub String);

/// The write half of a client connection.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

struct Mailbox {
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
    delivery: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    mailboxes: HashMap<ConnectionId, Mailbox>,
    closed: bool,
}

/// Registry of every connection held by this process.
pub struct Registry {
    table: Mutex<Table>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            capacity: capacity.max(1),
        }
    }

    /// Create the mailbox and delivery task for `id`.
    ///
    /// Returns the connection's close signal, which fires once the delivery
    /// task has stopped. Returns `None` without touching the existing entry
    /// if `id` is already registered, and always once `close_all` has run.
    pub fn register<T: Transport>(&self, id: ConnectionId, transport: T) -> Option<CancellationToken> {
        let mut table = self.table.lock();
        if table.closed {
            tracing::debug!(connection_id = %id, "Registry closed, refusing connection");
            return None;
        }
        if table.mailboxes.contains_key(&id) {
            tracing::warn!(connection_id = %id, "Connection already registered, ignoring");
            return None;
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let closed = CancellationToken::new();
        let delivery = tokio::spawn(deliver(id.clone(), rx, transport, closed.clone()));
        table.mailboxes.insert(
            id,
            Mailbox {
                tx,
                closed: closed.clone(),
                delivery,
            },
        );
        Some(closed)
    }

    /// Remove `id` and close its mailbox. Queued frames still drain before
    /// the delivery task exits. Returns whether an entry was removed.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        // Dropping the sender outside the lock ends the delivery loop.
        let removed = self.table.lock().mailboxes.remove(id);
        removed.is_some()
    }

    /// Enqueue `text` for one connection. Absent connections are expected
    /// (the peer may have just left) and are not an error.
    pub fn send(&self, id: &ConnectionId, text: String) -> bool {
        let tx = self.table.lock().mailboxes.get(id).map(|m| m.tx.clone());
        match tx {
            Some(tx) => offer(id, &tx, text),
            None => {
                tracing::debug!(connection_id = %id, "Send to unknown connection dropped");
                false
            }
        }
    }

    /// Serialize and enqueue a frame for one connection.
    pub fn send_frame(&self, id: &ConnectionId, frame: &OutboundFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send(id, json),
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Failed to encode frame");
                false
            }
        }
    }

    /// Enqueue `text` for every connection registered at the time of the
    /// call. Returns how many mailboxes accepted it.
    pub fn broadcast(&self, text: &str) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<String>)> = self
            .table
            .lock()
            .mailboxes
            .iter()
            .map(|(id, m)| (id.clone(), m.tx.clone()))
            .collect();

        targets
            .iter()
            .filter(|(id, tx)| offer(id, tx, text.to_string()))
            .count()
    }

    /// Close every transport and mailbox, waiting for delivery tasks to
    /// finish. The registry accepts no connections afterwards. Used only
    /// during shutdown. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, Mailbox)> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.mailboxes.drain().collect()
        };
        let count = drained.len();

        let mut deliveries = Vec::with_capacity(count);
        for (_, mailbox) in drained {
            mailbox.closed.cancel();
            deliveries.push(mailbox.delivery);
        }
        for delivery in deliveries {
            let _ = delivery.await;
        }

        tracing::info!(closed = count, "Closed all connections");
        count
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.table.lock().mailboxes.len()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.table.lock().mailboxes.contains_key(id)
    }
}

/// Non-blocking enqueue. A full mailbox drops the message for that
/// connection only.
fn offer(id: &ConnectionId, tx: &mpsc::Sender<String>, text: String) -> bool {
    match tx.try_send(text) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            tracing::warn!(
                connection_id = %id,
                msg_len = msg.len(),
                "Mailbox full, dropping message"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// The only task that ever writes to this connection's transport.
async fn deliver<T: Transport>(
    id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    mut transport: T,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(text) => {
                    if let Err(e) = transport.send_text(text).await {
                        tracing::debug!(connection_id = %id, error = %e, "Write failed, stopping delivery");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    transport.close().await;
    closed.cancel();
    tracing::trace!(connection_id = %id, "Delivery loop stopped");
}
