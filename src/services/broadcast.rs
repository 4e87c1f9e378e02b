//! Broadcast service — connection registry and fan-out.
//!
//! DESIGN
//! ======
//! Every live websocket registers a bounded `mpsc` sender keyed by its client
//! id. Fan-out serializes a message once and `try_send`s the shared text to a
//! point-in-time snapshot of the registry, so it never awaits and never holds
//! the registry lock while delivering.
//!
//! Delivery is reliable-effort. A closed or full queue counts as a failed
//! delivery: the connection is pruned from the registry, which drops the last
//! sender for that queue and ends the session loop reading it. The client
//! resynchronizes from a fresh `init` when it reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Outbound queue of one connection. Carries pre-serialized frames.
pub type Outbound = mpsc::Sender<Utf8Bytes>;

#[derive(Clone, Default)]
pub struct Broadcaster {
    clients: Arc<Mutex<HashMap<Uuid, Outbound>>>,
}

impl Broadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: Uuid, tx: Outbound) {
        let total = {
            let mut clients = self.lock();
            clients.insert(client_id, tx);
            clients.len()
        };
        debug!(%client_id, total, "broadcast: registered connection");
    }

    /// Remove a connection. Absent ids are tolerated and return `false`.
    pub fn deregister(&self, client_id: Uuid) -> bool {
        let removed = self.lock().remove(&client_id).is_some();
        if !removed {
            debug!(%client_id, "broadcast: deregister of unknown connection");
        }
        removed
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `message` to every registered connection. Returns the number
    /// of successful deliveries.
    pub fn fanout(&self, message: &ServerMessage) -> usize {
        match message.encode() {
            Ok(json) => self.fanout_text(&Utf8Bytes::from(json)),
            Err(e) => {
                warn!(error = %e, "broadcast: failed to serialize message");
                0
            }
        }
    }

    /// Deliver pre-serialized text to every registered connection.
    pub fn fanout_text(&self, text: &Utf8Bytes) -> usize {
        let snapshot: Vec<(Uuid, Outbound)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (client_id, tx) in snapshot {
            match tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%client_id, "broadcast: outbound queue full; pruning connection");
                    failed.push(client_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%client_id, "broadcast: outbound queue closed; pruning connection");
                    failed.push(client_id);
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.lock();
            for client_id in &failed {
                clients.remove(client_id);
            }
            warn!(pruned = failed.len(), remaining = clients.len(), "broadcast: removed failed connections");
        }

        delivered
    }

    /// Drop every registration, closing all outbound queues. Used at shutdown.
    pub fn close_all(&self) -> usize {
        let mut clients = self.lock();
        let closed = clients.len();
        clients.clear();
        closed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Outbound>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
