//! Per-connection state

use crate::protocol::ServerMessage;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Message queued for a connection's socket task.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    /// JSON text frame
    Frame(String),
    /// Protocol-level liveness probe (WebSocket ping)
    Ping,
    /// Forcible close; the socket task exits on receipt
    Terminate,
}

/// A connected client
pub struct ClientConnection {
    /// Opaque connection id, stable for the socket's lifetime
    pub id: Uuid,
    /// Externally-assigned identity (pluggable, random by default)
    pub client_id: String,
    /// Channels this connection is currently a member of
    channels: RwLock<HashSet<String>>,
    /// Cleared by each heartbeat sweep, set again by any inbound traffic
    alive: AtomicBool,
    /// Sender half of the socket task's outbound queue
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientConnection {
    pub(crate) fn new(client_id: String, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            channels: RwLock::new(HashSet::new()),
            alive: AtomicBool::new(true),
            tx,
        }
    }

    /// Queue a frame for this connection. Connections whose socket task has
    /// already exited are skipped without error.
    pub(crate) fn send(&self, message: &ServerMessage) {
        let text = serde_json::to_string(message).expect("server frames always serialize");
        if self.tx.send(Outbound::Frame(text)).is_err() {
            debug!(conn_id = %self.id, "dropping frame for closed connection");
        }
    }

    pub(crate) fn ping(&self) {
        let _ = self.tx.send(Outbound::Ping);
    }

    pub(crate) fn terminate(&self) {
        let _ = self.tx.send(Outbound::Terminate);
    }

    /// Any inbound traffic counts as proof of life.
    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Returns whether the connection was seen alive since the previous
    /// sweep, and clears the flag for the next one.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.read().contains(channel)
    }

    pub(crate) fn add_channel(&self, channel: &str) {
        self.channels.write().insert(channel.to_string());
    }

    pub(crate) fn remove_channel(&self, channel: &str) {
        self.channels.write().remove(channel);
    }

    /// Snapshot of current memberships
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().iter().cloned().collect()
    }
}
