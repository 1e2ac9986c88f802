//! In-process loopback transport
//!
//! Routes published messages straight back through the event channel for
//! every channel currently subscribed. Useful for single-node deployments
//! and as the transport under the integration tests. Self-delivery takes
//! the same async path a remote transport would use.

use super::transport::{async_trait, PubSubTransport, TransportError, TransportEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct MemoryTransport {
    subscriptions: parking_lot::Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                subscriptions: parking_lot::Mutex::new(HashSet::new()),
                events: tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.subscriptions.lock().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut subscriptions = self.subscriptions.lock();
        for channel in channels {
            subscriptions.remove(channel);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, TransportError> {
        self.ensure_open()?;
        if !self.subscriptions.lock().contains(channel) {
            return Ok(0);
        }
        self.events
            .send(TransportEvent {
                channel: channel.to_string(),
                payload: message.to_string(),
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(1)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.lock().clear();
        Ok(())
    }
}
