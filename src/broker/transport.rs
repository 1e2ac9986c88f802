//! External pub/sub transport contract
//!
//! The broker is generic over the upstream channel: anything that can
//! subscribe, unsubscribe, publish, and emit `(channel, payload)` events
//! works. Publish and subscribe must use logically separate connections;
//! a connection in subscribe mode cannot issue ordinary commands.

pub use async_trait::async_trait;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection error: {0}")]
    Connection(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("transport closed")]
    Closed,
}

/// A raw message delivered by the transport for a subscribed channel.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub channel: String,
    pub payload: String,
}

/// Upstream pub/sub operations.
///
/// Implementations hand the broker an event receiver at construction time;
/// the broker owns the dispatch loop over it.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Subscribe the shared upstream connection to a channel.
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Unsubscribe from one or more channels in a single call.
    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError>;

    /// Publish a raw message, returning how many upstream receivers saw it.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, TransportError>;

    /// Close the underlying connections.
    async fn close(&self) -> Result<(), TransportError>;
}
