//! Redis transport
//!
//! Uses two logically separate connections, as Redis requires: a dedicated
//! pub/sub connection (split into sink and stream) for subscriptions, and a
//! multiplexed connection for PUBLISH and other ordinary commands.

use super::transport::{async_trait, PubSubTransport, TransportError, TransportEvent};
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct RedisTransport {
    publisher: MultiplexedConnection,
    sink: tokio::sync::Mutex<PubSubSink>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RedisTransport {
    /// Connect to Redis and return the transport together with the event
    /// receiver carrying every message for currently-subscribed channels.
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        let pubsub = client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(channel = %channel, error = %error, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx
                    .send(TransportEvent { channel, payload })
                    .is_err()
                {
                    break;
                }
            }
            debug!("redis pub/sub stream ended");
        });

        debug!(url, "connected redis transport");

        Ok((
            Arc::new(Self {
                publisher,
                sink: tokio::sync::Mutex::new(sink),
                listener: parking_lot::Mutex::new(Some(listener)),
            }),
            rx,
        ))
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.sink.lock().await.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        if channels.is_empty() {
            return Ok(());
        }
        self.sink.lock().await.unsubscribe(channels).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, TransportError> {
        // MultiplexedConnection is cheap to clone and safe to use per-call
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(channel, message).await?;
        Ok(receivers)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}
