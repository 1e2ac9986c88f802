//! Pub/sub broker: an adapter over an external transport with local
//! fan-out to multiple in-process handlers per channel.
//!
//! The broker keeps one upstream subscription per channel, alive exactly as
//! long as the channel has at least one registered handler. Concurrent
//! first-subscribers for the same channel are coalesced into a single
//! upstream call through a shared in-flight future.

mod memory;
mod redis;
mod transport;

pub use self::memory::MemoryTransport;
pub use self::redis::RedisTransport;
pub use self::transport::{async_trait, PubSubTransport, TransportError, TransportEvent};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Callback invoked for every raw message delivered on a subscribed channel.
///
/// Handlers are synchronous; a returned error is logged and isolated from
/// the other handlers registered on the same channel.
pub type MessageHandler = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Stable identity of a registered handler, returned by [`Broker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to subscribe to channel '{channel}': {source}")]
    Subscribe {
        channel: String,
        source: Arc<TransportError>,
    },

    #[error("failed to unsubscribe from channel '{channel}': {source}")]
    Unsubscribe {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to publish to channel '{channel}': {source}")]
    Publish {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to close broker: {source}")]
    Close {
        #[source]
        source: TransportError,
    },
}

/// Shared slot that serializes concurrent first-subscribers for one channel.
type PendingSubscribe = Shared<BoxFuture<'static, Result<(), Arc<TransportError>>>>;

struct ChannelRecord {
    handlers: HashMap<HandlerId, MessageHandler>,
    /// In-flight upstream subscribe; present only until the first attempt
    /// resolves. All concurrent callers await this same future.
    pending: Option<PendingSubscribe>,
    /// Identifies the subscribe attempt that created this record, so a
    /// failed waiter never rolls back a record created by a later attempt.
    epoch: u64,
}

/// Adapter over an external pub/sub transport with local multi-handler
/// fan-out per channel.
pub struct Broker {
    transport: Arc<dyn PubSubTransport>,
    channels: Arc<DashMap<String, ChannelRecord>>,
    next_handler: AtomicU64,
    next_epoch: AtomicU64,
    close_transport_on_shutdown: bool,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Create a broker over `transport`, draining `events` until closed.
    /// The transport is left open on [`Broker::close`].
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Arc<Self> {
        Self::with_options(transport, events, false)
    }

    /// Like [`Broker::new`], but `close_transport_on_shutdown` controls
    /// whether [`Broker::close`] also closes the underlying transport.
    pub fn with_options(
        transport: Arc<dyn PubSubTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        close_transport_on_shutdown: bool,
    ) -> Arc<Self> {
        let channels: Arc<DashMap<String, ChannelRecord>> = Arc::new(DashMap::new());
        let dispatch = tokio::spawn(run_dispatch(channels.clone(), events));

        Arc::new(Self {
            transport,
            channels,
            next_handler: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
            close_transport_on_shutdown,
            dispatch: parking_lot::Mutex::new(Some(dispatch)),
        })
    }

    /// Register `handler` for `channel`.
    ///
    /// The first handler for a channel issues exactly one upstream
    /// subscribe; concurrent callers await that same in-flight future. On
    /// upstream failure the speculative record is rolled back before the
    /// error reaches every waiter, so retries start clean.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<HandlerId, BrokerError> {
        loop {
            let waiting = match self.channels.entry(channel.to_string()) {
                Entry::Occupied(entry) => {
                    let record = entry.get();
                    record.pending.clone().map(|p| (p, record.epoch))
                }
                Entry::Vacant(entry) => {
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let pending = {
                        let transport = self.transport.clone();
                        let channel = channel.to_string();
                        async move { transport.subscribe(&channel).await.map_err(Arc::new) }
                    }
                    .boxed()
                    .shared();

                    entry.insert(ChannelRecord {
                        handlers: HashMap::new(),
                        pending: Some(pending.clone()),
                        epoch,
                    });
                    Some((pending, epoch))
                }
            };

            if let Some((pending, epoch)) = waiting {
                match pending.await {
                    Ok(()) => {
                        if let Some(mut record) = self.channels.get_mut(channel) {
                            if record.epoch == epoch {
                                record.pending = None;
                            }
                        }
                        debug!(channel, "subscribed to upstream channel");
                    }
                    Err(source) => {
                        // Roll back only the record this attempt created; a
                        // newer attempt may already own the channel name.
                        self.channels
                            .remove_if(channel, |_, record| record.epoch == epoch);
                        return Err(BrokerError::Subscribe {
                            channel: channel.to_string(),
                            source,
                        });
                    }
                }
            }

            let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
            match self.channels.get_mut(channel) {
                Some(mut record) => {
                    record.handlers.insert(id, handler);
                    return Ok(id);
                }
                // The record was torn down while we waited (the last handler
                // left between the upstream ack and now); start over with a
                // fresh upstream subscribe.
                None => continue,
            }
        }
    }

    /// Remove a handler; the last handler out deletes the record and issues
    /// one upstream unsubscribe. Unknown channels or handlers are a no-op.
    pub async fn unsubscribe(&self, channel: &str, handler: HandlerId) -> Result<(), BrokerError> {
        match self.channels.get_mut(channel) {
            Some(mut record) => {
                if record.handlers.remove(&handler).is_none() {
                    return Ok(());
                }
                if !record.handlers.is_empty() || record.pending.is_some() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }

        let removed = self
            .channels
            .remove_if(channel, |_, record| {
                record.handlers.is_empty() && record.pending.is_none()
            })
            .is_some();

        if removed {
            self.transport
                .unsubscribe(&[channel.to_string()])
                .await
                .map_err(|source| BrokerError::Unsubscribe {
                    channel: channel.to_string(),
                    source,
                })?;
            debug!(channel, "unsubscribed from upstream channel");
        }

        Ok(())
    }

    /// Forward a raw message to the upstream transport.
    ///
    /// Local handlers are reached only via the transport's own broadcast;
    /// self-delivery takes the same async path as remote delivery.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<usize, BrokerError> {
        self.transport
            .publish(channel, message)
            .await
            .map_err(|source| BrokerError::Publish {
                channel: channel.to_string(),
                source,
            })
    }

    /// Unsubscribe every tracked channel in one batch, clear local state,
    /// stop dispatch, and close the transport if configured to.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let tracked: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        self.channels.clear();

        if !tracked.is_empty() {
            self.transport
                .unsubscribe(&tracked)
                .await
                .map_err(|source| BrokerError::Close { source })?;
        }

        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }

        if self.close_transport_on_shutdown {
            self.transport
                .close()
                .await
                .map_err(|source| BrokerError::Close { source })?;
        }

        Ok(())
    }

    /// Number of channels with an active or in-flight upstream subscription.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Drains transport events and fans each one out to the channel's handlers.
/// A failing handler is logged and never blocks the remaining handlers.
async fn run_dispatch(
    channels: Arc<DashMap<String, ChannelRecord>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let handlers: Vec<(HandlerId, MessageHandler)> = match channels.get(&event.channel) {
            Some(record) => record
                .handlers
                .iter()
                .map(|(id, handler)| (*id, handler.clone()))
                .collect(),
            None => continue,
        };

        for (id, handler) in handlers {
            if let Err(err) = handler(&event.payload) {
                error!(channel = %event.channel, handler = %id, error = %err, "broker handler failed");
            }
        }
    }
}
