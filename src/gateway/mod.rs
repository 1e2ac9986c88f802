//! WebSocket gateway
//!
//! Bridges client sockets to the broker: owns the socket server, the
//! per-connection and per-channel registries, the client protocol state
//! machine, heartbeat scheduling, and broker-to-client fan-out. Multiple
//! gateway processes coordinate exclusively through the broker transport.

mod connections;

pub use self::connections::ClientConnection;
use self::connections::Outbound;

use crate::broker::{Broker, BrokerError, HandlerId, MessageHandler};
use crate::protocol::{
    epoch_ms, AckAction, ChannelEnvelope, ClientMessage, ErrorCode, ProtocolError, ServerMessage,
};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_PATH: &str = "/ws";
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Close code sent when the handshake validator rejects a connection.
const HANDSHAKE_REJECTED: u16 = 4001;

/// Request details available to the handshake validator and the
/// client-identify function.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

/// Validates an incoming connection before it is registered; an error
/// rejects the socket with close code 4001.
pub type HandshakeValidator =
    Arc<dyn Fn(&ConnectRequest) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Resolves the externally-visible identity of a connection.
pub type IdentifyClient = Arc<dyn Fn(&ConnectRequest) -> BoxFuture<'static, String> + Send + Sync>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("either a listener or a port must be configured")]
    MissingListener,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to subscribe to channel '{channel}': {source}")]
    ChannelSubscribe {
        channel: String,
        source: Arc<BrokerError>,
    },
}

/// Gateway configuration
pub struct GatewayConfig {
    /// Pre-bound listener supplied by the caller
    pub listener: Option<TcpListener>,
    /// Port to bind internally on 127.0.0.1 when no listener is given
    /// (0 picks an ephemeral port)
    pub port: Option<u16>,
    /// Mount path for the WebSocket route
    pub path: String,
    /// Heartbeat sweep interval; values below one second are clamped
    pub heartbeat_interval: Duration,
    /// Whether clients may publish through the gateway
    pub allow_client_publish: bool,
    pub handshake_validator: Option<HandshakeValidator>,
    pub identify_client: Option<IdentifyClient>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listener: None,
            port: None,
            path: DEFAULT_PATH.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            allow_client_publish: true,
            handshake_validator: None,
            identify_client: None,
        }
    }
}

/// Shared slot serializing concurrent first-subscribers for one channel.
type PendingChannel = Shared<BoxFuture<'static, Result<HandlerId, Arc<BrokerError>>>>;

/// Gateway-local channel state; exists iff the channel has at least one
/// member (or a first subscribe still in flight).
struct ChannelState {
    members: HashSet<Uuid>,
    /// Broker handler registration, set once the subscribe resolves
    handler: Option<HandlerId>,
    pending: Option<PendingChannel>,
    /// Identifies the subscribe attempt that created this state
    epoch: u64,
}

struct GatewayInner {
    broker: Arc<Broker>,
    /// Per-process random id stamped on outgoing envelopes
    server_id: String,
    path: String,
    allow_client_publish: bool,
    heartbeat_interval: Duration,
    handshake_validator: Option<HandshakeValidator>,
    identify_client: IdentifyClient,
    clients: DashMap<Uuid, Arc<ClientConnection>>,
    channels: DashMap<String, ChannelState>,
    next_epoch: AtomicU64,
}

struct GatewayRuntime {
    local_addr: SocketAddr,
    server: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// The WebSocket gateway. Create with a broker and a config, then call
/// [`WebSocketGateway::start`]; server-side code publishes through
/// [`WebSocketGateway::publish`].
pub struct WebSocketGateway {
    inner: Arc<GatewayInner>,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    port: Option<u16>,
    runtime: parking_lot::Mutex<Option<GatewayRuntime>>,
}

impl WebSocketGateway {
    pub fn new(broker: Arc<Broker>, config: GatewayConfig) -> Self {
        let identify_client = config
            .identify_client
            .unwrap_or_else(|| Arc::new(|_| futures::future::ready(Uuid::new_v4().to_string()).boxed()));

        let inner = Arc::new(GatewayInner {
            broker,
            server_id: Uuid::new_v4().to_string(),
            path: config.path,
            allow_client_publish: config.allow_client_publish,
            heartbeat_interval: config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            handshake_validator: config.handshake_validator,
            identify_client,
            clients: DashMap::new(),
            channels: DashMap::new(),
            next_epoch: AtomicU64::new(1),
        });

        Self {
            inner,
            listener: parking_lot::Mutex::new(config.listener),
            port: config.port,
            runtime: parking_lot::Mutex::new(None),
        }
    }

    /// The id stamped as `origin` on every envelope this process publishes.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Address the gateway is serving on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Bind (or adopt) the listener, mount the WebSocket route, and start
    /// the heartbeat task. Idempotent.
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        if let Some(runtime) = self.runtime.lock().as_ref() {
            return Ok(runtime.local_addr);
        }

        let taken = self.listener.lock().take();
        let listener = match taken {
            Some(listener) => listener,
            None => match self.port {
                Some(port) => TcpListener::bind(("127.0.0.1", port)).await?,
                None => return Err(GatewayError::MissingListener),
            },
        };

        let local_addr = listener.local_addr()?;
        let app = Router::new()
            .route(&self.inner.path, get(ws_handler))
            .with_state(self.inner.clone());

        let server = tokio::spawn(async move {
            let serve =
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
            if let Err(err) = serve.await {
                error!(error = %err, "websocket server error");
            }
        });

        let heartbeat = tokio::spawn(run_heartbeat(self.inner.clone()));

        *self.runtime.lock() = Some(GatewayRuntime {
            local_addr,
            server,
            heartbeat,
        });

        info!(addr = %local_addr, path = %self.inner.path, "websocket gateway started");
        Ok(local_addr)
    }

    /// Publish a payload to a channel through the broker; the message
    /// reaches local clients only via the normal broker fan-out path.
    pub async fn publish(
        &self,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<usize, GatewayError> {
        publish_envelope(&self.inner, channel, payload).await
    }

    /// Stop the heartbeat, terminate every connection, unsubscribe every
    /// remaining channel, stop serving, then close the broker. Idempotent.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let runtime = match self.runtime.lock().take() {
            Some(runtime) => runtime,
            None => return Ok(()),
        };

        runtime.heartbeat.abort();

        // Terminating a client makes its socket task exit; clearing the
        // registry first keeps the per-task disconnect cleanup a no-op so
        // each channel is unsubscribed exactly once, below.
        let clients: Vec<Arc<ClientConnection>> =
            self.inner.clients.iter().map(|e| e.value().clone()).collect();
        self.inner.clients.clear();
        for client in clients {
            client.terminate();
        }

        let states: Vec<(String, Option<HandlerId>)> = self
            .inner
            .channels
            .iter()
            .map(|e| (e.key().clone(), e.value().handler))
            .collect();
        self.inner.channels.clear();
        for (channel, handler) in states {
            if let Some(handler) = handler {
                if let Err(err) = self.inner.broker.unsubscribe(&channel, handler).await {
                    warn!(channel = %channel, error = %err, "shutdown unsubscribe failed");
                }
            }
        }

        runtime.server.abort();
        self.inner.broker.close().await?;

        info!("websocket gateway stopped");
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(inner): State<Arc<GatewayInner>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let request = ConnectRequest {
        uri,
        headers,
        remote_addr: Some(remote_addr),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, request, inner))
}

async fn handle_socket(mut socket: WebSocket, request: ConnectRequest, inner: Arc<GatewayInner>) {
    if let Some(validator) = &inner.handshake_validator {
        if let Err(err) = validator(&request).await {
            warn!(error = %err, "connection rejected during handshake validation");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: HANDSHAKE_REJECTED,
                    reason: "handshake rejected".into(),
                })))
                .await;
            return;
        }
    }

    let client_id = (inner.identify_client)(&request).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Arc::new(ClientConnection::new(client_id, tx));
    inner.clients.insert(conn.id, conn.clone());

    info!(
        conn_id = %conn.id,
        client_id = %conn.client_id,
        remote = ?request.remote_addr,
        "client connected"
    );

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(text)) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Terminate) | None => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(message)) => {
                    conn.mark_alive();
                    match message {
                        Message::Text(text) => handle_text_frame(&inner, &conn, &text).await,
                        Message::Binary(data) => {
                            let text = String::from_utf8_lossy(&data).into_owned();
                            handle_text_frame(&inner, &conn, &text).await;
                        }
                        Message::Ping(_) | Message::Pong(_) => {
                            // Pings are answered automatically by axum; any
                            // traffic already re-marked the connection alive
                        }
                        Message::Close(_) => break,
                    }
                }
                Some(Err(err)) => {
                    warn!(conn_id = %conn.id, error = %err, "websocket error");
                    break;
                }
                None => break,
            },
        }
    }

    disconnect(&inner, &conn).await;
}

async fn handle_text_frame(inner: &Arc<GatewayInner>, conn: &Arc<ClientConnection>, raw: &str) {
    let message = match ClientMessage::parse(raw) {
        Ok(message) => message,
        Err(ProtocolError::UnknownType(kind)) => {
            conn.send(&ServerMessage::error(
                ErrorCode::UnknownMessageType,
                format!("unsupported message type '{kind}'"),
            ));
            return;
        }
        Err(err) => {
            debug!(conn_id = %conn.id, error = %err, "invalid frame");
            conn.send(&ServerMessage::error(
                ErrorCode::InvalidMessage,
                "unable to parse incoming message",
            ));
            return;
        }
    };

    if let Err(err) = dispatch(inner, conn, message).await {
        error!(conn_id = %conn.id, error = %err, "failed to process client message");
        conn.send(&ServerMessage::error(
            ErrorCode::MessageProcessingFailed,
            "failed to process client message",
        ));
    }
}

async fn dispatch(
    inner: &Arc<GatewayInner>,
    conn: &Arc<ClientConnection>,
    message: ClientMessage,
) -> Result<(), GatewayError> {
    match message {
        ClientMessage::Subscribe { channels } => handle_subscribe(inner, conn, channels).await,
        ClientMessage::Unsubscribe { channels } => handle_unsubscribe(inner, conn, channels).await,
        ClientMessage::Publish { channel, payload } => {
            if !inner.allow_client_publish {
                conn.send(&ServerMessage::error(
                    ErrorCode::ClientPublishForbidden,
                    "client initiated publish is disabled",
                ));
                return Ok(());
            }
            publish_envelope(inner, &channel, payload).await?;
            Ok(())
        }
        ClientMessage::Ping => {
            conn.send(&ServerMessage::Pong {
                timestamp: epoch_ms(),
            });
            Ok(())
        }
    }
}

/// Wrap a payload in an envelope stamped with this process and hand it to
/// the broker. Never echoes directly to local clients.
async fn publish_envelope(
    inner: &GatewayInner,
    channel: &str,
    payload: serde_json::Value,
) -> Result<usize, GatewayError> {
    let envelope = ChannelEnvelope::new(payload, inner.server_id.clone());
    let raw = serde_json::to_string(&envelope)?;
    Ok(inner.broker.publish(channel, &raw).await?)
}

async fn handle_subscribe(
    inner: &Arc<GatewayInner>,
    conn: &Arc<ClientConnection>,
    channels: Vec<String>,
) -> Result<(), GatewayError> {
    let mut changed = Vec::new();
    for channel in channels {
        // Resubscribing is silently idempotent
        if conn.has_channel(&channel) {
            continue;
        }
        join_channel(inner, conn, &channel).await?;
        changed.push(channel);
    }

    if changed.is_empty() {
        return Ok(());
    }

    debug!(conn_id = %conn.id, channels = ?changed, "client subscribed");
    conn.send(&ServerMessage::Ack {
        action: AckAction::Subscribe,
        channels: changed,
    });
    Ok(())
}

async fn handle_unsubscribe(
    inner: &Arc<GatewayInner>,
    conn: &Arc<ClientConnection>,
    channels: Vec<String>,
) -> Result<(), GatewayError> {
    let mut changed = Vec::new();
    for channel in channels {
        // Only channels the connection actually belongs to
        if !conn.has_channel(&channel) {
            continue;
        }
        leave_channel(inner, conn, &channel).await?;
        changed.push(channel);
    }

    if changed.is_empty() {
        return Ok(());
    }

    debug!(conn_id = %conn.id, channels = ?changed, "client unsubscribed");
    conn.send(&ServerMessage::Ack {
        action: AckAction::Unsubscribe,
        channels: changed,
    });
    Ok(())
}

/// Add a connection to a channel, lazily creating the channel state and
/// issuing the broker subscribe for the first member. Concurrent first
/// subscribers await the same in-flight future.
async fn join_channel(
    inner: &Arc<GatewayInner>,
    conn: &Arc<ClientConnection>,
    channel: &str,
) -> Result<(), GatewayError> {
    loop {
        let waiting = match inner.channels.entry(channel.to_string()) {
            Entry::Occupied(entry) => {
                let state = entry.get();
                state.pending.clone().map(|p| (p, state.epoch))
            }
            Entry::Vacant(entry) => {
                let epoch = inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                let handler = broker_handler(inner, channel);
                let pending = {
                    let broker = inner.broker.clone();
                    let channel = channel.to_string();
                    async move { broker.subscribe(&channel, handler).await.map_err(Arc::new) }
                }
                .boxed()
                .shared();

                entry.insert(ChannelState {
                    members: HashSet::new(),
                    handler: None,
                    pending: Some(pending.clone()),
                    epoch,
                });
                Some((pending, epoch))
            }
        };

        if let Some((pending, epoch)) = waiting {
            match pending.await {
                Ok(handler_id) => {
                    if let Some(mut state) = inner.channels.get_mut(channel) {
                        if state.epoch == epoch {
                            state.handler = Some(handler_id);
                            state.pending = None;
                        }
                    }
                }
                Err(source) => {
                    // Roll back only the state this attempt created so a
                    // retry starts clean.
                    inner
                        .channels
                        .remove_if(channel, |_, state| state.epoch == epoch);
                    return Err(GatewayError::ChannelSubscribe {
                        channel: channel.to_string(),
                        source,
                    });
                }
            }
        }

        let joined = match inner.channels.get_mut(channel) {
            Some(mut state) => {
                if inner.clients.contains_key(&conn.id) {
                    state.members.insert(conn.id);
                    true
                } else {
                    false
                }
            }
            // Torn down while we waited; retry with a fresh subscribe
            None => continue,
        };

        if joined {
            conn.add_channel(channel);
            // The connection may have disconnected between the membership
            // insert and now; its cleanup saw no membership for this
            // channel, so undo ours.
            if !inner.clients.contains_key(&conn.id) {
                leave_channel(inner, conn, channel).await?;
            }
            return Ok(());
        }

        // The triggering connection disconnected mid-subscribe. The
        // subscribe itself completed normally; just make sure the channel
        // does not leak.
        teardown_channel_if_empty(inner, channel).await?;
        return Ok(());
    }
}

/// Remove a connection's membership; the last member out tears the channel
/// state down and unsubscribes from the broker.
async fn leave_channel(
    inner: &Arc<GatewayInner>,
    conn: &Arc<ClientConnection>,
    channel: &str,
) -> Result<(), GatewayError> {
    conn.remove_channel(channel);
    match inner.channels.get_mut(channel) {
        Some(mut state) => {
            state.members.remove(&conn.id);
        }
        None => return Ok(()),
    }
    teardown_channel_if_empty(inner, channel).await
}

async fn teardown_channel_if_empty(
    inner: &Arc<GatewayInner>,
    channel: &str,
) -> Result<(), GatewayError> {
    let removed = inner.channels.remove_if(channel, |_, state| {
        state.members.is_empty() && state.pending.is_none()
    });

    if let Some((_, state)) = removed {
        if let Some(handler) = state.handler {
            inner.broker.unsubscribe(channel, handler).await?;
        }
        debug!(channel, "channel state discarded");
    }
    Ok(())
}

/// Idempotent disconnect cleanup; only the caller that actually removes the
/// connection from the registry runs the channel teardown.
async fn disconnect(inner: &Arc<GatewayInner>, conn: &Arc<ClientConnection>) {
    if inner.clients.remove(&conn.id).is_none() {
        return;
    }

    for channel in conn.channel_names() {
        if let Err(err) = leave_channel(inner, conn, &channel).await {
            warn!(conn_id = %conn.id, channel = %channel, error = %err, "disconnect cleanup failed");
        }
    }

    info!(conn_id = %conn.id, client_id = %conn.client_id, "client disconnected");
}

/// Handler registered with the broker for one channel: decode the envelope
/// and fan the message out to every local member.
fn broker_handler(inner: &Arc<GatewayInner>, channel: &str) -> MessageHandler {
    let inner = Arc::downgrade(inner);
    let channel = channel.to_string();
    Arc::new(move |raw: &str| {
        if let Some(inner) = inner.upgrade() {
            dispatch_broker_message(&inner, &channel, raw);
        }
        Ok(())
    })
}

fn dispatch_broker_message(inner: &GatewayInner, channel: &str, raw: &str) {
    // Malformed envelopes are dropped silently; clients never see them
    let Some(envelope) = ChannelEnvelope::decode(raw) else {
        warn!(channel, "dropping malformed broker payload");
        return;
    };

    let frame = ServerMessage::Message {
        channel: channel.to_string(),
        payload: envelope.payload,
        origin: envelope.origin,
        timestamp: envelope.timestamp,
    };

    let members: Vec<Arc<ClientConnection>> = match inner.channels.get(channel) {
        Some(state) => state
            .members
            .iter()
            .filter_map(|id| inner.clients.get(id).map(|c| c.value().clone()))
            .collect(),
        None => return,
    };

    for member in members {
        member.send(&frame);
    }
}

async fn run_heartbeat(inner: Arc<GatewayInner>) {
    let mut interval = tokio::time::interval(inner.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so connections get a
    // full interval before the first sweep
    interval.tick().await;

    loop {
        interval.tick().await;
        run_heartbeat_sweep(&inner).await;
    }
}

/// One heartbeat sweep: terminate connections not seen alive since the
/// previous sweep, probe everyone else.
async fn run_heartbeat_sweep(inner: &Arc<GatewayInner>) {
    let clients: Vec<Arc<ClientConnection>> =
        inner.clients.iter().map(|e| e.value().clone()).collect();

    for client in clients {
        if !client.take_alive() {
            debug!(conn_id = %client.id, "terminating unresponsive connection");
            client.terminate();
            disconnect(inner, &client).await;
        } else {
            client.ping();
        }
    }
}
