//! Relaybus - real-time fan-out messaging over an external pub/sub channel
//!
//! A transport-agnostic pub/sub broker (Redis-backed in production) paired
//! with a WebSocket gateway, so multiple server processes can broadcast to
//! clients regardless of which process holds the socket.

pub mod broker;
pub mod gateway;
pub mod protocol;

pub use broker::{
    Broker, BrokerError, HandlerId, MemoryTransport, MessageHandler, PubSubTransport,
    RedisTransport, TransportError, TransportEvent,
};
pub use gateway::{
    ClientConnection, ConnectRequest, GatewayConfig, GatewayError, WebSocketGateway,
};
pub use protocol::{ChannelEnvelope, ClientMessage, ServerMessage};
