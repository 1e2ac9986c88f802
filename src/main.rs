//! Relaybus daemon - WebSocket fan-out gateway over Redis pub/sub

use anyhow::{Context, Result};
use clap::Parser;
use relaybus::broker::{Broker, RedisTransport};
use relaybus::gateway::{GatewayConfig, WebSocketGateway};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "relaybusd")]
#[command(about = "Relaybus WebSocket gateway daemon")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8090", env = "RELAYBUS_BIND")]
    bind: String,

    /// Mount path for the WebSocket route
    #[arg(long, default_value = "/ws", env = "RELAYBUS_PATH")]
    path: String,

    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "REDIS_URL")]
    redis_url: String,

    /// Heartbeat sweep interval in milliseconds (floor 1000)
    #[arg(long, default_value_t = 30_000, env = "RELAYBUS_HEARTBEAT_MS")]
    heartbeat_interval_ms: u64,

    /// Reject publish frames coming from clients
    #[arg(long, env = "RELAYBUS_DISABLE_CLIENT_PUBLISH")]
    disable_client_publish: bool,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (transport, events) = RedisTransport::connect(&args.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", args.redis_url))?;
    // The daemon owns the Redis connections, so tear them down on stop
    let broker = Broker::with_options(transport, events, true);

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    let gateway = WebSocketGateway::new(
        broker,
        GatewayConfig {
            listener: Some(listener),
            path: args.path,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            allow_client_publish: !args.disable_client_publish,
            ..GatewayConfig::default()
        },
    );

    let addr = gateway.start().await.context("Failed to start gateway")?;
    info!(addr = %addr, server_id = %gateway.server_id(), "relaybus daemon started");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping gateway");
    gateway.stop().await.context("Failed to stop gateway")?;

    info!("relaybus daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
