//! Room-based WebSocket Chat Relay - Entry Point
//!
//! Starts the Hub actor and the TCP listener, accepting connections.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::{serve, Hub, MemoryMessageLog, MemoryRoomStore, Relay, RoomId, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    // Environment first, then the bind address from the command line
    let mut config = ServerConfig::load()?;
    if let Some(addr) = env::args().nth(1) {
        config = config.bind(addr.parse::<SocketAddr>()?);
    }
    let config = Arc::new(config);

    let rooms = Arc::new(MemoryRoomStore::new().with_room(RoomId::new("general"), "general"));
    let log = Arc::new(MemoryMessageLog::new());

    // Start the Hub actor
    let (hub, _hub_task) = Hub::spawn(rooms.clone(), log, config.hub_channel_capacity);
    info!("Hub actor started");

    // Start TCP listener
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        "WebSocket Chat Relay listening on ws://{}{}",
        config.bind_addr, config.ws_path
    );

    serve(listener, Relay { hub, rooms, config }).await;

    Ok(())
}
