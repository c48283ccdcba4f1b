//! Room-based WebSocket Chat Relay Library
//!
//! Clients connect over WebSocket with a `user_id`, join rooms, and exchange
//! messages that are logged and fanned out to the members of the room.
//!
//! # Features
//! - WebSocket upgrade keyed by the `user_id` query parameter
//! - Room join/leave through a pluggable room store
//! - Validation and HTML-escaping of every inbound message
//! - Message persistence through a pluggable message log
//! - Room list with history pushed to each new session
//! - Keepalive pings and idle-read deadlines
//! - Slow consumers dropped instead of blocking the broadcaster
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning the live-session registry
//! - Each connection runs a read pump and a write pump; the write pump is
//!   the only writer to its socket
//! - No locks on the registry - all access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_relay::{serve, Hub, MemoryMessageLog, MemoryRoomStore, Relay, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(ServerConfig::default());
//!     let rooms = Arc::new(MemoryRoomStore::new());
//!     let log = Arc::new(MemoryMessageLog::new());
//!     let (hub, _task) = Hub::spawn(rooms.clone(), log, config.hub_channel_capacity);
//!
//!     let listener = TcpListener::bind(config.bind_addr).await.unwrap();
//!     serve(listener, Relay { hub, rooms, config }).await;
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod memory;
pub mod message;
pub mod session;
pub mod store;
pub mod types;
pub mod validation;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use error::{AppError, ConfigError, SendError, StoreError, ValidationError};
pub use handler::{handle_connection, serve, Relay};
pub use hub::{Hub, HubCommand, HubHandle, HubStats};
pub use memory::{MemoryMessageLog, MemoryRoomStore};
pub use message::{ChatMessage, InboundFrame, MessageKind, RoomListEntry};
pub use session::SessionHandle;
pub use store::{MessageLog, Room, RoomStore};
pub use types::{RoomId, SessionId, UserId};
