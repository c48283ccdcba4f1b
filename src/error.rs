//! Error types for the chat relay
//!
//! Defines application-level errors, validation failures, store failures,
//! outbound queue errors and configuration errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::RoomId;
use crate::validation::{MAX_CONTENT_LEN, MAX_SENDER_LEN};

/// Application-level errors
///
/// Covers both fatal errors (session teardown) and
/// per-message errors (send an error message to the client).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Read or write deadline exceeded (fatal)
    #[error("Transport deadline exceeded")]
    Timeout,

    /// Channel send error (fatal - hub has shut down)
    #[error("Channel send error")]
    ChannelSend,

    /// Inbound message rejected by validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Room store or message log failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Sender is not a member of the target room
    #[error("Not a member of room {0}")]
    NotMember(RoomId),

    /// A `join_room` command failed in the room store
    #[error("Failed to join room: {0}")]
    JoinFailed(StoreError),

    /// A `leave_room` command failed in the room store
    #[error("Failed to leave room: {0}")]
    LeaveFailed(StoreError),

    /// Upgrade request without a usable `user_id`
    #[error("user id is mandatory")]
    MissingUser,
}

impl AppError {
    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::WebSocket(_) | AppError::Io(_) | AppError::Timeout | AppError::ChannelSend
        )
    }
}

/// Reasons an inbound message is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message type is required")]
    MissingType,

    #[error("message content is required")]
    MissingContent,

    #[error("message sender is required")]
    MissingSender,

    #[error("message room is required")]
    MissingRoom,

    #[error("invalid message type: {0}")]
    InvalidType(String),

    #[error("message content exceeds maximum length of {max} characters", max = MAX_CONTENT_LEN)]
    ContentTooLong,

    #[error("sender name exceeds maximum length of {max} characters", max = MAX_SENDER_LEN)]
    SenderTooLong,
}

/// Room store and message log errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No room with the given ID
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Backend could not serve the request
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Outbound queue errors
///
/// Occurs when enqueueing onto a session's outbound queue without waiting.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The queue is at capacity (consumer too slow)
    #[error("Queue full")]
    QueueFull,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ::config::ConfigError),

    /// An environment variable held a value that could not be parsed
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("ping period must be positive and shorter than pong wait")]
    PingPeriod,
}
