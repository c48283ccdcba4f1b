//! Persistence collaborators consumed by the hub and connection sessions
//!
//! The relay never owns rooms or messages; it calls these traits. Both must
//! tolerate concurrent calls from the hub task and from background
//! registration lookups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::ChatMessage;
use crate::types::{RoomId, UserId};

/// A chat room as persisted by the room store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: RoomId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Room membership oracle
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// All rooms, ordered by name
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Rooms the user belongs to, ordered by name
    async fn list_rooms_for_user(&self, user: &UserId) -> Result<Vec<Room>, StoreError>;

    /// Users belonging to the room
    async fn list_members(&self, room: &RoomId) -> Result<Vec<UserId>, StoreError>;

    async fn create_room(&self, name: &str) -> Result<Room, StoreError>;

    /// Add the user to the room; joining twice is not an error
    async fn join_room(&self, user: &UserId, room: &RoomId) -> Result<(), StoreError>;

    async fn leave_room(&self, user: &UserId, room: &RoomId) -> Result<(), StoreError>;

    async fn is_member(&self, user: &UserId, room: &RoomId) -> Result<bool, StoreError>;
}

/// Append-only log of accepted chat messages
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Persist a message and return the stored copy with its `id` assigned
    async fn append(&self, message: &ChatMessage) -> Result<ChatMessage, StoreError>;

    /// Messages logged for the room, oldest first
    async fn list_for_room(&self, room: &RoomId) -> Result<Vec<ChatMessage>, StoreError>;
}
