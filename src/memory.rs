//! In-memory room store and message log
//!
//! Back the binary and the tests. State sits behind a `tokio::sync::RwLock`
//! so concurrent lookups from the hub and registration tasks only contend
//! on writes.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::ChatMessage;
use crate::store::{MessageLog, Room, RoomStore};
use crate::types::{RoomId, UserId};

#[derive(Debug, Default)]
struct RoomState {
    rooms: HashMap<RoomId, Room>,
    members: HashMap<RoomId, BTreeSet<UserId>>,
}

/// Room store holding rooms and memberships in memory
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    state: RwLock<RoomState>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with a fixed ID
    pub fn with_room(mut self, id: RoomId, name: impl Into<String>) -> Self {
        self.state
            .get_mut()
            .rooms
            .insert(id.clone(), Room::new(id, name));
        self
    }
}

fn sorted_by_name(mut rooms: Vec<Room>) -> Vec<Room> {
    rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    rooms
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let state = self.state.read().await;
        Ok(sorted_by_name(state.rooms.values().cloned().collect()))
    }

    async fn list_rooms_for_user(&self, user: &UserId) -> Result<Vec<Room>, StoreError> {
        let state = self.state.read().await;
        let rooms = state
            .members
            .iter()
            .filter(|(_, users)| users.contains(user))
            .filter_map(|(room_id, _)| state.rooms.get(room_id).cloned())
            .collect();
        Ok(sorted_by_name(rooms))
    }

    async fn list_members(&self, room: &RoomId) -> Result<Vec<UserId>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .members
            .get(room)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_room(&self, name: &str) -> Result<Room, StoreError> {
        let room = Room::new(RoomId::generate(), name);
        self.state
            .write()
            .await
            .rooms
            .insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn join_room(&self, user: &UserId, room: &RoomId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(room) {
            return Err(StoreError::RoomNotFound(room.to_string()));
        }
        state
            .members
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
        Ok(())
    }

    async fn leave_room(&self, user: &UserId, room: &RoomId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(users) = state.members.get_mut(room) {
            users.remove(user);
        }
        Ok(())
    }

    async fn is_member(&self, user: &UserId, room: &RoomId) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .members
            .get(room)
            .is_some_and(|users| users.contains(user)))
    }
}

/// Message log appending to a vector in memory
#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages logged so far
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn append(&self, message: &ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut stored = message.clone();
        stored.id = Some(Uuid::new_v4().to_string());
        self.messages.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn list_for_room(&self, room: &RoomId) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.room.as_ref() == Some(room))
            .cloned()
            .collect())
    }
}
