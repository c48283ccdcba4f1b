//! Message protocol definitions
//!
//! One JSON object shape travels in both directions:
//! `{"type", "room", "content", "sender", "time"}` plus `id` once persisted.
//! Inbound frames are decoded loosely (`InboundFrame`) so that an unknown
//! `type` reaches validation and is answered with an error message instead
//! of being dropped as malformed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::store::Room;
use crate::types::RoomId;

/// Sender label used for server-originated messages
pub const SYSTEM_SENDER: &str = "system";

/// Message kind, the wire `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Ordinary chat message
    Chat,
    /// Informational notice
    Notification,
    /// Server confirmation (join/leave)
    System,
    /// Error addressed to one session
    Error,
    /// Room summary sent once at registration
    RoomList,
}

impl MessageKind {
    /// Parse the wire name of a kind
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "notification" => Some(Self::Notification),
            "system" => Some(Self::System),
            "error" => Some(Self::Error),
            "room_list" => Some(Self::RoomList),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Notification => "notification",
            Self::System => "system",
            Self::Error => "error",
            Self::RoomList => "room_list",
        }
    }

    /// Kinds a client may submit for distribution
    pub fn is_client_submittable(&self) -> bool {
        !matches!(self, Self::RoomList)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as persisted and delivered
///
/// Immutable once handed to the hub; fanout shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Assigned by the message log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    pub content: String,
    pub sender: String,
    pub time: DateTime<Utc>,
}

impl ChatMessage {
    /// Create an unpersisted message stamped with the current time
    pub fn new(
        kind: MessageKind,
        room: Option<RoomId>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            kind,
            room,
            content: content.into(),
            sender: sender.into(),
            time: Utc::now(),
        }
    }

    /// Server confirmation message
    pub fn system(room: Option<RoomId>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, room, SYSTEM_SENDER, content)
    }

    /// Error message for a single session
    pub fn error(room: Option<RoomId>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, room, SYSTEM_SENDER, content)
    }

    /// Room list summary; `rooms` is serialized into the content field
    pub fn room_list(rooms: &[RoomListEntry]) -> Result<Self, serde_json::Error> {
        let content = serde_json::to_string(rooms)?;
        Ok(Self::new(MessageKind::RoomList, None, SYSTEM_SENDER, content))
    }
}

/// Inbound frame as decoded from the wire
///
/// Every field is optional so that structural problems are reported by
/// validation rather than by the JSON decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: String,
}

/// Room membership commands carried in inbound frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCommand {
    Join(RoomId),
    Leave(RoomId),
}

impl InboundFrame {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Whether this frame is a `join_room`/`leave_room` command
    pub fn is_room_command(&self) -> bool {
        matches!(self.kind.as_str(), "join_room" | "leave_room")
    }

    /// Extract a room command, if this frame carries one
    ///
    /// Returns `None` for ordinary messages and for commands missing a room.
    pub fn room_command(&self) -> Option<RoomCommand> {
        let room = self.room.trim();
        if room.is_empty() {
            return None;
        }
        let room = RoomId::new(room);
        match self.kind.as_str() {
            "join_room" => Some(RoomCommand::Join(room)),
            "leave_room" => Some(RoomCommand::Leave(room)),
            _ => None,
        }
    }
}

/// One element of the `room_list` payload: a room and its history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomListEntry {
    #[serde(flatten)]
    pub room: Room,
    pub messages: Vec<ChatMessage>,
}

/// Convert AppError to an error message for the originating session
impl From<AppError> for ChatMessage {
    fn from(err: AppError) -> Self {
        let (room, content) = match err {
            AppError::Validation(e) => (None, e.to_string()),
            AppError::NotMember(room) => {
                (Some(room), "You are not a member of this room".to_string())
            }
            e @ (AppError::JoinFailed(_) | AppError::LeaveFailed(_)) => (None, e.to_string()),
            AppError::Store(e) => (None, format!("Request failed: {}", e)),
            AppError::Json(e) => (None, format!("Invalid message format: {}", e)),
            // Fatal errors are not typically converted (session closes)
            _ => (None, "Internal error".to_string()),
        };
        ChatMessage::error(room, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, ValidationError};

    #[test]
    fn test_inbound_frame_deserialize() {
        let json = r#"{"type": "chat", "room": "general", "content": "hi", "sender": "alice"}"#;
        let frame = InboundFrame::decode(json).unwrap();
        assert_eq!(frame.kind, "chat");
        assert_eq!(frame.room, "general");
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.sender, "alice");
    }

    #[test]
    fn test_inbound_frame_missing_fields_default_empty() {
        let frame = InboundFrame::decode(r#"{"type": "bogus"}"#).unwrap();
        assert_eq!(frame.kind, "bogus");
        assert!(frame.content.is_empty());
        assert!(frame.sender.is_empty());
    }

    #[test]
    fn test_inbound_frame_malformed_json() {
        assert!(matches!(
            InboundFrame::decode("not json"),
            Err(AppError::Json(_))
        ));
    }

    #[test]
    fn test_room_command() {
        let join = InboundFrame::decode(r#"{"type": "join_room", "room": "general"}"#).unwrap();
        assert!(join.is_room_command());
        assert_eq!(join.room_command(), Some(RoomCommand::Join(RoomId::new("general"))));

        let leave = InboundFrame::decode(r#"{"type": "leave_room", "room": "general"}"#).unwrap();
        assert_eq!(leave.room_command(), Some(RoomCommand::Leave(RoomId::new("general"))));

        let no_room = InboundFrame::decode(r#"{"type": "join_room"}"#).unwrap();
        assert!(no_room.is_room_command());
        assert_eq!(no_room.room_command(), None);

        let chat = InboundFrame::decode(r#"{"type": "chat", "room": "general"}"#).unwrap();
        assert!(!chat.is_room_command());
    }

    #[test]
    fn test_chat_message_serialize() {
        let msg = ChatMessage::new(
            MessageKind::Chat,
            Some(RoomId::new("general")),
            "alice",
            "hi",
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"chat\""));
        assert!(json.contains("\"room\":\"general\""));
        assert!(json.contains("\"sender\":\"alice\""));
        assert!(json.contains("\"time\":"));
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_chat_message_time_is_rfc3339() {
        let msg = ChatMessage::system(None, "Joined room: general");
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        let time = value["time"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[test]
    fn test_room_list_kind_serialize() {
        let msg = ChatMessage::room_list(&[]).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"room_list\""));
        assert!(json.contains("\"content\":\"[]\""));
    }

    #[test]
    fn test_message_kind_parse() {
        for kind in [
            MessageKind::Chat,
            MessageKind::Notification,
            MessageKind::System,
            MessageKind::Error,
            MessageKind::RoomList,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("join_room"), None);
        assert!(!MessageKind::RoomList.is_client_submittable());
    }

    #[test]
    fn test_app_error_to_error_message() {
        let msg: ChatMessage = AppError::Validation(ValidationError::MissingContent).into();
        assert_eq!(msg.kind, MessageKind::Error);
        assert_eq!(msg.sender, SYSTEM_SENDER);
        assert_eq!(msg.content, "message content is required");

        let msg: ChatMessage = AppError::NotMember(RoomId::new("general")).into();
        assert_eq!(msg.room, Some(RoomId::new("general")));
        assert_eq!(msg.content, "You are not a member of this room");
    }

    #[test]
    fn test_room_command_failure_wording() {
        let not_found = StoreError::RoomNotFound("nowhere".to_string());

        let msg: ChatMessage = AppError::JoinFailed(not_found.clone()).into();
        assert_eq!(msg.kind, MessageKind::Error);
        assert_eq!(msg.content, "Failed to join room: Room not found: nowhere");

        let msg: ChatMessage = AppError::LeaveFailed(not_found).into();
        assert_eq!(msg.content, "Failed to leave room: Room not found: nowhere");
    }
}
