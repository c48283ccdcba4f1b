//! Inbound message sanitization and validation
//!
//! Sanitization runs first: escaping can lengthen a message, so length
//! limits are checked against the escaped, trimmed text.

use crate::error::ValidationError;
use crate::message::{ChatMessage, InboundFrame, MessageKind};
use crate::types::RoomId;

/// Maximum content length in characters
pub const MAX_CONTENT_LEN: usize = 1000;

/// Maximum sender label length in characters
pub const MAX_SENDER_LEN: usize = 50;

/// Escape markup-significant characters
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape and trim the free-text fields of a frame in place
pub fn sanitize(frame: &mut InboundFrame) {
    frame.content = escape_html(&frame.content).trim().to_string();
    frame.sender = escape_html(&frame.sender).trim().to_string();
}

/// Check a sanitized frame and return its kind
pub fn validate(frame: &InboundFrame) -> Result<MessageKind, ValidationError> {
    if frame.kind.is_empty() {
        return Err(ValidationError::MissingType);
    }
    if frame.content.is_empty() {
        return Err(ValidationError::MissingContent);
    }
    if frame.sender.is_empty() {
        return Err(ValidationError::MissingSender);
    }

    let kind = MessageKind::parse(&frame.kind)
        .filter(MessageKind::is_client_submittable)
        .ok_or_else(|| ValidationError::InvalidType(frame.kind.clone()))?;

    if frame.content.chars().count() > MAX_CONTENT_LEN {
        return Err(ValidationError::ContentTooLong);
    }
    if frame.sender.chars().count() > MAX_SENDER_LEN {
        return Err(ValidationError::SenderTooLong);
    }

    Ok(kind)
}

/// Sanitize, validate and build the message to submit
///
/// The room is `None` when the frame names none; routing rejects that later
/// as a membership failure.
pub fn accept(mut frame: InboundFrame) -> Result<ChatMessage, ValidationError> {
    sanitize(&mut frame);
    let kind = validate(&frame)?;

    let room = frame.room.trim();
    let room = (!room.is_empty()).then(|| RoomId::new(room));

    Ok(ChatMessage::new(kind, room, frame.sender, frame.content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(kind: &str, content: &str, sender: &str) -> InboundFrame {
        InboundFrame {
            kind: kind.to_string(),
            room: "general".to_string(),
            content: content.to_string(),
            sender: sender.to_string(),
        }
    }

    #[test]
    fn test_accept_valid_chat() {
        let msg = accept(frame("chat", "hi", "alice")).unwrap();
        assert_eq!(msg.kind, MessageKind::Chat);
        assert_eq!(msg.room, Some(RoomId::new("general")));
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.sender, "alice");
        assert!(msg.id.is_none());
    }

    #[test]
    fn test_sanitize_escapes_and_trims() {
        let msg = accept(frame("chat", "  <b>\"x\" & 'y'</b>  ", " <alice> ")).unwrap();
        assert_eq!(
            msg.content,
            "&lt;b&gt;&#34;x&#34; &amp; &#39;y&#39;&lt;/b&gt;"
        );
        assert_eq!(msg.sender, "&lt;alice&gt;");
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            accept(frame("", "hi", "alice")).unwrap_err(),
            ValidationError::MissingType
        );
        assert_eq!(
            accept(frame("chat", "   ", "alice")).unwrap_err(),
            ValidationError::MissingContent
        );
        assert_eq!(
            accept(frame("chat", "hi", "")).unwrap_err(),
            ValidationError::MissingSender
        );
    }

    #[test]
    fn test_invalid_kind() {
        assert_eq!(
            accept(frame("shout", "hi", "alice")).unwrap_err(),
            ValidationError::InvalidType("shout".to_string())
        );
        assert_eq!(
            accept(frame("room_list", "hi", "alice")).unwrap_err(),
            ValidationError::InvalidType("room_list".to_string())
        );
    }

    #[test]
    fn test_all_client_kinds_accepted() {
        for kind in ["chat", "notification", "system", "error"] {
            assert!(accept(frame(kind, "hi", "alice")).is_ok(), "{}", kind);
        }
    }

    #[test]
    fn test_length_limits_at_boundary() {
        let content = "a".repeat(MAX_CONTENT_LEN);
        let sender = "s".repeat(MAX_SENDER_LEN);
        assert!(accept(frame("chat", &content, &sender)).is_ok());

        let content = "a".repeat(MAX_CONTENT_LEN + 1);
        assert_eq!(
            accept(frame("chat", &content, "alice")).unwrap_err(),
            ValidationError::ContentTooLong
        );

        let sender = "s".repeat(MAX_SENDER_LEN + 1);
        assert_eq!(
            accept(frame("chat", "hi", &sender)).unwrap_err(),
            ValidationError::SenderTooLong
        );
    }

    #[test]
    fn test_length_checked_after_escaping() {
        // 250 '<' escape to exactly 1000 characters
        let content = "<".repeat(250);
        assert!(accept(frame("chat", &content, "alice")).is_ok());

        let content = "<".repeat(251);
        assert_eq!(
            accept(frame("chat", &content, "alice")).unwrap_err(),
            ValidationError::ContentTooLong
        );
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        let content = "é".repeat(MAX_CONTENT_LEN);
        assert!(accept(frame("chat", &content, "alice")).is_ok());
    }

    #[test]
    fn test_empty_room_is_none() {
        let mut f = frame("chat", "hi", "alice");
        f.room = "  ".to_string();
        assert_eq!(accept(f).unwrap().room, None);
    }

    proptest! {
        #[test]
        fn prop_valid_messages_accepted_unchanged(
            content in "[a-zA-Z0-9][a-zA-Z0-9 ]{0,998}[a-zA-Z0-9]",
            sender in "[a-zA-Z0-9_]{1,50}",
            kind in prop::sample::select(vec!["chat", "notification", "system", "error"]),
        ) {
            let msg = accept(frame(kind, &content, &sender)).unwrap();
            prop_assert_eq!(msg.content, content);
            prop_assert_eq!(msg.sender, sender);
            prop_assert_eq!(msg.kind.as_str(), kind);
        }

        #[test]
        fn prop_oversized_content_rejected(content in "[a-z]{1001,1200}") {
            prop_assert_eq!(
                accept(frame("chat", &content, "alice")).unwrap_err(),
                ValidationError::ContentTooLong
            );
        }
    }
}
