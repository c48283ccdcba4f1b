//! Session handle definition
//!
//! The hub's view of one live connection: who it belongs to and the sending
//! half of its outbound queue.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::ChatMessage;
use crate::types::{SessionId, UserId};

/// Sending half of a session's outbound queue
pub type Outbound = mpsc::Sender<Arc<ChatMessage>>;

/// Connected session information
///
/// The hub holds the only `Outbound` for each session, so dropping the
/// handle closes the queue and lets the write pump finish.
#[derive(Debug)]
pub struct SessionHandle {
    /// Unique identifier for this connection
    pub id: SessionId,
    /// User this connection was opened for
    pub user_id: UserId,
    /// Hub → write pump message channel
    sender: Outbound,
}

impl SessionHandle {
    /// Create a new session handle with the given identity and sender channel
    pub fn new(id: SessionId, user_id: UserId, sender: Outbound) -> Self {
        Self {
            id,
            user_id,
            sender,
        }
    }

    /// Enqueue a message without waiting
    ///
    /// Returns `QueueFull` when the consumer has fallen behind and
    /// `ChannelClosed` when the write pump is gone.
    pub fn try_send(&self, msg: Arc<ChatMessage>) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
