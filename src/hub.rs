//! Hub actor implementation
//!
//! The single authority over live sessions. Registration, unregistration,
//! submissions and direct deliveries all arrive on one command channel and
//! are handled in arrival order by one task, so the registry needs no lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, SendError, StoreError};
use crate::message::{ChatMessage, RoomListEntry};
use crate::session::SessionHandle;
use crate::store::{MessageLog, RoomStore};
use crate::types::{SessionId, UserId};

/// Immediate append attempts before a message is dropped
pub const PERSIST_ATTEMPTS: usize = 3;

/// Commands sent from connection sessions to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// New session connected
    Register { session: SessionHandle },
    /// Session is tearing down
    Unregister { session_id: SessionId },
    /// Validated message to persist and fan out to its room
    Submit {
        origin: SessionId,
        message: ChatMessage,
    },
    /// Message for one session only
    Deliver {
        session_id: SessionId,
        message: ChatMessage,
    },
    /// Registry snapshot
    Stats { reply: oneshot::Sender<HubStats> },
}

/// Counts reported by `HubCommand::Stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live sessions
    pub sessions: usize,
    /// Distinct users across live sessions
    pub users: usize,
}

/// Cloneable client of the Hub actor
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), AppError> {
        self.send(HubCommand::Register { session }).await
    }

    pub async fn unregister(&self, session_id: SessionId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister { session_id }).await
    }

    pub async fn submit(&self, origin: SessionId, message: ChatMessage) -> Result<(), AppError> {
        self.send(HubCommand::Submit { origin, message }).await
    }

    pub async fn deliver(&self, session_id: SessionId, message: ChatMessage) -> Result<(), AppError> {
        self.send(HubCommand::Deliver {
            session_id,
            message,
        })
        .await
    }

    pub async fn stats(&self) -> Result<HubStats, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}

/// The Hub actor
///
/// Owns the live-session registry and the store handles used for routing.
pub struct Hub {
    /// All live sessions: SessionId -> SessionHandle
    sessions: HashMap<SessionId, SessionHandle>,
    /// Room membership oracle
    rooms: Arc<dyn RoomStore>,
    /// Message log
    log: Arc<dyn MessageLog>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
    /// Route back into this hub for background tasks; weak so it never keeps
    /// the hub alive on its own
    commands: mpsc::WeakSender<HubCommand>,
}

impl Hub {
    /// Create a hub and the handle used to reach it
    pub fn new(
        rooms: Arc<dyn RoomStore>,
        log: Arc<dyn MessageLog>,
        capacity: usize,
    ) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let hub = Self {
            sessions: HashMap::new(),
            rooms,
            log,
            receiver,
            commands: sender.downgrade(),
        };
        (hub, HubHandle { sender })
    }

    /// Create a hub and run it on its own task
    pub fn spawn(
        rooms: Arc<dyn RoomStore>,
        log: Arc<dyn MessageLog>,
        capacity: usize,
    ) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(rooms, log, capacity);
        (handle, tokio::spawn(hub.run()))
    }

    /// Run the Hub event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("Hub shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { session } => {
                self.handle_register(session);
            }
            HubCommand::Unregister { session_id } => {
                self.handle_unregister(session_id);
            }
            HubCommand::Submit { origin, message } => {
                self.handle_submit(origin, message).await;
            }
            HubCommand::Deliver {
                session_id,
                message,
            } => {
                self.enqueue(session_id, Arc::new(message));
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Handle new session registration
    fn handle_register(&mut self, session: SessionHandle) {
        let session_id = session.id;
        let user_id = session.user_id.clone();
        info!("Session {} registered for user {}", session_id, user_id);

        self.sessions.insert(session_id, session);
        self.spawn_room_list(session_id, user_id);

        debug!("Total sessions: {}", self.sessions.len());
    }

    /// Handle session unregistration
    ///
    /// Dropping the handle closes the outbound queue. Unknown sessions are
    /// ignored, which makes repeated unregistration harmless.
    fn handle_unregister(&mut self, session_id: SessionId) {
        if let Some(session) = self.sessions.remove(&session_id) {
            info!(
                "Session {} unregistered for user {}",
                session_id, session.user_id
            );
            debug!("Total sessions: {}", self.sessions.len());
        }
    }

    /// Handle a validated message: persist, resolve members, fan out
    async fn handle_submit(&mut self, origin: SessionId, message: ChatMessage) {
        let Some(room) = message.room.clone() else {
            warn!("Dropping message from session {} without a room", origin);
            return;
        };

        let stored = match self.persist(&message).await {
            Ok(stored) => stored,
            Err(e) => {
                error!("Error saving message for room {}: {}", room, e);
                self.enqueue(
                    origin,
                    Arc::new(ChatMessage::error(Some(room), "Failed to save message")),
                );
                return;
            }
        };

        let members: HashSet<UserId> = match self.rooms.list_members(&room).await {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                error!("Error getting members of room {}: {}", room, e);
                return;
            }
        };

        let targets: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| members.contains(&s.user_id))
            .map(|s| s.id)
            .collect();

        let stored = Arc::new(stored);
        let mut delivered = 0;
        for session_id in targets {
            if self.enqueue(session_id, Arc::clone(&stored)) {
                delivered += 1;
            }
        }

        debug!("Message for room {} delivered to {} sessions", room, delivered);
    }

    /// Append to the message log, retrying a bounded number of times
    async fn persist(&self, message: &ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut attempt = 1;
        loop {
            match self.log.append(message).await {
                Ok(stored) => return Ok(stored),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!("Append attempt {} failed: {}", attempt, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking enqueue onto one session's outbound queue
    ///
    /// A full or closed queue removes the session from the registry; its
    /// own pumps take care of the transport. Returns whether the message
    /// was queued.
    fn enqueue(&mut self, session_id: SessionId, message: Arc<ChatMessage>) -> bool {
        let Some(session) = self.sessions.get(&session_id) else {
            return false;
        };

        match session.try_send(message) {
            Ok(()) => true,
            Err(SendError::QueueFull) => {
                info!(
                    "Session {} for user {} is not keeping up, dropping it",
                    session_id, session.user_id
                );
                self.sessions.remove(&session_id);
                false
            }
            Err(SendError::ChannelClosed) => {
                debug!("Session {} outbound queue already closed", session_id);
                self.sessions.remove(&session_id);
                false
            }
        }
    }

    fn stats(&self) -> HubStats {
        let users: HashSet<&UserId> = self.sessions.values().map(|s| &s.user_id).collect();
        HubStats {
            sessions: self.sessions.len(),
            users: users.len(),
        }
    }

    /// Look up the user's rooms off the hub task and deliver a room list
    fn spawn_room_list(&self, session_id: SessionId, user_id: UserId) {
        let rooms = Arc::clone(&self.rooms);
        let log = Arc::clone(&self.log);
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let message = match build_room_list(rooms.as_ref(), log.as_ref(), &user_id).await {
                Ok(message) => message,
                Err(e) => {
                    warn!("Error getting rooms for user {}: {}", user_id, e);
                    return;
                }
            };

            let Some(commands) = commands.upgrade() else {
                return;
            };
            let _ = commands
                .send(HubCommand::Deliver {
                    session_id,
                    message,
                })
                .await;
        });
    }
}

/// Build the `room_list` message: every room of the user with its history
///
/// A history lookup failure leaves that room's history empty.
async fn build_room_list(
    rooms: &dyn RoomStore,
    log: &dyn MessageLog,
    user_id: &UserId,
) -> Result<ChatMessage, AppError> {
    let user_rooms = rooms.list_rooms_for_user(user_id).await?;

    let mut entries = Vec::with_capacity(user_rooms.len());
    for room in user_rooms {
        let messages = log.list_for_room(&room.id).await.unwrap_or_else(|e| {
            warn!("Error retrieving messages for room {}: {}", room.id, e);
            Vec::new()
        });
        entries.push(RoomListEntry { room, messages });
    }

    Ok(ChatMessage::room_list(&entries)?)
}
