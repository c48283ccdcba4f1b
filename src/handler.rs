//! WebSocket connection handler
//!
//! Handles individual client connections: the upgrade handshake (which
//! carries the `user_id`), the read pump feeding the hub, the write pump
//! draining the session's outbound queue, keepalive and teardown.

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, timeout, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::config::ServerConfig;
use crate::error::{AppError, ValidationError};
use crate::hub::HubHandle;
use crate::message::{ChatMessage, InboundFrame, RoomCommand};
use crate::session::SessionHandle;
use crate::store::RoomStore;
use crate::types::{SessionId, UserId};
use crate::validation::{self, escape_html, MAX_SENDER_LEN};

type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Everything a connection needs from the rest of the relay
#[derive(Clone)]
pub struct Relay {
    pub hub: HubHandle,
    pub rooms: Arc<dyn RoomStore>,
    pub config: Arc<ServerConfig>,
}

/// Accept connections forever, one task per connection
pub async fn serve(listener: TcpListener, relay: Relay) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New TCP connection from {}", addr);
                let relay = relay.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, relay).await {
                        warn!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, registers the session with the hub,
/// runs both pumps and tears the session down when either one stops.
pub async fn handle_connection(stream: TcpStream, relay: Relay) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let config = Arc::clone(&relay.config);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    // WebSocket handshake; the callback picks the user out of the request
    let mut user_id = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            user_id = Some(authorize(req, &config.ws_path)?);
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;
    let user_id = user_id.ok_or(AppError::MissingUser)?;

    let session_id = SessionId::new();
    info!(
        "Session {} opened for user {} from {}",
        session_id, user_id, peer_addr
    );

    let (ws_sender, ws_receiver) = ws_stream.split();

    // Outbound queue: the hub keeps the only sender
    let (msg_tx, msg_rx) = mpsc::channel(config.send_queue_capacity);
    relay
        .hub
        .register(SessionHandle::new(session_id, user_id.clone(), msg_tx))
        .await?;

    let mut write_task = tokio::spawn(write_pump(
        ws_sender,
        msg_rx,
        Arc::clone(&config),
        session_id,
    ));

    let session = ConnectionSession {
        id: session_id,
        sender_label: escape_html(user_id.as_str()),
        user_id,
        hub: relay.hub.clone(),
        rooms: Arc::clone(&relay.rooms),
        pong_wait: config.pong_wait,
    };

    // Wait for either pump to stop
    let writer_done = tokio::select! {
        result = session.read_pump(ws_receiver) => {
            if let Err(e) = result {
                debug!("Read pump for {} ended: {}", session_id, e);
            }
            false
        }
        result = &mut write_task => {
            match result {
                Ok(Err(e)) => debug!("Write pump for {} ended: {}", session_id, e),
                Err(e) => warn!("Write pump for {} failed: {}", session_id, e),
                Ok(Ok(())) => {}
            }
            true
        }
    };

    // Unregistering closes the outbound queue, which tells the writer to
    // send a close frame. Harmless if the hub already dropped the session.
    let _ = relay.hub.unregister(session_id).await;

    if !writer_done && timeout(config.write_wait, &mut write_task).await.is_err() {
        debug!("Write pump for {} did not finish, aborting", session_id);
        write_task.abort();
    }

    info!("Session {} closed", session_id);

    Ok(())
}

/// Check the upgrade request and extract the connecting user
fn authorize(req: &Request, ws_path: &str) -> Result<UserId, ErrorResponse> {
    if req.uri().path() != ws_path {
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }

    let user = req
        .uri()
        .query()
        .and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "user_id")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_default();
    let user = user.trim();

    if user.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "user id is mandatory"));
    }
    // The user id doubles as the sender label of everything this session sends
    if escape_html(user).chars().count() > MAX_SENDER_LEN {
        return Err(reject(StatusCode::BAD_REQUEST, "user id is too long"));
    }

    Ok(UserId::new(user))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    debug!("Rejecting upgrade: {} {}", status, reason);
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Read side of one connection
struct ConnectionSession {
    id: SessionId,
    user_id: UserId,
    /// Escaped user id, stamped as the sender of submitted messages
    sender_label: String,
    hub: HubHandle,
    rooms: Arc<dyn RoomStore>,
    pong_wait: Duration,
}

impl ConnectionSession {
    /// Pump frames from the peer into the hub
    ///
    /// Every frame, keepalive answers included, starts a fresh read
    /// deadline. Returns when the peer closes, the deadline passes or the
    /// transport fails.
    async fn read_pump(&self, mut ws_receiver: WsStream) -> Result<(), AppError> {
        loop {
            let msg = match timeout(self.pong_wait, ws_receiver.next()).await {
                Ok(Some(msg)) => msg?,
                Ok(None) => return Ok(()),
                Err(_) => {
                    debug!("Read deadline exceeded for {}", self.id);
                    return Err(AppError::Timeout);
                }
            };

            match msg {
                Message::Text(text) => self.handle_text(&text).await?,
                Message::Close(_) => {
                    debug!("Session {} sent close frame", self.id);
                    return Ok(());
                }
                Message::Ping(_) => {
                    // Pong is queued automatically by tungstenite
                    debug!("Ping from {}", self.id);
                }
                Message::Pong(_) => {
                    debug!("Pong from {}", self.id);
                }
                _ => {
                    // Binary and raw frames are ignored
                }
            }
        }
    }

    /// Handle one text frame
    ///
    /// Malformed JSON is dropped. Per-message failures are answered with an
    /// error message to this session only; only fatal errors end the pump.
    async fn handle_text(&self, text: &str) -> Result<(), AppError> {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Invalid JSON from {}: {}", self.id, e);
                return Ok(());
            }
        };

        let result = if frame.is_room_command() {
            self.handle_room_command(&frame).await
        } else {
            self.handle_message(frame).await
        };

        match result {
            Err(e) if !e.is_fatal() => {
                debug!("Rejected frame from {}: {}", self.id, e);
                self.reply(e.into()).await
            }
            other => other,
        }
    }

    async fn handle_room_command(&self, frame: &InboundFrame) -> Result<(), AppError> {
        match frame.room_command().ok_or(ValidationError::MissingRoom)? {
            RoomCommand::Join(room) => {
                self.rooms
                    .join_room(&self.user_id, &room)
                    .await
                    .map_err(AppError::JoinFailed)?;
                info!("User {} joined room {}", self.user_id, room);
                let content = format!("Joined room: {}", room);
                self.reply(ChatMessage::system(Some(room), content)).await
            }
            RoomCommand::Leave(room) => {
                self.rooms
                    .leave_room(&self.user_id, &room)
                    .await
                    .map_err(AppError::LeaveFailed)?;
                info!("User {} left room {}", self.user_id, room);
                let content = format!("Left room: {}", room);
                self.reply(ChatMessage::system(Some(room), content)).await
            }
        }
    }

    /// Validate, check membership and submit to the hub
    async fn handle_message(&self, frame: InboundFrame) -> Result<(), AppError> {
        let mut message = validation::accept(frame)?;
        let room = message.room.clone().ok_or(ValidationError::MissingRoom)?;

        if !self.rooms.is_member(&self.user_id, &room).await? {
            return Err(AppError::NotMember(room));
        }

        // Sender identity is the connection's, never the client's claim
        message.sender = self.sender_label.clone();
        self.hub.submit(self.id, message).await
    }

    /// Send a message to this session only
    async fn reply(&self, message: ChatMessage) -> Result<(), AppError> {
        self.hub.deliver(self.id, message).await
    }
}

/// Pump messages from the outbound queue to the peer
///
/// The only writer to the transport. Messages already queued when one is
/// dequeued go out in the same flush. Exits with a close frame once the hub
/// closes the queue, or with an error when a write fails or overruns
/// `write_wait`.
async fn write_pump<S>(
    mut ws_sender: S,
    mut msg_rx: mpsc::Receiver<Arc<ChatMessage>>,
    config: Arc<ServerConfig>,
    session_id: SessionId,
) -> Result<(), AppError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut keepalive = time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = msg_rx.recv() => {
                let Some(msg) = msg else {
                    debug!("Outbound queue closed for {}", session_id);
                    let _ = timeout(config.write_wait, ws_sender.close()).await;
                    return Ok(());
                };

                let pending = msg_rx.len();
                let mut batch = Vec::with_capacity(pending + 1);
                batch.extend(encode(&msg));
                for _ in 0..pending {
                    match msg_rx.try_recv() {
                        Ok(next) => batch.extend(encode(&next)),
                        Err(_) => break,
                    }
                }

                with_deadline(config.write_wait, async {
                    for frame in batch {
                        ws_sender.feed(frame).await?;
                    }
                    ws_sender.flush().await
                })
                .await?;
            }
            _ = keepalive.tick() => {
                with_deadline(config.write_wait, ws_sender.send(Message::Ping(Default::default())))
                    .await?;
            }
        }
    }
}

/// Serialize a message into a text frame; failures are logged and skipped
fn encode(msg: &ChatMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}

/// Run a transport write, treating an overrun as fatal
async fn with_deadline<F, T>(limit: Duration, write: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, tungstenite::Error>>,
{
    match timeout(limit, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(AppError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_authorize_extracts_user() {
        let user = authorize(&request("/ws?user_id=alice"), "/ws").unwrap();
        assert_eq!(user, UserId::new("alice"));
    }

    #[test]
    fn test_authorize_decodes_user() {
        let user = authorize(&request("/ws?room=x&user_id=alice%20smith"), "/ws").unwrap();
        assert_eq!(user, UserId::new("alice smith"));
    }

    #[test]
    fn test_authorize_requires_user() {
        for uri in ["/ws", "/ws?user_id=", "/ws?other=1", "/ws?user_id=%20"] {
            let response = authorize(&request(uri), "/ws").unwrap_err();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[test]
    fn test_authorize_rejects_long_user() {
        let uri = format!("/ws?user_id={}", "a".repeat(MAX_SENDER_LEN + 1));
        let response = authorize(&request(&uri), "/ws").unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_authorize_wrong_path() {
        let response = authorize(&request("/chat?user_id=alice"), "/ws").unwrap_err();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_authorize_decodes_form_encoding() {
        let user = authorize(&request("/ws?user_id=caf%C3%A9+au+lait"), "/ws").unwrap();
        assert_eq!(user, UserId::new("café au lait"));
    }

    /// What the write pump did to its sink, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Text(String),
        Ping,
        Flush,
        Close,
    }

    /// Sink that records every operation
    ///
    /// On its first flush it enqueues `late`, if set, to check that messages
    /// arriving mid-write wait for the next batch.
    struct RecordingSink {
        ops: Arc<std::sync::Mutex<Vec<Op>>>,
        late: Option<(mpsc::Sender<Arc<ChatMessage>>, Arc<ChatMessage>)>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<std::sync::Mutex<Vec<Op>>>) {
            let ops = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = Self {
                ops: Arc::clone(&ops),
                late: None,
            };
            (sink, ops)
        }
    }

    impl Sink<Message> for RecordingSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            let op = match item {
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    Op::Text(value["content"].as_str().unwrap().to_string())
                }
                Message::Ping(_) => Op::Ping,
                other => panic!("unexpected frame: {:?}", other),
            };
            self.ops.lock().unwrap().push(op);
            Ok(())
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            self.ops.lock().unwrap().push(Op::Flush);
            if let Some((tx, msg)) = self.late.take() {
                tx.try_send(msg).unwrap();
            }
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.ops.lock().unwrap().push(Op::Close);
            Poll::Ready(Ok(()))
        }
    }

    /// Sink whose writes never complete
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    fn text(content: &str) -> Arc<ChatMessage> {
        Arc::new(ChatMessage::system(None, content))
    }

    #[tokio::test]
    async fn test_write_pump_coalesces_queued_messages() {
        let (sink, ops) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);
        for content in ["one", "two", "three"] {
            tx.try_send(text(content)).unwrap();
        }
        drop(tx);

        write_pump(sink, rx, Arc::new(ServerConfig::default()), SessionId::new())
            .await
            .unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                Op::Text("one".into()),
                Op::Text("two".into()),
                Op::Text("three".into()),
                Op::Flush,
                Op::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_write_pump_batch_stops_at_queue_length_seen() {
        let (mut sink, ops) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);
        tx.try_send(text("one")).unwrap();
        tx.try_send(text("two")).unwrap();
        sink.late = Some((tx, text("late")));

        write_pump(sink, rx, Arc::new(ServerConfig::default()), SessionId::new())
            .await
            .unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                Op::Text("one".into()),
                Op::Text("two".into()),
                Op::Flush,
                Op::Text("late".into()),
                Op::Flush,
                Op::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_write_pump_sends_keepalive_pings() {
        let (sink, ops) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);
        let config = ServerConfig::default().pong_wait(Duration::from_millis(100));

        let pump = tokio::spawn(write_pump(sink, rx, Arc::new(config), SessionId::new()));
        time::sleep(Duration::from_millis(250)).await;
        drop(tx);
        pump.await.unwrap().unwrap();

        let ops = ops.lock().unwrap();
        assert!(ops.iter().filter(|op| **op == Op::Ping).count() >= 2, "{:?}", ops);
        assert_eq!(ops.last(), Some(&Op::Close));
    }

    #[tokio::test]
    async fn test_write_pump_stalled_write_times_out() {
        let (tx, rx) = mpsc::channel(8);
        tx.try_send(text("stuck")).unwrap();
        let config = ServerConfig::default().write_wait(Duration::from_millis(50));

        let result = timeout(
            Duration::from_secs(2),
            write_pump(StalledSink, rx, Arc::new(config), SessionId::new()),
        )
        .await
        .expect("write pump ignored its deadline");

        assert!(matches!(result, Err(AppError::Timeout)));
        drop(tx);
    }
}
