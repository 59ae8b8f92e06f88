#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for quiz battle client integration tests.
//!
//! Provides a channel-driven [`MockTransport`] whose server side is scripted
//! through a [`ServerHandle`], a [`MockConnector`] that hands those
//! transports to the connection manager, and builders for common server
//! messages.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use quiz_battle_client::protocol::{Player, Question, RoomJoinedPayload, RoomSettings, RoomSnapshot};
use quiz_battle_client::{
    ClientConfig, Connection, ConnectionManager, Connector, Credentials, EventKind, ServerMessage,
    SessionError, StaticToken, Transport,
};
use tokio::sync::mpsc;

type Frame = Option<Result<String, SessionError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// A transport fed by its [`ServerHandle`]. `None` on the channel closes it.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

/// The server side of a [`MockTransport`].
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Frame>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

pub fn mock_transport() -> (MockTransport, ServerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport {
            incoming: rx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        },
        ServerHandle { tx, sent, closed },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SessionError::TransportClosed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        match self.incoming.recv().await {
            Some(frame) => frame,
            // Server handle dropped: stay open until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl ServerHandle {
    /// Push one server event.
    pub fn push(&self, msg: &ServerMessage) {
        self.push_raw(&serde_json::to_string(msg).expect("server message serialization"));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.tx.send(Some(Ok(text.to_string())));
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        let _ = self.tx.send(None);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Every frame the client sent, decoded.
    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).expect("client frame is JSON"))
            .collect()
    }

    /// Frames the client sent for `event`.
    pub fn sent_events(&self, event: &str) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter(|v| v["event"] == event)
            .collect()
    }

    /// Wait until the client has sent `count` frames for `event`.
    pub async fn wait_for_sent(&self, event: &str, count: usize) -> Vec<serde_json::Value> {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let frames = self.sent_events(event);
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("client never sent {count} {event} frame(s)"))
    }

    /// Push `msg` once `conn` has a listener for `kind`.
    pub async fn reply_when_listening(&self, conn: &Connection, kind: EventKind, msg: ServerMessage) {
        while conn.registry().listener_count(kind) == 0 {
            tokio::task::yield_now().await;
        }
        self.push(&msg);
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Hands out scripted transports in order and records every dial.
pub struct MockConnector {
    transports: StdMutex<VecDeque<MockTransport>>,
    tokens: Arc<StdMutex<Vec<Option<String>>>>,
    calls: Arc<AtomicUsize>,
}

/// Observes a [`MockConnector`] after it moved into the manager.
#[derive(Clone)]
pub struct DialLog {
    tokens: Arc<StdMutex<Vec<Option<String>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(transports: Vec<MockTransport>) -> (Self, DialLog) {
        let tokens = Arc::new(StdMutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                transports: StdMutex::new(transports.into()),
                tokens: Arc::clone(&tokens),
                calls: Arc::clone(&calls),
            },
            DialLog { tokens, calls },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(credentials.token.clone());
        match self.transports.lock().unwrap().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(SessionError::ConnectionError("connection refused".into())),
        }
    }
}

impl DialLog {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

/// A manager over one scripted transport, authenticating as `"test-jwt"`.
pub fn manager_with_server() -> (Arc<ConnectionManager>, ServerHandle, DialLog) {
    let (transport, server) = mock_transport();
    let (connector, dials) = MockConnector::new(vec![transport]);
    let manager = ConnectionManager::new(
        connector,
        StaticToken(Some("test-jwt".into())),
        ClientConfig::new("ws://test.invalid/socket"),
    );
    (Arc::new(manager), server, dials)
}

// ── Message builders ────────────────────────────────────────────────

pub fn room_joined(room_code: &str, players: Vec<Player>) -> ServerMessage {
    ServerMessage::RoomJoined(RoomJoinedPayload {
        room_code: room_code.into(),
        players,
        chat_history: vec![],
    })
}

pub fn error(message: &str) -> ServerMessage {
    ServerMessage::Error {
        message: message.into(),
    }
}

pub fn snapshot(room_code: &str, players: Vec<Player>, time_per_question: u32) -> RoomSnapshot {
    RoomSnapshot {
        room_code: room_code.into(),
        creator_id: "u1".into(),
        players,
        settings: RoomSettings {
            time_per_question,
            ..RoomSettings::default()
        },
    }
}

pub fn question(number: u32, time_limit: u32) -> Question {
    Question {
        question_number: number,
        text: "Which planet is known as the red planet?".into(),
        options: vec![
            "Venus".into(),
            "Mars".into(),
            "Jupiter".into(),
            "Saturn".into(),
        ],
        category: Some("science".into()),
        difficulty: Some("easy".into()),
        time_limit,
    }
}

pub fn question_started(number: u32, time_limit: u32) -> ServerMessage {
    ServerMessage::QuestionStarted(question(number, time_limit))
}

pub fn new_message(username: &str, message: &str, timestamp: i64) -> ServerMessage {
    ServerMessage::NewMessage {
        username: username.into(),
        message: message.into(),
        timestamp: Some(timestamp),
    }
}

pub fn game_ended(standings: Vec<Player>, xp: &[(&str, u32)]) -> ServerMessage {
    ServerMessage::GameEnded {
        final_standings: standings,
        xp_awarded: xp
            .iter()
            .map(|(id, amount)| ((*id).to_string(), *amount))
            .collect::<BTreeMap<_, _>>(),
    }
}
