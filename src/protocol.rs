//! Wire-compatible protocol types for the quiz battle socket.
//!
//! Every frame is a JSON text message of the shape
//! `{"event": "<snake_case name>", "data": { ... }}`. Outbound commands are
//! [`ClientMessage`]s, inbound events are [`ServerMessage`]s.
//!
//! Snapshots (`room_snapshot_updated`, `settings_updated`) are always complete
//! and are meant to replace client state, never to be merged into it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Type aliases ────────────────────────────────────────────────────

/// Opaque server-assigned user identifier.
pub type UserId = String;

/// Default per-question timer when a snapshot omits it.
pub const DEFAULT_TIME_PER_QUESTION: u32 = 30;

/// Default room capacity when a snapshot omits it.
pub const DEFAULT_MAX_PLAYERS: u8 = 8;

// ── Structs ─────────────────────────────────────────────────────────

/// A player inside a room or battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub is_ready: bool,
    /// Running score (battle only).
    #[serde(default)]
    pub score: i64,
    /// Running correct-answer count (battle only).
    #[serde(default)]
    pub correct_answers: u32,
}

impl Player {
    /// A fresh, not-ready player with zero score.
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            is_ready: false,
            score: 0,
            correct_answers: 0,
        }
    }
}

/// One quiz selected for the room's question pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizContent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub question_count: u32,
}

/// Host-controlled lobby settings.
///
/// Only a `settings_updated` event is allowed to change these locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    #[serde(default = "default_time_per_question")]
    pub time_per_question: u32,
    #[serde(default = "default_max_players")]
    pub max_players: u8,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub quiz_contents: Vec<QuizContent>,
}

fn default_time_per_question() -> u32 {
    DEFAULT_TIME_PER_QUESTION
}

fn default_max_players() -> u8 {
    DEFAULT_MAX_PLAYERS
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            time_per_question: DEFAULT_TIME_PER_QUESTION,
            max_players: DEFAULT_MAX_PLAYERS,
            category: None,
            difficulty: None,
            quiz_contents: Vec::new(),
        }
    }
}

/// Complete description of a lobby as pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_code: String,
    pub creator_id: UserId,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub settings: RoomSettings,
}

/// A single quiz question as broadcast at `question_started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question_number: u32,
    pub text: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    /// Seconds allowed for this question.
    pub time_limit: u32,
}

impl Question {
    /// Letter used on the wire for the option at `index` (`0 → "A"`).
    pub fn option_letter(index: usize) -> Option<String> {
        u8::try_from(index)
            .ok()
            .filter(|i| *i < 26)
            .map(|i| char::from(b'A' + i).to_string())
    }

    /// Option text for a wire letter such as `"B"`.
    pub fn option_for_letter(&self, letter: &str) -> Option<&str> {
        let mut chars = letter.chars();
        let c = chars.next()?.to_ascii_uppercase();
        if chars.next().is_some() || !c.is_ascii_uppercase() {
            return None;
        }
        let index = usize::from(c as u8 - b'A');
        self.options.get(index).map(String::as_str)
    }
}

/// A chat log entry.
///
/// `system` entries are informational and carry no author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        message: String,
        /// Epoch milliseconds.
        timestamp: i64,
    },
    Chat {
        username: String,
        message: String,
        /// Epoch milliseconds.
        timestamp: i64,
    },
}

impl ChatMessage {
    pub fn message(&self) -> &str {
        match self {
            Self::System { message, .. } | Self::Chat { message, .. } => message,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Self::System { .. } => None,
            Self::Chat { username, .. } => Some(username),
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::System { timestamp, .. } | Self::Chat { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}

// ── Payload structs ─────────────────────────────────────────────────

/// Acknowledgement of a `join_room` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinedPayload {
    pub room_code: String,
    #[serde(default)]
    pub players: Vec<Player>,
    /// Recent chat history used to hydrate the local chat log.
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Commands sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room identified by a 6-character code.
    JoinRoom { room_code: String },
    /// Leave a room. Best-effort, no acknowledgement is awaited.
    LeaveRoom { room_code: String },
    /// Post a chat message to a room.
    SendMessage { room_code: String, message: String },
    /// Answer the current question. An empty `answer` means time ran out.
    SubmitAnswer {
        room_code: String,
        answer: String,
        /// Whole seconds elapsed since the question started.
        time_taken: u32,
    },
}

/// Events pushed from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges `join_room`.
    RoomJoined(RoomJoinedPayload),
    /// Generic failure reply to the last command.
    Error { message: String },
    PlayerJoined { player: Player },
    PlayerLeft {
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
    },
    PlayerReadyChanged { user_id: UserId, is_ready: bool },
    /// Routine snapshot (join, ready toggle, ...). Never authoritative for settings.
    RoomSnapshotUpdated(RoomSnapshot),
    /// Snapshot produced by a settings change. Authoritative for settings.
    SettingsUpdated(RoomSnapshot),
    RoomClosed {
        #[serde(default)]
        message: Option<String>,
    },
    AllReady {
        #[serde(default)]
        room_code: Option<String>,
    },
    PlayerDisconnected {
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
    },
    CountdownStarted {
        seconds: u32,
        #[serde(default)]
        players: Option<Vec<Player>>,
    },
    GameStarted {
        total_questions: u32,
        #[serde(default)]
        players: Option<Vec<Player>>,
    },
    QuestionStarted(Question),
    PlayerAnswered {
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
    },
    /// Correlated reply to `submit_answer`.
    AnswerRecorded {
        is_correct: bool,
        points_earned: i64,
        #[serde(default)]
        correct_answer: Option<String>,
    },
    QuestionEnded {
        #[serde(default)]
        question_number: Option<u32>,
        #[serde(default)]
        standings: Vec<Player>,
        #[serde(default)]
        correct_answer: Option<String>,
    },
    ScoresUpdated { standings: Vec<Player> },
    GameEnded {
        final_standings: Vec<Player>,
        #[serde(default)]
        xp_awarded: BTreeMap<UserId, u32>,
    },
    NewMessage {
        username: String,
        message: String,
        /// Epoch milliseconds; the client clock is used when absent.
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn client_message_uses_event_envelope() {
        let msg = ClientMessage::SubmitAnswer {
            room_code: "ABC123".into(),
            answer: "B".into(),
            time_taken: 3,
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "submit_answer");
        assert_eq!(value["data"]["room_code"], "ABC123");
        assert_eq!(value["data"]["answer"], "B");
        assert_eq!(value["data"]["time_taken"], 3);
    }

    #[test]
    fn snapshot_settings_fall_back_to_defaults() {
        let json = r#"{"event":"room_snapshot_updated","data":{"room_code":"ABC123","creator_id":"u1"}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let ServerMessage::RoomSnapshotUpdated(snapshot) = msg else {
            panic!("expected RoomSnapshotUpdated, got {msg:?}");
        };
        assert!(snapshot.players.is_empty());
        assert_eq!(snapshot.settings, RoomSettings::default());
    }

    #[test]
    fn question_started_fixture_decodes() {
        let json = r#"{
            "event": "question_started",
            "data": {
                "question_number": 1,
                "text": "Capital of France?",
                "options": ["Berlin", "Paris", "Rome", "Madrid"],
                "category": "geography",
                "difficulty": "easy",
                "time_limit": 30
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let ServerMessage::QuestionStarted(q) = msg else {
            panic!("expected QuestionStarted");
        };
        assert_eq!(q.time_limit, 30);
        assert_eq!(q.option_for_letter("B"), Some("Paris"));
        assert_eq!(q.option_for_letter("e"), None);
    }

    #[test]
    fn game_ended_xp_map_decodes() {
        let json = r#"{"event":"game_ended","data":{
            "final_standings":[{"user_id":"u1","username":"Alice","score":300}],
            "xp_awarded":{"u1":150}
        }}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let ServerMessage::GameEnded {
            final_standings,
            xp_awarded,
        } = msg
        else {
            panic!("expected GameEnded");
        };
        assert_eq!(final_standings[0].score, 300);
        assert_eq!(xp_awarded.get("u1"), Some(&150));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let json = r#"{"event":"answer_recorded","data":{"points_earned":10}}"#;
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }

    #[test]
    fn chat_history_entries_are_tagged() {
        let json = r#"{"event":"room_joined","data":{"room_code":"ABC123","chat_history":[
            {"type":"system","message":"Alice joined","timestamp":1},
            {"type":"chat","username":"bob","message":"hi","timestamp":2}
        ]}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let ServerMessage::RoomJoined(payload) = msg else {
            panic!("expected RoomJoined");
        };
        assert!(payload.chat_history[0].is_system());
        assert_eq!(payload.chat_history[1].username(), Some("bob"));
    }

    #[test]
    fn option_letters() {
        assert_eq!(Question::option_letter(0).as_deref(), Some("A"));
        assert_eq!(Question::option_letter(3).as_deref(), Some("D"));
        assert_eq!(Question::option_letter(26), None);
    }
}
