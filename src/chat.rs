//! Per-room chat history.
//!
//! The log is strictly server-authoritative: entries arrive only through
//! [`ChatLog::ingest`] (fed by `new_message` broadcasts, the `room_joined`
//! history, and synthesised presence notices), never from local sends.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, trace};

use crate::protocol::{ChatMessage, ServerMessage};

#[derive(Debug, Clone)]
pub struct ChatLog {
    room_code: Option<String>,
    messages: Vec<ChatMessage>,
    dedup_window_ms: u64,
}

impl ChatLog {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            room_code: None,
            messages: Vec::new(),
            dedup_window_ms: u64::try_from(dedup_window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The room this history belongs to.
    pub fn room_code(&self) -> Option<&str> {
        self.room_code.as_deref()
    }

    /// Bind the log to `code`. Re-entering the same room keeps the history;
    /// entering a different one discards it. Returns `true` if it was cleared.
    pub fn enter_room(&mut self, code: &str) -> bool {
        if self.room_code.as_deref() == Some(code) {
            trace!(room = code, "re-entering room; chat history kept");
            return false;
        }
        let cleared = !self.messages.is_empty();
        if cleared {
            debug!(
                room = code,
                dropped = self.messages.len(),
                "entering a different room; chat history cleared"
            );
        }
        self.messages.clear();
        self.room_code = Some(code.to_string());
        cleared
    }

    /// Append `msg` unless an entry of the same type with the same author and
    /// text already exists within the dedup window. Returns `true` if appended.
    pub fn ingest(&mut self, msg: ChatMessage) -> bool {
        if self.is_duplicate(&msg) {
            trace!(text = msg.message(), "duplicate chat entry dropped");
            return false;
        }
        self.messages.push(msg);
        true
    }

    /// Ingest the history carried by `room_joined`. Returns how many entries
    /// were appended.
    pub fn hydrate(&mut self, history: impl IntoIterator<Item = ChatMessage>) -> usize {
        history
            .into_iter()
            .map(|msg| self.ingest(msg))
            .filter(|appended| *appended)
            .count()
    }

    /// Ingest the chat entry `msg` implies, if any.
    pub fn ingest_server(&mut self, msg: &ServerMessage) -> bool {
        chat_entry(msg).is_some_and(|entry| self.ingest(entry))
    }

    /// Entries, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Forget the room and its history.
    pub fn reset(&mut self) {
        self.room_code = None;
        self.messages.clear();
    }

    fn is_duplicate(&self, msg: &ChatMessage) -> bool {
        self.messages.iter().rev().any(|existing| {
            existing.is_system() == msg.is_system()
                && existing.username() == msg.username()
                && existing.message() == msg.message()
                && existing.timestamp().abs_diff(msg.timestamp()) < self.dedup_window_ms
        })
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

/// The chat entry a server event implies: broadcasts become `chat` entries,
/// presence changes become `system` notices.
pub fn chat_entry(msg: &ServerMessage) -> Option<ChatMessage> {
    let now = Utc::now().timestamp_millis();
    match msg {
        ServerMessage::NewMessage {
            username,
            message,
            timestamp,
        } => Some(ChatMessage::Chat {
            username: username.clone(),
            message: message.clone(),
            timestamp: timestamp.unwrap_or(now),
        }),
        ServerMessage::PlayerJoined { player } => Some(ChatMessage::System {
            message: format!("{} joined the lobby", player.username),
            timestamp: now,
        }),
        ServerMessage::PlayerLeft { user_id, username } => Some(ChatMessage::System {
            message: format!("{} left the lobby", username.as_deref().unwrap_or(user_id)),
            timestamp: now,
        }),
        ServerMessage::PlayerDisconnected { user_id, username } => Some(ChatMessage::System {
            message: format!(
                "{} disconnected",
                username.as_deref().unwrap_or(user_id)
            ),
            timestamp: now,
        }),
        _ => None,
    }
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
    use crate::protocol::Player;

    fn chat(username: &str, text: &str, timestamp: i64) -> ChatMessage {
        ChatMessage::Chat {
            username: username.into(),
            message: text.into(),
            timestamp,
        }
    }

    #[test]
    fn same_room_keeps_history_other_room_clears_it() {
        let mut log = ChatLog::default();
        log.enter_room("ABC123");
        log.ingest(chat("bob", "hi", 1_000));
        assert!(!log.enter_room("ABC123"));
        assert_eq!(log.len(), 1);

        assert!(log.enter_room("XYZ789"));
        assert!(log.is_empty());
        assert_eq!(log.room_code(), Some("XYZ789"));
    }

    #[test]
    fn near_duplicates_are_dropped() {
        let mut log = ChatLog::default();
        assert!(log.ingest(chat("bob", "hi", 10_000)));
        assert!(!log.ingest(chat("bob", "hi", 10_999)));
        assert!(!log.ingest(chat("bob", "hi", 9_500)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn distinct_or_distant_messages_are_kept() {
        let mut log = ChatLog::default();
        log.ingest(chat("bob", "hi", 10_000));
        assert!(log.ingest(chat("bob", "hi", 11_000)));
        assert!(log.ingest(chat("alice", "hi", 10_000)));
        assert!(log.ingest(chat("bob", "hey", 10_000)));
        assert!(log.ingest(ChatMessage::System {
            message: "hi".into(),
            timestamp: 10_000,
        }));
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let mut log = ChatLog::default();
        assert!(log.ingest(chat("bob", "hi", i64::MIN)));
        assert!(log.ingest(chat("bob", "hi", 1)));
        assert!(log.ingest(chat("bob", "hi", i64::MAX)));
        assert!(!log.ingest(chat("bob", "hi", i64::MAX - 1)));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn hydrate_skips_redelivered_entries() {
        let mut log = ChatLog::default();
        log.enter_room("ABC123");
        log.ingest(chat("bob", "hi", 5_000));
        let appended = log.hydrate(vec![chat("bob", "hi", 5_000), chat("carol", "yo", 5_100)]);
        assert_eq!(appended, 1);
        assert_eq!(log.messages()[1].username(), Some("carol"));
    }

    #[test]
    fn new_message_uses_server_timestamp() {
        let entry = chat_entry(&ServerMessage::NewMessage {
            username: "bob".into(),
            message: "hi".into(),
            timestamp: Some(42),
        })
        .unwrap();
        assert_eq!(entry, chat("bob", "hi", 42));
    }

    #[test]
    fn presence_events_become_system_notices() {
        let joined = chat_entry(&ServerMessage::PlayerJoined {
            player: Player::new("u2", "Bob"),
        })
        .unwrap();
        assert!(joined.is_system());
        assert_eq!(joined.message(), "Bob joined the lobby");

        let gone = chat_entry(&ServerMessage::PlayerDisconnected {
            user_id: "u3".into(),
            username: None,
        })
        .unwrap();
        assert_eq!(gone.message(), "u3 disconnected");

        assert!(chat_entry(&ServerMessage::AllReady { room_code: None }).is_none());
    }
}
