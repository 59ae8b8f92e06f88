//! Event names used to route inbound [`ServerMessage`]s to listeners.

use std::fmt;

use crate::protocol::ServerMessage;

/// Field-less mirror of [`ServerMessage`], used as the fan-out key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    RoomJoined,
    Error,
    PlayerJoined,
    PlayerLeft,
    PlayerReadyChanged,
    RoomSnapshotUpdated,
    SettingsUpdated,
    RoomClosed,
    AllReady,
    PlayerDisconnected,
    CountdownStarted,
    GameStarted,
    QuestionStarted,
    PlayerAnswered,
    AnswerRecorded,
    QuestionEnded,
    ScoresUpdated,
    GameEnded,
    NewMessage,
}

impl EventKind {
    /// Events a lobby or battle view may subscribe to.
    pub const ROOM_EVENTS: [EventKind; 16] = [
        EventKind::PlayerJoined,
        EventKind::PlayerLeft,
        EventKind::PlayerReadyChanged,
        EventKind::RoomSnapshotUpdated,
        EventKind::SettingsUpdated,
        EventKind::RoomClosed,
        EventKind::AllReady,
        EventKind::PlayerDisconnected,
        EventKind::CountdownStarted,
        EventKind::GameStarted,
        EventKind::QuestionStarted,
        EventKind::PlayerAnswered,
        EventKind::QuestionEnded,
        EventKind::GameEnded,
        EventKind::NewMessage,
        EventKind::ScoresUpdated,
    ];

    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoomJoined => "room_joined",
            Self::Error => "error",
            Self::PlayerJoined => "player_joined",
            Self::PlayerLeft => "player_left",
            Self::PlayerReadyChanged => "player_ready_changed",
            Self::RoomSnapshotUpdated => "room_snapshot_updated",
            Self::SettingsUpdated => "settings_updated",
            Self::RoomClosed => "room_closed",
            Self::AllReady => "all_ready",
            Self::PlayerDisconnected => "player_disconnected",
            Self::CountdownStarted => "countdown_started",
            Self::GameStarted => "game_started",
            Self::QuestionStarted => "question_started",
            Self::PlayerAnswered => "player_answered",
            Self::AnswerRecorded => "answer_recorded",
            Self::QuestionEnded => "question_ended",
            Self::ScoresUpdated => "scores_updated",
            Self::GameEnded => "game_ended",
            Self::NewMessage => "new_message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerMessage {
    /// The routing key for this message.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RoomJoined(_) => EventKind::RoomJoined,
            Self::Error { .. } => EventKind::Error,
            Self::PlayerJoined { .. } => EventKind::PlayerJoined,
            Self::PlayerLeft { .. } => EventKind::PlayerLeft,
            Self::PlayerReadyChanged { .. } => EventKind::PlayerReadyChanged,
            Self::RoomSnapshotUpdated(_) => EventKind::RoomSnapshotUpdated,
            Self::SettingsUpdated(_) => EventKind::SettingsUpdated,
            Self::RoomClosed { .. } => EventKind::RoomClosed,
            Self::AllReady { .. } => EventKind::AllReady,
            Self::PlayerDisconnected { .. } => EventKind::PlayerDisconnected,
            Self::CountdownStarted { .. } => EventKind::CountdownStarted,
            Self::GameStarted { .. } => EventKind::GameStarted,
            Self::QuestionStarted(_) => EventKind::QuestionStarted,
            Self::PlayerAnswered { .. } => EventKind::PlayerAnswered,
            Self::AnswerRecorded { .. } => EventKind::AnswerRecorded,
            Self::QuestionEnded { .. } => EventKind::QuestionEnded,
            Self::ScoresUpdated { .. } => EventKind::ScoresUpdated,
            Self::GameEnded { .. } => EventKind::GameEnded,
            Self::NewMessage { .. } => EventKind::NewMessage,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn wire_name_matches_serde_tag() {
        let msg = ServerMessage::PlayerReadyChanged {
            user_id: "u1".into(),
            is_ready: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value.get("event").and_then(|v| v.as_str()), Some(msg.kind().as_str()));
    }

    #[test]
    fn room_events_exclude_correlated_replies() {
        assert!(!EventKind::ROOM_EVENTS.contains(&EventKind::RoomJoined));
        assert!(!EventKind::ROOM_EVENTS.contains(&EventKind::AnswerRecorded));
        assert!(!EventKind::ROOM_EVENTS.contains(&EventKind::Error));
    }
}
