#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Protocol serialization tests for the quiz battle client.
//!
//! Decodes JSON fixtures shaped like real server output and checks the exact
//! wire shape of every outbound command.

use quiz_battle_client::protocol::{ChatMessage, ClientMessage, RoomSettings, ServerMessage};
use quiz_battle_client::EventKind;

fn decode(json: &str) -> ServerMessage {
    serde_json::from_str(json).unwrap_or_else(|e| panic!("fixture failed to decode: {e}\n{json}"))
}

fn encode(msg: &ClientMessage) -> serde_json::Value {
    serde_json::to_value(msg).expect("serialize")
}

// ════════════════════════════════════════════════════════════════════
// Outbound commands
// ════════════════════════════════════════════════════════════════════

#[test]
fn outbound_commands_match_wire_shape() {
    assert_eq!(
        encode(&ClientMessage::JoinRoom {
            room_code: "ABC123".into()
        }),
        serde_json::json!({"event": "join_room", "data": {"room_code": "ABC123"}})
    );
    assert_eq!(
        encode(&ClientMessage::LeaveRoom {
            room_code: "ABC123".into()
        }),
        serde_json::json!({"event": "leave_room", "data": {"room_code": "ABC123"}})
    );
    assert_eq!(
        encode(&ClientMessage::SendMessage {
            room_code: "ABC123".into(),
            message: "hi".into(),
        }),
        serde_json::json!({"event": "send_message", "data": {"room_code": "ABC123", "message": "hi"}})
    );
    assert_eq!(
        encode(&ClientMessage::SubmitAnswer {
            room_code: "ABC123".into(),
            answer: String::new(),
            time_taken: 30,
        }),
        serde_json::json!({
            "event": "submit_answer",
            "data": {"room_code": "ABC123", "answer": "", "time_taken": 30}
        })
    );
}

// ════════════════════════════════════════════════════════════════════
// Inbound fixtures
// ════════════════════════════════════════════════════════════════════

#[test]
fn room_joined_with_chat_history() {
    let msg = decode(
        r#"{"event":"room_joined","data":{
            "room_code":"ABC123",
            "players":[],
            "chat_history":[
                {"type":"system","message":"Alice created the lobby","timestamp":1700000000000},
                {"type":"chat","username":"Alice","message":"hello","timestamp":1700000000500}
            ]
        }}"#,
    );
    let ServerMessage::RoomJoined(payload) = msg else {
        panic!("expected RoomJoined");
    };
    assert!(payload.players.is_empty());
    assert_eq!(payload.chat_history.len(), 2);
    assert!(payload.chat_history[0].is_system());
    assert_eq!(
        payload.chat_history[1],
        ChatMessage::Chat {
            username: "Alice".into(),
            message: "hello".into(),
            timestamp: 1_700_000_000_500,
        }
    );
}

#[test]
fn room_joined_without_history_defaults_to_empty() {
    let msg = decode(r#"{"event":"room_joined","data":{"room_code":"ABC123"}}"#);
    let ServerMessage::RoomJoined(payload) = msg else {
        panic!("expected RoomJoined");
    };
    assert!(payload.chat_history.is_empty());
}

#[test]
fn settings_updated_carries_full_snapshot() {
    let msg = decode(
        r#"{"event":"settings_updated","data":{
            "room_code":"ABC123",
            "creator_id":"u1",
            "players":[{"user_id":"u1","username":"Alice","is_ready":true}],
            "settings":{
                "time_per_question":45,
                "max_players":4,
                "category":"history",
                "difficulty":"hard",
                "quiz_contents":[{"id":"q-1","title":"Rome","question_count":12}]
            }
        }}"#,
    );
    assert_eq!(msg.kind(), EventKind::SettingsUpdated);
    let ServerMessage::SettingsUpdated(snapshot) = msg else {
        panic!("expected SettingsUpdated");
    };
    assert!(snapshot.players[0].is_ready);
    assert_eq!(snapshot.settings.time_per_question, 45);
    assert_eq!(snapshot.settings.max_players, 4);
    assert_eq!(snapshot.settings.quiz_contents[0].question_count, 12);
}

#[test]
fn partial_settings_fall_back_to_defaults() {
    let msg = decode(
        r#"{"event":"room_snapshot_updated","data":{
            "room_code":"ABC123","creator_id":"u1","settings":{"category":"art"}
        }}"#,
    );
    let ServerMessage::RoomSnapshotUpdated(snapshot) = msg else {
        panic!("expected RoomSnapshotUpdated");
    };
    assert_eq!(
        snapshot.settings,
        RoomSettings {
            category: Some("art".into()),
            ..RoomSettings::default()
        }
    );
}

#[test]
fn countdown_and_game_started_players_are_optional() {
    let msg = decode(r#"{"event":"countdown_started","data":{"seconds":5}}"#);
    assert!(matches!(
        msg,
        ServerMessage::CountdownStarted {
            seconds: 5,
            players: None
        }
    ));

    let msg = decode(
        r#"{"event":"game_started","data":{"total_questions":10,
            "players":[{"user_id":"u1","username":"Alice"}]}}"#,
    );
    let ServerMessage::GameStarted {
        total_questions,
        players,
    } = msg
    else {
        panic!("expected GameStarted");
    };
    assert_eq!(total_questions, 10);
    assert_eq!(players.unwrap()[0].score, 0);
}

#[test]
fn answer_recorded_fixture() {
    let msg = decode(
        r#"{"event":"answer_recorded","data":{"is_correct":true,"points_earned":120,"correct_answer":"B"}}"#,
    );
    assert_eq!(
        msg,
        ServerMessage::AnswerRecorded {
            is_correct: true,
            points_earned: 120,
            correct_answer: Some("B".into()),
        }
    );
}

#[test]
fn question_ended_and_game_ended_fixtures() {
    let msg = decode(
        r#"{"event":"question_ended","data":{
            "standings":[{"user_id":"u1","username":"Alice","score":120,"correct_answers":1}],
            "correct_answer":"B"
        }}"#,
    );
    let ServerMessage::QuestionEnded {
        question_number,
        standings,
        correct_answer,
    } = msg
    else {
        panic!("expected QuestionEnded");
    };
    assert_eq!(question_number, None);
    assert_eq!(standings[0].correct_answers, 1);
    assert_eq!(correct_answer.as_deref(), Some("B"));

    let msg = decode(
        r#"{"event":"game_ended","data":{
            "final_standings":[{"user_id":"u1","username":"Alice","score":300}],
            "xp_awarded":{"u1":150,"u2":40}
        }}"#,
    );
    let ServerMessage::GameEnded { xp_awarded, .. } = msg else {
        panic!("expected GameEnded");
    };
    assert_eq!(xp_awarded.get("u2"), Some(&40));
}

#[test]
fn new_message_timestamp_is_optional() {
    let msg = decode(r#"{"event":"new_message","data":{"username":"bob","message":"hi"}}"#);
    assert!(matches!(
        msg,
        ServerMessage::NewMessage {
            timestamp: None,
            ..
        }
    ));
}

#[test]
fn unknown_or_malformed_events_are_rejected() {
    assert!(serde_json::from_str::<ServerMessage>(r#"{"event":"teleport","data":{}}"#).is_err());
    assert!(serde_json::from_str::<ServerMessage>(
        r#"{"event":"question_started","data":{"question_number":1}}"#
    )
    .is_err());
    assert!(serde_json::from_str::<ServerMessage>("[]").is_err());
}

#[test]
fn event_kind_names_match_wire_names() {
    let fixtures = [
        (r#"{"event":"all_ready","data":{}}"#, EventKind::AllReady),
        (r#"{"event":"room_closed","data":{}}"#, EventKind::RoomClosed),
        (
            r#"{"event":"player_answered","data":{"user_id":"u2"}}"#,
            EventKind::PlayerAnswered,
        ),
        (
            r#"{"event":"player_ready_changed","data":{"user_id":"u2","is_ready":true}}"#,
            EventKind::PlayerReadyChanged,
        ),
        (
            r#"{"event":"scores_updated","data":{"standings":[]}}"#,
            EventKind::ScoresUpdated,
        ),
    ];
    for (json, kind) in fixtures {
        let msg = decode(json);
        assert_eq!(msg.kind(), kind);
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["event"], kind.as_str());
    }
}
