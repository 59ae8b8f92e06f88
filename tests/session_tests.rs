//! End-to-end tests for the quiz battle client.
//!
//! Uses the scripted transport from `tests/common` behind a real
//! `ConnectionManager`, so every test goes through the connect, correlated
//! request and fan-out paths the application uses.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod common;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use parking_lot::Mutex;
use quiz_battle_client::battle::TIMES_UP;
use quiz_battle_client::protocol::{ChatMessage, Player};
use quiz_battle_client::{
    BattleSession, BattleState, ChatLog, ClientConfig, ConnectionManager, ConnectionStatus,
    EventKind, LobbySync, MembershipStore, MemoryStore, Phase, RoomController, RoomEventHandlers,
    ServerMessage, SessionError, StaticToken,
};

use common::{
    error, game_ended, manager_with_server, mock_transport, new_message, question,
    question_started, room_joined, snapshot, MockConnector,
};

// ════════════════════════════════════════════════════════════════════
// Connection manager
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_attaches_token_and_is_idempotent() {
    let (manager, _server, dials) = manager_with_server();
    let first = manager.connect().await.unwrap();
    let second = manager.connect().await.unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(dials.calls(), 1);
    assert_eq!(dials.tokens(), vec![Some("test-jwt".to_string())]);
    assert!(manager.connection().is_some());
    manager.disconnect().await;
    assert!(manager.connection().is_none());
}

#[tokio::test]
async fn failed_handshake_is_terminal_for_the_attempt() {
    let (connector, dials) = MockConnector::new(vec![]);
    let manager = ConnectionManager::new(connector, StaticToken(None), ClientConfig::default());
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectionError(_)));
    assert_eq!(dials.calls(), 1);
    assert_eq!(dials.tokens(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_is_redialled_and_listeners_survive() {
    let (first, first_server) = mock_transport();
    let (second, second_server) = mock_transport();
    let (connector, dials) = MockConnector::new(vec![first, second]);
    let manager = ConnectionManager::new(
        connector,
        StaticToken(Some("jwt".into())),
        ClientConfig::default(),
    );
    let rooms = RoomController::new(Arc::new(manager));
    let conn = rooms.manager().connect().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    let _sub = rooms.subscribe_room_events(RoomEventHandlers::new().on(
        EventKind::NewMessage,
        move |msg| seen_in_handler.lock().push(msg.clone()),
    ));

    let mut status = conn.watch_status();
    first_server.drop_connection();
    status
        .wait_for(|s| *s == ConnectionStatus::Reconnecting)
        .await
        .unwrap();
    status
        .wait_for(|s| *s == ConnectionStatus::Connected)
        .await
        .unwrap();
    assert_eq!(dials.calls(), 2);

    second_server.push(&new_message("bob", "back", 1));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().len(), 1);
    rooms.manager().disconnect().await;
}

// ════════════════════════════════════════════════════════════════════
// Room membership
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_and_chat_round_trip() {
    let (manager, server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));
    let conn = manager.connect().await.unwrap();

    let (joined, ()) = tokio::join!(
        rooms.join_room("abc123"),
        server.reply_when_listening(&conn, EventKind::RoomJoined, room_joined("ABC123", vec![])),
    );
    let joined = joined.unwrap();
    assert_eq!(joined.room_code, "ABC123");
    assert!(joined.players.is_empty());
    let sent = server.wait_for_sent("join_room", 1).await;
    assert_eq!(sent[0]["data"]["room_code"], "ABC123");

    let chat = Arc::new(Mutex::new(ChatLog::default()));
    chat.lock().enter_room("ABC123");
    chat.lock().hydrate(joined.chat_history);
    let chat_in_handler = Arc::clone(&chat);
    let _sub = rooms.subscribe_room_events(RoomEventHandlers::new().on(
        EventKind::NewMessage,
        move |msg| {
            chat_in_handler.lock().ingest_server(msg);
        },
    ));

    rooms.send_message("ABC123", "hi").unwrap();
    let sent = server.wait_for_sent("send_message", 1).await;
    assert_eq!(sent[0]["data"]["message"], "hi");
    assert!(chat.lock().is_empty());

    server.push(&new_message("bob", "hi", 1_700_000_000_000));
    server.push(&new_message("bob", "hi", 1_700_000_000_400));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let chat = chat.lock();
    assert_eq!(chat.len(), 1);
    assert_eq!(
        chat.messages()[0],
        ChatMessage::Chat {
            username: "bob".into(),
            message: "hi".into(),
            timestamp: 1_700_000_000_000,
        }
    );
    drop(chat);
    manager.disconnect().await;
}

#[tokio::test]
async fn join_error_event_is_rejection() {
    let (manager, server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));
    let conn = manager.connect().await.unwrap();

    let (joined, ()) = tokio::join!(
        rooms.join_room("ZZZ999"),
        server.reply_when_listening(&conn, EventKind::Error, error("Lobby not found")),
    );
    match joined {
        Err(SessionError::JoinRejected(message)) => assert_eq!(message, "Lobby not found"),
        other => panic!("expected JoinRejected, got {other:?}"),
    }
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn join_without_reply_times_out_and_late_ack_is_ignored() {
    let (manager, server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));

    let started = tokio::time::Instant::now();
    let err = rooms.join_room("ABC123").await.unwrap_err();
    assert!(matches!(err, SessionError::JoinTimeout));
    assert!(started.elapsed() >= Duration::from_secs(5));

    let conn = manager.connection().unwrap();
    assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 0);
    assert_eq!(conn.registry().listener_count(EventKind::Error), 0);

    server.push(&room_joined("ABC123", vec![]));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(conn.is_connected());
    manager.disconnect().await;
}

#[tokio::test]
async fn invalid_input_never_reaches_the_wire() {
    let (manager, server, dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));

    assert!(matches!(
        rooms.join_room("ABC").await,
        Err(SessionError::InvalidInput(_))
    ));
    assert_eq!(dials.calls(), 0);

    manager.connect().await.unwrap();
    assert!(rooms.send_message("ABC123", "   ").is_err());
    assert!(rooms.send_message("ABC123", &"x".repeat(201)).is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(server.sent_events("send_message").is_empty());
    manager.disconnect().await;
}

#[tokio::test]
async fn subscribe_before_connect_is_noop() {
    let (manager, _server, _dials) = manager_with_server();
    let rooms = RoomController::new(manager);
    let mut sub = rooms.subscribe_room_events(
        RoomEventHandlers::new().on(EventKind::PlayerJoined, |_| {}),
    );
    assert!(!sub.is_active());
    sub.unsubscribe();
}

#[tokio::test]
async fn unsubscribe_leaves_other_subscribers_attached() {
    let (manager, server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));
    let conn = manager.connect().await.unwrap();

    let lobby_hits = Arc::new(Mutex::new(0));
    let battle_hits = Arc::new(Mutex::new(0));
    let l = Arc::clone(&lobby_hits);
    let b = Arc::clone(&battle_hits);
    let mut lobby_sub = rooms.subscribe_room_events(
        RoomEventHandlers::new().on(EventKind::AllReady, move |_| *l.lock() += 1),
    );
    let _battle_sub = rooms.subscribe_room_events(
        RoomEventHandlers::new().on(EventKind::AllReady, move |_| *b.lock() += 1),
    );

    lobby_sub.unsubscribe();
    lobby_sub.unsubscribe();
    assert_eq!(conn.registry().listener_count(EventKind::AllReady), 1);

    server.push(&ServerMessage::AllReady { room_code: None });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*lobby_hits.lock(), 0);
    assert_eq!(*battle_hits.lock(), 1);
    manager.disconnect().await;
}

// ════════════════════════════════════════════════════════════════════
// Lobby synchronization through the socket
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn routine_snapshot_does_not_clobber_settings() {
    let (manager, server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));
    manager.connect().await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let mut lobby = LobbySync::new("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
    lobby.enter("ABC123", None);
    let lobby = Arc::new(Mutex::new(lobby));
    let lobby_in_handler = Arc::clone(&lobby);
    let _sub = rooms.subscribe_room_events(RoomEventHandlers::new().on_each(
        &[
            EventKind::RoomSnapshotUpdated,
            EventKind::SettingsUpdated,
            EventKind::PlayerReadyChanged,
        ],
        move |msg| {
            lobby_in_handler.lock().apply_server(msg);
        },
    ));

    let mut alice = Player::new("u1", "Alice");
    server.push(&ServerMessage::SettingsUpdated(snapshot(
        "ABC123",
        vec![alice.clone()],
        45,
    )));
    alice.is_ready = true;
    server.push(&ServerMessage::RoomSnapshotUpdated(snapshot(
        "ABC123",
        vec![alice, Player::new("u2", "Bob")],
        30,
    )));
    tokio::time::sleep(Duration::from_millis(20)).await;

    {
        let lobby = lobby.lock();
        assert_eq!(lobby.settings().unwrap().time_per_question, 45);
        assert_eq!(lobby.players().len(), 2);
        assert!(lobby.is_host());
        assert!(lobby.is_ready());
        assert!(!lobby.all_ready());
    }

    let stored = store.load().unwrap().unwrap();
    assert_eq!(stored.room_code, "ABC123");
    assert_eq!(stored.snapshot.unwrap().settings.time_per_question, 45);
    manager.disconnect().await;
}

// ════════════════════════════════════════════════════════════════════
// Battle session
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn countdown_seeds_standings_and_game_start_waits_for_question() {
    let (manager, server, _dials) = manager_with_server();
    let conn = manager.connect().await.unwrap();
    let session = BattleSession::start(conn, "ABC123", BattleState::new(), manager.config());
    let mut phase = session.watch_phase();

    server.push(&ServerMessage::CountdownStarted {
        seconds: 5,
        players: Some(vec![Player::new("u1", "Alice")]),
    });
    phase.wait_for(|p| *p == Phase::Countdown).await.unwrap();
    let state = session.snapshot();
    assert_eq!(state.standings()[0].username, "Alice");
    assert_eq!(state.standings()[0].score, 0);

    server.push(&ServerMessage::GameStarted {
        total_questions: 10,
        players: None,
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.phase(), Phase::Countdown);
    assert_eq!(session.snapshot().total_questions(), Some(10));

    server.push(&question_started(1, 30));
    phase.wait_for(|p| *p == Phase::Question).await.unwrap();
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_question_submits_once_at_zero() {
    let (manager, server, _dials) = manager_with_server();
    let conn = manager.connect().await.unwrap();
    let session = BattleSession::start(conn, "ABC123", BattleState::new(), manager.config());
    let mut phase = session.watch_phase();

    server.push(&question_started(1, 30));
    phase.wait_for(|p| *p == Phase::Question).await.unwrap();

    tokio::time::sleep(Duration::from_millis(29_500)).await;
    assert!(server.sent_events("submit_answer").is_empty());
    assert_eq!(session.snapshot().time_left(), 1);

    let sent = server.wait_for_sent("submit_answer", 1).await;
    assert_eq!(sent[0]["data"]["answer"], "");
    assert_eq!(sent[0]["data"]["time_taken"], 30);
    assert_eq!(sent[0]["data"]["room_code"], "ABC123");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(server.sent_events("submit_answer").len(), 1);
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn recorded_answer_keeps_question_until_question_ended() {
    let (manager, server, _dials) = manager_with_server();
    let conn = manager.connect().await.unwrap();
    let session = BattleSession::start(
        conn.clone(),
        "ABC123",
        BattleState::with_question(question(1, 30), Some(10), vec![]),
        manager.config(),
    );

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let (feedback, ()) = tokio::join!(
        session.submit_answer("B"),
        server.reply_when_listening(
            &conn,
            EventKind::AnswerRecorded,
            ServerMessage::AnswerRecorded {
                is_correct: true,
                points_earned: 120,
                correct_answer: Some("B".into()),
            },
        ),
    );
    let feedback = feedback.unwrap().unwrap();
    assert!(feedback.is_correct);
    assert_eq!(feedback.points_earned, 120);
    assert_eq!(feedback.correct_answer.as_deref(), Some("B"));
    assert_eq!(session.phase(), Phase::Question);
    let sent = server.wait_for_sent("submit_answer", 1).await;
    assert_eq!(sent[0]["data"]["time_taken"], 3);

    let mut phase = session.watch_phase();
    server.push(&ServerMessage::QuestionEnded {
        question_number: Some(1),
        standings: vec![Player::new("u1", "Alice")],
        correct_answer: Some("B".into()),
    });
    phase.wait_for(|p| *p == Phase::Results).await.unwrap();

    server.push(&game_ended(vec![Player::new("u1", "Alice")], &[("u1", 150)]));
    phase.wait_for(|p| *p == Phase::GameOver).await.unwrap();
    assert_eq!(session.snapshot().xp_for("u1"), 150);
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn connection_loss_mid_question_degrades_to_times_up() {
    let (manager, server, _dials) = manager_with_server();
    let conn = manager.connect().await.unwrap();
    let session = BattleSession::start(
        conn.clone(),
        "ABC123",
        BattleState::with_question(question(1, 3), None, vec![]),
        manager.config(),
    );

    let mut status = conn.watch_status();
    server.drop_connection();
    status
        .wait_for(|s| *s != ConnectionStatus::Connected)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let state = session.snapshot();
    assert_eq!(state.phase(), Phase::Question);
    assert_eq!(state.time_left(), 0);
    assert!(state.has_answered());
    let feedback = state.feedback().unwrap();
    assert_eq!(feedback.message.as_deref(), Some(TIMES_UP));
    assert!(feedback.correct_answer.is_none());
    assert!(server.sent_events("submit_answer").is_empty());
}

#[tokio::test]
async fn leaving_battle_sends_leave_clears_membership_then_navigates() {
    let (manager, server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));
    let conn = manager.connect().await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let mut lobby = LobbySync::new("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
    lobby.enter("ABC123", Some(snapshot("ABC123", vec![], 30)));
    assert!(store.load().unwrap().is_some());

    let session = BattleSession::start(conn, "ABC123", BattleState::new(), manager.config());
    let order = Arc::new(StdMutex::new(Vec::new()));
    let order_in_nav = Arc::clone(&order);
    let store_in_nav = Arc::clone(&store);
    session.leave(&rooms, &mut lobby, move || {
        let cleared = store_in_nav.load().unwrap().is_none();
        order_in_nav.lock().unwrap().push(("navigate", cleared));
    });

    assert_eq!(*order.lock().unwrap(), vec![("navigate", true)]);
    assert!(lobby.room_code().is_none());
    let left = server.wait_for_sent("leave_room", 1).await;
    assert_eq!(left[0]["data"]["room_code"], "ABC123");
    manager.disconnect().await;
}

#[tokio::test]
async fn leaving_without_connection_still_navigates() {
    let (manager, _server, _dials) = manager_with_server();
    let rooms = RoomController::new(Arc::clone(&manager));
    let conn = manager.connect().await.unwrap();
    let session = BattleSession::start(conn, "ABC123", BattleState::new(), manager.config());
    manager.disconnect().await;

    let mut lobby = LobbySync::new("u1", Arc::new(MemoryStore::new()));
    lobby.enter("ABC123", None);
    let mut navigated = false;
    session.leave(&rooms, &mut lobby, || navigated = true);
    assert!(navigated);
    assert!(lobby.room_code().is_none());
}
