//! # Scripted Battle Example
//!
//! Plays a two-question battle against an in-process scripted server, with
//! no network involved. It shows how to:
//!
//! - implement [`Transport`] and [`Connector`] over in-process channels
//! - drive a [`BattleSession`] through countdown, questions and game over
//! - submit an answer and let the local countdown time out on another
//!
//! ## Running
//!
//! ```sh
//! cargo run --example scripted_battle
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quiz_battle_client::protocol::{Player, Question};
use quiz_battle_client::{
    BattleSession, BattleState, ClientConfig, ClientMessage, ConnectionManager, Connector,
    Credentials, Phase, RoomController, ServerMessage, SessionError, StaticToken, Transport,
    XpSummary,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: An in-process transport and a connector that hands it out
// ─────────────────────────────────────────────────────────────────────

struct LoopbackTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        self.to_server
            .send(message)
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct LoopbackConnector {
    transport: Mutex<Option<LoopbackTransport>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Box<dyn Transport>, SessionError> {
        self.transport
            .lock()
            .take()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| SessionError::ConnectionError("loopback already used".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A tiny scripted server
// ─────────────────────────────────────────────────────────────────────

fn question(number: u32, text: &str, options: &[&str]) -> Question {
    Question {
        question_number: number,
        text: text.into(),
        options: options.iter().map(|o| (*o).to_string()).collect(),
        category: Some("science".into()),
        difficulty: Some("easy".into()),
        time_limit: 3,
    }
}

async fn run_server(
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
) {
    let push = |msg: ServerMessage| {
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = to_client.send(json);
        }
    };
    let mut alice = Player::new("u1", "Alice");

    while let Some(frame) = from_client.recv().await {
        let Ok(msg) = serde_json::from_str::<ClientMessage>(&frame) else {
            continue;
        };
        match msg {
            ClientMessage::JoinRoom { room_code } => {
                push(ServerMessage::RoomJoined(
                    quiz_battle_client::protocol::RoomJoinedPayload {
                        room_code,
                        players: vec![alice.clone()],
                        chat_history: vec![],
                    },
                ));
                push(ServerMessage::CountdownStarted {
                    seconds: 1,
                    players: Some(vec![alice.clone()]),
                });
                tokio::time::sleep(Duration::from_secs(1)).await;
                push(ServerMessage::GameStarted {
                    total_questions: 2,
                    players: None,
                });
                push(ServerMessage::QuestionStarted(question(
                    1,
                    "Which planet is known as the red planet?",
                    &["Venus", "Mars", "Jupiter"],
                )));
            }
            ClientMessage::SubmitAnswer {
                answer, time_taken, ..
            } => {
                let is_correct = answer == "B";
                let points = if is_correct { 100 + i64::from(3 - time_taken.min(3)) * 10 } else { 0 };
                alice.score += points;
                push(ServerMessage::AnswerRecorded {
                    is_correct,
                    points_earned: points,
                    correct_answer: Some("B".into()),
                });
                tokio::time::sleep(Duration::from_millis(500)).await;
                push(ServerMessage::QuestionEnded {
                    question_number: None,
                    standings: vec![alice.clone()],
                    correct_answer: Some("B".into()),
                });

                if answer.is_empty() {
                    let mut xp = BTreeMap::new();
                    xp.insert(alice.user_id.clone(), 140);
                    push(ServerMessage::GameEnded {
                        final_standings: vec![alice.clone()],
                        xp_awarded: xp,
                    });
                } else {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    push(ServerMessage::QuestionStarted(question(
                        2,
                        "What is H2O?",
                        &["Salt", "Water", "Air"],
                    )));
                }
            }
            ClientMessage::LeaveRoom { .. } | ClientMessage::SendMessage { .. } => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Play
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_server(server_rx, server_tx));

    let connector = LoopbackConnector {
        transport: Mutex::new(Some(LoopbackTransport {
            to_server: client_tx,
            from_server: client_rx,
        })),
    };
    let manager = Arc::new(ConnectionManager::new(
        connector,
        StaticToken(None),
        ClientConfig::new("loopback://"),
    ));
    let rooms = RoomController::new(Arc::clone(&manager));

    // Start the session before joining so the countdown that follows the join is seen.
    let conn = manager.connect().await?;
    let session = BattleSession::start(conn, "ABC123", BattleState::new(), manager.config());
    let mut phase = session.watch_phase();

    let joined = rooms.join_room("ABC123").await?;
    println!("joined {} with {} player(s)", joined.room_code, joined.players.len());

    let mut answered_first = false;
    while phase.changed().await.is_ok() {
        let current = *phase.borrow_and_update();
        let state = session.snapshot();
        match current {
            Phase::Countdown => println!("get ready: {}s", state.countdown().unwrap_or(0)),
            Phase::Question => {
                if let Some(q) = state.question() {
                    println!("Q{}: {} {:?}", q.question_number, q.text, q.options);
                }
                if !answered_first {
                    answered_first = true;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    match session.submit_answer("B").await {
                        Ok(Some(feedback)) => println!(
                            "answered B: correct={} +{}",
                            feedback.is_correct, feedback.points_earned
                        ),
                        Ok(None) => println!("already answered"),
                        Err(e) => println!("answer failed: {e}"),
                    }
                } else {
                    println!("(letting the timer run out)");
                }
            }
            Phase::Results => {
                let state = session.snapshot();
                if let Some(feedback) = state.feedback() {
                    println!(
                        "feedback: {}",
                        feedback.message.as_deref().unwrap_or("answer recorded")
                    );
                }
                for p in state.standings() {
                    println!("  {:<8} {:>5}", p.username, p.score);
                }
            }
            Phase::GameOver => {
                let xp = XpSummary::snap(900, state.xp_for("u1"));
                println!(
                    "game over: +{} XP, level {} ({:.0}% to next)",
                    xp.earned,
                    xp.level,
                    xp.progress() * 100.0
                );
                break;
            }
            Phase::Loading => {}
        }
    }

    session.stop();
    manager.disconnect().await;
    Ok(())
}
