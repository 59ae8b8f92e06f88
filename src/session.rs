//! Async driver for one battle.
//!
//! [`BattleSession`] feeds battle events from the connection into a
//! [`BattleState`], runs the one-second local countdown for each question
//! and performs answer submissions as correlated requests. The countdown
//! does not depend on the connection: if the socket drops mid-question the
//! timer keeps running and the timeout submission degrades to "time's up".
//!
//! # Example
//!
//! ```rust,ignore
//! let session = BattleSession::start(conn, "ABC123", BattleState::new(), manager.config());
//! session.submit_answer("B").await?;
//! // back button
//! session.leave(&rooms, &mut lobby, || router.go_home());
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::battle::{AnswerResult, BattleState, Feedback, Phase, SubmitIntent, SubmitOrigin};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::event::EventKind;
use crate::fanout::{RoomEventHandlers, Subscription};
use crate::lobby::LobbySync;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::request::RequestOutcome;
use crate::room::RoomController;

const TICK: Duration = Duration::from_secs(1);

/// Events that drive the battle phase machine.
const BATTLE_EVENTS: [EventKind; 7] = [
    EventKind::CountdownStarted,
    EventKind::GameStarted,
    EventKind::QuestionStarted,
    EventKind::PlayerAnswered,
    EventKind::QuestionEnded,
    EventKind::ScoresUpdated,
    EventKind::GameEnded,
];

struct Shared {
    conn: Connection,
    room_code: String,
    state: Mutex<BattleState>,
    phase_tx: watch::Sender<Phase>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Held for the lifetime of one `submit_answer` request. Replies carry no
    /// correlation id, so only one submission may be awaiting a reply.
    submit_turn: tokio::sync::Mutex<()>,
    answer_timeout: Duration,
}

impl Shared {
    fn publish(&self, phase: Phase) {
        self.phase_tx.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    /// Send `intent` and record how it settled.
    async fn submit(&self, intent: SubmitIntent) -> Result<Option<Feedback>> {
        debug!(
            question = intent.question_number,
            origin = ?intent.origin,
            time_taken = intent.time_taken,
            "submitting answer"
        );
        let _turn = self.submit_turn.lock().await;
        let outcome = self
            .conn
            .request(
                ClientMessage::SubmitAnswer {
                    room_code: self.room_code.clone(),
                    answer: intent.answer.clone(),
                    time_taken: intent.time_taken,
                },
                EventKind::AnswerRecorded,
                self.answer_timeout,
            )
            .await;

        let (result, error) = match outcome {
            Ok(RequestOutcome::Replied(ServerMessage::AnswerRecorded {
                is_correct,
                points_earned,
                correct_answer,
            })) => (
                AnswerResult::Recorded {
                    is_correct,
                    points_earned,
                    correct_answer,
                },
                None,
            ),
            Ok(RequestOutcome::Replied(other)) => {
                let err = SessionError::ProtocolError(format!(
                    "expected answer_recorded, got {}",
                    other.kind()
                ));
                (AnswerResult::Failed(err.to_string()), Some(err))
            }
            Ok(RequestOutcome::Rejected(message)) => (
                AnswerResult::Failed(message.clone()),
                Some(SessionError::AnswerRejected(message)),
            ),
            Ok(RequestOutcome::TimedOut) => (
                AnswerResult::Failed("no answer_recorded in time".into()),
                Some(SessionError::AnswerTimeout),
            ),
            Err(e) => (AnswerResult::Failed(e.to_string()), Some(e)),
        };

        let feedback = self
            .state
            .lock()
            .record_result(intent.question_number, result, intent.origin);
        match error {
            Some(e) => Err(e),
            None => Ok(feedback),
        }
    }

    fn stop_ticker(&self) {
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
        }
    }
}

/// Start a fresh countdown for the current question, replacing any previous one.
fn restart_ticker(shared: &Arc<Shared>) {
    let Some(question_number) = shared.state.lock().question_number() else {
        return;
    };
    let task = tokio::spawn(run_ticker(Arc::clone(shared), question_number));
    if let Some(previous) = shared.ticker.lock().replace(task) {
        previous.abort();
    }
}

async fn run_ticker(shared: Arc<Shared>, question_number: u32) {
    let mut interval = interval_at(Instant::now() + TICK, TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let intent = {
            let mut state = shared.state.lock();
            if state.phase() != Phase::Question || state.question_number() != Some(question_number) {
                return;
            }
            let intent = state.tick();
            if intent.is_none() && state.time_left() == 0 {
                return;
            }
            intent
        };

        if let Some(intent) = intent {
            info!(question = question_number, "time's up; submitting empty answer");
            let shared = Arc::clone(&shared);
            // Detached so a new question's ticker cannot cancel the submission.
            tokio::spawn(async move {
                if let Err(e) = shared.submit(intent).await {
                    warn!("timeout submission failed: {e}");
                }
            });
            return;
        }
    }
}

fn on_battle_event(weak: &Weak<Shared>, msg: &ServerMessage) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let (changed, phase) = {
        let mut state = shared.state.lock();
        (state.handle_server(msg), state.phase())
    };
    if !changed {
        return;
    }
    shared.publish(phase);
    match (msg, phase) {
        (ServerMessage::QuestionStarted(_), Phase::Question) => restart_ticker(&shared),
        (_, Phase::GameOver) => shared.stop_ticker(),
        _ => {}
    }
}

/// One running battle bound to a connection and a room.
pub struct BattleSession {
    shared: Arc<Shared>,
    subscription: Mutex<Subscription>,
}

impl BattleSession {
    /// Subscribe to battle events on `conn` and, if `initial` is already in
    /// a question, start its countdown.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        conn: Connection,
        room_code: impl Into<String>,
        initial: BattleState,
        config: &ClientConfig,
    ) -> Self {
        let phase = initial.phase();
        let (phase_tx, _phase_rx) = watch::channel(phase);
        let shared = Arc::new(Shared {
            conn,
            room_code: room_code.into(),
            state: Mutex::new(initial),
            phase_tx,
            ticker: Mutex::new(None),
            submit_turn: tokio::sync::Mutex::new(()),
            answer_timeout: config.answer_timeout,
        });

        let weak = Arc::downgrade(&shared);
        let handlers = RoomEventHandlers::new()
            .on_each(&BATTLE_EVENTS, move |msg| on_battle_event(&weak, msg));
        let subscription = shared.conn.subscribe(handlers);

        if phase == Phase::Question {
            restart_ticker(&shared);
        }
        info!(room = %shared.room_code, ?phase, "battle session started");

        Self {
            shared,
            subscription: Mutex::new(subscription),
        }
    }

    pub fn room_code(&self) -> &str {
        &self.shared.room_code
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> BattleState {
        self.shared.state.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase()
    }

    /// Watch phase transitions.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase_tx.subscribe()
    }

    /// Submit `answer` for the current question.
    ///
    /// Returns `Ok(None)` without sending anything if the question is already
    /// answered (by the user or the timer) or no question is showing. On
    /// success the feedback is also stored in the state; the phase stays
    /// [`Phase::Question`] until the server ends the question.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AnswerTimeout`] if no `answer_recorded` arrives within
    ///   `answer_timeout`.
    /// - [`SessionError::AnswerRejected`] if the server replies with `error`.
    /// - [`SessionError::NotConnected`] if the connection is down.
    ///
    /// The answer stays locked in after a failure.
    pub async fn submit_answer(&self, answer: &str) -> Result<Option<Feedback>> {
        let Some(intent) = self.shared.state.lock().begin_submit(answer) else {
            return Ok(None);
        };
        self.shared.submit(intent).await
    }

    /// Leave the battle view: tell the server, forget the membership, then
    /// call `navigate`. `navigate` runs even if the leave could not be sent.
    pub fn leave<F>(&self, rooms: &RoomController, lobby: &mut LobbySync, navigate: F)
    where
        F: FnOnce(),
    {
        self.stop();
        rooms.leave_room(&self.shared.room_code);
        lobby.leave();
        navigate();
    }

    /// Detach from the connection and stop the countdown.
    pub fn stop(&self) {
        self.subscription.lock().unsubscribe();
        self.shared.stop_ticker();
    }
}

impl Drop for BattleSession {
    fn drop(&mut self) {
        self.shared.stop_ticker();
    }
}

impl std::fmt::Debug for BattleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleSession")
            .field("room_code", &self.shared.room_code)
            .field("phase", &self.phase())
            .finish()
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
    use crate::protocol::{Player, Question};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct ChannelTransport {
        incoming: mpsc::UnboundedReceiver<String>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), SessionError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
        async fn recv(&mut self) -> Option<std::result::Result<String, SessionError>> {
            self.incoming.recv().await.map(Ok)
        }
        async fn close(&mut self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    fn connection() -> (Connection, mpsc::UnboundedSender<String>, Arc<StdMutex<Vec<String>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let conn = Connection::from_transport(
            ChannelTransport {
                incoming: rx,
                sent: Arc::clone(&sent),
            },
            &ClientConfig::default(),
        );
        (conn, tx, sent)
    }

    fn question(number: u32, time_limit: u32) -> Question {
        Question {
            question_number: number,
            text: "2 + 2?".into(),
            options: vec!["3".into(), "4".into()],
            category: None,
            difficulty: None,
            time_limit,
        }
    }

    fn frame(msg: &ServerMessage) -> String {
        serde_json::to_string(msg).unwrap()
    }

    fn submissions(sent: &StdMutex<Vec<String>>) -> Vec<serde_json::Value> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str::<serde_json::Value>(s).unwrap())
            .filter(|v| v["event"] == "submit_answer")
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn question_started_event_starts_countdown() {
        let (conn, tx, sent) = connection();
        let session = BattleSession::start(conn.clone(), "ABC123", BattleState::new(), &ClientConfig::default());
        let mut phase = session.watch_phase();

        tx.send(frame(&ServerMessage::QuestionStarted(question(1, 3))))
            .unwrap();
        phase.wait_for(|p| *p == Phase::Question).await.unwrap();
        assert_eq!(session.snapshot().time_left(), 3);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(session.snapshot().time_left(), 1);
        assert!(submissions(&sent).is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let subs = submissions(&sent);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0]["data"]["answer"], "");
        assert_eq!(subs[0]["data"]["time_taken"], 3);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_answer_is_recorded_without_leaving_question() {
        let (conn, tx, sent) = connection();
        let session = BattleSession::start(
            conn.clone(),
            "ABC123",
            BattleState::with_question(question(1, 30), Some(5), vec![Player::new("u1", "Alice")]),
            &ClientConfig::default(),
        );

        let reply = async {
            while conn.registry().listener_count(EventKind::AnswerRecorded) == 0 {
                tokio::task::yield_now().await;
            }
            tx.send(frame(&ServerMessage::AnswerRecorded {
                is_correct: true,
                points_earned: 120,
                correct_answer: Some("B".into()),
            }))
            .unwrap();
        };
        let (feedback, ()) = tokio::join!(session.submit_answer("B"), reply);
        let feedback = feedback.unwrap().unwrap();
        assert!(feedback.is_correct);
        assert_eq!(session.phase(), Phase::Question);

        // Second submission is a no-op.
        assert_eq!(session.submit_answer("A").await.unwrap(), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(submissions(&sent).len(), 1);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_question_started_does_not_submit_again() {
        let (conn, tx, sent) = connection();
        let session = BattleSession::start(
            conn.clone(),
            "ABC123",
            BattleState::with_question(question(1, 5), None, vec![]),
            &ClientConfig::default(),
        );

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(submissions(&sent).len(), 1);

        tx.send(frame(&ServerMessage::QuestionStarted(question(1, 5))))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(submissions(&sent).len(), 1);
        assert!(session.snapshot().has_answered());
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_submission_waits_for_pending_timeout_submission() {
        let (conn, tx, sent) = connection();
        let session = BattleSession::start(
            conn.clone(),
            "ABC123",
            BattleState::with_question(question(1, 1), None, vec![]),
            &ClientConfig::default(),
        );

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(submissions(&sent).len(), 1);
        tx.send(frame(&ServerMessage::QuestionStarted(question(2, 30))))
            .unwrap();
        while session.snapshot().question_number() != Some(2) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let server = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            // The timeout submission for question 1 still owns the reply.
            assert_eq!(submissions(&sent).len(), 1);
            tx.send(frame(&ServerMessage::AnswerRecorded {
                is_correct: false,
                points_earned: 0,
                correct_answer: Some("A".into()),
            }))
            .unwrap();

            while submissions(&sent).len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            tx.send(frame(&ServerMessage::AnswerRecorded {
                is_correct: true,
                points_earned: 100,
                correct_answer: Some("B".into()),
            }))
            .unwrap();
        };
        let (feedback, ()) = tokio::join!(session.submit_answer("B"), server);

        let feedback = feedback.unwrap().unwrap();
        assert!(feedback.is_correct);
        assert_eq!(feedback.points_earned, 100);
        assert_eq!(submissions(&sent)[1]["data"]["answer"], "B");
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_reply_is_answer_timeout() {
        let (conn, _tx, _sent) = connection();
        let session = BattleSession::start(
            conn.clone(),
            "ABC123",
            BattleState::with_question(question(1, 30), None, vec![]),
            &ClientConfig::default(),
        );
        let err = session.submit_answer("A").await.unwrap_err();
        assert!(matches!(err, SessionError::AnswerTimeout));
        assert!(session.snapshot().has_answered());
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn game_ended_stops_countdown() {
        let (conn, tx, sent) = connection();
        let session = BattleSession::start(
            conn.clone(),
            "ABC123",
            BattleState::with_question(question(1, 5), None, vec![]),
            &ClientConfig::default(),
        );
        let mut phase = session.watch_phase();
        tx.send(frame(&ServerMessage::GameEnded {
            final_standings: vec![],
            xp_awarded: Default::default(),
        }))
        .unwrap();
        phase.wait_for(|p| *p == Phase::GameOver).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(submissions(&sent).is_empty());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn stop_detaches_battle_listeners() {
        let (conn, _tx, _sent) = connection();
        let session = BattleSession::start(conn.clone(), "ABC123", BattleState::new(), &ClientConfig::default());
        assert_eq!(conn.registry().listener_count(EventKind::QuestionStarted), 1);
        session.stop();
        assert_eq!(conn.registry().listener_count(EventKind::QuestionStarted), 0);
        conn.shutdown().await;
    }
}
