//! Battle phase machine.
//!
//! ```text
//! Loading ──countdown_started──▶ Countdown ──question_started──▶ Question
//!                                                   ▲               │
//!                                   question_started│               │question_ended
//!                                                   │               ▼
//!                                                   └─────────── Results
//!                                    game_ended (from any phase) ──▶ GameOver
//! ```
//!
//! [`BattleState`] is a plain value with no I/O. Server events go through
//! [`BattleState::handle_server`], the local countdown through
//! [`BattleState::tick`], and answer submissions through
//! [`BattleState::begin_submit`] / [`BattleState::record_result`]. The async
//! driver lives in [`crate::session`].
//!
//! The local timer and `question_ended` race. Whichever lands first wins:
//! a `question_ended` for a question already left is ignored, and once
//! `has_answered` is latched no second submission is produced.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::protocol::{Player, Question, ServerMessage, UserId};

/// Feedback text shown when the timer ran out and the result is unknown.
pub const TIMES_UP: &str = "Time's up!";

/// XP needed per level.
pub const XP_PER_LEVEL: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Countdown,
    Question,
    Results,
    GameOver,
}

/// Who triggered a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOrigin {
    User,
    /// The local countdown reached zero with no answer.
    Timeout,
}

/// An answer the driver should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitIntent {
    pub question_number: u32,
    /// Empty for a timeout submission.
    pub answer: String,
    /// Whole seconds elapsed since the question started.
    pub time_taken: u32,
    pub origin: SubmitOrigin,
}

/// How an answer submission settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerResult {
    Recorded {
        is_correct: bool,
        points_earned: i64,
        correct_answer: Option<String>,
    },
    Failed(String),
}

/// Locally-authoritative per-question feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub is_correct: bool,
    pub points_earned: i64,
    /// Letter of the correct option. Unknown after a failed timeout submission.
    pub correct_answer: Option<String>,
    pub message: Option<String>,
}

impl Feedback {
    fn times_up() -> Self {
        Self {
            is_correct: false,
            points_earned: 0,
            correct_answer: None,
            message: Some(TIMES_UP.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleState {
    phase: Phase,
    countdown: Option<u32>,
    total_questions: Option<u32>,
    question: Option<Question>,
    time_left: u32,
    selected_answer: Option<String>,
    has_answered: bool,
    feedback: Option<Feedback>,
    revealed_answer: Option<String>,
    answered: BTreeSet<UserId>,
    standings: Vec<Player>,
    xp_awarded: BTreeMap<UserId, u32>,
}

impl Default for BattleState {
    fn default() -> Self {
        Self::new()
    }
}

impl BattleState {
    /// A session waiting for its first server event.
    pub fn new() -> Self {
        Self {
            phase: Phase::Loading,
            countdown: None,
            total_questions: None,
            question: None,
            time_left: 0,
            selected_answer: None,
            has_answered: false,
            feedback: None,
            revealed_answer: None,
            answered: BTreeSet::new(),
            standings: Vec::new(),
            xp_awarded: BTreeMap::new(),
        }
    }

    /// A session that already holds its first question, e.g. handed over
    /// by the lobby view. Starts in [`Phase::Question`].
    pub fn with_question(question: Question, total_questions: Option<u32>, players: Vec<Player>) -> Self {
        let mut state = Self::new();
        state.total_questions = total_questions;
        state.standings = zeroed(players);
        state.start_question(question);
        state
    }

    /// Apply a server event. Returns `true` if the state changed.
    pub fn handle_server(&mut self, msg: &ServerMessage) -> bool {
        if self.phase == Phase::GameOver && !matches!(msg, ServerMessage::CountdownStarted { .. }) {
            trace!("game over; ignoring {}", msg.kind());
            return false;
        }

        match msg {
            ServerMessage::CountdownStarted { seconds, players } => {
                if self.phase == Phase::GameOver {
                    *self = Self::new();
                }
                self.phase = Phase::Countdown;
                self.countdown = Some(*seconds);
                if let Some(players) = players {
                    self.standings = zeroed(players.clone());
                }
                true
            }
            ServerMessage::GameStarted {
                total_questions,
                players,
            } => {
                self.total_questions = Some(*total_questions);
                if let Some(players) = players.as_ref().filter(|_| self.standings.is_empty()) {
                    self.standings = zeroed(players.clone());
                }
                true
            }
            ServerMessage::QuestionStarted(question) => {
                if self.phase == Phase::Question
                    && self.question_number() == Some(question.question_number)
                {
                    debug!(question = question.question_number, "question_started repeated; ignored");
                    return false;
                }
                self.start_question(question.clone());
                true
            }
            ServerMessage::PlayerAnswered { user_id, .. } => {
                self.phase == Phase::Question && self.answered.insert(user_id.clone())
            }
            ServerMessage::QuestionEnded {
                question_number,
                standings,
                correct_answer,
            } => {
                let current = self.question_number();
                let stale = self.phase != Phase::Question
                    || question_number.is_some_and(|n| Some(n) != current);
                if stale {
                    debug!(?question_number, ?current, "question_ended for a question already left");
                    return false;
                }
                self.phase = Phase::Results;
                self.revealed_answer = correct_answer.clone();
                if !standings.is_empty() {
                    self.standings = standings.clone();
                }
                true
            }
            ServerMessage::ScoresUpdated { standings } => {
                self.standings = standings.clone();
                true
            }
            ServerMessage::GameEnded {
                final_standings,
                xp_awarded,
            } => {
                self.phase = Phase::GameOver;
                self.standings = final_standings.clone();
                self.xp_awarded = xp_awarded.clone();
                self.time_left = 0;
                true
            }
            _ => false,
        }
    }

    /// Advance the local countdown by one second.
    ///
    /// Returns a timeout submission when the countdown reaches zero with no
    /// answer given. Latches `has_answered`, so it fires at most once per
    /// question. A question with no time at all times out on its first tick.
    pub fn tick(&mut self) -> Option<SubmitIntent> {
        if self.phase != Phase::Question {
            return None;
        }
        self.time_left = self.time_left.saturating_sub(1);
        if self.time_left > 0 || self.has_answered {
            return None;
        }
        self.latch(String::new(), SubmitOrigin::Timeout)
    }

    /// Lock in `answer`. `None` if not in a question or already answered.
    pub fn begin_submit(&mut self, answer: &str) -> Option<SubmitIntent> {
        if self.phase != Phase::Question || self.has_answered {
            trace!("submission ignored; already answered or not in a question");
            return None;
        }
        self.latch(answer.to_string(), SubmitOrigin::User)
    }

    /// Record how a submission for `question_number` settled.
    ///
    /// Stays in [`Phase::Question`]. Results for a question already left are
    /// dropped. A failed timeout submission yields generic "time's up"
    /// feedback; a failed user submission leaves feedback untouched and the
    /// answer locked. Returns the feedback that was applied.
    pub fn record_result(
        &mut self,
        question_number: u32,
        result: AnswerResult,
        origin: SubmitOrigin,
    ) -> Option<Feedback> {
        if self.phase != Phase::Question || self.question_number() != Some(question_number) {
            debug!(question_number, "answer result for a question already left; dropped");
            return None;
        }
        let feedback = match (result, origin) {
            (
                AnswerResult::Recorded {
                    is_correct,
                    points_earned,
                    correct_answer,
                },
                _,
            ) => Feedback {
                is_correct,
                points_earned,
                correct_answer,
                message: None,
            },
            (AnswerResult::Failed(reason), SubmitOrigin::Timeout) => {
                debug!("timeout submission failed ({reason}); showing time's up");
                Feedback::times_up()
            }
            (AnswerResult::Failed(reason), SubmitOrigin::User) => {
                debug!("answer submission failed: {reason}");
                return None;
            }
        };
        self.feedback = Some(feedback.clone());
        Some(feedback)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Seconds announced by the last `countdown_started`.
    pub fn countdown(&self) -> Option<u32> {
        self.countdown
    }

    pub fn total_questions(&self) -> Option<u32> {
        self.total_questions
    }

    pub fn question(&self) -> Option<&Question> {
        self.question.as_ref()
    }

    pub fn question_number(&self) -> Option<u32> {
        self.question.as_ref().map(|q| q.question_number)
    }

    /// Seconds left on the local countdown.
    pub fn time_left(&self) -> u32 {
        self.time_left
    }

    pub fn selected_answer(&self) -> Option<&str> {
        self.selected_answer.as_deref()
    }

    pub fn has_answered(&self) -> bool {
        self.has_answered
    }

    pub fn feedback(&self) -> Option<&Feedback> {
        self.feedback.as_ref()
    }

    /// Correct answer revealed by `question_ended`.
    pub fn revealed_answer(&self) -> Option<&str> {
        self.revealed_answer.as_deref()
    }

    /// Players who answered the current question.
    pub fn answered(&self) -> &BTreeSet<UserId> {
        &self.answered
    }

    pub fn standings(&self) -> &[Player] {
        &self.standings
    }

    pub fn xp_awarded(&self) -> &BTreeMap<UserId, u32> {
        &self.xp_awarded
    }

    /// XP awarded to `user_id` this game, zero if none.
    pub fn xp_for(&self, user_id: &str) -> u32 {
        self.xp_awarded.get(user_id).copied().unwrap_or(0)
    }

    fn start_question(&mut self, question: Question) {
        debug!(
            question = question.question_number,
            time_limit = question.time_limit,
            "question started"
        );
        self.phase = Phase::Question;
        self.time_left = question.time_limit;
        self.selected_answer = None;
        self.has_answered = false;
        self.feedback = None;
        self.revealed_answer = None;
        self.answered.clear();
        self.question = Some(question);
    }

    fn latch(&mut self, answer: String, origin: SubmitOrigin) -> Option<SubmitIntent> {
        let question = self.question.as_ref()?;
        self.has_answered = true;
        self.selected_answer = Some(answer.clone());
        Some(SubmitIntent {
            question_number: question.question_number,
            answer,
            time_taken: question.time_limit.saturating_sub(self.time_left),
            origin,
        })
    }
}

fn zeroed(players: Vec<Player>) -> Vec<Player> {
    players
        .into_iter()
        .map(|p| Player {
            score: 0,
            correct_answers: 0,
            ..p
        })
        .collect()
}

/// End-of-game XP display, at its final value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpSummary {
    pub previous_xp: u64,
    pub earned: u32,
    pub total_xp: u64,
    pub level: u32,
    /// XP accumulated inside the current level.
    pub xp_into_level: u64,
    pub leveled_up: bool,
}

impl XpSummary {
    /// Jump straight to the result of adding `earned` to `previous_xp`.
    pub fn snap(previous_xp: u64, earned: u32) -> Self {
        let total_xp = previous_xp.saturating_add(u64::from(earned));
        let level = level_for(total_xp);
        Self {
            previous_xp,
            earned,
            total_xp,
            level,
            xp_into_level: total_xp % XP_PER_LEVEL,
            leveled_up: level > level_for(previous_xp),
        }
    }

    /// Fraction of the current level filled, in `0.0..1.0`.
    pub fn progress(&self) -> f64 {
        self.xp_into_level as f64 / XP_PER_LEVEL as f64
    }
}

/// Levels start at 1.
fn level_for(xp: u64) -> u32 {
    u32::try_from(xp / XP_PER_LEVEL)
        .unwrap_or(u32::MAX)
        .saturating_add(1)
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

    fn question(number: u32, time_limit: u32) -> Question {
        Question {
            question_number: number,
            text: "Capital of France?".into(),
            options: vec!["Berlin".into(), "Paris".into(), "Rome".into()],
            category: None,
            difficulty: None,
            time_limit,
        }
    }

    fn ended(number: u32) -> ServerMessage {
        ServerMessage::QuestionEnded {
            question_number: Some(number),
            standings: vec![],
            correct_answer: Some("B".into()),
        }
    }

    #[test]
    fn countdown_seeds_zero_score_standings_and_game_started_waits() {
        let mut state = BattleState::new();
        let mut alice = Player::new("u1", "Alice");
        alice.score = 99;
        state.handle_server(&ServerMessage::CountdownStarted {
            seconds: 5,
            players: Some(vec![alice]),
        });
        assert_eq!(state.phase(), Phase::Countdown);
        assert_eq!(state.standings()[0].username, "Alice");
        assert_eq!(state.standings()[0].score, 0);

        state.handle_server(&ServerMessage::GameStarted {
            total_questions: 10,
            players: None,
        });
        assert_eq!(state.phase(), Phase::Countdown);
        assert_eq!(state.total_questions(), Some(10));
    }

    #[test]
    fn question_started_resets_per_question_fields() {
        let mut state = BattleState::with_question(question(1, 30), Some(2), vec![]);
        state.begin_submit("A").unwrap();
        state.record_result(
            1,
            AnswerResult::Recorded {
                is_correct: false,
                points_earned: 0,
                correct_answer: Some("B".into()),
            },
            SubmitOrigin::User,
        );
        state.handle_server(&ended(1));
        state.handle_server(&ServerMessage::QuestionStarted(question(2, 20)));

        assert_eq!(state.phase(), Phase::Question);
        assert_eq!(state.time_left(), 20);
        assert!(!state.has_answered());
        assert!(state.feedback().is_none());
        assert!(state.selected_answer().is_none());
        assert!(state.revealed_answer().is_none());
    }

    #[test]
    fn timer_fires_one_empty_submission_at_zero() {
        let mut state = BattleState::with_question(question(1, 3), None, vec![]);
        assert!(state.tick().is_none());
        assert!(state.tick().is_none());
        let intent = state.tick().unwrap();
        assert_eq!(intent.answer, "");
        assert_eq!(intent.time_taken, 3);
        assert_eq!(intent.origin, SubmitOrigin::Timeout);
        assert!(state.tick().is_none());
        assert!(state.begin_submit("B").is_none());
    }

    #[test]
    fn user_submission_wins_over_timer() {
        let mut state = BattleState::with_question(question(1, 2), None, vec![]);
        state.tick();
        let intent = state.begin_submit("B").unwrap();
        assert_eq!(intent.time_taken, 1);
        assert!(state.begin_submit("C").is_none());
        assert!(state.tick().is_none());
        assert_eq!(state.time_left(), 0);
        assert_eq!(state.selected_answer(), Some("B"));
    }

    #[test]
    fn zero_time_limit_times_out_on_first_tick() {
        let mut state = BattleState::with_question(question(1, 0), None, vec![]);
        assert_eq!(state.time_left(), 0);
        let intent = state.tick().unwrap();
        assert_eq!(intent.origin, SubmitOrigin::Timeout);
        assert_eq!(intent.time_taken, 0);
        assert!(state.tick().is_none());
    }

    #[test]
    fn repeated_question_started_keeps_the_latch() {
        let mut state = BattleState::with_question(question(1, 5), None, vec![]);
        state.tick();
        state.begin_submit("B").unwrap();
        state.record_result(
            1,
            AnswerResult::Recorded {
                is_correct: true,
                points_earned: 100,
                correct_answer: Some("B".into()),
            },
            SubmitOrigin::User,
        );

        assert!(!state.handle_server(&ServerMessage::QuestionStarted(question(1, 5))));
        assert!(state.has_answered());
        assert_eq!(state.time_left(), 4);
        assert!(state.feedback().is_some());
        assert!(state.begin_submit("C").is_none());
    }

    #[test]
    fn recorded_result_stays_in_question() {
        let mut state = BattleState::with_question(question(1, 30), None, vec![]);
        state.begin_submit("B");
        let feedback = state
            .record_result(
                1,
                AnswerResult::Recorded {
                    is_correct: true,
                    points_earned: 120,
                    correct_answer: Some("B".into()),
                },
                SubmitOrigin::User,
            )
            .unwrap();
        assert!(feedback.is_correct);
        assert_eq!(feedback.points_earned, 120);
        assert_eq!(state.phase(), Phase::Question);

        assert!(state.handle_server(&ended(1)));
        assert_eq!(state.phase(), Phase::Results);
        assert_eq!(state.revealed_answer(), Some("B"));
    }

    #[test]
    fn failed_timeout_submission_shows_times_up() {
        let mut state = BattleState::with_question(question(1, 1), None, vec![]);
        let intent = state.tick().unwrap();
        let feedback = state
            .record_result(
                intent.question_number,
                AnswerResult::Failed("not connected".into()),
                intent.origin,
            )
            .unwrap();
        assert_eq!(feedback.message.as_deref(), Some(TIMES_UP));
        assert!(feedback.correct_answer.is_none());
    }

    #[test]
    fn failed_user_submission_keeps_latch_without_feedback() {
        let mut state = BattleState::with_question(question(1, 30), None, vec![]);
        state.begin_submit("A");
        assert!(state
            .record_result(1, AnswerResult::Failed("timed out".into()), SubmitOrigin::User)
            .is_none());
        assert!(state.has_answered());
        assert!(state.feedback().is_none());
    }

    #[test]
    fn stale_question_ended_and_results_are_ignored() {
        let mut state = BattleState::with_question(question(1, 30), None, vec![]);
        state.handle_server(&ended(1));
        assert!(!state.handle_server(&ended(1)));

        state.handle_server(&ServerMessage::QuestionStarted(question(2, 30)));
        assert!(!state.handle_server(&ended(1)));
        assert_eq!(state.phase(), Phase::Question);
        assert!(state
            .record_result(
                1,
                AnswerResult::Recorded {
                    is_correct: true,
                    points_earned: 50,
                    correct_answer: None,
                },
                SubmitOrigin::User,
            )
            .is_none());
    }

    #[test]
    fn game_over_is_terminal_until_a_new_countdown() {
        let mut state = BattleState::with_question(question(3, 30), None, vec![]);
        let mut xp = BTreeMap::new();
        xp.insert("u1".to_string(), 150);
        state.handle_server(&ServerMessage::GameEnded {
            final_standings: vec![Player::new("u1", "Alice")],
            xp_awarded: xp,
        });
        assert_eq!(state.phase(), Phase::GameOver);
        assert_eq!(state.xp_for("u1"), 150);
        assert_eq!(state.xp_for("nobody"), 0);

        assert!(!state.handle_server(&ServerMessage::QuestionStarted(question(4, 30))));
        assert!(state.tick().is_none());

        state.handle_server(&ServerMessage::CountdownStarted {
            seconds: 3,
            players: None,
        });
        assert_eq!(state.phase(), Phase::Countdown);
        assert!(state.xp_awarded().is_empty());
    }

    #[test]
    fn player_answered_tracked_per_question() {
        let mut state = BattleState::with_question(question(1, 30), None, vec![]);
        let answered = ServerMessage::PlayerAnswered {
            user_id: "u2".into(),
            username: None,
        };
        assert!(state.handle_server(&answered));
        assert!(!state.handle_server(&answered));
        state.handle_server(&ServerMessage::QuestionStarted(question(2, 30)));
        assert!(state.answered().is_empty());
    }

    #[test]
    fn xp_snaps_to_final_value() {
        let xp = XpSummary::snap(950, 100);
        assert_eq!(xp.total_xp, 1050);
        assert_eq!(xp.level, 2);
        assert_eq!(xp.xp_into_level, 50);
        assert!(xp.leveled_up);

        let same = XpSummary::snap(0, 10);
        assert_eq!(same.level, 1);
        assert!(!same.leveled_up);
        assert!((same.progress() - 0.01).abs() < f64::EPSILON);
    }
}
