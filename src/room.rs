//! Room membership: join, leave, chat and room-event subscription.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::event::EventKind;
use crate::fanout::{RoomEventHandlers, Subscription};
use crate::manager::ConnectionManager;
use crate::protocol::{ClientMessage, RoomJoinedPayload, ServerMessage};
use crate::request::RequestOutcome;

/// Length of a lobby code.
pub const ROOM_CODE_LEN: usize = 6;

/// A validated lobby code: six ASCII alphanumerics, upper-cased.
///
/// ```
/// use quiz_battle_client::RoomCode;
///
/// let code: RoomCode = " abc123 ".parse().unwrap();
/// assert_eq!(code.as_str(), "ABC123");
/// assert!("ABC-12".parse::<RoomCode>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// # Errors
    ///
    /// [`SessionError::InvalidInput`] unless `raw` trims to six ASCII
    /// alphanumerics.
    pub fn parse(raw: &str) -> Result<Self> {
        let code = raw.trim();
        if code.len() != ROOM_CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SessionError::InvalidInput(format!(
                "room code must be {ROOM_CODE_LEN} letters or digits, got {raw:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Joins and leaves rooms over the shared connection.
///
/// Joining suspends until the server acknowledges or rejects the join.
/// Leaving and chatting are fire-and-forget: transport failures are logged
/// and never surface to the caller.
#[derive(Debug, Clone)]
pub struct RoomController {
    manager: Arc<ConnectionManager>,
}

impl RoomController {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Join `code`, connecting first if needed.
    ///
    /// Resolves with the server's acknowledgement, which may carry recent
    /// chat history.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidInput`] for a malformed code.
    /// - Connection errors from [`ConnectionManager::connect`].
    /// - [`SessionError::JoinTimeout`] if neither `room_joined` nor `error`
    ///   arrives within `join_timeout`.
    /// - [`SessionError::JoinRejected`] if `error` arrives first.
    pub async fn join_room(&self, code: &str) -> Result<RoomJoinedPayload> {
        let code = RoomCode::parse(code)?;
        let conn = self.manager.connect().await?;
        let timeout = self.manager.config().join_timeout;

        info!(room = %code, "joining room");
        let outcome = conn
            .request(
                ClientMessage::JoinRoom {
                    room_code: code.to_string(),
                },
                EventKind::RoomJoined,
                timeout,
            )
            .await?;

        match outcome {
            RequestOutcome::Replied(ServerMessage::RoomJoined(payload)) => {
                info!(room = %payload.room_code, players = payload.players.len(), "joined room");
                Ok(payload)
            }
            RequestOutcome::Replied(other) => Err(SessionError::ProtocolError(format!(
                "expected room_joined, got {}",
                other.kind()
            ))),
            RequestOutcome::Rejected(message) => {
                warn!(room = %code, "join rejected: {message}");
                Err(SessionError::JoinRejected(message))
            }
            RequestOutcome::TimedOut => {
                warn!(room = %code, "join timed out after {timeout:?}");
                Err(SessionError::JoinTimeout)
            }
        }
    }

    /// Tell the server the room is left. Best-effort.
    pub fn leave_room(&self, code: &str) {
        self.fire(ClientMessage::LeaveRoom {
            room_code: code.trim().to_ascii_uppercase(),
        });
    }

    /// Send a chat message to `code`.
    ///
    /// The message is not added to any local chat log; it appears once the
    /// server broadcasts it back.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidInput`] if the code is malformed or the
    /// trimmed text is empty or longer than `max_message_chars`. Transport
    /// failures are only logged.
    pub fn send_message(&self, code: &str, text: &str) -> Result<()> {
        let code = RoomCode::parse(code)?;
        let message = validate_message(text, self.manager.config().max_message_chars)?;
        self.fire(ClientMessage::SendMessage {
            room_code: code.to_string(),
            message,
        });
        Ok(())
    }

    /// Attach `handlers` to the live connection.
    ///
    /// Without a connection this attaches nothing and returns
    /// [`Subscription::noop`].
    pub fn subscribe_room_events(&self, handlers: RoomEventHandlers) -> Subscription {
        match self.manager.connection() {
            Some(conn) => conn.subscribe(handlers),
            None => {
                warn!(
                    handlers = handlers.len(),
                    "subscribe_room_events called before connect; nothing attached"
                );
                Subscription::noop()
            }
        }
    }

    fn fire(&self, message: ClientMessage) {
        let Some(conn) = self.manager.connection() else {
            debug!("not connected; dropping {message:?}");
            return;
        };
        if let Err(e) = conn.emit(message) {
            warn!("fire-and-forget emit failed: {e}");
        }
    }
}

/// Trim `text` and enforce the chat length cap.
fn validate_message(text: &str, max_chars: usize) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidInput("message is empty".into()));
    }
    let chars = trimmed.chars().count();
    if chars > max_chars {
        return Err(SessionError::InvalidInput(format!(
            "message is {chars} characters, limit is {max_chars}"
        )));
    }
    Ok(trimmed.to_string())
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
    fn room_codes_are_normalised() {
        assert_eq!(RoomCode::parse("abc123").unwrap().as_str(), "ABC123");
        assert!(RoomCode::parse("ABC12").is_err());
        assert!(RoomCode::parse("ABC1234").is_err());
        assert!(RoomCode::parse("ABC 12").is_err());
        assert!(RoomCode::parse("ÄBC123").is_err());
    }

    #[test]
    fn message_cap_counts_characters() {
        assert_eq!(validate_message("  hi  ", 200).unwrap(), "hi");
        assert!(validate_message("   ", 200).is_err());
        assert!(validate_message(&"é".repeat(200), 200).is_ok());
        assert!(matches!(
            validate_message(&"x".repeat(201), 200),
            Err(SessionError::InvalidInput(_))
        ));
    }
}
