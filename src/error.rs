//! Error types for the quiz battle client.

use thiserror::Error;

/// Errors that can occur when using the quiz battle client.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport reported an error while establishing the connection.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// No handshake completed within the connect deadline.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Neither `room_joined` nor `error` arrived before the join deadline.
    #[error("timed out waiting to join the room")]
    JoinTimeout,

    /// The server answered a join request with an error.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// Neither `answer_recorded` nor `error` arrived before the answer deadline.
    #[error("timed out waiting for the answer to be recorded")]
    AnswerTimeout,

    /// The server answered an answer submission with an error.
    #[error("answer rejected: {0}")]
    AnswerRejected(String),

    /// An inbound frame could not be decoded or lacked required fields.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires a live connection.
    #[error("not connected to server")]
    NotConnected,

    /// Caller-supplied input was rejected before reaching the wire.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The membership store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns `true` for the deadline-expiry variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout | Self::JoinTimeout | Self::AnswerTimeout
        )
    }
}

/// A specialized [`Result`] type for quiz battle client operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_variants_are_classified() {
        assert!(SessionError::ConnectionTimeout.is_timeout());
        assert!(SessionError::JoinTimeout.is_timeout());
        assert!(SessionError::AnswerTimeout.is_timeout());
        assert!(!SessionError::NotConnected.is_timeout());
        assert!(!SessionError::JoinRejected("full".into()).is_timeout());
    }

    #[test]
    fn rejection_message_is_displayed() {
        let err = SessionError::JoinRejected("Lobby is full".into());
        assert_eq!(err.to_string(), "join rejected: Lobby is full");
    }
}
