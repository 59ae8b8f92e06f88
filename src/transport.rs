//! Transport abstraction for the quiz battle socket.
//!
//! The [`Transport`] trait defines a bidirectional text message channel
//! between the client and server; every frame is one JSON text message.
//!
//! # Connection Setup
//!
//! Dialling is split out into the [`Connector`] trait so the connection
//! manager can re-dial after a drop. A connector receives the current
//! [`Credentials`] on every attempt and returns a ready [`Transport`].
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use quiz_battle_client::error::SessionError;
//! use quiz_battle_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), SessionError> {
//!         // Send the JSON text frame over your transport
//!         Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SessionError>> {
//!         // Return None when the connection is closed cleanly
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SessionError> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SessionError;

/// A bidirectional text message transport.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is
/// used inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), SessionError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, SessionError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), SessionError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        (**self).close().await
    }
}

/// Credentials attached to every dial attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token, if the user is logged in.
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Credentials without a token.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Dials a fresh [`Transport`].
///
/// Implementations must attach the token both as a connection-level
/// credential and as a query-string fallback where the medium allows it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectionError`] (or an I/O error) if the
    /// endpoint cannot be reached or refuses the handshake.
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, SessionError>;
}

/// Source of the current auth token, read at every connect attempt.
pub trait TokenSource: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

/// A fixed token.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_token_source_is_read_each_time() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let counter = std::sync::Arc::clone(&calls);
        let source = move || {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            Some(format!("tok-{n}"))
        };
        assert_eq!(source.token().as_deref(), Some("tok-0"));
        assert_eq!(source.token().as_deref(), Some("tok-1"));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn static_token_source() {
        assert_eq!(StaticToken(Some("abc".into())).token().as_deref(), Some("abc"));
        assert_eq!(StaticToken::default().token(), None);
    }

    #[test]
    fn boxed_transport_is_object_safe() {
        fn assert_transport<T: Transport>() {}
        assert_transport::<Box<dyn Transport>>();
    }
}
