//! Transport implementations for the quiz battle socket.
//!
//! | Feature                | Items                                        |
//! |------------------------|----------------------------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`], [`WebSocketConnector`] |
//! | always                 | [`FallbackConnector`]                        |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), quiz_battle_client::SessionError> {
//! use quiz_battle_client::transport::{Connector, Credentials};
//! use quiz_battle_client::WebSocketConnector;
//!
//! let connector = WebSocketConnector::new("ws://localhost:5000/socket");
//! let mut transport = connector.connect(&Credentials::new(Some("jwt".into()))).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod fallback;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use fallback::FallbackConnector;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
