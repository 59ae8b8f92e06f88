//! # Quiz Battle Client
//!
//! Transport-agnostic Rust client for real-time quiz battle lobbies.
//!
//! The crate keeps one socket connection per process and layers lobby and
//! battle synchronization on top of it. Every frame is a JSON text message
//! of the form `{"event": "...", "data": {...}}`.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in**: the default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **Correlated requests**: joins and answer submissions resolve exactly once, or time out
//! - **Server-authoritative lobby**: [`LobbySync`] reconciles snapshots through one reducer
//! - **Local countdown**: [`BattleSession`] keeps ticking through connection loss
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quiz_battle_client::{
//!     ClientConfig, ConnectionManager, EventKind, RoomController, RoomEventHandlers,
//!     StaticToken, WebSocketConnector,
//! };
//!
//! let config = ClientConfig::from_env();
//! let manager = Arc::new(ConnectionManager::new(
//!     WebSocketConnector::new(&config.url),
//!     StaticToken(Some(jwt)),
//!     config,
//! ));
//! let rooms = RoomController::new(Arc::clone(&manager));
//!
//! let joined = rooms.join_room("ABC123").await?;
//! let _sub = rooms.subscribe_room_events(
//!     RoomEventHandlers::new().on(EventKind::NewMessage, |msg| println!("{msg:?}")),
//! );
//! rooms.send_message("ABC123", "hi")?;
//! ```

pub mod battle;
pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod fanout;
pub mod lobby;
pub mod manager;
pub mod protocol;
pub mod request;
pub mod room;
pub mod session;
pub mod store;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use battle::{BattleState, Feedback, Phase, XpSummary};
pub use chat::ChatLog;
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionStatus};
pub use error::{Result, SessionError};
pub use event::EventKind;
pub use fanout::{RoomEventHandlers, Subscription};
pub use lobby::{LobbySync, LobbyUpdate};
pub use manager::ConnectionManager;
pub use protocol::{ClientMessage, ServerMessage};
pub use request::RequestOutcome;
pub use room::{RoomCode, RoomController};
pub use session::BattleSession;
pub use store::{JsonFileStore, MembershipStore, MemoryStore};
pub use transport::{Connector, Credentials, StaticToken, TokenSource, Transport};
pub use transports::FallbackConnector;

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
