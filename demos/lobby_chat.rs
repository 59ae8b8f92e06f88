//! # Lobby Chat Example
//!
//! Demonstrates the lobby side of a quiz battle client:
//!
//! 1. Connect over WebSocket with a bearer token
//! 2. Join a lobby by its 6-character code
//! 3. Mirror the lobby snapshot and chat log from server events
//! 4. Send a chat message (it appears once the server echoes it back)
//! 5. Leave and disconnect on Ctrl+C
//!
//! ## Running
//!
//! ```sh
//! # Start a quiz battle server on localhost:5000, then:
//! QUIZ_BATTLE_TOKEN=<jwt> cargo run --example lobby_chat -- ABC123
//!
//! # Override the server URL:
//! QUIZ_BATTLE_URL=ws://my-server:5000/socket cargo run --example lobby_chat -- ABC123
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use quiz_battle_client::{
    ChatLog, ClientConfig, ConnectionManager, EventKind, JsonFileStore, LobbySync, RoomController,
    RoomEventHandlers, ServerMessage, WebSocketConnector,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let room_code = std::env::args().nth(1).unwrap_or_else(|| "ABC123".to_string());
    let user_id = std::env::var("QUIZ_BATTLE_USER").unwrap_or_else(|_| "demo-user".to_string());
    let config = ClientConfig::from_env();
    tracing::info!("Connecting to {}", config.url);

    // The token is read on every dial, so a refreshed token is picked up on reconnect.
    let tokens = || std::env::var("QUIZ_BATTLE_TOKEN").ok();
    let manager = Arc::new(ConnectionManager::new(
        WebSocketConnector::new(&config.url),
        tokens,
        config.clone(),
    ));
    let rooms = RoomController::new(Arc::clone(&manager));

    // ── Join ────────────────────────────────────────────────────────
    let joined = rooms.join_room(&room_code).await?;
    tracing::info!(
        "Joined {} ({} player(s) present)",
        joined.room_code,
        joined.players.len()
    );

    let store = Arc::new(JsonFileStore::new(std::env::temp_dir().join("quiz-battle")));
    let lobby = Arc::new(Mutex::new(LobbySync::restore(user_id, store)));
    let chat = Arc::new(Mutex::new(ChatLog::new(config.chat_dedup_window)));
    {
        let mut chat = chat.lock();
        chat.enter_room(&joined.room_code);
        chat.hydrate(joined.chat_history.clone());
    }
    lobby
        .lock()
        .apply_server(&ServerMessage::RoomJoined(joined.clone()));

    // ── Subscribe ───────────────────────────────────────────────────
    let lobby_in_handler = Arc::clone(&lobby);
    let chat_in_handler = Arc::clone(&chat);
    let _subscription = rooms.subscribe_room_events(RoomEventHandlers::new().on_each(
        &EventKind::ROOM_EVENTS,
        move |msg| {
            let mut lobby = lobby_in_handler.lock();
            if lobby.apply_server(msg) {
                tracing::info!(
                    "Lobby: {} player(s), {} ready, host={}",
                    lobby.players().len(),
                    lobby.ready_count(),
                    lobby.is_host()
                );
            }
            let mut chat = chat_in_handler.lock();
            if chat.ingest_server(msg) {
                if let Some(entry) = chat.messages().last() {
                    match entry.username() {
                        Some(who) => tracing::info!("<{who}> {}", entry.message()),
                        None => tracing::info!("* {}", entry.message()),
                    }
                }
            }
            if let ServerMessage::CountdownStarted { seconds, .. } = msg {
                tracing::info!("Game starting in {seconds}s");
            }
        },
    ));

    rooms.send_message(&joined.room_code, "hello from Rust!")?;

    // ── Wait for Ctrl+C ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, leaving…");

    // ── Cleanup ─────────────────────────────────────────────────────
    rooms.leave_room(&joined.room_code);
    lobby.lock().leave();
    manager.disconnect().await;
    tracing::info!("Goodbye!");
    Ok(())
}
