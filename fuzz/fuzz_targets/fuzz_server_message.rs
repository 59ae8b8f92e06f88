#![no_main]

use libfuzzer_sys::fuzz_target;
use quiz_battle_client::protocol::ServerMessage;
use quiz_battle_client::{BattleState, ChatLog, LobbySync, MemoryStore};
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = serde_json::from_slice::<ServerMessage>(data) else {
        return;
    };

    // Any decodable event must be safe to feed to every reducer.
    let _ = msg.kind();
    let mut battle = BattleState::new();
    battle.handle_server(&msg);
    let _ = battle.tick();

    let mut lobby = LobbySync::new("fuzz-user", Arc::new(MemoryStore::new()));
    lobby.enter("ABC123", None);
    lobby.apply_server(&msg);
    let _ = (lobby.is_host(), lobby.all_ready(), lobby.ready_count());

    let mut chat = ChatLog::default();
    chat.ingest_server(&msg);
    chat.ingest_server(&msg);
});
