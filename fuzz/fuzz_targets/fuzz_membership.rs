#![no_main]

use libfuzzer_sys::fuzz_target;
use quiz_battle_client::{LobbySync, MemoryStore};
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    // Stored membership is untrusted input on restore.
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let store = Arc::new(MemoryStore::new());
    store.set_raw(raw);
    let lobby = LobbySync::restore("fuzz-user", store);
    let _ = (lobby.room_code(), lobby.needs_reconcile(), lobby.players().len());
});
