//! Durable "currently in this room" membership.
//!
//! The stored value is opaque JSON under a fixed key. It is a hint for
//! restoring the lobby view after navigation or a restart, never an
//! authoritative snapshot.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::protocol::RoomSnapshot;

/// Fixed key the membership is stored under.
pub const MEMBERSHIP_KEY: &str = "current_lobby";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMembership {
    pub room_code: String,
    #[serde(default)]
    pub snapshot: Option<RoomSnapshot>,
    pub joined_at: DateTime<Utc>,
}

/// Storage backend for [`PersistedMembership`].
pub trait MembershipStore: Send + Sync {
    /// Read the stored membership, if any.
    ///
    /// # Errors
    ///
    /// [`SessionError::Storage`] if the stored value cannot be read or decoded.
    fn load(&self) -> Result<Option<PersistedMembership>>;

    fn save(&self, membership: &PersistedMembership) -> Result<()>;

    /// Remove the stored membership. Clearing an empty store succeeds.
    fn clear(&self) -> Result<()>;
}

/// Keeps the membership in memory, serialized the same way as on disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    value: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw stored JSON.
    pub fn raw(&self) -> Option<String> {
        self.value.lock().clone()
    }

    /// Replace the raw stored JSON, e.g. to simulate a corrupted entry.
    pub fn set_raw(&self, raw: impl Into<String>) {
        *self.value.lock() = Some(raw.into());
    }
}

impl MembershipStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedMembership>> {
        self.value
            .lock()
            .as_deref()
            .map(decode)
            .transpose()
    }

    fn save(&self, membership: &PersistedMembership) -> Result<()> {
        *self.value.lock() = Some(serde_json::to_string(membership)?);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.value.lock() = None;
        Ok(())
    }
}

/// Stores the membership as `<dir>/current_lobby.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{MEMBERSHIP_KEY}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MembershipStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedMembership>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => decode(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::Storage(format!(
                "{}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, membership: &PersistedMembership) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(membership)?;
        // Readers only ever see a complete file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), room = %membership.room_code, "membership saved");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn decode(raw: &str) -> Result<PersistedMembership> {
    serde_json::from_str(raw).map_err(|e| SessionError::Storage(format!("corrupt membership: {e}")))
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
    use crate::protocol::{Player, RoomSettings};

    fn membership() -> PersistedMembership {
        PersistedMembership {
            room_code: "ABC123".into(),
            snapshot: Some(RoomSnapshot {
                room_code: "ABC123".into(),
                creator_id: "u1".into(),
                players: vec![Player::new("u1", "Alice")],
                settings: RoomSettings::default(),
            }),
            joined_at: Utc::now(),
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("quiz-battle-store-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn memory_store_save_load_clear() {
        let store = MemoryStore::new();
        assert_eq!(store.load().unwrap(), None);
        let m = membership();
        store.save(&m).unwrap();
        assert_eq!(store.load().unwrap(), Some(m));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn corrupt_entry_is_a_storage_error() {
        let store = MemoryStore::new();
        store.set_raw("{not json");
        assert!(matches!(store.load(), Err(SessionError::Storage(_))));
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = scratch_dir();
        let m = membership();
        JsonFileStore::new(&dir).save(&m).unwrap();

        let reopened = JsonFileStore::new(&dir);
        assert!(reopened.path().ends_with("current_lobby.json"));
        assert_eq!(reopened.load().unwrap(), Some(m));

        reopened.clear().unwrap();
        reopened.clear().unwrap();
        assert_eq!(reopened.load().unwrap(), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let store = JsonFileStore::new(scratch_dir());
        assert_eq!(store.load().unwrap(), None);
    }
}
