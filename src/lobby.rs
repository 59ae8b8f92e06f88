//! Server-authoritative view of the pre-game lobby.
//!
//! Every inbound change is first turned into a [`LobbyUpdate`] and then fed
//! through the single reducer [`LobbySync::apply`]. The reconciliation rules
//! live there and nowhere else:
//!
//! - [`LobbyUpdate::Snapshot`] replaces the whole room view **except** its
//!   settings, so a routine snapshot racing a settings change cannot roll the
//!   settings back.
//! - [`LobbyUpdate::Settings`] replaces the whole room view, settings included.
//! - Snapshots for a room other than the current one are ignored.
//!
//! Every change is written through to a [`MembershipStore`]. A membership
//! restored from the store is only a hint: [`LobbySync::needs_reconcile`]
//! stays `true` until a fresh server snapshot has been applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::protocol::{Player, RoomJoinedPayload, RoomSettings, RoomSnapshot, ServerMessage, UserId};
use crate::store::{MembershipStore, PersistedMembership};

/// A lobby change, tagged by how it may be reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyUpdate {
    /// Join acknowledged by the socket.
    Joined(RoomJoinedPayload),
    /// Routine full snapshot. Settings are not taken from it.
    Snapshot(RoomSnapshot),
    /// Settings change. The only source of settings.
    Settings(RoomSnapshot),
    ReadyChanged { user_id: UserId, is_ready: bool },
    PlayerJoined(Player),
    PlayerLeft { user_id: UserId },
    /// The room no longer exists.
    Closed,
}

impl LobbyUpdate {
    /// The lobby update carried by `msg`, if any.
    pub fn from_server(msg: &ServerMessage) -> Option<Self> {
        match msg {
            ServerMessage::RoomJoined(payload) => Some(Self::Joined(payload.clone())),
            ServerMessage::RoomSnapshotUpdated(snapshot) => Some(Self::Snapshot(snapshot.clone())),
            ServerMessage::SettingsUpdated(snapshot) => Some(Self::Settings(snapshot.clone())),
            ServerMessage::PlayerReadyChanged { user_id, is_ready } => Some(Self::ReadyChanged {
                user_id: user_id.clone(),
                is_ready: *is_ready,
            }),
            ServerMessage::PlayerJoined { player } => Some(Self::PlayerJoined(player.clone())),
            ServerMessage::PlayerLeft { user_id, .. } => Some(Self::PlayerLeft {
                user_id: user_id.clone(),
            }),
            ServerMessage::RoomClosed { .. } => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Local mirror of one lobby, owned by whoever receives its pushes.
pub struct LobbySync {
    user_id: UserId,
    room_code: Option<String>,
    snapshot: Option<RoomSnapshot>,
    /// Players from `room_joined`, held until the first snapshot arrives.
    roster: Vec<Player>,
    joined_at: Option<DateTime<Utc>>,
    needs_reconcile: bool,
    store: Arc<dyn MembershipStore>,
}

impl LobbySync {
    /// An empty lobby view for `user_id`.
    pub fn new(user_id: impl Into<UserId>, store: Arc<dyn MembershipStore>) -> Self {
        Self {
            user_id: user_id.into(),
            room_code: None,
            snapshot: None,
            roster: Vec::new(),
            joined_at: None,
            needs_reconcile: false,
            store,
        }
    }

    /// Rebuild the lobby view from `store`.
    ///
    /// A corrupt entry is cleared and treated as absent. A restored view
    /// reports [`needs_reconcile`](Self::needs_reconcile) until a fresh
    /// snapshot arrives.
    pub fn restore(user_id: impl Into<UserId>, store: Arc<dyn MembershipStore>) -> Self {
        let mut lobby = Self::new(user_id, store);
        match lobby.store.load() {
            Ok(Some(membership)) => {
                info!(room = %membership.room_code, "restored lobby membership");
                lobby.room_code = Some(membership.room_code);
                lobby.snapshot = membership.snapshot;
                lobby.joined_at = Some(membership.joined_at);
                lobby.needs_reconcile = true;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("discarding stored membership: {e}");
                if let Err(e) = lobby.store.clear() {
                    warn!("failed to clear stored membership: {e}");
                }
            }
        }
        lobby
    }

    /// Seed the view for `room_code`, e.g. from a create or join response,
    /// before the socket confirms. Entering a different room drops the old one.
    pub fn enter(&mut self, room_code: &str, snapshot: Option<RoomSnapshot>) {
        if self.room_code.as_deref() != Some(room_code) {
            self.snapshot = None;
            self.roster.clear();
            self.joined_at = Some(Utc::now());
            self.room_code = Some(room_code.to_string());
        }
        if let Some(snapshot) = snapshot {
            self.snapshot = Some(snapshot);
            self.needs_reconcile = false;
        }
        self.persist();
    }

    /// Apply one update. Returns `true` if the view changed.
    pub fn apply(&mut self, update: LobbyUpdate) -> bool {
        let changed = match update {
            LobbyUpdate::Joined(payload) => {
                if self.room_code.as_deref() != Some(payload.room_code.as_str()) {
                    self.snapshot = None;
                    self.joined_at = Some(Utc::now());
                    self.room_code = Some(payload.room_code);
                }
                match self.snapshot.as_mut() {
                    Some(snapshot) => snapshot.players = payload.players,
                    None => self.roster = payload.players,
                }
                true
            }
            LobbyUpdate::Snapshot(incoming) => {
                if !self.accepts(&incoming.room_code) {
                    return false;
                }
                let settings = match self.snapshot.take() {
                    Some(current) => current.settings,
                    None => incoming.settings.clone(),
                };
                self.adopt(RoomSnapshot { settings, ..incoming });
                true
            }
            LobbyUpdate::Settings(incoming) => {
                if !self.accepts(&incoming.room_code) {
                    return false;
                }
                self.adopt(incoming);
                true
            }
            LobbyUpdate::ReadyChanged { user_id, is_ready } => match self.player_mut(&user_id) {
                Some(player) if player.is_ready != is_ready => {
                    player.is_ready = is_ready;
                    true
                }
                _ => false,
            },
            LobbyUpdate::PlayerJoined(player) => match self.players_mut() {
                Some(players) => {
                    match players.iter_mut().find(|p| p.user_id == player.user_id) {
                        Some(existing) => *existing = player,
                        None => players.push(player),
                    }
                    true
                }
                None => false,
            },
            LobbyUpdate::PlayerLeft { user_id } => match self.players_mut() {
                Some(players) => {
                    let before = players.len();
                    players.retain(|p| p.user_id != user_id);
                    players.len() != before
                }
                None => false,
            },
            LobbyUpdate::Closed => {
                info!(room = ?self.room_code, "room closed by server");
                self.clear();
                return true;
            }
        };

        if changed {
            self.persist();
        }
        changed
    }

    /// Apply the lobby update carried by `msg`, if any.
    pub fn apply_server(&mut self, msg: &ServerMessage) -> bool {
        LobbyUpdate::from_server(msg).is_some_and(|update| self.apply(update))
    }

    /// Adopt a snapshot fetched out-of-band. The fetch is complete and
    /// authoritative, settings included.
    pub fn reconcile(&mut self, snapshot: RoomSnapshot) {
        if self.room_code.is_none() {
            self.room_code = Some(snapshot.room_code.clone());
            self.joined_at = Some(Utc::now());
        }
        if self.room_code.as_deref() != Some(snapshot.room_code.as_str()) {
            warn!(
                current = ?self.room_code,
                fetched = %snapshot.room_code,
                "reconcile snapshot is for another room; ignored"
            );
            return;
        }
        self.adopt(snapshot);
        self.persist();
    }

    /// Explicit leave: forget the room and its stored membership.
    pub fn leave(&mut self) {
        debug!(room = ?self.room_code, "leaving lobby");
        self.clear();
    }

    pub fn logout(&mut self) {
        debug!("logout; clearing lobby membership");
        self.clear();
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn room_code(&self) -> Option<&str> {
        self.room_code.as_deref()
    }

    pub fn snapshot(&self) -> Option<&RoomSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        self.joined_at
    }

    /// Current players: the latest snapshot's, or the `room_joined` roster
    /// before any snapshot arrived.
    pub fn players(&self) -> &[Player] {
        match &self.snapshot {
            Some(snapshot) => &snapshot.players,
            None => &self.roster,
        }
    }

    pub fn settings(&self) -> Option<&RoomSettings> {
        self.snapshot.as_ref().map(|s| &s.settings)
    }

    /// `true` while the view came from storage and no server snapshot has
    /// confirmed it yet.
    pub fn needs_reconcile(&self) -> bool {
        self.needs_reconcile
    }

    /// The local user created the room.
    pub fn is_host(&self) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| s.creator_id == self.user_id)
    }

    /// The local user is listed as ready.
    pub fn is_ready(&self) -> bool {
        self.players()
            .iter()
            .any(|p| p.user_id == self.user_id && p.is_ready)
    }

    pub fn ready_count(&self) -> usize {
        self.players().iter().filter(|p| p.is_ready).count()
    }

    /// Every listed player is ready. `false` for an empty room.
    pub fn all_ready(&self) -> bool {
        let players = self.players();
        !players.is_empty() && players.iter().all(|p| p.is_ready)
    }

    /// Snapshots are taken only for the room entered through `enter`,
    /// `room_joined`, `reconcile` or `restore`. With no room, including right
    /// after a leave, every snapshot is dropped.
    fn accepts(&self, room_code: &str) -> bool {
        match self.room_code.as_deref() {
            Some(current) if current == room_code => true,
            current => {
                debug!(?current, incoming = room_code, "snapshot for a room not entered; ignored");
                false
            }
        }
    }

    fn adopt(&mut self, snapshot: RoomSnapshot) {
        self.snapshot = Some(snapshot);
        self.roster.clear();
        self.needs_reconcile = false;
    }

    fn players_mut(&mut self) -> Option<&mut Vec<Player>> {
        self.room_code.as_ref()?;
        Some(match self.snapshot.as_mut() {
            Some(snapshot) => &mut snapshot.players,
            None => &mut self.roster,
        })
    }

    fn player_mut(&mut self, user_id: &str) -> Option<&mut Player> {
        self.players_mut()?
            .iter_mut()
            .find(|p| p.user_id == user_id)
    }

    fn clear(&mut self) {
        self.room_code = None;
        self.snapshot = None;
        self.roster.clear();
        self.joined_at = None;
        self.needs_reconcile = false;
        if let Err(e) = self.store.clear() {
            warn!("failed to clear stored membership: {e}");
        }
    }

    fn persist(&self) {
        let Some(room_code) = self.room_code.clone() else {
            return;
        };
        let membership = PersistedMembership {
            room_code,
            snapshot: self.snapshot.clone(),
            joined_at: self.joined_at.unwrap_or_else(Utc::now),
        };
        if let Err(e) = self.store.save(&membership) {
            warn!("failed to persist lobby membership: {e}");
        }
    }
}

impl std::fmt::Debug for LobbySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbySync")
            .field("user_id", &self.user_id)
            .field("room_code", &self.room_code)
            .field("players", &self.players().len())
            .field("needs_reconcile", &self.needs_reconcile)
            .finish()
    }
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
    use crate::store::MemoryStore;

    fn snapshot(players: Vec<Player>, time_per_question: u32) -> RoomSnapshot {
        RoomSnapshot {
            room_code: "ABC123".into(),
            creator_id: "u1".into(),
            players,
            settings: RoomSettings {
                time_per_question,
                ..RoomSettings::default()
            },
        }
    }

    fn ready(mut player: Player) -> Player {
        player.is_ready = true;
        player
    }

    fn lobby() -> (LobbySync, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut lobby = LobbySync::new("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
        lobby.enter("ABC123", None);
        (lobby, store)
    }

    #[test]
    fn routine_snapshot_keeps_settings() {
        let (mut lobby, _) = lobby();
        lobby.apply(LobbyUpdate::Settings(snapshot(vec![], 45)));
        lobby.apply(LobbyUpdate::Snapshot(snapshot(
            vec![Player::new("u1", "Alice"), Player::new("u2", "Bob")],
            30,
        )));
        assert_eq!(lobby.players().len(), 2);
        assert_eq!(lobby.settings().unwrap().time_per_question, 45);
    }

    #[test]
    fn settings_update_replaces_settings() {
        let (mut lobby, _) = lobby();
        lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![], 30)));
        lobby.apply(LobbyUpdate::Settings(snapshot(vec![Player::new("u1", "Alice")], 60)));
        assert_eq!(lobby.settings().unwrap().time_per_question, 60);
        assert_eq!(lobby.players().len(), 1);
    }

    #[test]
    fn derived_values_follow_players() {
        let (mut lobby, _) = lobby();
        lobby.apply(LobbyUpdate::Snapshot(snapshot(
            vec![ready(Player::new("u1", "Alice")), Player::new("u2", "Bob")],
            30,
        )));
        assert!(lobby.is_host());
        assert!(lobby.is_ready());
        assert_eq!(lobby.ready_count(), 1);
        assert!(!lobby.all_ready());

        assert!(lobby.apply(LobbyUpdate::ReadyChanged {
            user_id: "u2".into(),
            is_ready: true,
        }));
        assert!(lobby.all_ready());
        assert!(!lobby.apply(LobbyUpdate::ReadyChanged {
            user_id: "u2".into(),
            is_ready: true,
        }));
    }

    #[test]
    fn snapshot_for_other_room_is_ignored() {
        let (mut lobby, _) = lobby();
        lobby.enter("ABC123", None);
        let mut other = snapshot(vec![Player::new("u9", "Zed")], 30);
        other.room_code = "XYZ789".into();
        assert!(!lobby.apply(LobbyUpdate::Snapshot(other)));
        assert!(lobby.players().is_empty());
    }

    #[test]
    fn every_change_is_persisted_and_leave_clears() {
        let (mut lobby, store) = lobby();
        lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![Player::new("u1", "Alice")], 30)));
        let stored = store.load().unwrap().unwrap();
        assert_eq!(stored.room_code, "ABC123");
        assert_eq!(stored.snapshot.unwrap().players.len(), 1);

        lobby.apply(LobbyUpdate::PlayerJoined(Player::new("u2", "Bob")));
        assert_eq!(store.load().unwrap().unwrap().snapshot.unwrap().players.len(), 2);

        lobby.leave();
        assert!(lobby.room_code().is_none());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn late_snapshot_after_leave_is_not_readopted() {
        let (mut lobby, store) = lobby();
        lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![Player::new("u1", "Alice")], 30)));
        lobby.leave();

        assert!(!lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![Player::new("u1", "Alice")], 30))));
        assert!(!lobby.apply(LobbyUpdate::Settings(snapshot(vec![], 45))));
        assert!(lobby.room_code().is_none());
        assert!(lobby.players().is_empty());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn joined_roster_is_kept_until_first_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut lobby = LobbySync::new("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
        lobby.apply_server(&ServerMessage::RoomJoined(crate::protocol::RoomJoinedPayload {
            room_code: "ABC123".into(),
            players: vec![Player::new("u1", "Alice"), Player::new("u2", "Bob")],
            chat_history: vec![],
        }));
        assert_eq!(lobby.room_code(), Some("ABC123"));
        assert_eq!(lobby.players().len(), 2);
        assert!(lobby.settings().is_none());

        assert!(lobby.apply(LobbyUpdate::ReadyChanged {
            user_id: "u2".into(),
            is_ready: true,
        }));
        assert_eq!(lobby.ready_count(), 1);
        assert!(lobby.apply(LobbyUpdate::PlayerLeft {
            user_id: "u1".into(),
        }));
        assert_eq!(lobby.players().len(), 1);

        lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![Player::new("u3", "Cid")], 30)));
        assert_eq!(lobby.players().len(), 1);
        assert_eq!(lobby.players()[0].user_id, "u3");
    }

    #[test]
    fn restored_membership_needs_reconcile_until_snapshot() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut lobby = LobbySync::new("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
            lobby.enter("ABC123", None);
            lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![Player::new("u1", "Alice")], 30)));
        }

        let mut restored = LobbySync::restore("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
        assert_eq!(restored.room_code(), Some("ABC123"));
        assert!(restored.needs_reconcile());

        restored.reconcile(snapshot(vec![], 20));
        assert!(!restored.needs_reconcile());
        assert_eq!(restored.settings().unwrap().time_per_question, 20);
    }

    #[test]
    fn corrupt_store_restores_empty_and_is_cleared() {
        let store = Arc::new(MemoryStore::new());
        store.set_raw("garbage");
        let lobby = LobbySync::restore("u1", Arc::clone(&store) as Arc<dyn MembershipStore>);
        assert!(lobby.room_code().is_none());
        assert!(!lobby.needs_reconcile());
        assert!(store.raw().is_none());
    }

    #[test]
    fn room_closed_clears_membership() {
        let (mut lobby, store) = lobby();
        lobby.apply(LobbyUpdate::Snapshot(snapshot(vec![], 30)));
        assert!(lobby.apply_server(&ServerMessage::RoomClosed { message: None }));
        assert!(lobby.snapshot().is_none());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn player_left_removes_player() {
        let (mut lobby, _) = lobby();
        lobby.apply(LobbyUpdate::Snapshot(snapshot(
            vec![Player::new("u1", "Alice"), Player::new("u2", "Bob")],
            30,
        )));
        assert!(lobby.apply_server(&ServerMessage::PlayerLeft {
            user_id: "u2".into(),
            username: Some("Bob".into()),
        }));
        assert_eq!(lobby.players().len(), 1);
        assert!(!lobby.apply(LobbyUpdate::PlayerLeft {
            user_id: "u2".into(),
        }));
    }
}
