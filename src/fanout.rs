//! Event fan-out: routes inbound [`ServerMessage`]s to registered listeners.
//!
//! Listeners are keyed by [`EventKind`]. Persistent listeners stay attached
//! until removed; one-shot listeners are removed the first time their event
//! fires. Handlers run outside the registry lock, so a handler may subscribe
//! or unsubscribe without deadlocking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::EventKind;
use crate::protocol::ServerMessage;

/// A persistent event handler.
pub type Handler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// A handler that fires at most once.
pub type OnceHandler = Box<dyn FnOnce(&ServerMessage) + Send>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Default)]
struct Listeners {
    persistent: HashMap<EventKind, Vec<(ListenerId, Handler)>>,
    once: HashMap<EventKind, Vec<(ListenerId, OnceHandler)>>,
}

/// Listener table shared by a connection and its subscribers.
#[derive(Default)]
pub struct EventRegistry {
    listeners: Mutex<Listeners>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a persistent listener.
    pub fn on(&self, kind: EventKind, handler: Handler) -> ListenerId {
        let id = ListenerId::new();
        self.listeners
            .lock()
            .persistent
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Attach a listener that is removed after its first invocation.
    pub fn once(&self, kind: EventKind, handler: OnceHandler) -> ListenerId {
        let id = ListenerId::new();
        self.listeners
            .lock()
            .once
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Detach a listener. Returns `false` if it was already gone.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let mut removed = false;
        if let Some(list) = listeners.persistent.get_mut(&kind) {
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            removed |= list.len() != before;
        }
        if let Some(list) = listeners.once.get_mut(&kind) {
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of listeners (persistent and one-shot) attached to `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        let listeners = self.listeners.lock();
        listeners.persistent.get(&kind).map_or(0, Vec::len)
            + listeners.once.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `msg` to every listener of its kind. Returns how many ran.
    pub fn dispatch(&self, msg: &ServerMessage) -> usize {
        let kind = msg.kind();
        let (persistent, once): (Vec<Handler>, Vec<OnceHandler>) = {
            let mut listeners = self.listeners.lock();
            let persistent = listeners
                .persistent
                .get(&kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            let once = listeners
                .once
                .remove(&kind)
                .map(|list| list.into_iter().map(|(_, h)| h).collect())
                .unwrap_or_default();
            (persistent, once)
        };

        let count = persistent.len() + once.len();
        if count == 0 {
            debug!("no listener for {kind}");
        }
        for handler in persistent {
            handler(msg);
        }
        for handler in once {
            handler(msg);
        }
        count
    }

    /// Attach every handler in `handlers` and return the guard that detaches
    /// exactly those listeners.
    #[must_use = "dropping the subscription detaches its handlers"]
    pub fn subscribe(self: &Arc<Self>, handlers: RoomEventHandlers) -> Subscription {
        let ids = handlers
            .handlers
            .into_iter()
            .map(|(kind, handler)| (kind, self.on(kind, handler)))
            .collect();
        Subscription {
            registry: Arc::downgrade(self),
            ids,
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("EventRegistry")
            .field("persistent_kinds", &listeners.persistent.len())
            .field("once_kinds", &listeners.once.len())
            .finish()
    }
}

/// A map from event name to at most one handler.
///
/// # Example
///
/// ```
/// use quiz_battle_client::{EventKind, RoomEventHandlers};
///
/// let handlers = RoomEventHandlers::new()
///     .on(EventKind::PlayerJoined, |msg| println!("{msg:?}"))
///     .on(EventKind::NewMessage, |msg| println!("{msg:?}"));
/// assert_eq!(handlers.len(), 2);
/// ```
#[derive(Default, Clone)]
pub struct RoomEventHandlers {
    handlers: BTreeMap<EventKind, Handler>,
}

impl RoomEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler for `kind`, replacing any previous one.
    #[must_use]
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        if !EventKind::ROOM_EVENTS.contains(&kind) {
            warn!("{kind} is not a room event; handler will still be attached");
        }
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Set the same handler for every kind in `kinds`.
    #[must_use]
    pub fn on_each<F>(mut self, kinds: &[EventKind], handler: F) -> Self
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        for kind in kinds {
            self.handlers.insert(*kind, Arc::clone(&handler));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

impl std::fmt::Debug for RoomEventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Guard for a set of attached listeners.
///
/// [`unsubscribe`](Subscription::unsubscribe) is idempotent and also runs on
/// drop.
#[must_use = "dropping the subscription detaches its handlers"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<EventRegistry>,
    ids: Vec<(EventKind, ListenerId)>,
}

impl Subscription {
    /// A subscription that owns nothing.
    pub fn noop() -> Self {
        Self {
            registry: Weak::new(),
            ids: Vec::new(),
        }
    }

    /// Detach the listeners this subscription attached. Safe to call twice.
    pub fn unsubscribe(&mut self) {
        let ids = std::mem::take(&mut self.ids);
        if let Some(registry) = self.registry.upgrade() {
            for (kind, id) in ids {
                registry.off(kind, id);
            }
        }
    }

    /// `true` while listeners are still attached.
    pub fn is_active(&self) -> bool {
        !self.ids.is_empty() && self.registry.strong_count() > 0
    }

    /// Event kinds this subscription is attached to.
    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.ids.iter().map(|(kind, _)| *kind)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&ServerMessage) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_msg: &ServerMessage| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn all_ready() -> ServerMessage {
        ServerMessage::AllReady { room_code: None }
    }

    #[test]
    fn persistent_listener_fires_every_time() {
        let registry = EventRegistry::new();
        let (hits, handler) = counter();
        registry.on(EventKind::AllReady, Arc::new(handler));
        registry.dispatch(&all_ready());
        registry.dispatch(&all_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_listener_fires_once() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.once(
            EventKind::AllReady,
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(registry.listener_count(EventKind::AllReady), 1);
        registry.dispatch(&all_ready());
        registry.dispatch(&all_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count(EventKind::AllReady), 0);
    }

    #[test]
    fn unsubscribe_detaches_only_own_handlers() {
        let registry = Arc::new(EventRegistry::new());
        let (other_hits, other) = counter();
        registry.on(EventKind::AllReady, Arc::new(other));

        let (hits, handler) = counter();
        let mut sub = registry.subscribe(RoomEventHandlers::new().on(EventKind::AllReady, handler));
        assert_eq!(registry.listener_count(EventKind::AllReady), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(registry.listener_count(EventKind::AllReady), 1);

        registry.dispatch(&all_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(other_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_detaches_handlers() {
        let registry = Arc::new(EventRegistry::new());
        let (_hits, handler) = counter();
        {
            let _sub = registry
                .subscribe(RoomEventHandlers::new().on(EventKind::GameStarted, handler));
            assert_eq!(registry.listener_count(EventKind::GameStarted), 1);
        }
        assert_eq!(registry.listener_count(EventKind::GameStarted), 0);
    }

    #[test]
    fn only_supplied_handlers_are_wired() {
        let registry = Arc::new(EventRegistry::new());
        let (_a, ha) = counter();
        let (_b, hb) = counter();
        let sub = registry.subscribe(
            RoomEventHandlers::new()
                .on(EventKind::PlayerJoined, ha)
                .on(EventKind::PlayerLeft, hb),
        );
        let kinds: Vec<_> = sub.kinds().collect();
        assert_eq!(kinds, vec![EventKind::PlayerJoined, EventKind::PlayerLeft]);
        assert_eq!(registry.listener_count(EventKind::NewMessage), 0);
    }

    #[test]
    fn second_handler_for_same_event_replaces_first() {
        let (first_hits, first) = counter();
        let (second_hits, second) = counter();
        let handlers = RoomEventHandlers::new()
            .on(EventKind::AllReady, first)
            .on(EventKind::AllReady, second);
        assert_eq!(handlers.len(), 1);

        let registry = Arc::new(EventRegistry::new());
        let _sub = registry.subscribe(handlers);
        registry.dispatch(&all_ready());
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_unsubscribe_reentrantly() {
        let registry = Arc::new(EventRegistry::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let reg = Arc::clone(&registry);
        let slot_in = Arc::clone(&slot);
        let id = registry.on(
            EventKind::AllReady,
            Arc::new(move |_| {
                if let Some(id) = slot_in.lock().take() {
                    reg.off(EventKind::AllReady, id);
                }
            }),
        );
        *slot.lock() = Some(id);
        assert_eq!(registry.dispatch(&all_ready()), 1);
        assert_eq!(registry.listener_count(EventKind::AllReady), 0);
    }

    #[test]
    fn noop_subscription_is_inert() {
        let mut sub = Subscription::noop();
        assert!(!sub.is_active());
        sub.unsubscribe();
    }
}
