//! Correlated request/response over the event socket.
//!
//! The socket is pub/sub, so a "request" is an emit paired with the first
//! matching reply event or the first `error` event, bounded by a deadline.
//! Both one-shot listeners are attached before the emit and detached when
//! the request settles, whichever way it settles.
//!
//! Replies carry no correlation id, so two requests waiting on the same reply
//! kind would race for the first reply. Callers that can overlap serialize
//! their requests (see the answer submission turn in `session`).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::event::EventKind;
use crate::fanout::{EventRegistry, OnceHandler};
use crate::protocol::{ClientMessage, ServerMessage};

/// How a correlated request settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The expected reply event arrived first.
    Replied(ServerMessage),
    /// An `error` event arrived first.
    Rejected(String),
    /// The deadline elapsed first.
    TimedOut,
}

/// Detaches the request's listeners when dropped.
struct PendingRequest<'a> {
    registry: &'a EventRegistry,
    listeners: Vec<(EventKind, crate::fanout::ListenerId)>,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        for (kind, id) in self.listeners.drain(..) {
            self.registry.off(kind, id);
        }
    }
}

fn settle(slot: &Arc<Mutex<Option<oneshot::Sender<ServerMessage>>>>) -> OnceHandler {
    let slot = Arc::clone(slot);
    Box::new(move |msg: &ServerMessage| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(msg.clone());
        }
    })
}

impl Connection {
    /// Emit `message` and wait for one `reply` event, one `error` event, or
    /// the deadline, whichever comes first.
    ///
    /// The caller is resolved at most once; replies arriving after the
    /// deadline find no listener.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the emit fails and
    /// [`SessionError::TransportClosed`] if the connection goes away while
    /// waiting.
    pub async fn request(
        &self,
        message: ClientMessage,
        reply: EventKind,
        timeout: Duration,
    ) -> Result<RequestOutcome> {
        let registry = self.registry();
        let (tx, rx) = oneshot::channel::<ServerMessage>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let _pending = PendingRequest {
            registry,
            listeners: vec![
                (reply, registry.once(reply, settle(&slot))),
                (EventKind::Error, registry.once(EventKind::Error, settle(&slot))),
            ],
        };

        self.emit(message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ServerMessage::Error { message })) => Ok(RequestOutcome::Rejected(message)),
            Ok(Ok(msg)) => Ok(RequestOutcome::Replied(msg)),
            Ok(Err(_)) => Err(SessionError::TransportClosed),
            Err(_) => {
                debug!("no {reply} within {timeout:?}");
                Ok(RequestOutcome::TimedOut)
            }
        }
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
    use crate::config::ClientConfig;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct ChannelTransport {
        incoming: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, _message: String) -> std::result::Result<(), SessionError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<std::result::Result<String, SessionError>> {
            self.incoming.recv().await.map(Ok)
        }
        async fn close(&mut self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    fn connection() -> (Connection, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::from_transport(ChannelTransport { incoming: rx }, &ClientConfig::default());
        (conn, tx)
    }

    fn join() -> ClientMessage {
        ClientMessage::JoinRoom {
            room_code: "ABC123".into(),
        }
    }

    /// Push `frame` once the request has attached its `kind` listener.
    async fn reply_when_listening(
        conn: &Connection,
        tx: &mpsc::UnboundedSender<String>,
        kind: EventKind,
        frame: &str,
    ) {
        while conn.registry().listener_count(kind) == 0 {
            tokio::task::yield_now().await;
        }
        tx.send(frame.to_string()).unwrap();
    }

    const JOINED: &str = r#"{"event":"room_joined","data":{"room_code":"ABC123"}}"#;

    #[tokio::test]
    async fn reply_resolves_request_and_detaches_listeners() {
        let (conn, tx) = connection();
        let (outcome, ()) = tokio::join!(
            conn.request(join(), EventKind::RoomJoined, Duration::from_secs(5)),
            reply_when_listening(&conn, &tx, EventKind::RoomJoined, JOINED),
        );
        let outcome = outcome.unwrap();
        assert!(matches!(outcome, RequestOutcome::Replied(ServerMessage::RoomJoined(_))));
        assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 0);
        assert_eq!(conn.registry().listener_count(EventKind::Error), 0);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn error_event_rejects_request() {
        let (conn, tx) = connection();
        let (outcome, ()) = tokio::join!(
            conn.request(join(), EventKind::RoomJoined, Duration::from_secs(5)),
            reply_when_listening(
                &conn,
                &tx,
                EventKind::Error,
                r#"{"event":"error","data":{"message":"Lobby not found"}}"#,
            ),
        );
        let outcome = outcome.unwrap();
        assert_eq!(outcome, RequestOutcome::Rejected("Lobby not found".into()));
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_does_not_resolve_twice() {
        let (conn, tx) = connection();
        let outcome = conn
            .request(join(), EventKind::RoomJoined, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, RequestOutcome::TimedOut);
        assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 0);

        // Nobody is listening for the late reply any more.
        tx.send(JOINED.into()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 0);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn emit_failure_detaches_listeners() {
        let (conn, _tx) = connection();
        conn.shutdown().await;
        let err = conn
            .request(join(), EventKind::RoomJoined, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 0);
    }

    #[tokio::test]
    async fn abandoned_request_detaches_listeners() {
        let (conn, _tx) = connection();
        let mut pending = tokio_test::task::spawn(conn.request(
            join(),
            EventKind::RoomJoined,
            Duration::from_secs(5),
        ));
        tokio_test::assert_pending!(pending.poll());
        assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 1);
        assert_eq!(conn.registry().listener_count(EventKind::Error), 1);

        drop(pending);
        assert_eq!(conn.registry().listener_count(EventKind::RoomJoined), 0);
        assert_eq!(conn.registry().listener_count(EventKind::Error), 0);
        conn.shutdown().await;
    }
}
