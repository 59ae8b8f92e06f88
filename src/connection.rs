//! Live socket connection and its background transport loop.
//!
//! [`Connection`] is a cheap, cloneable handle. Outgoing commands travel to
//! the loop over an unbounded MPSC channel; inbound frames are decoded and
//! handed to the connection's [`EventRegistry`].
//!
//! Once a connection has been established, a dropped transport is re-dialled
//! up to `reconnect_attempts` times with a fixed delay. While re-dialling the
//! status is [`ConnectionStatus::Reconnecting`] and emits fail with
//! [`SessionError::NotConnected`]; registered listeners stay attached and
//! resume receiving events once the transport is back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::fanout::{EventRegistry, RoomEventHandlers, Subscription};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{Connector, Credentials, TokenSource, Transport};

/// Connection lifecycle as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// The transport dropped and is being re-dialled.
    Reconnecting,
}

/// Everything the loop needs to re-dial after a drop.
pub(crate) struct Redial {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) tokens: Arc<dyn TokenSource>,
    pub(crate) attempts: u32,
    pub(crate) delay: Duration,
}

struct ConnectionInner {
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    registry: Arc<EventRegistry>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_timeout: Duration,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // No executor context for a graceful close here.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Handle to one live transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Spawn the transport loop over an already-dialled transport.
    ///
    /// Without a `redial` policy a dropped transport ends the connection.
    pub(crate) fn start(
        transport: Box<dyn Transport>,
        redial: Option<Redial>,
        config: &ClientConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (status_tx, _status_rx) = watch::channel(ConnectionStatus::Connected);
        let status_tx = Arc::new(status_tx);
        let registry = Arc::new(EventRegistry::new());

        let task = tokio::spawn(transport_loop(
            transport,
            cmd_rx,
            Arc::clone(&status_tx),
            Arc::clone(&registry),
            shutdown_rx,
            redial,
        ));

        Self {
            inner: Arc::new(ConnectionInner {
                cmd_tx,
                status_tx,
                registry,
                task: Mutex::new(Some(task)),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_timeout: config.shutdown_timeout,
            }),
        }
    }

    /// Wrap a transport with no reconnection policy.
    ///
    /// Useful for tests and for callers that dial transports themselves.
    pub fn from_transport(transport: impl Transport, config: &ClientConfig) -> Self {
        Self::start(Box::new(transport), None, config)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch status transitions, e.g. to show a reconnecting banner.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// The listener table fed by this connection.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    /// Attach `handlers` to this connection's events.
    pub fn subscribe(&self, handlers: RoomEventHandlers) -> Subscription {
        self.inner.registry.subscribe(handlers)
    }

    /// Queue a command for the server.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] unless the status is
    /// [`ConnectionStatus::Connected`].
    pub fn emit(&self, msg: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.inner
            .cmd_tx
            .send(msg)
            .map_err(|_| SessionError::NotConnected)
    }

    /// Close the transport and stop the background loop.
    ///
    /// Listeners stay in the registry but will receive nothing further.
    pub async fn shutdown(&self) {
        debug!("connection: shutdown requested");

        if let Some(tx) = self.inner.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let task = self.inner.task.lock().take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.inner.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("transport loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("transport loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("transport loop aborted: {join_err}");
                    }
                }
            }
        }

        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected);
    }

    /// `true` if both handles refer to the same underlying connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .field("has_task", &self.inner.task.lock().is_some())
            .finish()
    }
}

// ── Transport loop ──────────────────────────────────────────────────

/// Why one transport's session ended.
enum SessionExit {
    /// Shutdown requested or every handle dropped.
    Shutdown,
    /// The transport failed or the server closed it.
    Dropped(Option<String>),
}

async fn transport_loop(
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    registry: Arc<EventRegistry>,
    mut shutdown_rx: oneshot::Receiver<()>,
    redial: Option<Redial>,
) {
    debug!("transport loop started");

    loop {
        match run_session(&mut transport, &mut cmd_rx, &registry, &mut shutdown_rx).await {
            SessionExit::Shutdown => {
                let _ = transport.close().await;
                break;
            }
            SessionExit::Dropped(reason) => {
                warn!(
                    "connection lost: {}",
                    reason.as_deref().unwrap_or("closed by server")
                );
                let Some(redial) = redial.as_ref().filter(|r| r.attempts > 0) else {
                    break;
                };
                status_tx.send_replace(ConnectionStatus::Reconnecting);
                match redial_with_backoff(redial, &mut shutdown_rx).await {
                    Some(next) => {
                        transport = next;
                        status_tx.send_replace(ConnectionStatus::Connected);
                    }
                    None => break,
                }
            }
        }
    }

    status_tx.send_replace(ConnectionStatus::Disconnected);
    debug!("transport loop exited");
}

/// Pump one transport until it drops or shutdown is requested.
async fn run_session(
    transport: &mut Box<dyn Transport>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    registry: &EventRegistry,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> SessionExit {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(msg) = cmd else {
                    debug!("command channel closed, shutting down transport loop");
                    return SessionExit::Shutdown;
                };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        debug!("sending {json}");
                        if let Err(e) = transport.send(json).await {
                            error!("transport send error: {e}");
                            return SessionExit::Dropped(Some(e.to_string()));
                        }
                    }
                    Err(e) => {
                        error!("failed to serialize ClientMessage: {e}");
                    }
                }
            }

            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                return SessionExit::Shutdown;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => handle_frame(registry, &text),
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        return SessionExit::Dropped(Some(e.to_string()));
                    }
                    None => {
                        debug!("transport closed by server");
                        return SessionExit::Dropped(None);
                    }
                }
            }
        }
    }
}

/// Decode one inbound frame and fan it out. Undecodable frames are logged
/// and swallowed so the session keeps running.
fn handle_frame(registry: &EventRegistry, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => {
            debug!("received {}", msg.kind());
            registry.dispatch(&msg);
        }
        Err(e) => {
            let err = SessionError::ProtocolError(e.to_string());
            warn!("{err}; raw: {text}");
        }
    }
}

/// Re-dial with a fixed delay. `None` when attempts run out or shutdown is
/// requested in between.
async fn redial_with_backoff(
    redial: &Redial,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Option<Box<dyn Transport>> {
    for attempt in 1..=redial.attempts {
        tokio::select! {
            () = tokio::time::sleep(redial.delay) => {}
            _ = &mut *shutdown_rx => {
                debug!("shutdown requested while reconnecting");
                return None;
            }
        }

        info!("reconnecting (attempt {attempt}/{})", redial.attempts);
        let credentials = Credentials::new(redial.tokens.token());
        match redial.connector.connect(&credentials).await {
            Ok(transport) => {
                info!("reconnected after {attempt} attempt(s)");
                return Some(transport);
            }
            Err(e) => warn!("reconnect attempt {attempt} failed: {e}"),
        }
    }

    error!("failed to reconnect after {} attempts", redial.attempts);
    None
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
    use crate::event::EventKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Transport fed from a channel; `None` on the channel closes it.
    struct ChannelTransport {
        incoming: mpsc::UnboundedReceiver<Option<String>>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), SessionError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, SessionError>> {
            match self.incoming.recv().await {
                Some(Some(text)) => Some(Ok(text)),
                Some(None) | None => None,
            }
        }

        async fn close(&mut self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    fn channel_transport() -> (
        ChannelTransport,
        mpsc::UnboundedSender<Option<String>>,
        Arc<StdMutex<Vec<String>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        (
            ChannelTransport {
                incoming: rx,
                sent: Arc::clone(&sent),
            },
            tx,
            sent,
        )
    }

    struct CountingConnector {
        calls: Arc<AtomicUsize>,
        spare: StdMutex<Option<ChannelTransport>>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            _credentials: &Credentials,
        ) -> std::result::Result<Box<dyn Transport>, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.spare.lock().unwrap().take() {
                Some(t) => Ok(Box::new(t)),
                None => Err(SessionError::ConnectionError("refused".into())),
            }
        }
    }

    #[tokio::test]
    async fn emit_serializes_command() {
        let (transport, _tx, sent) = channel_transport();
        let conn = Connection::from_transport(transport, &ClientConfig::default());
        conn.emit(ClientMessage::LeaveRoom {
            room_code: "ABC123".into(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"leave_room\""));
        drop(sent);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn inbound_frames_reach_listeners_and_garbage_is_skipped() {
        let (transport, tx, _sent) = channel_transport();
        let conn = Connection::from_transport(transport, &ClientConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = conn.subscribe(RoomEventHandlers::new().on(EventKind::AllReady, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        tx.send(Some("not json".into())).unwrap();
        tx.send(Some(r#"{"event":"unknown_event","data":{}}"#.into()))
            .unwrap();
        tx.send(Some(r#"{"event":"all_ready","data":{}}"#.into()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(conn.is_connected());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn server_close_without_redial_disconnects() {
        let (transport, tx, _sent) = channel_transport();
        let conn = Connection::from_transport(transport, &ClientConfig::default());
        let mut status = conn.watch_status();
        tx.send(None).unwrap();
        status
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await
            .unwrap();
        let err = conn
            .emit(ClientMessage::LeaveRoom {
                room_code: "ABC123".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_transport_is_redialled() {
        let (first, first_tx, _first_sent) = channel_transport();
        let (second, second_tx, _second_sent) = channel_transport();
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            calls: Arc::clone(&calls),
            spare: StdMutex::new(Some(second)),
        };
        let redial = Redial {
            connector: Arc::new(connector),
            tokens: Arc::new(crate::transport::StaticToken(None)),
            attempts: 3,
            delay: Duration::from_secs(1),
        };
        let conn = Connection::start(Box::new(first), Some(redial), &ClientConfig::default());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = conn.subscribe(RoomEventHandlers::new().on(EventKind::AllReady, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let mut status = conn.watch_status();
        first_tx.send(None).unwrap();
        status
            .wait_for(|s| *s == ConnectionStatus::Reconnecting)
            .await
            .unwrap();
        status
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        second_tx
            .send(Some(r#"{"event":"all_ready","data":{}}"#.into()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        conn.shutdown().await;
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn redial_gives_up_after_bounded_attempts() {
        let (first, first_tx, _sent) = channel_transport();
        let calls = Arc::new(AtomicUsize::new(0));
        let redial = Redial {
            connector: Arc::new(CountingConnector {
                calls: Arc::clone(&calls),
                spare: StdMutex::new(None),
            }),
            tokens: Arc::new(crate::transport::StaticToken(None)),
            attempts: 2,
            delay: Duration::from_secs(1),
        };
        let conn = Connection::start(Box::new(first), Some(redial), &ClientConfig::default());
        let mut status = conn.watch_status();
        first_tx.send(None).unwrap();
        status
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
