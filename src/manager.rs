//! Process-wide owner of the single socket connection.
//!
//! [`ConnectionManager::connect`] is idempotent: a live connection is
//! returned as-is, and concurrent callers during a handshake all await the
//! same attempt. The handshake runs in its own task so a caller dropping its
//! future does not strand the others.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(
//!     WebSocketConnector::new(&config.url),
//!     StaticToken(Some(jwt)),
//!     config,
//! );
//! let conn = manager.connect().await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionStatus, Redial};
use crate::error::{Result, SessionError};
use crate::transport::{Connector, Credentials, TokenSource};

/// Why a handshake attempt failed, in a form every waiter can share.
#[derive(Debug, Clone)]
enum AttemptFailure {
    Error(String),
    Timeout,
}

impl From<AttemptFailure> for SessionError {
    fn from(failure: AttemptFailure) -> Self {
        match failure {
            AttemptFailure::Error(message) => SessionError::ConnectionError(message),
            AttemptFailure::Timeout => SessionError::ConnectionTimeout,
        }
    }
}

type AttemptResult = std::result::Result<Connection, AttemptFailure>;

enum Slot {
    Idle,
    Connecting {
        attempt: u64,
        outcome: watch::Receiver<Option<AttemptResult>>,
    },
    Live(Connection),
}

struct SlotState {
    slot: Slot,
    next_attempt: u64,
}

/// Owns the one live [`Connection`] of the process.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    config: ClientConfig,
    state: Arc<Mutex<SlotState>>,
}

impl ConnectionManager {
    pub fn new(
        connector: impl Connector,
        tokens: impl TokenSource,
        config: ClientConfig,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            tokens: Arc::new(tokens),
            config,
            state: Arc::new(Mutex::new(SlotState {
                slot: Slot::Idle,
                next_attempt: 0,
            })),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Return the live connection, joining or starting a handshake if needed.
    ///
    /// # Errors
    ///
    /// - [`SessionError::ConnectionError`] if the connector fails.
    /// - [`SessionError::ConnectionTimeout`] if no handshake completes within
    ///   `connect_timeout`.
    pub async fn connect(&self) -> Result<Connection> {
        let mut outcome = {
            let mut state = self.state.lock();
            let in_flight = match &state.slot {
                Slot::Live(conn) if conn.status() != ConnectionStatus::Disconnected => {
                    return Ok(conn.clone());
                }
                Slot::Connecting { outcome, .. } => Some(outcome.clone()),
                Slot::Live(_) | Slot::Idle => None,
            };
            match in_flight {
                Some(outcome) => outcome,
                None => {
                    let attempt = state.next_attempt;
                    state.next_attempt += 1;
                    let (tx, rx) = watch::channel(None);
                    state.slot = Slot::Connecting {
                        attempt,
                        outcome: rx.clone(),
                    };
                    tokio::spawn(dial(
                        Arc::clone(&self.connector),
                        Arc::clone(&self.tokens),
                        self.config.clone(),
                        Arc::clone(&self.state),
                        tx,
                        attempt,
                    ));
                    rx
                }
            }
        };

        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SessionError::ConnectionError("connect attempt abandoned".into()))?
            .clone();
        match settled {
            Some(Ok(conn)) => Ok(conn),
            Some(Err(failure)) => Err(failure.into()),
            None => Err(SessionError::ConnectionError(
                "connect attempt abandoned".into(),
            )),
        }
    }

    /// Tear down the live connection. A no-op when idle.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut self.state.lock().slot, Slot::Idle);
        match previous {
            Slot::Live(conn) => {
                info!("disconnecting");
                conn.shutdown().await;
            }
            Slot::Connecting { attempt, .. } => {
                debug!("disconnect during handshake attempt {attempt}");
            }
            Slot::Idle => {}
        }
    }

    /// The live connection, without triggering a connect.
    pub fn connection(&self) -> Option<Connection> {
        match &self.state.lock().slot {
            Slot::Live(conn) => Some(conn.clone()),
            Slot::Connecting { .. } | Slot::Idle => None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.state.lock().slot {
            Slot::Live(conn) => conn.status(),
            Slot::Connecting { .. } => ConnectionStatus::Connecting,
            Slot::Idle => ConnectionStatus::Disconnected,
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url)
            .field("status", &self.status())
            .finish()
    }
}

/// One handshake attempt. Publishes its outcome to every waiter and settles
/// the slot, unless `disconnect` replaced the slot in the meantime.
async fn dial(
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    config: ClientConfig,
    state: Arc<Mutex<SlotState>>,
    tx: watch::Sender<Option<AttemptResult>>,
    attempt: u64,
) {
    let credentials = Credentials::new(tokens.token());
    info!(url = %config.url, "connecting");

    let dialled = tokio::time::timeout(config.connect_timeout, connector.connect(&credentials)).await;
    let mut outcome: AttemptResult = match dialled {
        Ok(Ok(transport)) => {
            let redial = Redial {
                connector: Arc::clone(&connector),
                tokens: Arc::clone(&tokens),
                attempts: config.reconnect_attempts,
                delay: config.reconnect_delay,
            };
            info!(url = %config.url, "connected");
            Ok(Connection::start(transport, Some(redial), &config))
        }
        Ok(Err(e)) => {
            error!("connection error: {e}");
            Err(AttemptFailure::Error(e.to_string()))
        }
        Err(_) => {
            warn!("no handshake within {:?}", config.connect_timeout);
            Err(AttemptFailure::Timeout)
        }
    };

    let mut orphaned = None;
    {
        let mut state = state.lock();
        let current = matches!(&state.slot, Slot::Connecting { attempt: a, .. } if *a == attempt);
        if current {
            state.slot = match &outcome {
                Ok(conn) => Slot::Live(conn.clone()),
                Err(_) => Slot::Idle,
            };
        } else if let Ok(conn) = &outcome {
            orphaned = Some(conn.clone());
        }
    }

    if let Some(conn) = orphaned {
        debug!("handshake attempt {attempt} finished after disconnect; closing it");
        conn.shutdown().await;
        outcome = Err(AttemptFailure::Error(
            "disconnected while connecting".into(),
        ));
    }

    tx.send_replace(Some(outcome));
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
    use crate::transport::{StaticToken, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct IdleTransport;

    #[async_trait]
    impl Transport for IdleTransport {
        async fn send(&mut self, _message: String) -> std::result::Result<(), SessionError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<std::result::Result<String, SessionError>> {
            std::future::pending().await
        }
        async fn close(&mut self) -> std::result::Result<(), SessionError> {
            Ok(())
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    struct ScriptedConnector {
        calls: Arc<AtomicUsize>,
        tokens_seen: Arc<StdMutex<Vec<Option<String>>>>,
        behaviour: Behaviour,
        delay: Duration,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            credentials: &Credentials,
        ) -> std::result::Result<Box<dyn Transport>, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens_seen
                .lock()
                .unwrap()
                .push(credentials.token.clone());
            tokio::time::sleep(self.delay).await;
            match self.behaviour {
                Behaviour::Succeed => Ok(Box::new(IdleTransport)),
                Behaviour::Fail => Err(SessionError::ConnectionError("refused".into())),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn manager(behaviour: Behaviour) -> (ConnectionManager, Arc<AtomicUsize>, Arc<StdMutex<Vec<Option<String>>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tokens_seen = Arc::new(StdMutex::new(Vec::new()));
        let connector = ScriptedConnector {
            calls: Arc::clone(&calls),
            tokens_seen: Arc::clone(&tokens_seen),
            behaviour,
            delay: Duration::from_millis(50),
        };
        let manager = ConnectionManager::new(
            connector,
            StaticToken(Some("jwt".into())),
            ClientConfig::default(),
        );
        (manager, calls, tokens_seen)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt() {
        let (manager, calls, tokens_seen) = manager(Behaviour::Succeed);
        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.ptr_eq(&b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens_seen.lock().unwrap().as_slice(), &[Some("jwt".to_string())]);

        // Already connected: returned immediately, no new dial.
        let c = manager.connect().await.unwrap();
        assert!(c.ptr_eq(&a));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), ConnectionStatus::Connected);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connector_failure_is_connection_error_and_not_retried() {
        let (manager, calls, _) = manager(Behaviour::Fail);
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.connection().is_none());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        // The caller retries explicitly.
        let _ = manager.connect().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handshake_times_out_after_ten_seconds() {
        let (manager, _, _) = manager(Behaviour::Hang);
        let started = tokio::time::Instant::now();
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionTimeout));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_noop() {
        let (manager, calls, _) = manager(Behaviour::Succeed);
        manager.disconnect().await;
        assert!(manager.connection().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_then_connect_dials_again() {
        let (manager, calls, _) = manager(Behaviour::Succeed);
        let first = manager.connect().await.unwrap();
        manager.disconnect().await;
        assert_eq!(first.status(), ConnectionStatus::Disconnected);
        let second = manager.connect().await.unwrap();
        assert!(!second.ptr_eq(&first));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        manager.disconnect().await;
    }
}
