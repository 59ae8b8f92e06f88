//! Primary/secondary connector fallback.
//!
//! Some deployments only accept the low-latency full-duplex transport, others
//! only an HTTP long-polling one. [`FallbackConnector`] dials the primary
//! connector first and the secondary one if that fails.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::transport::{Connector, Credentials, Transport};

/// Tries `primary`, then `secondary`.
#[derive(Debug, Clone)]
pub struct FallbackConnector<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackConnector<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<P, S> Connector for FallbackConnector<P, S>
where
    P: Connector,
    S: Connector,
{
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, SessionError> {
        match self.primary.connect(credentials).await {
            Ok(transport) => Ok(transport),
            Err(primary_err) => {
                tracing::warn!("primary transport failed ({primary_err}), trying fallback");
                self.secondary.connect(credentials).await.map_err(|e| {
                    SessionError::ConnectionError(format!(
                        "primary: {primary_err}; fallback: {e}"
                    ))
                })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&mut self, _message: String) -> Result<(), SessionError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<Result<String, SessionError>> {
            None
        }
        async fn close(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct CountingConnector {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _credentials: &Credentials) -> Result<Box<dyn Transport>, SessionError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(SessionError::ConnectionError("refused".into()))
            } else {
                Ok(Box::new(NullTransport))
            }
        }
    }

    fn pair(primary_fails: bool, secondary_fails: bool) -> (FallbackConnector<CountingConnector, CountingConnector>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let p = Arc::new(AtomicU32::new(0));
        let s = Arc::new(AtomicU32::new(0));
        let connector = FallbackConnector::new(
            CountingConnector { calls: Arc::clone(&p), fail: primary_fails },
            CountingConnector { calls: Arc::clone(&s), fail: secondary_fails },
        );
        (connector, p, s)
    }

    #[tokio::test]
    async fn secondary_not_dialled_when_primary_succeeds() {
        let (connector, p, s) = pair(false, false);
        connector.connect(&Credentials::anonymous()).await.unwrap();
        assert_eq!(p.load(Ordering::Relaxed), 1);
        assert_eq!(s.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn secondary_dialled_when_primary_fails() {
        let (connector, p, s) = pair(true, false);
        connector.connect(&Credentials::anonymous()).await.unwrap();
        assert_eq!(p.load(Ordering::Relaxed), 1);
        assert_eq!(s.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn both_failures_are_reported() {
        let (connector, _p, _s) = pair(true, true);
        let Err(err) = connector.connect(&Credentials::anonymous()).await else {
            panic!("expected failure");
        };
        assert!(matches!(err, SessionError::ConnectionError(msg) if msg.contains("fallback")));
    }
}
