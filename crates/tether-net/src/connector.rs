//! Outbound connection attempts.
//!
//! [`Connector::connect`] launches `parallel` attempts at once. Each attempt
//! that succeeds configures the socket, asks the factory for a fresh
//! [`Session`], initializes it with the stream and runs its `on_connected`
//! hook. Failed attempts are logged and skipped; retry policy belongs to the
//! caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::platform::{SocketConfig, configure_stream};
use crate::session::{Session, SessionError};

/// Connection attempt settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Concurrent attempts made by [`Connector::connect`]. Default: 1.
    pub parallel: usize,
    /// Upper bound on one connect. `None` waits for the OS. Default: `None`.
    pub connect_timeout: Option<Duration>,
    /// Options applied to each connected socket.
    pub socket: SocketConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            connect_timeout: None,
            socket: SocketConfig::default(),
        }
    }
}

/// Errors from a single connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The TCP connect or socket configuration failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connect did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The new session refused the stream.
    #[error("session init failed: {0}")]
    Session(#[from] SessionError),
}

/// Opens outbound connections and hands them to new sessions.
#[derive(Debug, Clone, Default)]
pub struct Connector {
    config: ConnectorConfig,
}

impl Connector {
    /// Create a connector.
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Make `parallel` concurrent attempts to `endpoint`.
    ///
    /// Returns the sessions that connected, in completion order.
    pub async fn connect<F>(&self, endpoint: SocketAddr, factory: F) -> Vec<Session>
    where
        F: Fn() -> Session + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let mut attempts = JoinSet::new();
        for attempt in 0..self.config.parallel {
            let factory = Arc::clone(&factory);
            let config = self.config.clone();
            attempts.spawn(async move {
                let result = establish(endpoint, &config, || factory()).await;
                (attempt, result)
            });
        }

        let mut sessions = Vec::with_capacity(self.config.parallel);
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, Ok(session))) => sessions.push(session),
                Ok((attempt, Err(e))) => {
                    tracing::warn!(attempt, %endpoint, "connect failed: {e}");
                }
                Err(e) => tracing::warn!(%endpoint, "connect task aborted: {e}"),
            }
        }
        sessions
    }

    /// Make a single attempt to `endpoint`.
    pub async fn connect_one<F>(&self, endpoint: SocketAddr, factory: F) -> Result<Session, ConnectError>
    where
        F: FnOnce() -> Session,
    {
        establish(endpoint, &self.config, factory)
            .await
            .inspect_err(|e| tracing::warn!(%endpoint, "connect failed: {e}"))
    }
}

async fn establish<F>(
    endpoint: SocketAddr,
    config: &ConnectorConfig,
    factory: F,
) -> Result<Session, ConnectError>
where
    F: FnOnce() -> Session,
{
    let connecting = TcpStream::connect(endpoint);
    let stream = match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| ConnectError::Timeout(limit))??,
        None => connecting.await?,
    };
    configure_stream(&stream, &config.socket)?;

    let session = factory();
    session.init(stream, endpoint)?;
    tracing::info!(session = %session.id(), %endpoint, "session connected");
    session.on_connected();
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolTable;
    use crate::session::{ConnectionState, NoopHandler, SessionConfig};
    use tokio::net::TcpListener;

    fn factory() -> impl Fn() -> Session + Send + Sync + 'static {
        let protocols = Arc::new(ProtocolTable::new());
        move || {
            Session::new(
                Arc::new(NoopHandler),
                Arc::clone(&protocols),
                SessionConfig::default(),
            )
        }
    }

    async fn refused_endpoint() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_parallel_attempts_yield_one_session_each() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut peers = Vec::new();
            for _ in 0..3 {
                peers.push(listener.accept().await.unwrap().0);
            }
            peers
        });

        let connector = Connector::new(ConnectorConfig {
            parallel: 3,
            ..Default::default()
        });
        let sessions = connector.connect(addr, factory()).await;
        let _peers = accept.await.unwrap();

        assert_eq!(sessions.len(), 3);
        for session in &sessions {
            assert_eq!(session.state().current(), ConnectionState::Connected);
            assert_eq!(session.remote_addr(), Some(addr));
        }
        let mut ids: Vec<_> = sessions.iter().map(Session::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_refused_connect_returns_no_sessions() {
        let addr = refused_endpoint().await;
        let connector = Connector::new(ConnectorConfig {
            parallel: 2,
            ..Default::default()
        });
        assert!(connector.connect(addr, factory()).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_one_reports_io_error() {
        let addr = refused_endpoint().await;
        let result = Connector::default().connect_one(addr, factory()).await;
        assert!(matches!(result, Err(ConnectError::Io(_))));
    }

    #[tokio::test]
    async fn test_factory_not_called_when_connect_fails() {
        let addr = refused_endpoint().await;
        let result = Connector::default()
            .connect_one(addr, || -> Session { panic!("factory must not run") })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_one_with_timeout_succeeds_on_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = Connector::new(ConnectorConfig {
            connect_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });

        let session = connector.connect_one(addr, factory()).await.unwrap();
        let _peer = listener.accept().await.unwrap();
        assert_eq!(session.state().current(), ConnectionState::Connected);
    }
}
