//! Async facade over [`Connection`]
//!
//! Transactions run on tokio's blocking pool. The connection sits behind a
//! `tokio::sync::Mutex`, so clones of one handle still perform one exchange
//! at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{ChunkObserver, Connection, ConnectionConfig, ProtocolError};

fn join_error(e: tokio::task::JoinError) -> ProtocolError {
    ProtocolError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("blocking task failed: {}", e),
    ))
}

/// Cloneable async handle to a reader connection
#[derive(Clone)]
pub struct AsyncConnection {
    inner: Arc<Mutex<Connection>>,
}

impl From<Connection> for AsyncConnection {
    fn from(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }
}

impl AsyncConnection {
    /// Open and handshake without blocking the runtime
    pub async fn connect(
        config: ConnectionConfig,
        observer: Option<ChunkObserver>,
    ) -> Result<Self, ProtocolError> {
        let conn = tokio::task::spawn_blocking(move || {
            Connection::connect_with_observer(config, observer)
        })
        .await
        .map_err(join_error)??;
        Ok(conn.into())
    }

    /// Async [`Connection::send_receive`]
    pub async fn send_receive(&self, message: impl Into<String>) -> Result<String, ProtocolError> {
        let message = message.into();
        let mut conn = self.inner.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || conn.send_receive(message))
            .await
            .map_err(join_error)?
    }

    /// Async [`Connection::send_receive_timeout`]
    pub async fn send_receive_timeout(
        &self,
        message: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let message = message.into();
        let mut conn = self.inner.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || conn.send_receive_timeout(message, timeout))
            .await
            .map_err(join_error)?
    }

    /// Close the connection if this is the last handle. Otherwise the
    /// connection closes when the last clone is dropped.
    pub async fn close(self) -> Result<(), ProtocolError> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                let conn = mutex.into_inner();
                tokio::task::spawn_blocking(move || conn.close())
                    .await
                    .map_err(join_error)?
            }
            Err(_) => {
                tracing::debug!("close requested while other handles are alive");
                Ok(())
            }
        }
    }
}
