//! Connection lifecycle shared by every backend.
//!
//! A backend implements the two primitives (`do_connect`, `do_disconnect`);
//! the provided methods add idempotent transitions and status fan-out.
//! Status lives in a watch channel so any number of observers can follow
//! `idle -> connecting -> connected -> closed` without polling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status value plus the error message that produced it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

/// Shared state cell every connection carries.
///
/// Clones share the same underlying cell, so background I/O tasks can keep
/// reporting status after the owning call returned.
#[derive(Clone)]
pub struct ConnectionState {
    status: Arc<watch::Sender<StatusEvent>>,
    attempt: Arc<Mutex<()>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StatusEvent {
            status: ConnectionStatus::Idle,
            error: None,
        });
        Self {
            status: Arc::new(status),
            attempt: Arc::new(Mutex::new(())),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().status
    }

    pub fn set(&self, status: ConnectionStatus, error: Option<String>) {
        let next = StatusEvent { status, error };
        if *self.status.borrow() != next {
            self.status.send_replace(next);
        }
    }

    pub fn watch(&self) -> watch::Receiver<StatusEvent> {
        self.status.subscribe()
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle contract every backend connection implements.
///
/// Concurrent `connect` calls queue on the attempt mutex and adopt the
/// winner's outcome instead of dialing twice. `disconnect` of an already
/// closed connection is a no-op.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Identity the pool shares one physical resource under.
    fn share_id(&self) -> String;

    fn state(&self) -> &ConnectionState;

    async fn do_connect(&self) -> Result<(), StorageError>;

    async fn do_disconnect(&self) -> Result<(), StorageError>;

    fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    fn watch_status(&self) -> watch::Receiver<StatusEvent> {
        self.state().watch()
    }

    async fn connect(&self) -> Result<(), StorageError> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        let state = self.state().clone();
        let _attempt = state.attempt.lock().await;
        if state.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        state.set(ConnectionStatus::Connecting, None);
        log::debug!("connecting {}", self.share_id());
        match self.do_connect().await {
            Ok(()) => {
                state.set(ConnectionStatus::Connected, None);
                log::info!("connected {}", self.share_id());
                Ok(())
            }
            Err(err) => {
                state.set(ConnectionStatus::Error, Some(err.to_string()));
                log::warn!("connect failed for {}: {err}", self.share_id());
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let state = self.state().clone();
        let _attempt = state.attempt.lock().await;
        if matches!(
            state.status(),
            ConnectionStatus::Idle | ConnectionStatus::Closed
        ) {
            return Ok(());
        }
        log::debug!("disconnecting {}", self.share_id());
        match self.do_disconnect().await {
            Ok(()) => {
                state.set(ConnectionStatus::Closed, None);
                Ok(())
            }
            Err(err) => {
                state.set(ConnectionStatus::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowConnection {
        state: ConnectionState,
        dials: AtomicUsize,
        hangups: AtomicUsize,
        fail: bool,
    }

    impl SlowConnection {
        fn new(fail: bool) -> Self {
            Self {
                state: ConnectionState::new(),
                dials: AtomicUsize::new(0),
                hangups: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Connection for SlowConnection {
        fn share_id(&self) -> String {
            "test:slow".to_owned()
        }

        fn state(&self) -> &ConnectionState {
            &self.state
        }

        async fn do_connect(&self) -> Result<(), StorageError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                Err(StorageError::ConnectFailed {
                    message: "refused".to_owned(),
                })
            } else {
                Ok(())
            }
        }

        async fn do_disconnect(&self) -> Result<(), StorageError> {
            self.hangups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_connects_dial_once() {
        let conn = Arc::new(SlowConnection::new(false));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move { conn.connect().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(conn.dials.load(Ordering::SeqCst), 1);
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let conn = SlowConnection::new(false);
        conn.connect().await.unwrap();
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.hangups.load(Ordering::SeqCst), 1);
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_error_status() {
        let conn = SlowConnection::new(true);
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, StorageError::ConnectFailed { .. }));
        let event = conn.watch_status().borrow().clone();
        assert_eq!(event.status, ConnectionStatus::Error);
        assert_eq!(event.error.as_deref(), Some("connect failed: refused"));
    }

    #[tokio::test]
    async fn test_status_transitions_are_observable() {
        let conn = Arc::new(SlowConnection::new(false));
        let mut watcher = conn.watch_status();
        assert_eq!(watcher.borrow_and_update().status, ConnectionStatus::Idle);

        let connecting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect().await })
        };

        let mut seen = Vec::new();
        while watcher.changed().await.is_ok() {
            let status = watcher.borrow_and_update().status;
            seen.push(status);
            if status == ConnectionStatus::Connected {
                break;
            }
        }
        connecting.await.unwrap().unwrap();
        assert_eq!(
            seen,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let conn = SlowConnection::new(false);
        conn.connect().await.unwrap();
        conn.disconnect().await.unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.dials.load(Ordering::SeqCst), 2);
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }
}
