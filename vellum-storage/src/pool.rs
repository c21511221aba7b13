//! Reference-counted connection sharing.
//!
//! Several logical storages usually sit on one physical resource: the four
//! storage kinds of a local space share one RocksDB directory, a remote
//! space's doc and blob storages share one socket. The pool hands out
//! handles keyed by the connection's share id and only tears the resource
//! down when the last handle lets go.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::connection::{Connection, ConnectionStatus, StatusEvent};
use crate::error::StorageError;

struct PoolEntry {
    conn: Arc<dyn Connection>,
    refs: usize,
}

#[derive(Default)]
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the shared connection for `share_id`, creating it with `make`
    /// on first use. Every acquire must be balanced by a handle disconnect.
    pub async fn acquire<F>(self: &Arc<Self>, share_id: &str, make: F) -> ConnectionHandle
    where
        F: FnOnce() -> Arc<dyn Connection>,
    {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(share_id.to_owned())
            .or_insert_with(|| PoolEntry {
                conn: make(),
                refs: 0,
            });
        entry.refs += 1;
        log::debug!("pool acquire {share_id} (refs {})", entry.refs);
        ConnectionHandle {
            conn: entry.conn.clone(),
            pool: Arc::clone(self),
            share_id: share_id.to_owned(),
            released: AtomicBool::new(false),
        }
    }

    /// Drop one reference. Returns the connection when the last sharer left
    /// so the caller can physically disconnect it.
    async fn release(&self, share_id: &str) -> Option<Arc<dyn Connection>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(share_id)?;
        entry.refs = entry.refs.saturating_sub(1);
        log::debug!("pool release {share_id} (refs {})", entry.refs);
        if entry.refs == 0 {
            entries.remove(share_id).map(|entry| entry.conn)
        } else {
            None
        }
    }

    /// Number of live pooled connections.
    pub async fn active(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Reference count of one entry, zero when absent.
    pub async fn refs(&self, share_id: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(share_id)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }
}

/// One storage's grip on a pooled connection.
pub struct ConnectionHandle {
    conn: Arc<dyn Connection>,
    pool: Arc<ConnectionPool>,
    share_id: String,
    released: AtomicBool,
}

impl ConnectionHandle {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusEvent> {
        self.conn.watch_status()
    }

    pub async fn connect(&self) -> Result<(), StorageError> {
        self.conn.connect().await
    }

    /// Release this sharer. The physical disconnect happens only when this
    /// was the last handle on the connection; repeated calls are no-ops.
    pub async fn disconnect(&self) -> Result<(), StorageError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.pool.release(&self.share_id).await {
            Some(last) => last.disconnect().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use async_trait::async_trait;

    struct FakeConnection {
        state: ConnectionState,
        id: String,
    }

    impl FakeConnection {
        fn shared(id: &str) -> Arc<dyn Connection> {
            Arc::new(Self {
                state: ConnectionState::new(),
                id: id.to_owned(),
            })
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        fn share_id(&self) -> String {
            self.id.clone()
        }

        fn state(&self) -> &ConnectionState {
            &self.state
        }

        async fn do_connect(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn do_disconnect(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_same_share_id_reuses_the_connection() {
        let pool = Arc::new(ConnectionPool::new());
        let first = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        let second = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(pool.active().await, 1);
        assert_eq!(pool.refs("db:a").await, 2);
    }

    #[tokio::test]
    async fn test_distinct_share_ids_get_distinct_connections() {
        let pool = Arc::new(ConnectionPool::new());
        let a = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        let b = pool.acquire("db:b", || FakeConnection::shared("db:b")).await;
        assert!(!Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(pool.active().await, 2);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_last_sharer() {
        let pool = Arc::new(ConnectionPool::new());
        let first = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        let second = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        first.connect().await.unwrap();

        first.disconnect().await.unwrap();
        assert_eq!(second.status(), ConnectionStatus::Connected);
        assert_eq!(pool.refs("db:a").await, 1);

        second.disconnect().await.unwrap();
        assert_eq!(second.status(), ConnectionStatus::Closed);
        assert_eq!(pool.active().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_disconnect_releases_once() {
        let pool = Arc::new(ConnectionPool::new());
        let first = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        let second = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        first.connect().await.unwrap();

        first.disconnect().await.unwrap();
        first.disconnect().await.unwrap();
        first.disconnect().await.unwrap();
        // The duplicate calls must not steal the second handle's reference.
        assert_eq!(pool.refs("db:a").await, 1);
        assert_eq!(second.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_reacquire_after_drain_builds_fresh_connection() {
        let pool = Arc::new(ConnectionPool::new());
        let first = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        let old = first.connection().clone();
        first.disconnect().await.unwrap();

        let second = pool.acquire("db:a", || FakeConnection::shared("db:a")).await;
        assert!(!Arc::ptr_eq(&old, second.connection()));
    }
}
