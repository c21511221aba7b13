//! Sync metadata: per-peer clock bookkeeping.
//!
//! For every (peer, doc) pair two clocks are tracked: `clock` is the latest
//! timestamp received from that peer, `pushed` the latest sent to it. A
//! sync orchestrator reads them to resume where it left off; losing them is
//! harmless and merely forces a full re-sync, which is exactly what
//! `clear_clocks` exploits.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::pool::ConnectionHandle;
use crate::storage::{SpaceScope, StorageKind};
use crate::types::{DocClocks, Timestamp};

#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    /// Received-clock of every doc known for `peer`. Pairs whose received
    /// half was never written report 0.
    async fn get_peer_clocks(&self, peer: &str) -> Result<DocClocks, StorageError>;

    /// Record a received clock. Monotone: stale writes are ignored.
    async fn set_peer_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError>;

    /// Pushed-clock of every doc known for `peer`.
    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks, StorageError>;

    /// Record a pushed clock. Monotone: stale writes are ignored.
    async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError>;

    /// Drop all peer bookkeeping for this space.
    async fn clear_clocks(&self) -> Result<(), StorageError>;
}

pub struct SyncStorage {
    scope: SpaceScope,
    backend: Box<dyn SyncBackend>,
    connection: ConnectionHandle,
}

impl std::fmt::Debug for SyncStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStorage")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl SyncStorage {
    pub fn new(
        scope: SpaceScope,
        backend: impl SyncBackend,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            scope,
            backend: Box::new(backend),
            connection,
        }
    }

    pub fn kind(&self) -> StorageKind {
        StorageKind::Sync
    }

    pub fn scope(&self) -> &SpaceScope {
        &self.scope
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub async fn connect(&self) -> Result<(), StorageError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), StorageError> {
        self.connection.disconnect().await
    }

    pub async fn get_peer_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        self.backend.get_peer_clocks(peer).await
    }

    pub async fn set_peer_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.backend.set_peer_clock(peer, doc_id, timestamp).await
    }

    pub async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        self.backend.get_peer_pushed_clocks(peer).await
    }

    pub async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.backend
            .set_peer_pushed_clock(peer, doc_id, timestamp)
            .await
    }

    pub async fn clear_clocks(&self) -> Result<(), StorageError> {
        log::info!("{}: clearing peer clocks", self.scope);
        self.backend.clear_clocks().await
    }
}
