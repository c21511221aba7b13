//! History: named checkpoints and rollback.
//!
//! A checkpoint is a full doc payload keyed by (doc, timestamp). Rollback
//! never rewrites the log: it computes a revert update from the current
//! state back to a checkpoint and pushes it through the ordinary write
//! path, so the rollback itself syncs like any other edit.

use async_trait::async_trait;

use crate::crdt;
use crate::error::StorageError;
use crate::pool::ConnectionHandle;
use crate::storage::doc::DocStorage;
use crate::storage::{SpaceScope, StorageKind};
use crate::types::{DocRecord, DocUpdate, HistoryFilter, ListedHistory, Timestamp};

#[async_trait]
pub trait HistoryBackend: Send + Sync + 'static {
    /// Checkpoints of one doc, newest first, narrowed by `filter`.
    async fn list_history(
        &self,
        doc_id: &str,
        filter: Option<HistoryFilter>,
    ) -> Result<Vec<ListedHistory>, StorageError>;

    async fn get_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<Option<DocRecord>, StorageError>;

    /// Store a checkpoint. Writing the same (doc, timestamp) twice is an
    /// overwrite, which keeps retries idempotent.
    async fn create_history(&self, record: &DocRecord) -> Result<(), StorageError>;

    async fn delete_history(&self, doc_id: &str, timestamp: Timestamp)
        -> Result<(), StorageError>;
}

pub struct HistoryStorage {
    scope: SpaceScope,
    backend: Box<dyn HistoryBackend>,
    connection: ConnectionHandle,
}

impl std::fmt::Debug for HistoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStorage")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl HistoryStorage {
    pub fn new(
        scope: SpaceScope,
        backend: impl HistoryBackend,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            scope,
            backend: Box::new(backend),
            connection,
        }
    }

    pub fn kind(&self) -> StorageKind {
        StorageKind::History
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

    pub async fn list_history(
        &self,
        doc_id: &str,
        filter: Option<HistoryFilter>,
    ) -> Result<Vec<ListedHistory>, StorageError> {
        self.backend.list_history(doc_id, filter).await
    }

    pub async fn get_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<Option<DocRecord>, StorageError> {
        self.backend.get_history(doc_id, timestamp).await
    }

    pub async fn delete_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.backend.delete_history(doc_id, timestamp).await
    }

    /// Checkpoint the doc's current merged state.
    ///
    /// Docs that do not exist or hold nothing yet are skipped, so calling
    /// this eagerly after every push is safe. The doc storage is passed in
    /// rather than owned: the composition layer may swap either storage
    /// independently.
    pub async fn create_checkpoint(
        &self,
        docs: &DocStorage,
        doc_id: &str,
    ) -> Result<(), StorageError> {
        let Some(record) = docs.get_doc(doc_id).await? else {
            log::trace!("{}: nothing to checkpoint for {doc_id}", self.scope);
            return Ok(());
        };
        if crdt::is_empty_bin(&record.bin) {
            return Ok(());
        }
        log::debug!(
            "{}: checkpoint {doc_id} @ {}",
            self.scope,
            record.timestamp
        );
        self.backend.create_history(&record).await
    }

    /// Roll the doc back to the checkpoint at `timestamp`.
    ///
    /// The pre-rollback state is checkpointed afterwards, so the rollback
    /// can itself be rolled back.
    pub async fn rollback_doc(
        &self,
        docs: &DocStorage,
        doc_id: &str,
        timestamp: Timestamp,
        editor: Option<String>,
    ) -> Result<(), StorageError> {
        let Some(older) = self.backend.get_history(doc_id, timestamp).await? else {
            return Err(StorageError::HistoryNotFound {
                doc_id: doc_id.to_owned(),
                timestamp,
            });
        };
        let Some(current) = docs.get_doc(doc_id).await? else {
            return Err(StorageError::DocNotFound {
                doc_id: doc_id.to_owned(),
            });
        };

        let revert = crdt::generate_revert_update(&current.bin, &older.bin)?;
        docs.push_doc_update(DocUpdate {
            doc_id: doc_id.to_owned(),
            bin: revert,
            editor,
        })
        .await?;
        self.backend.create_history(&current).await?;
        log::info!("{}: rolled back {doc_id} to {timestamp}", self.scope);
        Ok(())
    }
}
