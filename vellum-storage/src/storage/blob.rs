//! Blob storage: immutable binaries with soft delete.
//!
//! Deletion defaults to a tombstone so other devices referencing the blob
//! keep resolving it until a release pass physically purges. Re-setting a
//! tombstoned key revives it with a fresh created_at.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::pool::ConnectionHandle;
use crate::storage::{SpaceScope, StorageKind};
use crate::types::{BlobRecord, ListedBlobRecord};

#[async_trait]
pub trait BlobBackend: Send + Sync + 'static {
    /// `None` for missing and for tombstoned keys alike.
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, StorageError>;

    /// Store a blob, stamping created_at now. Overwrites and revives
    /// tombstones.
    async fn set_blob(&self, key: &str, data: Vec<u8>, mime: &str) -> Result<(), StorageError>;

    /// Tombstone the key, or remove it outright when `permanently`.
    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), StorageError>;

    /// Physically purge every tombstoned blob.
    async fn release_blobs(&self) -> Result<(), StorageError>;

    /// Metadata of all live (non-tombstoned) blobs.
    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, StorageError>;
}

pub struct BlobStorage {
    scope: SpaceScope,
    backend: Box<dyn BlobBackend>,
    connection: ConnectionHandle,
}

impl std::fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl BlobStorage {
    pub fn new(
        scope: SpaceScope,
        backend: impl BlobBackend,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            scope,
            backend: Box::new(backend),
            connection,
        }
    }

    pub fn kind(&self) -> StorageKind {
        StorageKind::Blob
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

    pub async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        self.backend.get_blob(key).await
    }

    pub async fn set_blob(
        &self,
        key: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<(), StorageError> {
        log::trace!("{}: set blob {key} ({} bytes)", self.scope, data.len());
        self.backend.set_blob(key, data, mime).await
    }

    pub async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        self.backend.delete_blob(key, permanently).await
    }

    pub async fn release_blobs(&self) -> Result<(), StorageError> {
        self.backend.release_blobs().await
    }

    pub async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        self.backend.list_blobs().await
    }
}
