//! Remote space storage over WebSocket.
//!
//! The server owns the merge: a push is acked with the doc's new clock and
//! `get_doc_snapshot` returns the server's already-merged record. The local
//! merge machinery therefore degenerates cleanly — there are never pending
//! updates to squash and no snapshot to write back. Deletion stays a local
//! concern; see `delete_doc`.
//!
//! Remote spaces expose doc and blob storage only. Sync metadata and
//! history checkpoints live in the peer's local stores.

pub mod socket;

pub use socket::{RemoteConfig, RemoteConnection, SpaceRequest, SpaceResponse, WireMessage};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::connection::Connection;
use crate::error::StorageError;
use crate::lock::LockManager;
use crate::pool::ConnectionPool;
use crate::storage::{BlobBackend, BlobStorage, DocBackend, DocStorage};
use crate::types::{
    BlobRecord, DocClock, DocClocks, DocRecord, DocUpdate, ListedBlobRecord, Timestamp,
};

fn unexpected(op: &str) -> StorageError {
    StorageError::UnexpectedResponse { op: op.to_owned() }
}

fn expect_doc(op: &str, response: SpaceResponse) -> Result<Option<DocRecord>, StorageError> {
    match response {
        SpaceResponse::Doc(doc) => Ok(doc),
        _ => Err(unexpected(op)),
    }
}

fn expect_clock(op: &str, response: SpaceResponse) -> Result<DocClock, StorageError> {
    match response {
        SpaceResponse::Clock(clock) => Ok(clock),
        _ => Err(unexpected(op)),
    }
}

fn expect_timestamps(op: &str, response: SpaceResponse) -> Result<DocClocks, StorageError> {
    match response {
        SpaceResponse::Timestamps(clocks) => Ok(clocks),
        _ => Err(unexpected(op)),
    }
}

fn expect_blob(op: &str, response: SpaceResponse) -> Result<Option<BlobRecord>, StorageError> {
    match response {
        SpaceResponse::Blob(blob) => Ok(blob),
        _ => Err(unexpected(op)),
    }
}

fn expect_blobs(op: &str, response: SpaceResponse) -> Result<Vec<ListedBlobRecord>, StorageError> {
    match response {
        SpaceResponse::Blobs(blobs) => Ok(blobs),
        _ => Err(unexpected(op)),
    }
}

fn expect_unit(op: &str, response: SpaceResponse) -> Result<(), StorageError> {
    match response {
        SpaceResponse::Unit => Ok(()),
        _ => Err(unexpected(op)),
    }
}

pub struct RemoteDocBackend {
    conn: Arc<RemoteConnection>,
}

impl RemoteDocBackend {
    pub fn new(conn: Arc<RemoteConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DocBackend for RemoteDocBackend {
    async fn push_doc_update(&self, update: &DocUpdate) -> Result<DocClock, StorageError> {
        let response = self
            .conn
            .request(SpaceRequest::PushDocUpdate {
                doc_id: update.doc_id.clone(),
                bin: update.bin.clone(),
                editor: update.editor.clone(),
            })
            .await?;
        expect_clock("push_doc_update", response)
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let response = self
            .conn
            .request(SpaceRequest::GetDoc {
                doc_id: doc_id.to_owned(),
            })
            .await?;
        expect_doc("get_doc", response)
    }

    // The server's doc is the snapshot. There is nothing to write back.
    async fn set_doc_snapshot(&self, _snapshot: &DocRecord) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn get_doc_updates(&self, _doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        Ok(Vec::new())
    }

    async fn mark_updates_merged(
        &self,
        _doc_id: &str,
        _timestamps: &[Timestamp],
    ) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        let response = self
            .conn
            .request(SpaceRequest::GetDocTimestamps { after })
            .await?;
        expect_timestamps("get_doc_timestamps", response)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        // Deleting server-side data is an account-level action, not a sync
        // call. Local stores honor the delete; the remote mirror ignores it.
        log::warn!("delete_doc({doc_id}) ignored on remote storage");
        Ok(())
    }

    fn update_stream(&self) -> Option<broadcast::Receiver<DocRecord>> {
        Some(self.conn.subscribe_updates())
    }
}

pub struct RemoteBlobBackend {
    conn: Arc<RemoteConnection>,
}

impl RemoteBlobBackend {
    pub fn new(conn: Arc<RemoteConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BlobBackend for RemoteBlobBackend {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        let response = self
            .conn
            .request(SpaceRequest::GetBlob {
                key: key.to_owned(),
            })
            .await?;
        expect_blob("get_blob", response)
    }

    async fn set_blob(&self, key: &str, data: Vec<u8>, mime: &str) -> Result<(), StorageError> {
        let response = self
            .conn
            .request(SpaceRequest::SetBlob {
                key: key.to_owned(),
                data,
                mime: mime.to_owned(),
            })
            .await?;
        expect_unit("set_blob", response)
    }

    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        let response = self
            .conn
            .request(SpaceRequest::DeleteBlob {
                key: key.to_owned(),
                permanently,
            })
            .await?;
        expect_unit("delete_blob", response)
    }

    async fn release_blobs(&self) -> Result<(), StorageError> {
        let response = self.conn.request(SpaceRequest::ReleaseBlobs).await?;
        expect_unit("release_blobs", response)
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        let response = self.conn.request(SpaceRequest::ListBlobs).await?;
        expect_blobs("list_blobs", response)
    }
}

/// Build the doc and blob storages of one remote space, sharing one pooled
/// socket. The returned storages are not yet connected.
pub async fn open_remote_space(
    config: RemoteConfig,
    locks: Arc<LockManager>,
    pool: &Arc<ConnectionPool>,
) -> Result<(DocStorage, BlobStorage), StorageError> {
    let scope = config.scope.clone();
    let conn = Arc::new(RemoteConnection::new(config));
    let share_id = conn.share_id();
    let as_dyn: Arc<dyn Connection> = conn.clone();

    let docs_handle = {
        let c = as_dyn.clone();
        pool.acquire(&share_id, move || c).await
    };
    if !Arc::ptr_eq(docs_handle.connection(), &as_dyn) {
        docs_handle.disconnect().await?;
        return Err(StorageError::ConnectFailed {
            message: format!("{share_id} is already open"),
        });
    }
    let blobs_handle = pool.acquire(&share_id, move || as_dyn).await;

    Ok((
        DocStorage::new(
            scope.clone(),
            RemoteDocBackend::new(conn.clone()),
            locks,
            docs_handle,
        ),
        BlobStorage::new(scope, RemoteBlobBackend::new(conn), blobs_handle),
    ))
}
