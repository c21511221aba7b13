//! Composition layer: one handler owning the storages of a peer, and the
//! typed client fronting it across the bridge.
//!
//! The backend holds at most one storage per kind, swappable at runtime.
//! Replacing a storage does not tear the old one down immediately; it is
//! queued and disconnected on the next connect or disconnect pass, after
//! the replacement is already serving.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::select_all;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::backend::SpaceStorages;
use crate::connection::StatusEvent;
use crate::error::StorageError;
use crate::op::{
    BridgeConfig, OpConsumer, OpEvent, OpHandler, OpOutput, OpProducer, OpRequest,
    SubscribeRequest, Subscription, SubscriptionItem, SubscriptionSink,
};
use crate::storage::{BlobStorage, DocStorage, HistoryStorage, StorageKind, SyncStorage};
use crate::types::{
    BlobRecord, DocClock, DocClocks, DocDiff, DocRecord, DocUpdate, HistoryFilter,
    ListedBlobRecord, ListedHistory, Timestamp,
};

/// One composed storage of any kind, for lifecycle passes.
enum AnyStorage {
    Doc(Arc<DocStorage>),
    Blob(Arc<BlobStorage>),
    Sync(Arc<SyncStorage>),
    History(Arc<HistoryStorage>),
}

impl AnyStorage {
    fn kind(&self) -> StorageKind {
        match self {
            AnyStorage::Doc(_) => StorageKind::Doc,
            AnyStorage::Blob(_) => StorageKind::Blob,
            AnyStorage::Sync(_) => StorageKind::Sync,
            AnyStorage::History(_) => StorageKind::History,
        }
    }

    fn watch_status(&self) -> watch::Receiver<StatusEvent> {
        match self {
            AnyStorage::Doc(s) => s.connection().watch_status(),
            AnyStorage::Blob(s) => s.connection().watch_status(),
            AnyStorage::Sync(s) => s.connection().watch_status(),
            AnyStorage::History(s) => s.connection().watch_status(),
        }
    }

    async fn connect(&self) -> Result<(), StorageError> {
        match self {
            AnyStorage::Doc(s) => s.connect().await,
            AnyStorage::Blob(s) => s.connect().await,
            AnyStorage::Sync(s) => s.connect().await,
            AnyStorage::History(s) => s.connect().await,
        }
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        match self {
            AnyStorage::Doc(s) => s.disconnect().await,
            AnyStorage::Blob(s) => s.disconnect().await,
            AnyStorage::Sync(s) => s.disconnect().await,
            AnyStorage::History(s) => s.disconnect().await,
        }
    }
}

#[derive(Default)]
struct Slots {
    docs: Option<Arc<DocStorage>>,
    blobs: Option<Arc<BlobStorage>>,
    sync: Option<Arc<SyncStorage>>,
    history: Option<Arc<HistoryStorage>>,
    /// Swapped out but not yet disconnected.
    replaced: Vec<AnyStorage>,
}

/// Consumer-side owner of one peer's storages.
///
/// Dispatches bridge ops to the composed storages. Ops addressed at a kind
/// with nothing composed fail with [`StorageError::UnhandledOp`].
#[derive(Default)]
pub struct PeerStorageBackend {
    slots: RwLock<Slots>,
}

impl PeerStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_doc_storage(&self, storage: DocStorage) {
        let mut slots = self.slots.write().await;
        if let Some(old) = slots.docs.replace(Arc::new(storage)) {
            slots.replaced.push(AnyStorage::Doc(old));
        }
    }

    pub async fn add_blob_storage(&self, storage: BlobStorage) {
        let mut slots = self.slots.write().await;
        if let Some(old) = slots.blobs.replace(Arc::new(storage)) {
            slots.replaced.push(AnyStorage::Blob(old));
        }
    }

    pub async fn add_sync_storage(&self, storage: SyncStorage) {
        let mut slots = self.slots.write().await;
        if let Some(old) = slots.sync.replace(Arc::new(storage)) {
            slots.replaced.push(AnyStorage::Sync(old));
        }
    }

    pub async fn add_history_storage(&self, storage: HistoryStorage) {
        let mut slots = self.slots.write().await;
        if let Some(old) = slots.history.replace(Arc::new(storage)) {
            slots.replaced.push(AnyStorage::History(old));
        }
    }

    /// Compose all four storages of a local space at once.
    pub async fn add_space(&self, space: SpaceStorages) {
        self.add_doc_storage(space.docs).await;
        self.add_blob_storage(space.blobs).await;
        self.add_sync_storage(space.sync).await;
        self.add_history_storage(space.history).await;
    }

    async fn docs(&self, op: &str) -> Result<Arc<DocStorage>, StorageError> {
        self.slots
            .read()
            .await
            .docs
            .clone()
            .ok_or_else(|| unhandled(op))
    }

    async fn blobs(&self, op: &str) -> Result<Arc<BlobStorage>, StorageError> {
        self.slots
            .read()
            .await
            .blobs
            .clone()
            .ok_or_else(|| unhandled(op))
    }

    async fn sync(&self, op: &str) -> Result<Arc<SyncStorage>, StorageError> {
        self.slots
            .read()
            .await
            .sync
            .clone()
            .ok_or_else(|| unhandled(op))
    }

    async fn history(&self, op: &str) -> Result<Arc<HistoryStorage>, StorageError> {
        self.slots
            .read()
            .await
            .history
            .clone()
            .ok_or_else(|| unhandled(op))
    }

    async fn composed(&self) -> Vec<AnyStorage> {
        let slots = self.slots.read().await;
        let mut out = Vec::new();
        if let Some(s) = &slots.docs {
            out.push(AnyStorage::Doc(s.clone()));
        }
        if let Some(s) = &slots.blobs {
            out.push(AnyStorage::Blob(s.clone()));
        }
        if let Some(s) = &slots.sync {
            out.push(AnyStorage::Sync(s.clone()));
        }
        if let Some(s) = &slots.history {
            out.push(AnyStorage::History(s.clone()));
        }
        out
    }

    /// Connect every composed storage, then tear down replaced ones.
    ///
    /// Failures are logged and do not stop the pass; per-storage health is
    /// what the connection-status subscription reports.
    async fn connect_all(&self) {
        for storage in self.composed().await {
            if let Err(err) = storage.connect().await {
                log::warn!("{} storage connect failed: {err}", storage.kind());
            }
        }
        self.drain_replaced().await;
    }

    async fn disconnect_all(&self) {
        for storage in self.composed().await {
            if let Err(err) = storage.disconnect().await {
                log::warn!("{} storage disconnect failed: {err}", storage.kind());
            }
        }
        self.drain_replaced().await;
    }

    async fn drain_replaced(&self) {
        let replaced = std::mem::take(&mut self.slots.write().await.replaced);
        for storage in replaced {
            if let Err(err) = storage.disconnect().await {
                log::warn!(
                    "replaced {} storage disconnect failed: {err}",
                    storage.kind()
                );
            }
        }
    }

    async fn destroy(&self) {
        self.disconnect_all().await;
        *self.slots.write().await = Slots::default();
    }

    /// Checkpoint one doc, provided both a doc and a history storage are
    /// composed. Peers without history simply skip.
    async fn checkpoint_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let (docs, history) = {
            let slots = self.slots.read().await;
            (slots.docs.clone(), slots.history.clone())
        };
        let (Some(docs), Some(history)) = (docs, history) else {
            return Ok(());
        };
        history.create_checkpoint(&docs, doc_id).await
    }

    async fn status_watchers(&self) -> Vec<(StorageKind, watch::Receiver<StatusEvent>)> {
        self.composed()
            .await
            .into_iter()
            .map(|storage| (storage.kind(), storage.watch_status()))
            .collect()
    }
}

#[async_trait]
impl OpHandler for PeerStorageBackend {
    async fn handle(&self, op: OpRequest) -> Result<OpOutput, StorageError> {
        match op {
            OpRequest::GetDoc { doc_id } => {
                let docs = self.docs("get_doc").await?;
                Ok(OpOutput::Doc(docs.get_doc(&doc_id).await?))
            }
            OpRequest::GetDocDiff { doc_id, state } => {
                let docs = self.docs("get_doc_diff").await?;
                Ok(OpOutput::Diff(
                    docs.get_doc_diff(&doc_id, state.as_deref()).await?,
                ))
            }
            OpRequest::PushDocUpdate(update) => {
                let docs = self.docs("push_doc_update").await?;
                Ok(OpOutput::Clock(docs.push_doc_update(update).await?))
            }
            OpRequest::GetDocTimestamps { after } => {
                let docs = self.docs("get_doc_timestamps").await?;
                Ok(OpOutput::Clocks(docs.get_doc_timestamps(after).await?))
            }
            OpRequest::DeleteDoc { doc_id } => {
                let docs = self.docs("delete_doc").await?;
                docs.delete_doc(&doc_id).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::ListHistory { doc_id, filter } => {
                let history = self.history("list_history").await?;
                Ok(OpOutput::Histories(
                    history.list_history(&doc_id, filter).await?,
                ))
            }
            OpRequest::GetHistory { doc_id, timestamp } => {
                let history = self.history("get_history").await?;
                Ok(OpOutput::Doc(history.get_history(&doc_id, timestamp).await?))
            }
            OpRequest::CreateHistory { doc_id } => {
                let history = self.history("create_history").await?;
                let docs = self.docs("create_history").await?;
                history.create_checkpoint(&docs, &doc_id).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::DeleteHistory { doc_id, timestamp } => {
                let history = self.history("delete_history").await?;
                history.delete_history(&doc_id, timestamp).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::RollbackDoc {
                doc_id,
                timestamp,
                editor,
            } => {
                let history = self.history("rollback_doc").await?;
                let docs = self.docs("rollback_doc").await?;
                history.rollback_doc(&docs, &doc_id, timestamp, editor).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::GetBlob { key } => {
                let blobs = self.blobs("get_blob").await?;
                Ok(OpOutput::Blob(blobs.get_blob(&key).await?))
            }
            OpRequest::SetBlob { key, data, mime } => {
                let blobs = self.blobs("set_blob").await?;
                blobs.set_blob(&key, data, &mime).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::DeleteBlob { key, permanently } => {
                let blobs = self.blobs("delete_blob").await?;
                blobs.delete_blob(&key, permanently).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::ReleaseBlobs => {
                let blobs = self.blobs("release_blobs").await?;
                blobs.release_blobs().await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::ListBlobs => {
                let blobs = self.blobs("list_blobs").await?;
                Ok(OpOutput::Blobs(blobs.list_blobs().await?))
            }
            OpRequest::GetPeerClocks { peer } => {
                let sync = self.sync("get_peer_clocks").await?;
                Ok(OpOutput::Clocks(sync.get_peer_clocks(&peer).await?))
            }
            OpRequest::SetPeerClock {
                peer,
                doc_id,
                timestamp,
            } => {
                let sync = self.sync("set_peer_clock").await?;
                sync.set_peer_clock(&peer, &doc_id, timestamp).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::GetPeerPushedClocks { peer } => {
                let sync = self.sync("get_peer_pushed_clocks").await?;
                Ok(OpOutput::Clocks(sync.get_peer_pushed_clocks(&peer).await?))
            }
            OpRequest::SetPeerPushedClock {
                peer,
                doc_id,
                timestamp,
            } => {
                let sync = self.sync("set_peer_pushed_clock").await?;
                sync.set_peer_pushed_clock(&peer, &doc_id, timestamp).await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::ClearPeerClocks => {
                let sync = self.sync("clear_peer_clocks").await?;
                sync.clear_clocks().await?;
                Ok(OpOutput::Unit)
            }
            OpRequest::Connect => {
                self.connect_all().await;
                Ok(OpOutput::Unit)
            }
            OpRequest::Disconnect => {
                self.disconnect_all().await;
                Ok(OpOutput::Unit)
            }
            OpRequest::Destroy => {
                self.destroy().await;
                Ok(OpOutput::Unit)
            }
        }
    }

    async fn subscribe(
        &self,
        op: SubscribeRequest,
        sink: SubscriptionSink,
    ) -> Result<JoinHandle<()>, StorageError> {
        match op {
            SubscribeRequest::DocUpdate => {
                let docs = self.docs(op.name()).await?;
                // Local backends have no self-originated stream; the
                // subscription then simply never yields.
                let stream = docs.subscribe_updates();
                Ok(tokio::spawn(async move {
                    let Some(mut stream) = stream else { return };
                    forward_doc_updates(&mut stream, &sink).await;
                }))
            }
            SubscribeRequest::ConnectionStatus => {
                let watchers = self.status_watchers().await;
                Ok(tokio::spawn(async move {
                    forward_statuses(watchers, &sink).await;
                }))
            }
        }
    }
}

fn unhandled(op: &str) -> StorageError {
    StorageError::UnhandledOp { name: op.to_owned() }
}

async fn forward_doc_updates(
    stream: &mut broadcast::Receiver<DocRecord>,
    sink: &SubscriptionSink,
) {
    loop {
        match stream.recv().await {
            Ok(record) => {
                if sink.push(SubscriptionItem::DocUpdate(record)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("doc update subscription lagged, {missed} updates skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Fan the status watchers of every composed storage into one stream.
///
/// The current status of each storage is pushed first, then one item per
/// change. Watch channels coalesce, so rapid transitions may collapse into
/// the latest value.
async fn forward_statuses(
    mut watchers: Vec<(StorageKind, watch::Receiver<StatusEvent>)>,
    sink: &SubscriptionSink,
) {
    for (kind, watcher) in &mut watchers {
        let event = watcher.borrow_and_update().clone();
        if push_status(sink, *kind, event).await.is_err() {
            return;
        }
    }
    while !watchers.is_empty() {
        let changes = watchers
            .iter_mut()
            .map(|(kind, watcher)| {
                let kind = *kind;
                Box::pin(async move { watcher.changed().await.map(|_| kind) })
            })
            .collect::<Vec<_>>();
        let (outcome, index, _) = select_all(changes).await;
        match outcome {
            Ok(kind) => {
                let event = watchers[index].1.borrow_and_update().clone();
                if push_status(sink, kind, event).await.is_err() {
                    return;
                }
            }
            // The storage behind this watcher is gone.
            Err(_) => {
                watchers.remove(index);
            }
        }
    }
}

async fn push_status(
    sink: &SubscriptionSink,
    kind: StorageKind,
    event: StatusEvent,
) -> Result<(), StorageError> {
    sink.push(SubscriptionItem::Status {
        kind,
        status: event.status,
        error: event.error,
    })
    .await
}

/// Typed caller surface over the bridge.
///
/// Owns the whole in-process bridge: dropping the client tears down the
/// producer reader, the consumer loop, and the checkpoint task.
pub struct PeerStorageClient {
    producer: OpProducer,
    _consumer: OpConsumer,
    checkpoint: JoinHandle<()>,
}

/// Wire `backend` to a fresh bridge.
///
/// Spawns the consumer loop and the history auto-checkpoint task, and
/// returns the typed client fronting both.
pub fn connect_peer_storage(
    backend: PeerStorageBackend,
    config: &BridgeConfig,
) -> PeerStorageClient {
    let backend = Arc::new(backend);
    let (to_consumer, consumer_inbound) = mpsc::channel(config.channel_capacity);
    let (consumer_outbound, to_producer) = mpsc::channel(config.channel_capacity);
    let producer = OpProducer::new(to_consumer, to_producer, config);
    let consumer = OpConsumer::spawn(
        consumer_inbound,
        consumer_outbound,
        backend.clone(),
        config,
    );
    let checkpoint = tokio::spawn(checkpoint_loop(consumer.events(), backend));
    PeerStorageClient {
        producer,
        _consumer: consumer,
        checkpoint,
    }
}

/// Checkpoint every doc a push touches.
///
/// Fire and forget: a failed checkpoint is logged and never surfaces to the
/// push that triggered it.
async fn checkpoint_loop(
    mut events: broadcast::Receiver<OpEvent>,
    backend: Arc<PeerStorageBackend>,
) {
    loop {
        match events.recv().await {
            Ok(OpEvent::DocUpdatePushed { doc_id, .. }) => {
                if let Err(err) = backend.checkpoint_doc(&doc_id).await {
                    log::warn!("auto checkpoint of {doc_id} failed: {err}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("checkpoint task lagged, {missed} push events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl PeerStorageClient {
    pub async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        match self
            .producer
            .send(OpRequest::GetDoc {
                doc_id: doc_id.to_owned(),
            })
            .await?
        {
            OpOutput::Doc(doc) => Ok(doc),
            _ => Err(unexpected("get_doc")),
        }
    }

    pub async fn get_doc_diff(
        &self,
        doc_id: &str,
        state: Option<Vec<u8>>,
    ) -> Result<Option<DocDiff>, StorageError> {
        match self
            .producer
            .send(OpRequest::GetDocDiff {
                doc_id: doc_id.to_owned(),
                state,
            })
            .await?
        {
            OpOutput::Diff(diff) => Ok(diff),
            _ => Err(unexpected("get_doc_diff")),
        }
    }

    pub async fn push_doc_update(&self, update: DocUpdate) -> Result<DocClock, StorageError> {
        match self.producer.send(OpRequest::PushDocUpdate(update)).await? {
            OpOutput::Clock(clock) => Ok(clock),
            _ => Err(unexpected("push_doc_update")),
        }
    }

    pub async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        self.send_clocks(OpRequest::GetDocTimestamps { after }).await
    }

    pub async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        self.send_unit(OpRequest::DeleteDoc {
            doc_id: doc_id.to_owned(),
        })
        .await
    }

    pub async fn list_history(
        &self,
        doc_id: &str,
        filter: Option<HistoryFilter>,
    ) -> Result<Vec<ListedHistory>, StorageError> {
        match self
            .producer
            .send(OpRequest::ListHistory {
                doc_id: doc_id.to_owned(),
                filter,
            })
            .await?
        {
            OpOutput::Histories(histories) => Ok(histories),
            _ => Err(unexpected("list_history")),
        }
    }

    pub async fn get_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<Option<DocRecord>, StorageError> {
        match self
            .producer
            .send(OpRequest::GetHistory {
                doc_id: doc_id.to_owned(),
                timestamp,
            })
            .await?
        {
            OpOutput::Doc(doc) => Ok(doc),
            _ => Err(unexpected("get_history")),
        }
    }

    pub async fn create_history(&self, doc_id: &str) -> Result<(), StorageError> {
        self.send_unit(OpRequest::CreateHistory {
            doc_id: doc_id.to_owned(),
        })
        .await
    }

    pub async fn delete_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.send_unit(OpRequest::DeleteHistory {
            doc_id: doc_id.to_owned(),
            timestamp,
        })
        .await
    }

    pub async fn rollback_doc(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
        editor: Option<String>,
    ) -> Result<(), StorageError> {
        self.send_unit(OpRequest::RollbackDoc {
            doc_id: doc_id.to_owned(),
            timestamp,
            editor,
        })
        .await
    }

    pub async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        match self
            .producer
            .send(OpRequest::GetBlob {
                key: key.to_owned(),
            })
            .await?
        {
            OpOutput::Blob(blob) => Ok(blob),
            _ => Err(unexpected("get_blob")),
        }
    }

    pub async fn set_blob(
        &self,
        key: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<(), StorageError> {
        self.send_unit(OpRequest::SetBlob {
            key: key.to_owned(),
            data,
            mime: mime.to_owned(),
        })
        .await
    }

    pub async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        self.send_unit(OpRequest::DeleteBlob {
            key: key.to_owned(),
            permanently,
        })
        .await
    }

    pub async fn release_blobs(&self) -> Result<(), StorageError> {
        self.send_unit(OpRequest::ReleaseBlobs).await
    }

    pub async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        match self.producer.send(OpRequest::ListBlobs).await? {
            OpOutput::Blobs(blobs) => Ok(blobs),
            _ => Err(unexpected("list_blobs")),
        }
    }

    pub async fn get_peer_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        self.send_clocks(OpRequest::GetPeerClocks {
            peer: peer.to_owned(),
        })
        .await
    }

    pub async fn set_peer_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.send_unit(OpRequest::SetPeerClock {
            peer: peer.to_owned(),
            doc_id: doc_id.to_owned(),
            timestamp,
        })
        .await
    }

    pub async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        self.send_clocks(OpRequest::GetPeerPushedClocks {
            peer: peer.to_owned(),
        })
        .await
    }

    pub async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.send_unit(OpRequest::SetPeerPushedClock {
            peer: peer.to_owned(),
            doc_id: doc_id.to_owned(),
            timestamp,
        })
        .await
    }

    pub async fn clear_peer_clocks(&self) -> Result<(), StorageError> {
        self.send_unit(OpRequest::ClearPeerClocks).await
    }

    pub async fn connect(&self) -> Result<(), StorageError> {
        self.send_unit(OpRequest::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), StorageError> {
        self.send_unit(OpRequest::Disconnect).await
    }

    /// Disconnect everything and stop the consumer loop. The client is
    /// spent afterwards; every further call fails.
    pub async fn destroy(&self) -> Result<(), StorageError> {
        self.send_unit(OpRequest::Destroy).await
    }

    /// Updates the composed doc storage produces on its own (remote
    /// broadcasts). Local-only peers never yield here.
    pub async fn subscribe_doc_updates(&self) -> Result<Subscription, StorageError> {
        self.producer.subscribe(SubscribeRequest::DocUpdate).await
    }

    /// Connection status of every composed storage, current state first.
    pub async fn on_connection_status(&self) -> Result<Subscription, StorageError> {
        self.producer
            .subscribe(SubscribeRequest::ConnectionStatus)
            .await
    }

    async fn send_unit(&self, op: OpRequest) -> Result<(), StorageError> {
        let name = op.name();
        match self.producer.send(op).await? {
            OpOutput::Unit => Ok(()),
            _ => Err(unexpected(name)),
        }
    }

    async fn send_clocks(&self, op: OpRequest) -> Result<DocClocks, StorageError> {
        let name = op.name();
        match self.producer.send(op).await? {
            OpOutput::Clocks(clocks) => Ok(clocks),
            _ => Err(unexpected(name)),
        }
    }
}

impl Drop for PeerStorageClient {
    fn drop(&mut self) {
        self.checkpoint.abort();
    }
}

fn unexpected(op: &str) -> StorageError {
    StorageError::UnexpectedResponse { op: op.to_owned() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::open_memory_space;
    use crate::connection::ConnectionStatus;
    use crate::lock::LockManager;
    use crate::pool::ConnectionPool;
    use crate::storage::SpaceScope;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn memory_backend(pool: &Arc<ConnectionPool>) -> PeerStorageBackend {
        let backend = PeerStorageBackend::new();
        let space = open_memory_space(
            SpaceScope::workspace("w1"),
            Arc::new(LockManager::new()),
            pool,
        )
        .await;
        backend.add_space(space).await;
        backend
    }

    #[tokio::test]
    async fn test_ops_route_to_the_composed_storages() {
        let pool = Arc::new(ConnectionPool::new());
        let backend = memory_backend(&pool).await;
        let client = connect_peer_storage(backend, &BridgeConfig::for_testing());

        let clock = client
            .push_doc_update(DocUpdate {
                doc_id: "doc-a".to_owned(),
                bin: vec![1, 2, 3],
                editor: Some("alice".to_owned()),
            })
            .await
            .unwrap();
        assert_eq!(clock.doc_id, "doc-a");

        let doc = client.get_doc("doc-a").await.unwrap().unwrap();
        assert_eq!(doc.bin, vec![1, 2, 3]);
        assert_eq!(doc.editor.as_deref(), Some("alice"));

        client
            .set_blob("b1", vec![9, 9], "application/octet-stream")
            .await
            .unwrap();
        let blob = client.get_blob("b1").await.unwrap().unwrap();
        assert_eq!(blob.data, vec![9, 9]);

        client.set_peer_clock("peer-1", "doc-a", 10).await.unwrap();
        let clocks = client.get_peer_clocks("peer-1").await.unwrap();
        assert_eq!(clocks.get("doc-a"), Some(&10));
    }

    #[tokio::test]
    async fn test_missing_kind_is_unhandled() {
        let backend = PeerStorageBackend::new();
        let client = connect_peer_storage(backend, &BridgeConfig::for_testing());

        let err = client.get_blob("missing").await.unwrap_err();
        assert_eq!(
            err,
            StorageError::UnhandledOp {
                name: "get_blob".to_owned()
            }
        );
        let err = client.get_doc("missing").await.unwrap_err();
        assert_eq!(
            err,
            StorageError::UnhandledOp {
                name: "get_doc".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_replaced_storage_disconnects_on_next_pass() {
        let pool = Arc::new(ConnectionPool::new());
        let locks = Arc::new(LockManager::new());
        let first = open_memory_space(SpaceScope::workspace("w1"), locks.clone(), &pool).await;
        let second = open_memory_space(SpaceScope::workspace("w1"), locks, &pool).await;

        // Keep only the doc storage of the first space; release its
        // siblings so the doc handle is the last grip on that connection.
        let old_share_id = first.docs.connection().share_id().to_owned();
        first.blobs.disconnect().await.unwrap();
        first.sync.disconnect().await.unwrap();
        first.history.disconnect().await.unwrap();

        let backend = PeerStorageBackend::new();
        backend.add_doc_storage(first.docs).await;
        backend.add_doc_storage(second.docs).await;
        assert_eq!(pool.refs(&old_share_id).await, 1);

        let client = connect_peer_storage(backend, &BridgeConfig::for_testing());
        client.connect().await.unwrap();
        // The connect pass drained the replaced storage.
        assert_eq!(pool.refs(&old_share_id).await, 0);
    }

    #[tokio::test]
    async fn test_status_subscription_covers_every_composed_kind() {
        let pool = Arc::new(ConnectionPool::new());
        let backend = memory_backend(&pool).await;
        let client = connect_peer_storage(backend, &BridgeConfig::for_testing());

        let mut statuses = client.on_connection_status().await.unwrap();
        let mut kinds = HashSet::new();
        for _ in 0..4 {
            match statuses.next().await.unwrap() {
                SubscriptionItem::Status { kind, status, .. } => {
                    assert_eq!(status, ConnectionStatus::Idle);
                    kinds.insert(kind);
                }
                other => panic!("expected status, got {other:?}"),
            }
        }
        assert_eq!(kinds.len(), 4, "one initial status per composed kind");

        client.connect().await.unwrap();
        // All four storages sit on one pooled connection; each watcher
        // reports the transition independently.
        let mut connected = HashSet::new();
        while connected.len() < 4 {
            match statuses.next().await.unwrap() {
                SubscriptionItem::Status { kind, status, .. } => {
                    if status == ConnectionStatus::Connected {
                        connected.insert(kind);
                    }
                }
                other => panic!("expected status, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_push_triggers_an_auto_checkpoint() {
        let pool = Arc::new(ConnectionPool::new());
        let backend = memory_backend(&pool).await;
        let client = connect_peer_storage(backend, &BridgeConfig::for_testing());

        client
            .push_doc_update(DocUpdate {
                doc_id: "doc-a".to_owned(),
                bin: vec![1, 2, 3],
                editor: None,
            })
            .await
            .unwrap();

        // The checkpoint runs detached from the push; poll for it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let histories = client.list_history("doc-a", None).await.unwrap();
            if !histories.is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "checkpoint never appeared"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_destroy_tears_down_the_bridge() {
        let pool = Arc::new(ConnectionPool::new());
        let backend = memory_backend(&pool).await;
        let client = connect_peer_storage(backend, &BridgeConfig::for_testing());

        client.connect().await.unwrap();
        client.destroy().await.unwrap();
        assert_eq!(pool.active().await, 0);

        // Give the consumer loop a beat to finish dropping its inbound.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = client.get_doc("any").await.unwrap_err();
        assert_eq!(err, StorageError::ChannelClosed);
    }
}
