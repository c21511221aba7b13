//! In-memory backends.
//!
//! State lives in `tokio::sync::RwLock` tables. This is the reference
//! implementation of the backend contracts: tests run against it, and the
//! remote integration tests reuse it server-side.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionState};
use crate::error::StorageError;
use crate::lock::LockManager;
use crate::pool::ConnectionPool;
use crate::storage::{
    BlobBackend, BlobStorage, DocBackend, DocStorage, HistoryBackend, HistoryStorage, SpaceScope,
    SyncBackend, SyncStorage,
};
use crate::types::{
    now_millis, BlobRecord, DocClock, DocClocks, DocRecord, DocUpdate, HistoryFilter,
    ListedBlobRecord, ListedHistory, Timestamp,
};

use super::SpaceStorages;

/// Connection over in-process state: nothing to establish, but the
/// lifecycle contract still applies so composition code stays uniform.
pub struct MemoryConnection {
    state: ConnectionState,
    share_id: String,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::new(),
            share_id: format!("memory:{}", Uuid::new_v4()),
        }
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn share_id(&self) -> String {
        self.share_id.clone()
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

#[derive(Default)]
struct DocTables {
    snapshots: HashMap<String, DocRecord>,
    updates: HashMap<String, BTreeMap<Timestamp, DocRecord>>,
    clocks: HashMap<String, Timestamp>,
}

#[derive(Default)]
pub struct MemoryDocBackend {
    tables: RwLock<DocTables>,
}

impl MemoryDocBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocBackend for MemoryDocBackend {
    async fn push_doc_update(&self, update: &DocUpdate) -> Result<DocClock, StorageError> {
        let mut tables = self.tables.write().await;
        let last = tables.clocks.get(&update.doc_id).copied().unwrap_or(0);
        // Strictly increasing per doc, even when pushes land within one
        // millisecond.
        let timestamp = now_millis().max(last + 1);
        let record = DocRecord {
            doc_id: update.doc_id.clone(),
            bin: update.bin.clone(),
            timestamp,
            editor: update.editor.clone(),
        };
        tables
            .updates
            .entry(update.doc_id.clone())
            .or_default()
            .insert(timestamp, record);
        tables.clocks.insert(update.doc_id.clone(), timestamp);
        Ok(DocClock {
            doc_id: update.doc_id.clone(),
            timestamp,
        })
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        Ok(self.tables.read().await.snapshots.get(doc_id).cloned())
    }

    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.snapshots.get(&snapshot.doc_id) {
            if existing.timestamp >= snapshot.timestamp {
                return Ok(false);
            }
        }
        tables
            .snapshots
            .insert(snapshot.doc_id.clone(), snapshot.clone());
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .updates
            .get(doc_id)
            .map(|pending| pending.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        timestamps: &[Timestamp],
    ) -> Result<usize, StorageError> {
        let mut tables = self.tables.write().await;
        let (removed, emptied) = {
            let Some(pending) = tables.updates.get_mut(doc_id) else {
                return Ok(0);
            };
            let mut removed = 0;
            for ts in timestamps {
                if pending.remove(ts).is_some() {
                    removed += 1;
                }
            }
            (removed, pending.is_empty())
        };
        if emptied {
            tables.updates.remove(doc_id);
        }
        Ok(removed)
    }

    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .clocks
            .iter()
            .filter(|(_, ts)| after.map_or(true, |a| **ts > a))
            .map(|(doc_id, ts)| (doc_id.clone(), *ts))
            .collect())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables.snapshots.remove(doc_id);
        tables.updates.remove(doc_id);
        tables.clocks.remove(doc_id);
        Ok(())
    }
}

struct StoredBlob {
    record: BlobRecord,
    deleted_at: Option<Timestamp>,
}

#[derive(Default)]
pub struct MemoryBlobBackend {
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .get(key)
            .filter(|stored| stored.deleted_at.is_none())
            .map(|stored| stored.record.clone()))
    }

    async fn set_blob(&self, key: &str, data: Vec<u8>, mime: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(
            key.to_owned(),
            StoredBlob {
                record: BlobRecord {
                    key: key.to_owned(),
                    data,
                    mime: mime.to_owned(),
                    created_at: now_millis(),
                },
                deleted_at: None,
            },
        );
        Ok(())
    }

    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        if permanently {
            blobs.remove(key);
        } else if let Some(stored) = blobs.get_mut(key) {
            stored.deleted_at = Some(now_millis());
        }
        Ok(())
    }

    async fn release_blobs(&self) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs.retain(|_, stored| stored.deleted_at.is_none());
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .values()
            .filter(|stored| stored.deleted_at.is_none())
            .map(|stored| ListedBlobRecord {
                key: stored.record.key.clone(),
                mime: stored.record.mime.clone(),
                size: stored.record.data.len() as u64,
                created_at: stored.record.created_at,
            })
            .collect())
    }
}

#[derive(Default, Clone, Copy)]
struct ClockPair {
    clock: Timestamp,
    pushed: Timestamp,
}

#[derive(Default)]
pub struct MemorySyncBackend {
    peers: RwLock<HashMap<String, HashMap<String, ClockPair>>>,
}

impl MemorySyncBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncBackend for MemorySyncBackend {
    async fn get_peer_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        let peers = self.peers.read().await;
        Ok(peers
            .get(peer)
            .map(|docs| {
                docs.iter()
                    .map(|(doc_id, pair)| (doc_id.clone(), pair.clock))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_peer_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let mut peers = self.peers.write().await;
        let pair = peers
            .entry(peer.to_owned())
            .or_default()
            .entry(doc_id.to_owned())
            .or_default();
        if timestamp > pair.clock {
            pair.clock = timestamp;
        }
        Ok(())
    }

    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        let peers = self.peers.read().await;
        Ok(peers
            .get(peer)
            .map(|docs| {
                docs.iter()
                    .map(|(doc_id, pair)| (doc_id.clone(), pair.pushed))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let mut peers = self.peers.write().await;
        let pair = peers
            .entry(peer.to_owned())
            .or_default()
            .entry(doc_id.to_owned())
            .or_default();
        if timestamp > pair.pushed {
            pair.pushed = timestamp;
        }
        Ok(())
    }

    async fn clear_clocks(&self) -> Result<(), StorageError> {
        self.peers.write().await.clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHistoryBackend {
    checkpoints: RwLock<HashMap<String, BTreeMap<Timestamp, DocRecord>>>,
}

impl MemoryHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryBackend for MemoryHistoryBackend {
    async fn list_history(
        &self,
        doc_id: &str,
        filter: Option<HistoryFilter>,
    ) -> Result<Vec<ListedHistory>, StorageError> {
        let filter = filter.unwrap_or_default();
        let checkpoints = self.checkpoints.read().await;
        let Some(per_doc) = checkpoints.get(doc_id) else {
            return Ok(Vec::new());
        };
        let mut listed: Vec<ListedHistory> = per_doc
            .values()
            .rev()
            .filter(|record| filter.before.map_or(true, |b| record.timestamp < b))
            .map(|record| ListedHistory {
                user_id: record.editor.clone(),
                timestamp: record.timestamp,
            })
            .collect();
        if let Some(limit) = filter.limit {
            listed.truncate(limit);
        }
        Ok(listed)
    }

    async fn get_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<Option<DocRecord>, StorageError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(doc_id)
            .and_then(|per_doc| per_doc.get(&timestamp))
            .cloned())
    }

    async fn create_history(&self, record: &DocRecord) -> Result<(), StorageError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints
            .entry(record.doc_id.clone())
            .or_default()
            .insert(record.timestamp, record.clone());
        Ok(())
    }

    async fn delete_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let mut checkpoints = self.checkpoints.write().await;
        if let Some(per_doc) = checkpoints.get_mut(doc_id) {
            per_doc.remove(&timestamp);
            if per_doc.is_empty() {
                checkpoints.remove(doc_id);
            }
        }
        Ok(())
    }
}

/// Build the four in-memory storages for one space, sharing one pooled
/// connection.
pub async fn open_memory_space(
    scope: SpaceScope,
    locks: Arc<LockManager>,
    pool: &Arc<ConnectionPool>,
) -> SpaceStorages {
    let conn: Arc<dyn Connection> = Arc::new(MemoryConnection::new());
    let share_id = conn.share_id();
    let docs_handle = {
        let conn = conn.clone();
        pool.acquire(&share_id, move || conn).await
    };
    let blobs_handle = {
        let conn = conn.clone();
        pool.acquire(&share_id, move || conn).await
    };
    let sync_handle = {
        let conn = conn.clone();
        pool.acquire(&share_id, move || conn).await
    };
    let history_handle = pool.acquire(&share_id, move || conn).await;

    SpaceStorages {
        docs: DocStorage::new(
            scope.clone(),
            MemoryDocBackend::new(),
            locks,
            docs_handle,
        ),
        blobs: BlobStorage::new(scope.clone(), MemoryBlobBackend::new(), blobs_handle),
        sync: SyncStorage::new(scope.clone(), MemorySyncBackend::new(), sync_handle),
        history: HistoryStorage::new(scope, MemoryHistoryBackend::new(), history_handle),
    }
}
