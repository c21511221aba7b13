//! RocksDB-backed space storage.
//!
//! Column families:
//! - `snapshots`   — merged doc payloads (LZ4 compressed, keyed by doc id)
//! - `updates`     — pending update log (LZ4 compressed, keyed by doc id + timestamp)
//! - `clocks`      — latest clock per doc (8-byte big-endian value)
//! - `peer_clocks` — received/pushed clock pairs (keyed by peer + doc id)
//! - `blobs`       — binaries with tombstones (LZ4 compressed)
//! - `histories`   — checkpoints (LZ4 compressed, keyed by doc id + timestamp)
//!
//! String ids are length-prefixed inside composite keys so prefix scans for
//! doc "a" never bleed into doc "ab". Timestamps sit last as big-endian
//! bytes, which makes the natural key order the timestamp order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

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

type Db = DBWithThreadMode<SingleThreaded>;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_CLOCKS: &str = "clocks";
const CF_PEER_CLOCKS: &str = "peer_clocks";
const CF_BLOBS: &str = "blobs";
const CF_HISTORIES: &str = "histories";

const COLUMN_FAMILIES: &[&str] = &[
    CF_SNAPSHOTS,
    CF_UPDATES,
    CF_CLOCKS,
    CF_PEER_CLOCKS,
    CF_BLOBS,
    CF_HISTORIES,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes per column family.
    pub block_cache_size: usize,
    /// Bloom filter bits per key.
    pub bloom_filter_bits: i32,
    /// fsync on every write. Off by default; RocksDB's own WAL covers
    /// crash atomicity.
    pub sync_writes: bool,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
}

impl RocksStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Connection owning the RocksDB handle for one space directory.
///
/// All four storage kinds of the space share this connection through the
/// pool, so the database opens once and closes when the last kind lets go.
pub struct RocksConnection {
    config: RocksStoreConfig,
    state: ConnectionState,
    db: RwLock<Option<Arc<Db>>>,
}

impl RocksConnection {
    pub fn new(config: RocksStoreConfig) -> Self {
        Self {
            config,
            state: ConnectionState::new(),
            db: RwLock::new(None),
        }
    }

    pub(crate) async fn db(&self) -> Result<Arc<Db>, StorageError> {
        self.db.read().await.clone().ok_or(StorageError::NotConnected)
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn open_db(&self) -> Result<Db, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(self.config.max_open_files);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &self.config)))
            .collect();

        Ok(Db::open_cf_descriptors(
            &db_opts,
            &self.config.path,
            cf_descriptors,
        )?)
    }
}

#[async_trait]
impl Connection for RocksConnection {
    fn share_id(&self) -> String {
        format!("rocks:{}", self.config.path.display())
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn do_connect(&self) -> Result<(), StorageError> {
        let db = self.open_db()?;
        *self.db.write().await = Some(Arc::new(db));
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<(), StorageError> {
        *self.db.write().await = None;
        Ok(())
    }
}

/// Build column-family-specific options.
fn cf_options(name: &str, config: &RocksStoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

    match name {
        // Payload CFs arrive LZ4-compressed from the application; double
        // compression only burns cycles.
        CF_SNAPSHOTS | CF_UPDATES | CF_BLOBS | CF_HISTORIES => {
            block_opts.set_block_size(32 * 1024);
            opts.set_compression_type(DBCompressionType::None);
        }
        // Clock CFs hold tiny values and read hot.
        CF_CLOCKS | CF_PEER_CLOCKS => {
            block_opts.set_block_size(4 * 1024);
            opts.set_compression_type(DBCompressionType::Lz4);
        }
        _ => {}
    }

    opts.set_block_based_table_factory(&block_opts);
    opts
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a rocksdb::ColumnFamily, StorageError> {
    db.cf_handle(name).ok_or_else(|| StorageError::Io {
        message: format!("column family '{name}' not found"),
    })
}

/// Length-prefixed id, the unit composite keys are built from.
fn id_prefix(id: &str) -> Vec<u8> {
    let bytes = id.as_bytes();
    let mut key = Vec::with_capacity(4 + bytes.len());
    key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

/// Composite key: length-prefixed id + big-endian timestamp.
fn ts_key(id: &str, timestamp: Timestamp) -> Vec<u8> {
    let mut key = id_prefix(id);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key
}

/// Composite key for (peer, doc) pairs.
fn pair_key(peer: &str, doc_id: &str) -> Vec<u8> {
    let mut key = id_prefix(peer);
    key.extend_from_slice(&id_prefix(doc_id));
    key
}

/// Timestamp from the last 8 bytes of a composite key.
fn ts_of_key(key: &[u8]) -> Option<Timestamp> {
    let tail: [u8; 8] = key.get(key.len().checked_sub(8)?..)?.try_into().ok()?;
    Some(Timestamp::from_be_bytes(tail))
}

/// Second id of a pair key, given the first id's prefix length.
fn pair_suffix(key: &[u8], prefix_len: usize) -> Option<String> {
    let rest = key.get(prefix_len..)?;
    let len = u32::from_be_bytes(rest.get(..4)?.try_into().ok()?) as usize;
    let id = rest.get(4..4 + len)?;
    Some(String::from_utf8_lossy(id).into_owned())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        StorageError::Io {
            message: e.to_string(),
        }
    })
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StorageError::Io {
            message: e.to_string(),
        })?;
    Ok(value)
}

fn compress(payload: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(payload)
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>, StorageError> {
    lz4_flex::decompress_size_prepended(payload).map_err(|e| StorageError::Io {
        message: e.to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    timestamp: Timestamp,
    editor: Option<String>,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredUpdate {
    editor: Option<String>,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredBlob {
    mime: String,
    size: u64,
    created_at: Timestamp,
    deleted_at: Option<Timestamp>,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default, Clone, Copy)]
struct StoredClockPair {
    clock: Timestamp,
    pushed: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct StoredHistory {
    editor: Option<String>,
    data: Vec<u8>,
}

fn read_doc_clock(db: &Db, doc_id: &str) -> Result<Option<Timestamp>, StorageError> {
    let cf_clocks = cf(db, CF_CLOCKS)?;
    let Some(bytes) = db.get_cf(cf_clocks, doc_id.as_bytes())? else {
        return Ok(None);
    };
    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StorageError::Io {
        message: format!("malformed clock value for doc {doc_id}"),
    })?;
    Ok(Some(Timestamp::from_be_bytes(raw)))
}

pub struct RocksDocBackend {
    conn: Arc<RocksConnection>,
    // Serializes read-modify-write sections: clock assignment on push and
    // the conditional snapshot compare.
    write_lock: Mutex<()>,
}

impl RocksDocBackend {
    pub fn new(conn: Arc<RocksConnection>) -> Self {
        Self {
            conn,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl DocBackend for RocksDocBackend {
    async fn push_doc_update(&self, update: &DocUpdate) -> Result<DocClock, StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;

        let last = read_doc_clock(&db, &update.doc_id)?.unwrap_or(0);
        let timestamp = now_millis().max(last + 1);

        let stored = StoredUpdate {
            editor: update.editor.clone(),
            data: compress(&update.bin),
        };
        let cf_updates = cf(&db, CF_UPDATES)?;
        let cf_clocks = cf(&db, CF_CLOCKS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, ts_key(&update.doc_id, timestamp), encode(&stored)?);
        batch.put_cf(cf_clocks, update.doc_id.as_bytes(), timestamp.to_be_bytes());
        db.write_opt(batch, &self.conn.write_options())?;

        Ok(DocClock {
            doc_id: update.doc_id.clone(),
            timestamp,
        })
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let db = self.conn.db().await?;
        let cf_snapshots = cf(&db, CF_SNAPSHOTS)?;
        let Some(bytes) = db.get_cf(cf_snapshots, doc_id.as_bytes())? else {
            return Ok(None);
        };
        let stored: StoredSnapshot = decode(&bytes)?;
        Ok(Some(DocRecord {
            doc_id: doc_id.to_owned(),
            bin: decompress(&stored.data)?,
            timestamp: stored.timestamp,
            editor: stored.editor,
        }))
    }

    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;

        let cf_snapshots = cf(&db, CF_SNAPSHOTS)?;
        let key = snapshot.doc_id.as_bytes();
        if let Some(bytes) = db.get_cf(cf_snapshots, key)? {
            let existing: StoredSnapshot = decode(&bytes)?;
            if existing.timestamp >= snapshot.timestamp {
                return Ok(false);
            }
        }
        let stored = StoredSnapshot {
            timestamp: snapshot.timestamp,
            editor: snapshot.editor.clone(),
            data: compress(&snapshot.bin),
        };
        db.put_cf_opt(cf_snapshots, key, encode(&stored)?, &self.conn.write_options())?;
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        let db = self.conn.db().await?;
        let cf_updates = cf(&db, CF_UPDATES)?;
        let prefix = id_prefix(doc_id);

        let mut records = Vec::new();
        let iter = db.iterator_cf(cf_updates, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(timestamp) = ts_of_key(&key) else {
                continue;
            };
            let stored: StoredUpdate = decode(&value)?;
            records.push(DocRecord {
                doc_id: doc_id.to_owned(),
                bin: decompress(&stored.data)?,
                timestamp,
                editor: stored.editor,
            });
        }
        Ok(records)
    }

    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        timestamps: &[Timestamp],
    ) -> Result<usize, StorageError> {
        let db = self.conn.db().await?;
        let cf_updates = cf(&db, CF_UPDATES)?;

        let mut removed = 0;
        let mut batch = WriteBatch::default();
        for ts in timestamps {
            let key = ts_key(doc_id, *ts);
            if db.get_cf(cf_updates, &key)?.is_some() {
                batch.delete_cf(cf_updates, &key);
                removed += 1;
            }
        }
        if removed > 0 {
            db.write_opt(batch, &self.conn.write_options())?;
        }
        Ok(removed)
    }

    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        let db = self.conn.db().await?;
        let cf_clocks = cf(&db, CF_CLOCKS)?;

        let mut clocks = DocClocks::new();
        let iter = db.iterator_cf(cf_clocks, IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let raw: [u8; 8] = match value.as_ref().try_into() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let timestamp = Timestamp::from_be_bytes(raw);
            if after.map_or(true, |a| timestamp > a) {
                clocks.insert(String::from_utf8_lossy(&key).into_owned(), timestamp);
            }
        }
        Ok(clocks)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;

        let cf_snapshots = cf(&db, CF_SNAPSHOTS)?;
        let cf_updates = cf(&db, CF_UPDATES)?;
        let cf_clocks = cf(&db, CF_CLOCKS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_snapshots, doc_id.as_bytes());
        batch.delete_cf(cf_clocks, doc_id.as_bytes());

        let prefix = id_prefix(doc_id);
        let iter = db.iterator_cf(cf_updates, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf_updates, &key);
        }

        db.write_opt(batch, &self.conn.write_options())?;
        Ok(())
    }
}

pub struct RocksBlobBackend {
    conn: Arc<RocksConnection>,
    // Serializes tombstone read-modify-write against set/release scans.
    write_lock: Mutex<()>,
}

impl RocksBlobBackend {
    pub fn new(conn: Arc<RocksConnection>) -> Self {
        Self {
            conn,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl BlobBackend for RocksBlobBackend {
    async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        let db = self.conn.db().await?;
        let cf_blobs = cf(&db, CF_BLOBS)?;
        let Some(bytes) = db.get_cf(cf_blobs, key.as_bytes())? else {
            return Ok(None);
        };
        let stored: StoredBlob = decode(&bytes)?;
        if stored.deleted_at.is_some() {
            return Ok(None);
        }
        Ok(Some(BlobRecord {
            key: key.to_owned(),
            data: decompress(&stored.data)?,
            mime: stored.mime,
            created_at: stored.created_at,
        }))
    }

    async fn set_blob(&self, key: &str, data: Vec<u8>, mime: &str) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;
        let cf_blobs = cf(&db, CF_BLOBS)?;
        let stored = StoredBlob {
            mime: mime.to_owned(),
            size: data.len() as u64,
            created_at: now_millis(),
            deleted_at: None,
            data: compress(&data),
        };
        db.put_cf_opt(cf_blobs, key.as_bytes(), encode(&stored)?, &self.conn.write_options())?;
        Ok(())
    }

    async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;
        let cf_blobs = cf(&db, CF_BLOBS)?;
        if permanently {
            db.delete_cf(cf_blobs, key.as_bytes())?;
            return Ok(());
        }
        let Some(bytes) = db.get_cf(cf_blobs, key.as_bytes())? else {
            return Ok(());
        };
        let mut stored: StoredBlob = decode(&bytes)?;
        stored.deleted_at = Some(now_millis());
        db.put_cf_opt(cf_blobs, key.as_bytes(), encode(&stored)?, &self.conn.write_options())?;
        Ok(())
    }

    async fn release_blobs(&self) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;
        let cf_blobs = cf(&db, CF_BLOBS)?;

        let mut batch = WriteBatch::default();
        let mut purged = 0usize;
        let iter = db.iterator_cf(cf_blobs, IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let stored: StoredBlob = decode(&value)?;
            if stored.deleted_at.is_some() {
                batch.delete_cf(cf_blobs, &key);
                purged += 1;
            }
        }
        if purged > 0 {
            db.write_opt(batch, &self.conn.write_options())?;
            log::debug!("released {purged} tombstoned blobs");
        }
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        let db = self.conn.db().await?;
        let cf_blobs = cf(&db, CF_BLOBS)?;

        let mut listed = Vec::new();
        let iter = db.iterator_cf(cf_blobs, IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let stored: StoredBlob = decode(&value)?;
            if stored.deleted_at.is_some() {
                continue;
            }
            listed.push(ListedBlobRecord {
                key: String::from_utf8_lossy(&key).into_owned(),
                mime: stored.mime,
                size: stored.size,
                created_at: stored.created_at,
            });
        }
        Ok(listed)
    }
}

pub struct RocksSyncBackend {
    conn: Arc<RocksConnection>,
    // Serializes the monotone clock compare-and-set.
    write_lock: Mutex<()>,
}

impl RocksSyncBackend {
    pub fn new(conn: Arc<RocksConnection>) -> Self {
        Self {
            conn,
            write_lock: Mutex::new(()),
        }
    }

    async fn upsert_pair<F>(&self, peer: &str, doc_id: &str, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StoredClockPair),
    {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;
        let cf_peers = cf(&db, CF_PEER_CLOCKS)?;
        let key = pair_key(peer, doc_id);
        let mut pair = match db.get_cf(cf_peers, &key)? {
            Some(bytes) => decode(&bytes)?,
            None => StoredClockPair::default(),
        };
        apply(&mut pair);
        db.put_cf_opt(cf_peers, &key, encode(&pair)?, &self.conn.write_options())?;
        Ok(())
    }

    async fn collect_clocks<F>(&self, peer: &str, pick: F) -> Result<DocClocks, StorageError>
    where
        F: Fn(&StoredClockPair) -> Timestamp,
    {
        let db = self.conn.db().await?;
        let cf_peers = cf(&db, CF_PEER_CLOCKS)?;
        let prefix = id_prefix(peer);

        let mut clocks = DocClocks::new();
        let iter = db.iterator_cf(cf_peers, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(doc_id) = pair_suffix(&key, prefix.len()) else {
                continue;
            };
            let pair: StoredClockPair = decode(&value)?;
            clocks.insert(doc_id, pick(&pair));
        }
        Ok(clocks)
    }
}

#[async_trait]
impl SyncBackend for RocksSyncBackend {
    async fn get_peer_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        self.collect_clocks(peer, |pair| pair.clock).await
    }

    async fn set_peer_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.upsert_pair(peer, doc_id, |pair| {
            if timestamp > pair.clock {
                pair.clock = timestamp;
            }
        })
        .await
    }

    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks, StorageError> {
        self.collect_clocks(peer, |pair| pair.pushed).await
    }

    async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.upsert_pair(peer, doc_id, |pair| {
            if timestamp > pair.pushed {
                pair.pushed = timestamp;
            }
        })
        .await
    }

    async fn clear_clocks(&self) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let _serial = self.write_lock.lock().await;
        let cf_peers = cf(&db, CF_PEER_CLOCKS)?;

        let mut batch = WriteBatch::default();
        let iter = db.iterator_cf(cf_peers, IteratorMode::Start);
        for item in iter {
            let (key, _) = item?;
            batch.delete_cf(cf_peers, &key);
        }
        db.write_opt(batch, &self.conn.write_options())?;
        Ok(())
    }
}

pub struct RocksHistoryBackend {
    conn: Arc<RocksConnection>,
}

impl RocksHistoryBackend {
    pub fn new(conn: Arc<RocksConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl HistoryBackend for RocksHistoryBackend {
    async fn list_history(
        &self,
        doc_id: &str,
        filter: Option<HistoryFilter>,
    ) -> Result<Vec<ListedHistory>, StorageError> {
        let filter = filter.unwrap_or_default();
        let db = self.conn.db().await?;
        let cf_histories = cf(&db, CF_HISTORIES)?;
        let prefix = id_prefix(doc_id);

        let mut listed = Vec::new();
        let iter = db.iterator_cf(cf_histories, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(timestamp) = ts_of_key(&key) else {
                continue;
            };
            if !filter.before.map_or(true, |b| timestamp < b) {
                continue;
            }
            let stored: StoredHistory = decode(&value)?;
            listed.push(ListedHistory {
                user_id: stored.editor,
                timestamp,
            });
        }
        // Key order is oldest first; listings are newest first.
        listed.reverse();
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
        let db = self.conn.db().await?;
        let cf_histories = cf(&db, CF_HISTORIES)?;
        let Some(bytes) = db.get_cf(cf_histories, ts_key(doc_id, timestamp))? else {
            return Ok(None);
        };
        let stored: StoredHistory = decode(&bytes)?;
        Ok(Some(DocRecord {
            doc_id: doc_id.to_owned(),
            bin: decompress(&stored.data)?,
            timestamp,
            editor: stored.editor,
        }))
    }

    async fn create_history(&self, record: &DocRecord) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let cf_histories = cf(&db, CF_HISTORIES)?;
        let stored = StoredHistory {
            editor: record.editor.clone(),
            data: compress(&record.bin),
        };
        db.put_cf_opt(
            cf_histories,
            ts_key(&record.doc_id, record.timestamp),
            encode(&stored)?,
            &self.conn.write_options(),
        )?;
        Ok(())
    }

    async fn delete_history(
        &self,
        doc_id: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let db = self.conn.db().await?;
        let cf_histories = cf(&db, CF_HISTORIES)?;
        db.delete_cf(cf_histories, ts_key(doc_id, timestamp))?;
        Ok(())
    }
}

/// Build the four RocksDB-backed storages for one space directory, sharing
/// one pooled connection.
///
/// A directory must be opened through this once per process; a second open
/// of the same path is refused rather than silently split across two
/// database handles.
pub async fn open_rocks_space(
    scope: SpaceScope,
    config: RocksStoreConfig,
    locks: Arc<LockManager>,
    pool: &Arc<ConnectionPool>,
) -> Result<SpaceStorages, StorageError> {
    let conn = Arc::new(RocksConnection::new(config));
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
    let blobs_handle = {
        let c = as_dyn.clone();
        pool.acquire(&share_id, move || c).await
    };
    let sync_handle = {
        let c = as_dyn.clone();
        pool.acquire(&share_id, move || c).await
    };
    let history_handle = pool.acquire(&share_id, move || as_dyn).await;

    Ok(SpaceStorages {
        docs: DocStorage::new(
            scope.clone(),
            RocksDocBackend::new(conn.clone()),
            locks,
            docs_handle,
        ),
        blobs: BlobStorage::new(scope.clone(), RocksBlobBackend::new(conn.clone()), blobs_handle),
        sync: SyncStorage::new(scope.clone(), RocksSyncBackend::new(conn.clone()), sync_handle),
        history: HistoryStorage::new(scope, RocksHistoryBackend::new(conn), history_handle),
    })
}
