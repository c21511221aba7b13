//! # vellum-storage — Client-side, multi-backend CRDT document storage
//!
//! Stores collaborative documents as opaque CRDT payloads behind a uniform
//! operation surface, so the same code path serves an in-memory scratch
//! space, a RocksDB directory, or a remote server over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   BridgeMessage     ┌────────────────────┐
//! │ PeerStorageClient │ ◄─────────────────► │ PeerStorageBackend │
//! │ (typed facade)    │   mpsc channels     │ (op dispatcher)    │
//! └───────────────────┘                     └─────────┬──────────┘
//!                                                     │
//!                                  ┌──────────┬───────┴──┬──────────┐
//!                                  ▼          ▼          ▼          ▼
//!                             DocStorage BlobStorage SyncStorage HistoryStorage
//!                                  │          │          │          │
//!                                  └──────────┴────┬─────┴──────────┘
//!                                                  │ backend traits
//!                                     ┌────────────┼────────────┐
//!                                     ▼            ▼            ▼
//!                                  memory       rocksdb      websocket
//! ```
//!
//! Writes append CRDT updates to a per-doc log; reads squash the pending
//! log into the snapshot under a per-doc lock and pay the merge cost once.
//! Everything above the backend traits is backend-agnostic policy: lazy
//! merge, monotone peer clocks, tombstoned blobs, checkpoint rollback.
//!
//! ## Modules
//!
//! - [`types`] — plain records crossing every boundary (docs, clocks, blobs)
//! - [`error`] — one serializable error enum for the whole crate
//! - [`crdt`] — merge/diff/state-vector/revert over opaque yrs payloads
//! - [`lock`] — in-process per-doc lock table
//! - [`connection`] / [`pool`] — connection lifecycle and ref-counted sharing
//! - [`op`] — the bridge: typed ops, producer, consumer, cancellation
//! - [`storage`] — the four storage engines and their backend traits
//! - [`backend`] — memory, rocksdb, and remote implementations
//! - [`client`] — peer composition and the typed client facade

pub mod backend;
pub mod client;
pub mod connection;
pub mod crdt;
pub mod error;
pub mod lock;
pub mod op;
pub mod pool;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use backend::memory::open_memory_space;
pub use backend::remote::{open_remote_space, RemoteConfig};
pub use backend::rocks::{open_rocks_space, RocksStoreConfig};
pub use backend::SpaceStorages;
pub use client::{connect_peer_storage, PeerStorageBackend, PeerStorageClient};
pub use connection::{Connection, ConnectionState, ConnectionStatus, StatusEvent};
pub use error::StorageError;
pub use lock::{LockKey, LockManager, ResourceClass};
pub use op::{
    BridgeConfig, BridgeMessage, OpConsumer, OpEvent, OpHandler, OpOutput, OpProducer,
    OpRequest, SubscribeRequest, Subscription, SubscriptionItem, SubscriptionSink,
};
pub use pool::{ConnectionHandle, ConnectionPool};
pub use storage::{
    BlobBackend, BlobStorage, DocBackend, DocStorage, HistoryBackend, HistoryStorage,
    SpaceScope, SpaceType, StorageKind, SyncBackend, SyncStorage,
};
pub use types::{
    BlobRecord, DocClock, DocClocks, DocDiff, DocRecord, DocUpdate, HistoryFilter,
    ListedBlobRecord, ListedHistory, Timestamp,
};
