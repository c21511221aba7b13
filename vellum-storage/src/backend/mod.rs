//! Backend implementations of the storage primitives.
//!
//! `memory` keeps everything in process (tests, scratch spaces), `rocks`
//! persists to a RocksDB directory, `remote` forwards doc and blob traffic
//! to a server over WebSocket. All three plug into the same engines in
//! [`crate::storage`].

pub mod memory;
pub mod remote;
pub mod rocks;

use crate::storage::{BlobStorage, DocStorage, HistoryStorage, SyncStorage};

/// The four storages of one local space, sharing one pooled connection.
#[derive(Debug)]
pub struct SpaceStorages {
    pub docs: DocStorage,
    pub blobs: BlobStorage,
    pub sync: SyncStorage,
    pub history: HistoryStorage,
}
