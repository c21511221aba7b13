//! Record types shared by every storage kind.
//!
//! Everything here derives the serde traits: records cross the op bridge,
//! travel the remote wire protocol, and land in RocksDB as bincode values,
//! all through the same definitions.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall clock in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One CRDT update or snapshot of a document at a point in time.
///
/// Records are immutable once written. Merging produces a new record with a
/// new timestamp ordering, it never rewrites an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub doc_id: String,
    /// Opaque CRDT payload bytes.
    pub bin: Vec<u8>,
    pub timestamp: Timestamp,
    /// Attribution carried from the update that produced this record.
    pub editor: Option<String>,
}

/// Input of a doc push. The timestamp is assigned by the backend when the
/// update lands in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub editor: Option<String>,
}

/// Pointer to the latest known state of one doc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: Timestamp,
}

/// Doc id to latest-known-timestamp map.
pub type DocClocks = HashMap<String, Timestamp>;

/// Minimal state transfer for one doc, relative to a requester-supplied
/// state vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocDiff {
    pub doc_id: String,
    /// Update bytes the requester is missing.
    pub missing: Vec<u8>,
    /// State vector of the full doc, for the requester's bookkeeping.
    pub state: Vec<u8>,
    pub timestamp: Timestamp,
}

/// A stored binary blob with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub mime: String,
    pub created_at: Timestamp,
}

/// Blob listing entry: metadata only, no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedBlobRecord {
    pub key: String,
    pub mime: String,
    /// Uncompressed payload size in bytes.
    pub size: u64,
    pub created_at: Timestamp,
}

/// History checkpoint listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedHistory {
    /// Editor recorded when the checkpoint was taken.
    pub user_id: Option<String>,
    pub timestamp: Timestamp,
}

/// Filter for history listings. Listings are newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Keep only checkpoints strictly older than this timestamp.
    pub before: Option<Timestamp>,
    /// Maximum number of entries returned.
    pub limit: Option<usize>,
}
