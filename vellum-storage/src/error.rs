//! Structured error codes shared by storages, backends, and the op bridge.
//!
//! One serializable enum covers the whole crate, so an error raised inside a
//! backend crosses the bridge in a `Return` message (or the remote wire in a
//! response envelope) without collapsing into a string.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// A bridge call missed its deadline.
    Timeout { op: String, after_ms: u64 },
    /// A bridge call was canceled before completion.
    Canceled { reason: String },
    /// The other side of a channel is gone.
    ChannelClosed,
    /// No storage is composed for the kind this op addresses.
    UnhandledOp { name: String },
    /// The responder answered with a payload of the wrong shape.
    UnexpectedResponse { op: String },
    /// Operation attempted while the connection is not established.
    NotConnected,
    /// Establishing a connection failed.
    ConnectFailed { message: String },
    /// The remote side answered with an error envelope.
    Remote { message: String },
    /// Wire frame could not be encoded or decoded.
    Wire { message: String },
    /// Squash was invoked with zero records.
    NoUpdatesToMerge,
    /// CRDT payload could not be decoded or applied.
    Crdt { message: String },
    /// The doc does not exist where one is required.
    DocNotFound { doc_id: String },
    /// No history checkpoint exists at the given timestamp.
    HistoryNotFound { doc_id: String, timestamp: Timestamp },
    /// Backend storage I/O failure.
    Io { message: String },
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Timeout { op, after_ms } => {
                write!(f, "op {op} timed out after {after_ms}ms")
            }
            StorageError::Canceled { reason } => write!(f, "op canceled: {reason}"),
            StorageError::ChannelClosed => write!(f, "channel closed"),
            StorageError::UnhandledOp { name } => write!(f, "no storage handles op {name}"),
            StorageError::UnexpectedResponse { op } => {
                write!(f, "unexpected response shape for op {op}")
            }
            StorageError::NotConnected => write!(f, "not connected"),
            StorageError::ConnectFailed { message } => write!(f, "connect failed: {message}"),
            StorageError::Remote { message } => write!(f, "remote error: {message}"),
            StorageError::Wire { message } => write!(f, "wire error: {message}"),
            StorageError::NoUpdatesToMerge => write!(f, "no updates to merge"),
            StorageError::Crdt { message } => write!(f, "crdt failure: {message}"),
            StorageError::DocNotFound { doc_id } => write!(f, "doc {doc_id} not found"),
            StorageError::HistoryNotFound { doc_id, timestamp } => {
                write!(f, "no history for doc {doc_id} at {timestamp}")
            }
            StorageError::Io { message } => write!(f, "storage io failure: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::Io {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_op() {
        let err = StorageError::Timeout {
            op: "get_doc".to_owned(),
            after_ms: 3000,
        };
        assert_eq!(err.to_string(), "op get_doc timed out after 3000ms");
    }

    #[test]
    fn errors_survive_a_wire_roundtrip() {
        let err = StorageError::HistoryNotFound {
            doc_id: "doc-a".to_owned(),
            timestamp: 42,
        };
        let bytes = bincode::serde::encode_to_vec(&err, bincode::config::standard())
            .expect("encode error");
        let (back, _): (StorageError, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .expect("decode error");
        assert_eq!(back, err);
    }
}
