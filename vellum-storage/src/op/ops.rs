//! Operation and message shapes for the storage bridge.
//!
//! The catalog is a closed union: dispatch is an exhaustive `match`, an
//! unknown operation cannot be expressed, and responses carry structured
//! error codes instead of stringly-typed failures.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionStatus;
use crate::error::StorageError;
use crate::storage::StorageKind;
use crate::types::{
    BlobRecord, DocClock, DocClocks, DocDiff, DocRecord, DocUpdate, HistoryFilter,
    ListedBlobRecord, ListedHistory, Timestamp,
};

/// One-shot operations: one request, one `Return`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpRequest {
    GetDoc { doc_id: String },
    GetDocDiff { doc_id: String, state: Option<Vec<u8>> },
    PushDocUpdate(DocUpdate),
    GetDocTimestamps { after: Option<Timestamp> },
    DeleteDoc { doc_id: String },
    ListHistory { doc_id: String, filter: Option<HistoryFilter> },
    GetHistory { doc_id: String, timestamp: Timestamp },
    CreateHistory { doc_id: String },
    DeleteHistory { doc_id: String, timestamp: Timestamp },
    RollbackDoc { doc_id: String, timestamp: Timestamp, editor: Option<String> },
    GetBlob { key: String },
    SetBlob { key: String, data: Vec<u8>, mime: String },
    DeleteBlob { key: String, permanently: bool },
    ReleaseBlobs,
    ListBlobs,
    GetPeerClocks { peer: String },
    SetPeerClock { peer: String, doc_id: String, timestamp: Timestamp },
    GetPeerPushedClocks { peer: String },
    SetPeerPushedClock { peer: String, doc_id: String, timestamp: Timestamp },
    ClearPeerClocks,
    Connect,
    Disconnect,
    Destroy,
}

impl OpRequest {
    /// Stable operation name for logs, errors, and events.
    pub fn name(&self) -> &'static str {
        match self {
            OpRequest::GetDoc { .. } => "get_doc",
            OpRequest::GetDocDiff { .. } => "get_doc_diff",
            OpRequest::PushDocUpdate(_) => "push_doc_update",
            OpRequest::GetDocTimestamps { .. } => "get_doc_timestamps",
            OpRequest::DeleteDoc { .. } => "delete_doc",
            OpRequest::ListHistory { .. } => "list_history",
            OpRequest::GetHistory { .. } => "get_history",
            OpRequest::CreateHistory { .. } => "create_history",
            OpRequest::DeleteHistory { .. } => "delete_history",
            OpRequest::RollbackDoc { .. } => "rollback_doc",
            OpRequest::GetBlob { .. } => "get_blob",
            OpRequest::SetBlob { .. } => "set_blob",
            OpRequest::DeleteBlob { .. } => "delete_blob",
            OpRequest::ReleaseBlobs => "release_blobs",
            OpRequest::ListBlobs => "list_blobs",
            OpRequest::GetPeerClocks { .. } => "get_peer_clocks",
            OpRequest::SetPeerClock { .. } => "set_peer_clock",
            OpRequest::GetPeerPushedClocks { .. } => "get_peer_pushed_clocks",
            OpRequest::SetPeerPushedClock { .. } => "set_peer_pushed_clock",
            OpRequest::ClearPeerClocks => "clear_peer_clocks",
            OpRequest::Connect => "connect",
            OpRequest::Disconnect => "disconnect",
            OpRequest::Destroy => "destroy",
        }
    }
}

/// Subscription operations: one request, a stream of `Next` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeRequest {
    DocUpdate,
    ConnectionStatus,
}

impl SubscribeRequest {
    pub fn name(&self) -> &'static str {
        match self {
            SubscribeRequest::DocUpdate => "subscribe_doc_update",
            SubscribeRequest::ConnectionStatus => "subscribe_connection_status",
        }
    }
}

/// Typed operation results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOutput {
    Doc(Option<DocRecord>),
    Diff(Option<DocDiff>),
    Clock(DocClock),
    Clocks(DocClocks),
    Histories(Vec<ListedHistory>),
    Blob(Option<BlobRecord>),
    Blobs(Vec<ListedBlobRecord>),
    Unit,
}

/// Items pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionItem {
    DocUpdate(DocRecord),
    Status {
        kind: StorageKind,
        status: ConnectionStatus,
        error: Option<String>,
    },
}

/// Events the consumer publishes after completing certain ops.
///
/// Fire and forget: subscribers run on their own tasks and their failures
/// never surface to the op caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpEvent {
    DocUpdatePushed { doc_id: String, timestamp: Timestamp },
}

/// Bridge wire messages.
///
/// The channel itself is typed, so "malformed" degenerates to ids or kinds
/// that do not match current bridge state. Both sides drop those silently
/// instead of failing the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeMessage {
    Op { id: Uuid, op: OpRequest },
    Cancel { id: Uuid, reason: String },
    Subscribe { id: Uuid, op: SubscribeRequest },
    Return { id: Uuid, result: Result<OpOutput, StorageError> },
    Next { id: Uuid, item: SubscriptionItem },
}

impl BridgeMessage {
    /// Message kind for trace logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::Op { .. } => "op",
            BridgeMessage::Cancel { .. } => "cancel",
            BridgeMessage::Subscribe { .. } => "subscribe",
            BridgeMessage::Return { .. } => "return",
            BridgeMessage::Next { .. } => "next",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            BridgeMessage::Op { id, .. }
            | BridgeMessage::Cancel { id, .. }
            | BridgeMessage::Subscribe { id, .. }
            | BridgeMessage::Return { id, .. }
            | BridgeMessage::Next { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_names_are_stable() {
        assert_eq!(
            OpRequest::GetDoc {
                doc_id: "d".to_owned()
            }
            .name(),
            "get_doc"
        );
        assert_eq!(
            OpRequest::PushDocUpdate(DocUpdate {
                doc_id: "d".to_owned(),
                bin: vec![],
                editor: None,
            })
            .name(),
            "push_doc_update"
        );
        assert_eq!(OpRequest::Destroy.name(), "destroy");
        assert_eq!(SubscribeRequest::DocUpdate.name(), "subscribe_doc_update");
    }

    #[test]
    fn test_bridge_messages_roundtrip_through_bincode() {
        let messages = vec![
            BridgeMessage::Op {
                id: Uuid::new_v4(),
                op: OpRequest::GetDocDiff {
                    doc_id: "doc".to_owned(),
                    state: Some(vec![1, 2, 3]),
                },
            },
            BridgeMessage::Return {
                id: Uuid::new_v4(),
                result: Err(StorageError::NotConnected),
            },
            BridgeMessage::Next {
                id: Uuid::new_v4(),
                item: SubscriptionItem::Status {
                    kind: StorageKind::Doc,
                    status: ConnectionStatus::Connected,
                    error: None,
                },
            },
        ];
        for msg in messages {
            let bytes = bincode::serde::encode_to_vec(&msg, bincode::config::standard())
                .expect("encode bridge message");
            let (back, _): (BridgeMessage, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .expect("decode bridge message");
            assert_eq!(back, msg);
            assert_eq!(back.id(), msg.id());
        }
    }
}
