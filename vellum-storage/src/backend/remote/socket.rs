//! Wire protocol and socket plumbing for remote spaces.
//!
//! Every frame is one bincode-encoded [`WireMessage`] in a binary
//! WebSocket message. Requests carry a fresh id; the server acks each with
//! a `Response` bearing the same id. `ServerUpdate` frames arrive
//! unsolicited whenever another client changed a doc in the joined space.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionState, ConnectionStatus};
use crate::error::StorageError;
use crate::storage::SpaceScope;
use crate::types::{BlobRecord, DocClock, DocClocks, DocRecord, ListedBlobRecord, Timestamp};

/// Calls a client can make against a joined space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpaceRequest {
    /// Bind this socket to a space. Must be acked before anything else.
    Join { scope: SpaceScope },
    GetDoc { doc_id: String },
    PushDocUpdate {
        doc_id: String,
        bin: Vec<u8>,
        editor: Option<String>,
    },
    GetDocTimestamps { after: Option<Timestamp> },
    GetBlob { key: String },
    SetBlob {
        key: String,
        data: Vec<u8>,
        mime: String,
    },
    DeleteBlob { key: String, permanently: bool },
    ReleaseBlobs,
    ListBlobs,
}

impl SpaceRequest {
    pub fn name(&self) -> &'static str {
        match self {
            SpaceRequest::Join { .. } => "join",
            SpaceRequest::GetDoc { .. } => "get_doc",
            SpaceRequest::PushDocUpdate { .. } => "push_doc_update",
            SpaceRequest::GetDocTimestamps { .. } => "get_doc_timestamps",
            SpaceRequest::GetBlob { .. } => "get_blob",
            SpaceRequest::SetBlob { .. } => "set_blob",
            SpaceRequest::DeleteBlob { .. } => "delete_blob",
            SpaceRequest::ReleaseBlobs => "release_blobs",
            SpaceRequest::ListBlobs => "list_blobs",
        }
    }
}

/// Server's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpaceResponse {
    Joined,
    Doc(Option<DocRecord>),
    Clock(DocClock),
    Timestamps(DocClocks),
    Blob(Option<BlobRecord>),
    Blobs(Vec<ListedBlobRecord>),
    Unit,
    Error { message: String },
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Request { id: Uuid, request: SpaceRequest },
    Response { id: Uuid, response: SpaceResponse },
    /// A doc changed server-side; the merged record fans out to every
    /// client joined to the space.
    ServerUpdate { record: DocRecord },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Request { .. } => "request",
            WireMessage::Response { .. } => "response",
            WireMessage::ServerUpdate { .. } => "server_update",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
            StorageError::Wire {
                message: e.to_string(),
            }
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Wire {
                message: e.to_string(),
            })?;
        Ok(message)
    }
}

/// Remote space endpoint and tuning.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// WebSocket URL of the sync server.
    pub url: String,
    /// Space to join after the socket opens.
    pub scope: SpaceScope,
    /// Deadline for one request-response pair, the join included.
    pub request_timeout: Duration,
    /// Capacity of the outgoing frame channel.
    pub channel_capacity: usize,
    /// Buffer of the server-update broadcast.
    pub update_capacity: usize,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, scope: SpaceScope) -> Self {
        Self {
            url: url.into(),
            scope,
            request_timeout: Duration::from_millis(5000),
            channel_capacity: 256,
            update_capacity: 256,
        }
    }

    /// Short deadlines for tests.
    pub fn for_testing(url: impl Into<String>, scope: SpaceScope) -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            channel_capacity: 16,
            update_capacity: 16,
            ..Self::new(url, scope)
        }
    }
}

type PendingAcks = Arc<Mutex<HashMap<Uuid, oneshot::Sender<SpaceResponse>>>>;

/// One WebSocket to one space, shared by the space's doc and blob storages.
///
/// `do_connect` dials, spawns the reader and writer tasks, and completes
/// the join handshake; the outbound channel is published only once the
/// server acked the join, so requests can never overtake it.
pub struct RemoteConnection {
    config: RemoteConfig,
    state: ConnectionState,
    outbound: Mutex<Option<mpsc::Sender<WireMessage>>>,
    pending: PendingAcks,
    updates: broadcast::Sender<DocRecord>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteConnection {
    pub fn new(config: RemoteConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity);
        Self {
            config,
            state: ConnectionState::new(),
            outbound: Mutex::new(None),
            pending: Arc::default(),
            updates,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Merged doc records pushed by the server for other clients' changes.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<DocRecord> {
        self.updates.subscribe()
    }

    /// Send one request and wait for its ack.
    pub(crate) async fn request(
        &self,
        request: SpaceRequest,
    ) -> Result<SpaceResponse, StorageError> {
        let Some(outbound) = self.outbound.lock().await.clone() else {
            return Err(StorageError::NotConnected);
        };
        self.request_on(&outbound, request).await
    }

    async fn request_on(
        &self,
        outbound: &mpsc::Sender<WireMessage>,
        request: SpaceRequest,
    ) -> Result<SpaceResponse, StorageError> {
        let id = Uuid::new_v4();
        let name = request.name();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        if outbound
            .send(WireMessage::Request { id, request })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(StorageError::NotConnected);
        }

        match timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(SpaceResponse::Error { message })) => Err(StorageError::Remote { message }),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(StorageError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(StorageError::Timeout {
                    op: name.to_owned(),
                    after_ms: self.config.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn teardown(&self) {
        *self.outbound.lock().await = None;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        // Dropping the reply senders wakes every in-flight request with a
        // channel-closed error.
        self.pending.lock().await.clear();
    }
}

#[async_trait]
impl Connection for RemoteConnection {
    fn share_id(&self) -> String {
        format!("remote:{}#{}", self.config.url, self.config.scope)
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn do_connect(&self) -> Result<(), StorageError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| StorageError::ConnectFailed {
                message: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(self.config.channel_capacity);

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let frame = match message.encode() {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("dropping unencodable {} frame: {err}", message.kind());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let pending = self.pending.clone();
        let updates = self.updates.clone();
        let state = self.state.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(WireMessage::Response { id, response }) => {
                                if let Some(reply) = pending.lock().await.remove(&id) {
                                    let _ = reply.send(response);
                                } else {
                                    log::trace!("ack {id} arrived after its caller left");
                                }
                            }
                            Ok(WireMessage::ServerUpdate { record }) => {
                                log::trace!(
                                    "server update for {} @ {}",
                                    record.doc_id,
                                    record.timestamp
                                );
                                let _ = updates.send(record);
                            }
                            Ok(other) => {
                                log::trace!("ignoring {} frame from server", other.kind());
                            }
                            Err(err) => {
                                log::warn!("undecodable frame from server: {err}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            pending.lock().await.clear();
            if state.status() == ConnectionStatus::Connected {
                state.set(ConnectionStatus::Error, Some("connection lost".to_owned()));
            }
        });

        {
            let mut tasks = self.tasks.lock().await;
            tasks.retain(|task| !task.is_finished());
            tasks.push(writer);
            tasks.push(reader);
        }

        // Join before publishing the outbound channel, so no request can
        // reach the server ahead of the handshake.
        let joined = self
            .request_on(
                &out_tx,
                SpaceRequest::Join {
                    scope: self.config.scope.clone(),
                },
            )
            .await;
        match joined {
            Ok(SpaceResponse::Joined) => {
                *self.outbound.lock().await = Some(out_tx);
                Ok(())
            }
            Ok(_) => {
                self.teardown().await;
                Err(StorageError::UnexpectedResponse {
                    op: "join".to_owned(),
                })
            }
            Err(err) => {
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn do_disconnect(&self) -> Result<(), StorageError> {
        self.teardown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_request() {
        let message = WireMessage::Request {
            id: Uuid::new_v4(),
            request: SpaceRequest::PushDocUpdate {
                doc_id: "d".to_owned(),
                bin: vec![1, 2, 3],
                editor: Some("eve".to_owned()),
            },
        };
        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "request");
    }

    #[test]
    fn test_wire_roundtrip_server_update() {
        let message = WireMessage::ServerUpdate {
            record: DocRecord {
                doc_id: "d".to_owned(),
                bin: vec![0, 1],
                timestamp: 42,
                editor: None,
            },
        };
        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "server_update");
    }

    #[test]
    fn test_wire_decode_rejects_garbage() {
        let err = WireMessage::decode(&[0xff, 0xfe, 0xfd]).unwrap_err();
        assert!(matches!(err, StorageError::Wire { .. }));
    }

    #[test]
    fn test_request_names() {
        assert_eq!(
            SpaceRequest::Join {
                scope: SpaceScope::workspace("w"),
            }
            .name(),
            "join"
        );
        assert_eq!(SpaceRequest::ListBlobs.name(), "list_blobs");
        assert_eq!(
            SpaceRequest::DeleteBlob {
                key: "k".to_owned(),
                permanently: true,
            }
            .name(),
            "delete_blob"
        );
    }

    #[tokio::test]
    async fn test_request_without_connection_fails_fast() {
        let conn = RemoteConnection::new(RemoteConfig::for_testing(
            "ws://127.0.0.1:1",
            SpaceScope::workspace("w"),
        ));
        let err = conn
            .request(SpaceRequest::GetDoc {
                doc_id: "d".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_reports_error() {
        let conn = RemoteConnection::new(RemoteConfig::for_testing(
            "ws://127.0.0.1:1",
            SpaceScope::workspace("w"),
        ));
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, StorageError::ConnectFailed { .. }));
        assert_eq!(conn.status(), ConnectionStatus::Error);
    }
}
