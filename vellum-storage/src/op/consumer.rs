//! Handler side of the op bridge.
//!
//! One actor loop owns the pending-op and subscription tables. Each op runs
//! on its own task so a slow merge never blocks the loop; results come back
//! over an internal done channel and are only answered while the op is
//! still pending. Cancel aborts the op's task outright, so a canceled call
//! stops consuming resources instead of finishing into the void.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::StorageError;
use crate::op::ops::{BridgeMessage, OpEvent, OpOutput, OpRequest, SubscribeRequest, SubscriptionItem};
use crate::op::producer::BridgeConfig;

/// Push half handed to subscription handlers.
#[derive(Clone)]
pub struct SubscriptionSink {
    id: Uuid,
    outbound: mpsc::Sender<BridgeMessage>,
}

impl SubscriptionSink {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn push(&self, item: SubscriptionItem) -> Result<(), StorageError> {
        self.outbound
            .send(BridgeMessage::Next { id: self.id, item })
            .await
            .map_err(|_| StorageError::ChannelClosed)
    }
}

/// What the consumer drives: one-shot ops plus long-lived subscriptions.
#[async_trait]
pub trait OpHandler: Send + Sync + 'static {
    async fn handle(&self, op: OpRequest) -> Result<OpOutput, StorageError>;

    /// Start a subscription that pushes through `sink` until the returned
    /// task is aborted.
    async fn subscribe(
        &self,
        op: SubscribeRequest,
        sink: SubscriptionSink,
    ) -> Result<JoinHandle<()>, StorageError>;
}

pub struct OpConsumer {
    events: broadcast::Sender<OpEvent>,
    task: JoinHandle<()>,
}

impl OpConsumer {
    pub fn spawn(
        inbound: mpsc::Receiver<BridgeMessage>,
        outbound: mpsc::Sender<BridgeMessage>,
        handler: Arc<dyn OpHandler>,
        config: &BridgeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let task = tokio::spawn(consumer_loop(inbound, outbound, handler, events.clone()));
        Self { events, task }
    }

    /// After-event stream (completed pushes and the like).
    pub fn events(&self) -> broadcast::Receiver<OpEvent> {
        self.events.subscribe()
    }
}

impl Drop for OpConsumer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PendingOp {
    name: &'static str,
    task: JoinHandle<()>,
}

type DoneMessage = (Uuid, &'static str, Result<OpOutput, StorageError>);

async fn consumer_loop(
    mut inbound: mpsc::Receiver<BridgeMessage>,
    outbound: mpsc::Sender<BridgeMessage>,
    handler: Arc<dyn OpHandler>,
    events: broadcast::Sender<OpEvent>,
) {
    let mut pending: HashMap<Uuid, PendingOp> = HashMap::new();
    let mut subscriptions: HashMap<Uuid, JoinHandle<()>> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<DoneMessage>();

    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(BridgeMessage::Op { id, op }) => {
                    log::debug!("op {} ({id})", op.name());
                    if matches!(op, OpRequest::Destroy) {
                        // Terminal: run inline, answer, stop consuming.
                        let result = handler.handle(op).await;
                        let _ = outbound.send(BridgeMessage::Return { id, result }).await;
                        break;
                    }
                    let name = op.name();
                    let task = {
                        let handler = handler.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            let result = handler.handle(op).await;
                            let _ = done.send((id, name, result));
                        })
                    };
                    pending.insert(id, PendingOp { name, task });
                }
                Some(BridgeMessage::Subscribe { id, op }) => {
                    log::debug!("subscribe {} ({id})", op.name());
                    let sink = SubscriptionSink { id, outbound: outbound.clone() };
                    match handler.subscribe(op, sink).await {
                        Ok(task) => {
                            subscriptions.insert(id, task);
                        }
                        Err(err) => {
                            let _ = outbound
                                .send(BridgeMessage::Return { id, result: Err(err) })
                                .await;
                        }
                    }
                }
                Some(BridgeMessage::Cancel { id, reason }) => {
                    if let Some(op) = pending.remove(&id) {
                        log::debug!("op {} ({id}) canceled: {reason}", op.name);
                        op.task.abort();
                    } else if let Some(task) = subscriptions.remove(&id) {
                        log::debug!("subscription {id} canceled: {reason}");
                        task.abort();
                    } else {
                        log::trace!("cancel for unknown id {id} ignored");
                    }
                }
                Some(other) => {
                    log::trace!("consumer ignoring out-of-place {} message", other.kind());
                }
                None => break,
            },
            done = done_rx.recv() => {
                let Some((id, name, result)) = done else { continue };
                if pending.remove(&id).is_none() {
                    log::trace!("suppressing reply for canceled op {name} ({id})");
                    continue;
                }
                if let Ok(output) = &result {
                    publish_after_event(&events, name, output);
                }
                if outbound.send(BridgeMessage::Return { id, result }).await.is_err() {
                    break;
                }
            },
        }
    }

    for (_, op) in pending {
        op.task.abort();
    }
    for (_, task) in subscriptions {
        task.abort();
    }
}

fn publish_after_event(
    events: &broadcast::Sender<OpEvent>,
    name: &'static str,
    output: &OpOutput,
) {
    if name == "push_doc_update" {
        if let OpOutput::Clock(clock) = output {
            let _ = events.send(OpEvent::DocUpdatePushed {
                doc_id: clock.doc_id.clone(),
                timestamp: clock.timestamp,
            });
        }
    }
}
