//! Caller side of the op bridge.
//!
//! The producer assigns every call a fresh id, posts it to the consumer,
//! and parks on a oneshot until the matching `Return` arrives. Timeouts and
//! dropped futures both route through the cancel path, so the consumer can
//! stop working on calls nobody is waiting for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::StorageError;
use crate::op::ops::{BridgeMessage, OpOutput, OpRequest, SubscribeRequest, SubscriptionItem};

/// Bridge tuning knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline for one-shot calls.
    pub op_timeout: Duration,
    /// Capacity of each bridge direction.
    pub channel_capacity: usize,
    /// Buffer of each subscription stream.
    pub subscription_capacity: usize,
    /// Buffer of the consumer's after-event channel.
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(3000),
            channel_capacity: 256,
            subscription_capacity: 64,
            event_capacity: 64,
        }
    }
}

impl BridgeConfig {
    /// Short deadlines and small buffers for tests.
    pub fn for_testing() -> Self {
        Self {
            op_timeout: Duration::from_millis(500),
            channel_capacity: 16,
            subscription_capacity: 16,
            event_capacity: 16,
        }
    }
}

type ReplySender = oneshot::Sender<Result<OpOutput, StorageError>>;
type PendingMap = Arc<Mutex<HashMap<Uuid, ReplySender>>>;
type SubscriptionMap = Arc<Mutex<HashMap<Uuid, mpsc::Sender<SubscriptionItem>>>>;
type CancelSender = mpsc::UnboundedSender<(Uuid, String)>;

pub struct OpProducer {
    outbound: mpsc::Sender<BridgeMessage>,
    cancels: CancelSender,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
    op_timeout: Duration,
    subscription_capacity: usize,
    reader: JoinHandle<()>,
}

impl OpProducer {
    pub fn new(
        outbound: mpsc::Sender<BridgeMessage>,
        inbound: mpsc::Receiver<BridgeMessage>,
        config: &BridgeConfig,
    ) -> Self {
        let pending: PendingMap = Arc::default();
        let subscriptions: SubscriptionMap = Arc::default();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(
            inbound,
            cancel_rx,
            outbound.clone(),
            pending.clone(),
            subscriptions.clone(),
        ));
        Self {
            outbound,
            cancels: cancel_tx,
            pending,
            subscriptions,
            op_timeout: config.op_timeout,
            subscription_capacity: config.subscription_capacity,
            reader,
        }
    }

    /// Send a one-shot op and wait for its result.
    ///
    /// Dropping the returned future before completion cancels the op on the
    /// consumer side; so does hitting the deadline.
    pub async fn send(&self, op: OpRequest) -> Result<OpOutput, StorageError> {
        let id = Uuid::new_v4();
        let name = op.name();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        let mut guard = CancelOnDrop {
            id,
            cancels: self.cancels.clone(),
            armed: true,
        };

        if self.outbound.send(BridgeMessage::Op { id, op }).await.is_err() {
            guard.armed = false;
            self.pending.lock().await.remove(&id);
            return Err(StorageError::ChannelClosed);
        }

        match tokio::time::timeout(self.op_timeout, reply_rx).await {
            Ok(Ok(result)) => {
                guard.armed = false;
                result
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(StorageError::ChannelClosed)
            }
            Err(_) => {
                guard.armed = false;
                let _ = self.cancels.send((id, "timeout".to_owned()));
                Err(StorageError::Timeout {
                    op: name.to_owned(),
                    after_ms: self.op_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Open a subscription stream. Dropping the handle unsubscribes.
    pub async fn subscribe(&self, op: SubscribeRequest) -> Result<Subscription, StorageError> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.subscription_capacity);
        self.subscriptions.lock().await.insert(id, tx);
        if self
            .outbound
            .send(BridgeMessage::Subscribe { id, op })
            .await
            .is_err()
        {
            self.subscriptions.lock().await.remove(&id);
            return Err(StorageError::ChannelClosed);
        }
        Ok(Subscription {
            id,
            items: rx,
            cancels: self.cancels.clone(),
        })
    }
}

impl Drop for OpProducer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A live subscription stream.
pub struct Subscription {
    id: Uuid,
    items: mpsc::Receiver<SubscriptionItem>,
    cancels: CancelSender,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next pushed item; `None` once the bridge is gone.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        self.items.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancels.send((self.id, "unsubscribed".to_owned()));
    }
}

/// Posts a cancel for ops whose caller went away mid-flight.
struct CancelOnDrop {
    id: Uuid,
    cancels: CancelSender,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.cancels.send((self.id, "dropped".to_owned()));
        }
    }
}

async fn reader_loop(
    mut inbound: mpsc::Receiver<BridgeMessage>,
    mut cancels: mpsc::UnboundedReceiver<(Uuid, String)>,
    outbound: mpsc::Sender<BridgeMessage>,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
) {
    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(BridgeMessage::Return { id, result }) => {
                    match pending.lock().await.remove(&id) {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => log::trace!("dropping late return for {id}"),
                    }
                }
                Some(BridgeMessage::Next { id, item }) => {
                    let subs = subscriptions.lock().await;
                    if let Some(sink) = subs.get(&id) {
                        if sink.try_send(item).is_err() {
                            log::warn!("subscription {id} is lagging, dropping an item");
                        }
                    } else {
                        log::trace!("dropping item for unknown subscription {id}");
                    }
                }
                Some(other) => {
                    log::trace!("producer ignoring out-of-place {} message", other.kind());
                }
                None => break,
            },
            cancel = cancels.recv() => match cancel {
                Some((id, reason)) => {
                    pending.lock().await.remove(&id);
                    subscriptions.lock().await.remove(&id);
                    if outbound
                        .send(BridgeMessage::Cancel { id, reason })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    // Consumer is gone. Fail everything still waiting.
    for (_, reply) in pending.lock().await.drain() {
        let _ = reply.send(Err(StorageError::ChannelClosed));
    }
    subscriptions.lock().await.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocClock, DocRecord};
    use std::time::Duration;

    fn harness(
        config: &BridgeConfig,
    ) -> (
        OpProducer,
        mpsc::Receiver<BridgeMessage>,
        mpsc::Sender<BridgeMessage>,
    ) {
        let (to_consumer_tx, to_consumer_rx) = mpsc::channel(config.channel_capacity);
        let (to_producer_tx, to_producer_rx) = mpsc::channel(config.channel_capacity);
        let producer = OpProducer::new(to_consumer_tx, to_producer_rx, config);
        (producer, to_consumer_rx, to_producer_tx)
    }

    #[tokio::test]
    async fn test_send_resolves_with_matching_return() {
        let config = BridgeConfig::for_testing();
        let (producer, mut consumer_rx, consumer_tx) = harness(&config);

        let echo = tokio::spawn(async move {
            while let Some(msg) = consumer_rx.recv().await {
                if let BridgeMessage::Op { id, .. } = msg {
                    let result = Ok(OpOutput::Clock(DocClock {
                        doc_id: "doc".to_owned(),
                        timestamp: 7,
                    }));
                    consumer_tx
                        .send(BridgeMessage::Return { id, result })
                        .await
                        .unwrap();
                }
            }
        });

        let output = producer
            .send(OpRequest::GetDoc {
                doc_id: "doc".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(
            output,
            OpOutput::Clock(DocClock {
                doc_id: "doc".to_owned(),
                timestamp: 7,
            })
        );
        drop(producer);
        echo.abort();
    }

    #[tokio::test]
    async fn test_timeout_posts_cancel() {
        let config = BridgeConfig {
            op_timeout: Duration::from_millis(50),
            ..BridgeConfig::for_testing()
        };
        let (producer, mut consumer_rx, _consumer_tx) = harness(&config);

        let err = producer
            .send(OpRequest::GetDoc {
                doc_id: "slow".to_owned(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout { ref op, .. } if op == "get_doc"));

        let op_msg = consumer_rx.recv().await.unwrap();
        let op_id = op_msg.id();
        assert_eq!(op_msg.kind(), "op");
        let cancel = consumer_rx.recv().await.unwrap();
        match cancel {
            BridgeMessage::Cancel { id, reason } => {
                assert_eq!(id, op_id);
                assert_eq!(reason, "timeout");
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_call_posts_cancel() {
        let config = BridgeConfig::for_testing();
        let (producer, mut consumer_rx, _consumer_tx) = harness(&config);
        let producer = Arc::new(producer);

        let call = {
            let producer = producer.clone();
            tokio::spawn(async move {
                let _ = producer
                    .send(OpRequest::GetDoc {
                        doc_id: "abandoned".to_owned(),
                    })
                    .await;
            })
        };

        let op_msg = consumer_rx.recv().await.unwrap();
        let op_id = op_msg.id();
        call.abort();

        let cancel = consumer_rx.recv().await.unwrap();
        match cancel {
            BridgeMessage::Cancel { id, reason } => {
                assert_eq!(id, op_id);
                assert_eq!(reason, "dropped");
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_return_after_timeout_is_dropped() {
        let config = BridgeConfig {
            op_timeout: Duration::from_millis(40),
            ..BridgeConfig::for_testing()
        };
        let (producer, mut consumer_rx, consumer_tx) = harness(&config);

        let err = producer
            .send(OpRequest::ReleaseBlobs)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout { .. }));

        // Answer anyway, long after the caller gave up.
        let op_id = consumer_rx.recv().await.unwrap().id();
        consumer_tx
            .send(BridgeMessage::Return {
                id: op_id,
                result: Ok(OpOutput::Unit),
            })
            .await
            .unwrap();

        // The bridge stays healthy for the next call.
        let follow_up = tokio::spawn(async move {
            while let Some(msg) = consumer_rx.recv().await {
                if let BridgeMessage::Op { id, .. } = msg {
                    consumer_tx
                        .send(BridgeMessage::Return {
                            id,
                            result: Ok(OpOutput::Unit),
                        })
                        .await
                        .unwrap();
                }
            }
        });
        let output = producer.send(OpRequest::ClearPeerClocks).await.unwrap();
        assert_eq!(output, OpOutput::Unit);
        drop(producer);
        follow_up.abort();
    }

    #[tokio::test]
    async fn test_subscription_receives_items_and_unsubscribes_on_drop() {
        let config = BridgeConfig::for_testing();
        let (producer, mut consumer_rx, consumer_tx) = harness(&config);

        let mut sub = producer.subscribe(SubscribeRequest::DocUpdate).await.unwrap();
        let sub_msg = consumer_rx.recv().await.unwrap();
        let sub_id = sub_msg.id();
        assert_eq!(sub_msg.kind(), "subscribe");

        let record = DocRecord {
            doc_id: "doc".to_owned(),
            bin: vec![1],
            timestamp: 1,
            editor: None,
        };
        consumer_tx
            .send(BridgeMessage::Next {
                id: sub_id,
                item: SubscriptionItem::DocUpdate(record.clone()),
            })
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            SubscriptionItem::DocUpdate(received) => assert_eq!(received, record),
            other => panic!("expected doc update, got {other:?}"),
        }

        drop(sub);
        let cancel = consumer_rx.recv().await.unwrap();
        match cancel {
            BridgeMessage::Cancel { id, reason } => {
                assert_eq!(id, sub_id);
                assert_eq!(reason, "unsubscribed");
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_noise_is_ignored() {
        let config = BridgeConfig::for_testing();
        let (producer, mut consumer_rx, consumer_tx) = harness(&config);

        // Unknown-id return, unknown-id item, and an out-of-place op.
        consumer_tx
            .send(BridgeMessage::Return {
                id: Uuid::new_v4(),
                result: Ok(OpOutput::Unit),
            })
            .await
            .unwrap();
        consumer_tx
            .send(BridgeMessage::Next {
                id: Uuid::new_v4(),
                item: SubscriptionItem::DocUpdate(DocRecord {
                    doc_id: "x".to_owned(),
                    bin: vec![],
                    timestamp: 0,
                    editor: None,
                }),
            })
            .await
            .unwrap();
        consumer_tx
            .send(BridgeMessage::Op {
                id: Uuid::new_v4(),
                op: OpRequest::ListBlobs,
            })
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            while let Some(msg) = consumer_rx.recv().await {
                if let BridgeMessage::Op { id, .. } = msg {
                    consumer_tx
                        .send(BridgeMessage::Return {
                            id,
                            result: Ok(OpOutput::Unit),
                        })
                        .await
                        .unwrap();
                }
            }
        });

        let output = producer.send(OpRequest::ReleaseBlobs).await.unwrap();
        assert_eq!(output, OpOutput::Unit);
        drop(producer);
        responder.abort();
    }

    #[tokio::test]
    async fn test_consumer_shutdown_fails_pending_calls() {
        let config = BridgeConfig::for_testing();
        let (producer, consumer_rx, consumer_tx) = harness(&config);

        let call = {
            let producer = Arc::new(producer);
            tokio::spawn(async move {
                producer.send(OpRequest::ListBlobs).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(consumer_rx);
        drop(consumer_tx);

        let result = call.await.unwrap();
        assert!(matches!(result, Err(StorageError::ChannelClosed)));
    }
}
