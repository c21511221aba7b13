//! The op bridge: typed request/response plumbing between a storage client
//! and the backend that owns the actual storages.
//!
//! ```text
//!   client (producer)                      backend (consumer)
//!        │  Op { id, op }                        │
//!        ├──────────────────────────────────────►│ spawn handler task
//!        │  Cancel { id, reason }                │
//!        ├──────────────────────────────────────►│ abort handler task
//!        │  Subscribe { id, op }                 │
//!        ├──────────────────────────────────────►│ spawn stream task
//!        │◄──────────────────────────────────────┤ Return { id, result }
//!        │◄──────────────────────────────────────┤ Next { id, item }
//! ```
//!
//! Both directions are plain bounded channels, so the two halves can live
//! on different tasks, threads, or behind an adapter that forwards the
//! messages over a process boundary.

pub mod consumer;
pub mod ops;
pub mod producer;

pub use consumer::{OpConsumer, OpHandler, SubscriptionSink};
pub use ops::{BridgeMessage, OpEvent, OpOutput, OpRequest, SubscribeRequest, SubscriptionItem};
pub use producer::{BridgeConfig, OpProducer, Subscription};
