//! Declarative descriptions of exchanges and queues, and the operations that set them up on
//! the broker. Check out [`ExchangeSpec`] as a starting point.
//!
//! ```
//! use warren::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
//!
//! // a topic exchange feeding one queue that only wants the `sync` routing key
//! let orders = ExchangeSpec::new("orders", ExchangeKind::Topic)
//!     .with_queue(QueueSpec::new("orders.sync", "sync"));
//! # drop(orders);
//! ```
mod operations;

pub use lapin::ExchangeKind;

/// An exchange and, optionally, the queues that should be bound to it.
///
/// Exchanges are always declared durable, never auto-deleted and never internal.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    /// Queues bound by [`declare_exchange_with_queues`], in declaration order.
    ///
    /// [`declare_exchange_with_queues`]: crate::ConnectionManager::declare_exchange_with_queues
    pub queues: Vec<QueueSpec>,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            queues: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }
}

/// A queue, the routing key used to bind it and how its messages are acknowledged.
///
/// Queues are always declared durable, non-exclusive and never auto-deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub routing_key: String,
    /// If `true` the broker considers a message delivered as soon as it is sent to the
    /// consumer. Otherwise each message is acked once it reached the subscriber's sink.
    pub auto_ack: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_key: routing_key.into(),
            auto_ack: false,
        }
    }

    #[must_use]
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}
