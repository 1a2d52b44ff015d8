//! Broker port - connection, channel and delivery seams.
//!
//! Mirrors the AMQP 0.9.1 model: a connection is shared, channels are opened
//! per operation and never shared, deliveries are acked manually.
//!
//! # 実装
//! - `impls::amqp`: RabbitMQ via lapin（本番用）
//! - `impls::inmem_broker`: in-process broker（テスト・デモ用）

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::QueueName;
use crate::error::QueueError;

/// Stream of manual-ack deliveries for one consume session.
///
/// Ends (`None`) when the channel or its connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, QueueError>>;

/// Dials new broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// One dial attempt. Retrying is the connection manager's job.
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn BrokerConnection>, QueueError>;
}

/// A live broker connection, shared by every task of one role.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError>;

    fn is_closed(&self) -> bool;

    /// Resolves once the connection is closed, by the broker or by us.
    async fn closed(&self);

    async fn close(&self) -> Result<(), QueueError>;
}

/// A channel. Owned by exactly one task at a time.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Bound unacked deliveries on this channel (0 = unlimited).
    async fn set_prefetch(&self, prefetch: u16) -> Result<(), QueueError>;

    /// Declare a durable, non-auto-delete queue. Idempotent.
    async fn declare_queue(&self, queue: &QueueName) -> Result<(), QueueError>;

    /// Publish with persistent delivery mode to the default exchange.
    async fn publish(&self, queue: &QueueName, body: &[u8]) -> Result<(), QueueError>;

    /// Start a manual-ack consumer.
    async fn consume(&self, queue: &QueueName, consumer_tag: &str)
        -> Result<DeliveryStream, QueueError>;

    /// Close the channel. Unacked deliveries go back to their queues.
    async fn close(&self) -> Result<(), QueueError>;
}

/// One delivered message.
///
/// `ack` consumes the delivery, so it can be terminated at most once.
/// Dropping a delivery without acking leaves it pending until its channel
/// closes, after which the broker redelivers it.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    /// Set by the broker when this message was delivered before and not acked.
    fn redelivered(&self) -> bool;

    async fn ack(self: Box<Self>) -> Result<(), QueueError>;
}
