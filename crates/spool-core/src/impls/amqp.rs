//! RabbitMQ implementation of the broker port using `lapin` (AMQP 0.9.1).
//!
//! - queues are declared durable on the default exchange (routing key = queue name)
//! - publishes use delivery mode 2 (persistent) and wait for the publisher confirm
//! - consumers run with manual ack; QoS prefetch bounds unacked deliveries
//! - a broker-side close is surfaced through `BrokerConnection::closed()`

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::warn;

use crate::domain::QueueName;
use crate::error::QueueError;
use crate::ports::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ at `url`.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connection URL with credentials hidden, for logging.
    pub fn url_redacted(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}***{}", &self.url[..scheme_end + 3], &self.url[at..])
            }
            _ => self.url.clone(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let connection = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(connection_name.into()),
        )
        .await
        .map_err(|e| {
            QueueError::Connection(format!("RabbitMQ connection to {} failed: {e}", self.url_redacted()))
        })?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let name = connection_name.to_string();
        connection.on_error(move |err| {
            warn!(connection = %name, error = %err, "RabbitMQ connection error");
            let _ = closed_tx.send(true);
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            closed_rx,
        }))
    }
}

struct AmqpConnection {
    inner: Connection,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(format!("RabbitMQ channel creation failed: {e}")))?;
        // publish はすべて broker の ack を待つ
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Channel(format!("failed to enable publisher confirms: {e}")))?;
        Ok(Box::new(AmqpChannel { inner: channel }))
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || !self.inner.status().connected()
    }

    async fn closed(&self) {
        if !self.inner.status().connected() {
            return;
        }
        let mut closed_rx = self.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "spool shutdown")
            .await
            .map_err(|e| QueueError::Connection(format!("RabbitMQ close failed: {e}")))
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, prefetch: u16) -> Result<(), QueueError> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Channel(format!("failed to set QoS: {e}")))
    }

    async fn declare_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        self.inner
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| QueueError::declare(queue, e))
    }

    async fn publish(&self, queue: &QueueName, body: &[u8]) -> Result<(), QueueError> {
        let confirm = self
            .inner
            .basic_publish(
                "",             // default exchange
                queue.as_str(), // routing key = queue name
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2) // persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| QueueError::publish(queue, e))?;

        let confirmation = confirm
            .await
            .map_err(|e| QueueError::publish(queue, format!("confirmation failed: {e}")))?;
        confirmed(queue, confirmation)
    }

    async fn consume(
        &self,
        queue: &QueueName,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        let consumer = self
            .inner
            .basic_consume(
                queue.as_str(),
                consumer_tag,
                BasicConsumeOptions::default(), // no_ack = false
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::consume(queue, e))?;

        let queue = queue.clone();
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(Box::new(AmqpDelivery { inner: delivery }) as Box<dyn Delivery>),
            Err(e) => Err(QueueError::consume(&queue, e)),
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "consumer done")
            .await
            .map_err(|e| QueueError::Channel(format!("channel close failed: {e}")))
    }
}

/// Only a broker ack counts as published.
fn confirmed(queue: &QueueName, confirmation: Confirmation) -> Result<(), QueueError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(QueueError::publish(queue, "broker nacked the message")),
        Confirmation::NotRequested => Err(QueueError::publish(
            queue,
            "publisher confirms are not enabled on this channel",
        )),
    }
}

struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Ack(format!("delivery_tag={}: {e}", self.inner.delivery_tag)))
    }
}
