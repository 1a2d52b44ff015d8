//! ConsumerLoop - 1 queue 分の受信ループ
//!
//! # フロー
//! 1. delivery を受け取る
//! 2. envelope を decode（失敗したら warn して ack, 捨てる）
//! 3. 登録済み handler を呼ぶ
//! 4. 結果に応じて ack / delay queue へ再投入 / 破棄
//!
//! handler は queue ごとに逐次実行。遅い handler が止めるのは自分の queue だけ。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::producer::Producer;
use super::session::Session;
use crate::domain::{HandlerError, QueueName, RawEnvelope};
use crate::error::QueueError;
use crate::ports::{BrokerConnection, Delivery, DeliveryStream};
use crate::queue::{RetryPolicy, SessionEnd};
use crate::typed::DynHandler;

pub struct ConsumerLoop {
    queue: QueueName,
    handler: Arc<dyn DynHandler>,
    producer: Producer,
    retry: RetryPolicy,
}

impl ConsumerLoop {
    pub fn new(
        queue: QueueName,
        handler: Arc<dyn DynHandler>,
        producer: Producer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            handler,
            producer,
            retry,
        }
    }

    /// Handle one delivery and settle it.
    ///
    /// `Err` means the delivery could not be settled (republish or ack
    /// failed). It stays unacked and the broker will redeliver it.
    pub async fn dispatch(&self, delivery: Box<dyn Delivery>) -> Result<(), QueueError> {
        let envelope = match RawEnvelope::from_slice(delivery.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    redelivered = delivery.redelivered(),
                    error = %e,
                    "dropping undecodable message"
                );
                return delivery.ack().await;
            }
        };

        match self.handler.handle_dyn(&envelope).await {
            Ok(()) => {
                debug!(queue = %self.queue, attempt = envelope.attempt(), "message handled");
                delivery.ack().await
            }
            Err(err) if err.is_retryable() => self.schedule_retry(delivery, envelope, err).await,
            Err(err) => {
                error!(
                    queue = %self.queue,
                    attempt = envelope.attempt(),
                    error = %err,
                    "dropping message after permanent failure"
                );
                delivery.ack().await
            }
        }
    }

    async fn schedule_retry(
        &self,
        delivery: Box<dyn Delivery>,
        mut envelope: RawEnvelope,
        err: HandlerError,
    ) -> Result<(), QueueError> {
        envelope.advance(&self.retry);

        let verdict = envelope.verdict(Utc::now());
        if verdict.is_drop() {
            error!(
                queue = %self.queue,
                attempt = envelope.attempt(),
                max_attempts = envelope.max_attempts(),
                verdict = ?verdict,
                error = %err,
                "dropping message, retry budget spent"
            );
            return delivery.ack().await;
        }

        // 先に delay queue へ publish、それから ack（逆だと落ちた時に消える）
        self.producer.publish(&QueueName::DELAY, &envelope).await?;
        debug!(
            queue = %self.queue,
            attempt = envelope.attempt(),
            next_attempt = %envelope.next_attempt(),
            error = %err,
            "retry scheduled"
        );
        delivery.ack().await
    }
}

#[async_trait]
impl Session for ConsumerLoop {
    async fn consume(
        &mut self,
        deliveries: &mut DeliveryStream,
        connection: &dyn BrokerConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, QueueError> {
        loop {
            if *shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    continue;
                }
                _ = connection.closed() => return Ok(SessionEnd::ConnectionLost),
                next = deliveries.next() => next,
            };

            let Some(delivery) = next else {
                return Ok(SessionEnd::ConnectionLost);
            };
            self.dispatch(delivery?).await?;
        }
    }
}
