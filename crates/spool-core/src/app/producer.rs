//! Producer - envelope を queue に publish する
//!
//! 呼び出しごとに channel を開いて閉じる（channel は共有しない）。
//! 失敗はそのまま呼び出し元へ返す。ここでは retry しない。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::connection::{ConnectionManager, Role};
use crate::domain::{Envelope, QueueName};
use crate::error::QueueError;
use crate::typed::Message;

/// Per-message retry budget set at enqueue time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Maximum handler invocations (0 = unlimited).
    pub max_attempts: u32,
    /// Retry horizon from first production (zero = unlimited).
    pub max_time: Duration,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }
}

#[derive(Clone)]
pub struct Producer {
    connections: Arc<ConnectionManager>,
}

impl Producer {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Build a fresh envelope for `T::QUEUE` and publish it.
    pub async fn enqueue<T: Message>(&self, message: T, options: EnqueueOptions) -> Result<(), QueueError> {
        let envelope = Envelope::new(T::QUEUE, message)
            .with_max_attempts(options.max_attempts)
            .with_max_time(options.max_time);
        self.publish(&T::QUEUE, &envelope).await
    }

    pub async fn publish<M: Serialize>(&self, queue: &QueueName, envelope: &Envelope<M>) -> Result<(), QueueError> {
        let body = envelope.to_vec()?;
        self.publish_bytes(queue, &body).await
    }

    /// Declare `queue` and publish `body` as is, on a channel of its own.
    pub async fn publish_bytes(&self, queue: &QueueName, body: &[u8]) -> Result<(), QueueError> {
        let connection = self.connections.get(Role::Producer).await?;
        let channel = connection.open_channel().await?;

        let result = async {
            channel.declare_queue(queue).await?;
            channel.publish(queue, body).await
        }
        .await;

        if let Err(e) = channel.close().await {
            debug!(queue = %queue, error = %e, "closing producer channel");
        }
        if result.is_ok() {
            debug!(queue = %queue, bytes = body.len(), "published");
        }
        result
    }
}
