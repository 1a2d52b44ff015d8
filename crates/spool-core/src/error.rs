use thiserror::Error;

use crate::domain::QueueName;

/// Infrastructure errors: broker I/O, codec, configuration and lifecycle.
///
/// Handler-reported business errors are [`crate::domain::HandlerError`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("declare failed for queue={queue}: {reason}")]
    Declare { queue: QueueName, reason: String },

    #[error("publish failed for queue={queue}: {reason}")]
    Publish { queue: QueueName, reason: String },

    #[error("consume failed for queue={queue}: {reason}")]
    Consume { queue: QueueName, reason: String },

    #[error("ack failed: {0}")]
    Ack(String),

    #[error("envelope codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("broker is already open")]
    AlreadyOpen,

    #[error("broker is shutting down")]
    Shutdown,
}

impl QueueError {
    pub(crate) fn declare(queue: &QueueName, reason: impl ToString) -> Self {
        Self::Declare {
            queue: queue.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn publish(queue: &QueueName, reason: impl ToString) -> Self {
        Self::Publish {
            queue: queue.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn consume(queue: &QueueName, reason: impl ToString) -> Self {
        Self::Consume {
            queue: queue.clone(),
            reason: reason.to_string(),
        }
    }
}
