//! Queue declaration: channel + QoS + durable queue.

use tracing::debug;

use crate::domain::QueueName;
use crate::error::QueueError;
use crate::ports::{BrokerChannel, BrokerConnection};

/// Open a channel on `connection`, bound in-flight deliveries to `prefetch`
/// (0 = unlimited) and declare `queue` durable and non-auto-delete.
///
/// Idempotent: declaring an existing queue with the same parameters is a no-op
/// on the broker side. The channel is closed again if any step fails.
pub async fn declare(
    connection: &dyn BrokerConnection,
    queue: &QueueName,
    prefetch: u16,
) -> Result<Box<dyn BrokerChannel>, QueueError> {
    let channel = connection.open_channel().await?;

    let setup = async {
        channel.set_prefetch(prefetch).await?;
        channel.declare_queue(queue).await
    };

    if let Err(e) = setup.await {
        if let Err(close_err) = channel.close().await {
            debug!(queue = %queue, error = %close_err, "closing channel after failed declare");
        }
        return Err(e);
    }

    debug!(queue = %queue, prefetch, "queue declared");
    Ok(channel)
}
