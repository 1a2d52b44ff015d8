//! Consume session supervision shared by the consumer loops and the delay scheduler.
//!
//! One session = one channel + one consumer tag on the consumer-role
//! connection. When a session ends for any reason other than shutdown, its
//! channel is closed (the broker requeues whatever was unacked) and a new
//! session starts after a backoff step.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::connection::{ConnectionManager, DialBackoff, Role};
use crate::domain::QueueName;
use crate::error::QueueError;
use crate::ports::{BrokerConnection, DeliveryStream};
use crate::queue::{ConsumerState, SessionEnd, declare};

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// What runs inside one consume session.
#[async_trait]
pub(crate) trait Session: Send {
    /// Read deliveries until shutdown, connection loss or an error.
    ///
    /// Returning `Err` aborts the session; unacked deliveries are redelivered.
    async fn consume(
        &mut self,
        deliveries: &mut DeliveryStream,
        connection: &dyn BrokerConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, QueueError>;
}

pub(crate) struct Supervisor {
    pub queue: QueueName,
    pub prefetch: u16,
    pub connections: Arc<ConnectionManager>,
    pub backoff: DialBackoff,
    pub shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Run sessions back to back until shutdown.
    pub async fn run<S: Session>(mut self, mut session: S) {
        let mut failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let delay = match self.session_once(&mut session).await {
                Ok(SessionEnd::Shutdown) | Err(QueueError::Shutdown) => break,
                Ok(SessionEnd::ConnectionLost) => {
                    warn!(queue = %self.queue, "consume session lost its connection");
                    failures = 0;
                    self.backoff.delay(0)
                }
                Err(e) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    error!(
                        queue = %self.queue,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "consume session aborted"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut self.shutdown) => break,
            }
        }

        info!(queue = %self.queue, "consumer stopped");
    }

    async fn session_once<S: Session>(&mut self, session: &mut S) -> Result<SessionEnd, QueueError> {
        self.transition(ConsumerState::Connecting);
        let connection = self.connections.get(Role::Consumer).await?;

        self.transition(ConsumerState::Declaring);
        let channel = declare(connection.as_ref(), &self.queue, self.prefetch).await?;

        let consumer_tag = format!("spool-{}-{}", self.queue, Ulid::new());
        let result = async {
            let mut deliveries = channel.consume(&self.queue, &consumer_tag).await?;
            self.transition(ConsumerState::Consuming);
            info!(queue = %self.queue, consumer_tag = %consumer_tag, prefetch = self.prefetch, "consuming");
            session
                .consume(&mut deliveries, connection.as_ref(), &mut self.shutdown)
                .await
        }
        .await;

        // unacked は broker 側で requeue される
        if let Err(e) = channel.close().await {
            debug!(queue = %self.queue, error = %e, "closing consumer channel");
        }
        result
    }

    fn transition(&self, state: ConsumerState) {
        debug!(queue = %self.queue, state = %state, "consumer state");
    }
}
