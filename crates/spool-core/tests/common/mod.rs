#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use spool_core::app::DialBackoff;
use spool_core::{BrokerConfig, Envelope, Handler, HandlerError, InMemoryBroker, Message, QueueName, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u32,
}

impl Message for Job {
    const QUEUE: QueueName = QueueName::APP_REFRESH;
}

/// Millisecond-scale timings so retries finish quickly.
pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        dial_backoff: DialBackoff {
            initial_ms: 1,
            max_ms: 20,
            multiplier: 2.0,
            jitter: 0.0,
        },
        retry: RetryPolicy::new(1.3, Duration::from_millis(1), Duration::from_secs(1)),
        ..BrokerConfig::default()
    }
}

/// One handler invocation as seen by [`Flaky`].
#[derive(Debug, Clone)]
pub struct Call {
    pub id: u32,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Fails the first `failures` invocations (retryable), then succeeds.
#[derive(Clone)]
pub struct Flaky {
    pub failures: usize,
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl Flaky {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always() -> Self {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.calls().iter().map(|c| c.attempt).collect()
    }
}

#[async_trait]
impl Handler<Job> for Flaky {
    async fn handle(&self, envelope: &Envelope<Job>) -> Result<(), HandlerError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                id: envelope.message().id,
                attempt: envelope.attempt(),
                at: Utc::now(),
            });
            calls.len()
        };
        if seen <= self.failures {
            return Err(HandlerError::retry(format!("failure #{seen}")));
        }
        Ok(())
    }
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Nothing ready or unacked on `queue`.
pub async fn is_drained(broker: &InMemoryBroker, queue: &QueueName) -> bool {
    broker.ready_count(queue).await == 0 && broker.unacked_count(queue).await == 0
}
