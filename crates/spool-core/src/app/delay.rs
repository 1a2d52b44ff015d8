//! DelayScheduler - delay queue を読み、期限が来たら元の queue に戻す
//!
//! # 方針
//! - 期限前の delivery は ack せずに手元の min-heap に保持する
//! - heap の先頭の期限で 1 本だけ timer を張る
//! - 期限が来たら再判定 → 元の queue に publish → ack
//! - `max_hold` より先の期限は、`max_hold` 経過後に delay queue へ同じ bytes で
//!   publish し直して ack する（broker の consumer timeout を超えて保持しない）
//! - session が終われば heap は捨てる（channel close で broker が requeue する）
//!
//! delay queue を通過しても `Attempt` / `NextAttempt` は変わらない。
//! publish するのは受け取った bytes そのもの。

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::producer::Producer;
use super::session::Session;
use crate::domain::{QueueName, RawEnvelope, Verdict};
use crate::error::QueueError;
use crate::ports::{BrokerConnection, Delivery, DeliveryStream};
use crate::queue::SessionEnd;

struct Held {
    due: Instant,
    seq: u64,
    /// Wall-clock time the timer stands for.
    release_at: DateTime<Utc>,
    envelope: RawEnvelope,
    delivery: Box<dyn Delivery>,
}

impl PartialEq for Held {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Held {}

impl PartialOrd for Held {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Held {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

pub struct DelayScheduler {
    producer: Producer,
    max_hold: TimeDelta,
    held: BinaryHeap<Reverse<Held>>,
    seq: u64,
}

impl DelayScheduler {
    /// `max_hold` bounds how long one delivery stays unacked (at most 24h).
    pub fn new(producer: Producer, max_hold: Duration) -> Self {
        let max_hold = TimeDelta::from_std(max_hold)
            .map_or(TimeDelta::hours(24), |hold| hold.min(TimeDelta::hours(24)));
        Self {
            producer,
            max_hold,
            held: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Deliveries currently held back, not yet due.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn next_due(&self) -> Option<Instant> {
        self.held.peek().map(|Reverse(held)| held.due)
    }

    /// Judge a fresh delivery from the delay queue.
    async fn accept(&mut self, delivery: Box<dyn Delivery>) -> Result<(), QueueError> {
        let envelope = match RawEnvelope::from_slice(delivery.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %QueueName::DELAY,
                    redelivered = delivery.redelivered(),
                    error = %e,
                    "dropping undecodable message"
                );
                return delivery.ack().await;
            }
        };
        self.settle(delivery, envelope, Utc::now()).await
    }

    /// Release every held entry whose timer has fired.
    async fn release_due(&mut self) -> Result<(), QueueError> {
        let now = Instant::now();
        while let Some(Reverse(head)) = self.held.peek() {
            if head.due > now {
                break;
            }
            let Some(Reverse(held)) = self.held.pop() else {
                break;
            };
            let now = Utc::now().max(held.release_at);
            if let Verdict::Pending { .. } = held.envelope.verdict(now) {
                self.recycle(held.delivery, &held.envelope).await?;
            } else {
                self.settle(held.delivery, held.envelope, now).await?;
            }
        }
        Ok(())
    }

    /// Put a delivery whose hold ran out back on the delay queue, unchanged.
    async fn recycle(&mut self, delivery: Box<dyn Delivery>, envelope: &RawEnvelope) -> Result<(), QueueError> {
        let body = delivery.body().to_vec();
        self.producer.publish_bytes(&QueueName::DELAY, &body).await?;
        debug!(
            queue = %envelope.original_queue(),
            attempt = envelope.attempt(),
            next_attempt = %envelope.next_attempt(),
            "delayed message recycled"
        );
        delivery.ack().await
    }

    async fn settle(
        &mut self,
        delivery: Box<dyn Delivery>,
        envelope: RawEnvelope,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        match envelope.verdict(now) {
            verdict @ (Verdict::Expired { .. } | Verdict::Exhausted { .. }) => {
                error!(
                    queue = %envelope.original_queue(),
                    attempt = envelope.attempt(),
                    verdict = ?verdict,
                    "dropping delayed message"
                );
                delivery.ack().await
            }
            Verdict::Due => {
                // 受け取った bytes をそのまま戻す
                let body = delivery.body().to_vec();
                self.producer
                    .publish_bytes(envelope.original_queue(), &body)
                    .await?;
                debug!(
                    queue = %envelope.original_queue(),
                    attempt = envelope.attempt(),
                    "delayed message released"
                );
                delivery.ack().await
            }
            Verdict::Pending { next_attempt } => {
                let release_at = now
                    .checked_add_signed(self.max_hold)
                    .map_or(next_attempt, |limit| next_attempt.min(limit));
                let wait = (release_at - now).to_std().unwrap_or_default();
                self.seq = self.seq.wrapping_add(1);
                debug!(
                    queue = %envelope.original_queue(),
                    attempt = envelope.attempt(),
                    next_attempt = %next_attempt,
                    "holding delayed message"
                );
                self.held.push(Reverse(Held {
                    due: Instant::now() + wait,
                    seq: self.seq,
                    release_at,
                    envelope,
                    delivery,
                }));
                Ok(())
            }
        }
    }

    async fn run_session(
        &mut self,
        deliveries: &mut DeliveryStream,
        connection: &dyn BrokerConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, QueueError> {
        loop {
            if *shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ = connection.closed() => return Ok(SessionEnd::ConnectionLost),
                _ = sleep_until(self.next_due()) => self.release_due().await?,
                next = deliveries.next() => {
                    let Some(delivery) = next else {
                        return Ok(SessionEnd::ConnectionLost);
                    };
                    self.accept(delivery?).await?;
                }
            }
        }
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Session for DelayScheduler {
    async fn consume(
        &mut self,
        deliveries: &mut DeliveryStream,
        connection: &dyn BrokerConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, QueueError> {
        let result = self.run_session(deliveries, connection, shutdown).await;

        // 保持していた delivery は ack されないまま channel close で requeue される
        if !self.held.is_empty() {
            debug!(held = self.held.len(), "returning held deliveries to the broker");
            self.held.clear();
        }
        result
    }
}
