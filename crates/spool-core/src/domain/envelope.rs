//! Envelope - payload plus the retry metadata that travels with it.
//!
//! Wire format (JSON):
//! `{Message, FirstSeen, Attempt, NextAttempt, OriginalQueue, MaxAttempts, MaxTime}`
//! with RFC 3339 timestamps and `MaxTime` as integer nanoseconds.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::QueueName;
use crate::queue::RetryPolicy;

/// Envelope around a message of type `M`.
///
/// On the wire side the message is kept as raw JSON ([`RawEnvelope`]); it is
/// decoded into the handler's type only once the consumer knows which handler
/// owns the queue.
///
/// `Attempt` is the 1-based number of the handler invocation this envelope is
/// about to receive. A fresh envelope starts at 1; every pass through the
/// retry path adds exactly one.
///
/// Fields are private so `FirstSeen` cannot change after first production.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope<M> {
    message: M,
    first_seen: DateTime<Utc>,
    attempt: u32,
    next_attempt: DateTime<Utc>,
    original_queue: QueueName,
    #[serde(default)]
    max_attempts: u32,
    #[serde(default, with = "duration_nanos")]
    max_time: Duration,
}

/// Envelope whose message has not been decoded yet.
pub type RawEnvelope = Envelope<serde_json::Value>;

impl<M> Envelope<M> {
    /// Create an envelope for first production, stamped with the current time.
    pub fn new(queue: QueueName, message: M) -> Self {
        Self::new_at(queue, message, Utc::now())
    }

    pub fn new_at(queue: QueueName, message: M, now: DateTime<Utc>) -> Self {
        Self {
            message,
            first_seen: now,
            attempt: 1,
            next_attempt: now,
            original_queue: queue,
            max_attempts: 0,
            max_time: Duration::ZERO,
        }
    }

    /// Limit the number of handler invocations (0 = unlimited).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Limit the total retry horizon measured from `FirstSeen` (zero = unlimited).
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_attempt(&self) -> DateTime<Utc> {
        self.next_attempt
    }

    pub fn original_queue(&self) -> &QueueName {
        &self.original_queue
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    /// `FirstSeen + MaxTime`, or `None` when the horizon is unlimited.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        if self.max_time.is_zero() {
            return None;
        }
        TimeDelta::from_std(self.max_time)
            .ok()
            .and_then(|max_time| self.first_seen.checked_add_signed(max_time))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|deadline| now > deadline)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempt > self.max_attempts
    }

    /// Move to the next attempt after a retryable failure.
    ///
    /// `NextAttempt` is anchored at `FirstSeen`, not at the failed attempt.
    pub fn advance(&mut self, policy: &RetryPolicy) {
        self.attempt = self.attempt.saturating_add(1);
        self.next_attempt = policy.next_attempt(self.first_seen, self.attempt);
    }

    /// Swap the message while keeping every piece of retry metadata.
    pub fn map_message<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N> {
        Envelope {
            message: f(self.message),
            first_seen: self.first_seen,
            attempt: self.attempt,
            next_attempt: self.next_attempt,
            original_queue: self.original_queue,
            max_attempts: self.max_attempts,
            max_time: self.max_time,
        }
    }
}

impl<M: Serialize> Envelope<M> {
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<M: DeserializeOwned> Envelope<M> {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.attempt == 0 {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "Attempt must be at least 1",
            ));
        }
        Ok(envelope)
    }
}

impl RawEnvelope {
    /// Decode the raw message into the handler's type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Envelope<T>, serde_json::Error> {
        let message = T::deserialize(&self.message)?;
        Ok(self.clone().map_message(|_| message))
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::try_from(value.as_nanos()).unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
