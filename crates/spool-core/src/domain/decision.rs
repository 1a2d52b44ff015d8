//! Verdict: what the retry path does with an envelope right now.
//!
//! Pure function of the envelope and the current time. The consumer asks for
//! a verdict after advancing a failed envelope, and the delay scheduler asks
//! for one on every delivery it reads and again when a held entry comes due.

use chrono::{DateTime, Utc};

use super::Envelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `FirstSeen + MaxTime` has passed. Drop.
    Expired { deadline: DateTime<Utc> },

    /// `Attempt` went past `MaxAttempts`. Drop.
    Exhausted { attempt: u32, max_attempts: u32 },

    /// `NextAttempt <= now`. Send back to the original queue.
    Due,

    /// Not due yet. Hold until `next_attempt`.
    Pending { next_attempt: DateTime<Utc> },
}

impl Verdict {
    /// Should the message be dropped (acked without redelivery)?
    pub fn is_drop(&self) -> bool {
        matches!(self, Verdict::Expired { .. } | Verdict::Exhausted { .. })
    }
}

impl<M> Envelope<M> {
    /// Expiry is checked before exhaustion, exhaustion before due time.
    pub fn verdict(&self, now: DateTime<Utc>) -> Verdict {
        if let Some(deadline) = self.deadline()
            && now > deadline
        {
            return Verdict::Expired { deadline };
        }
        if self.is_exhausted() {
            return Verdict::Exhausted {
                attempt: self.attempt(),
                max_attempts: self.max_attempts(),
            };
        }
        if self.next_attempt() <= now {
            Verdict::Due
        } else {
            Verdict::Pending {
                next_attempt: self.next_attempt(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use rstest::rstest;

    use super::*;
    use crate::domain::QueueName;
    use crate::queue::RetryPolicy;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn failed_times(n: u32, max_attempts: u32, max_time: Duration) -> Envelope<()> {
        let mut env = Envelope::new_at(QueueName::APP_REFRESH, (), t0())
            .with_max_attempts(max_attempts)
            .with_max_time(max_time);
        for _ in 0..n {
            env.advance(&RetryPolicy::default());
        }
        env
    }

    #[test]
    fn fresh_envelope_is_due_immediately() {
        let env = failed_times(0, 0, Duration::ZERO);
        assert_eq!(env.verdict(t0()), Verdict::Due);
    }

    #[rstest]
    #[case(1, 5, false)]
    #[case(4, 5, false)]
    #[case(5, 5, true)]
    #[case(50, 0, false)]
    fn exhaustion_follows_max_attempts(
        #[case] failures: u32,
        #[case] max_attempts: u32,
        #[case] exhausted: bool,
    ) {
        let env = failed_times(failures, max_attempts, Duration::ZERO);
        let far_future = t0() + TimeDelta::days(365);
        assert_eq!(env.verdict(far_future).is_drop(), exhausted);
    }

    #[test]
    fn pending_until_next_attempt() {
        let env = failed_times(2, 0, Duration::ZERO);
        let next = env.next_attempt();

        assert_eq!(
            env.verdict(next - TimeDelta::milliseconds(1)),
            Verdict::Pending { next_attempt: next }
        );
        assert_eq!(env.verdict(next), Verdict::Due);
    }

    #[test]
    fn expiry_wins_over_everything() {
        let env = failed_times(9, 3, Duration::from_secs(5));
        let verdict = env.verdict(t0() + TimeDelta::seconds(6));
        assert!(matches!(verdict, Verdict::Expired { .. }));
    }

    #[test]
    fn unlimited_budget_never_drops() {
        let env = failed_times(200, 0, Duration::ZERO);
        assert!(!env.verdict(t0() + TimeDelta::days(3650)).is_drop());
    }
}
