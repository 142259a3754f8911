// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Pure decision logic for failed messages. The delay between attempts is fixed;
//! it does not grow with the retry count.

use crate::configs::ConsumerConfigs;
use lapin::types::{AMQPValue, FieldTable};
use std::time::Duration;

/// Header carrying how many times a message has already been retried.
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// What to do with a message whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the message in the delay queue; it comes back after the delay.
    Delay { retry_count: i64 },

    /// Retries exhausted, move the message to the error sink.
    Quarantine { retry_count: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry_count: i64,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry_count: i64, delay: Duration) -> Self {
        Self {
            max_retry_count,
            delay,
        }
    }

    /// Decides the fate of a failed message.
    ///
    /// `retry_count` is the value after incrementing the header of the failed
    /// delivery, so the first failure is decided with `1`. A message is quarantined
    /// once `retry_count > max_retry_count`: with a maximum of `N` it is delivered
    /// `N + 1` times at most.
    pub fn decide(&self, retry_count: i64) -> RetryDecision {
        if retry_count > self.max_retry_count {
            RetryDecision::Quarantine { retry_count }
        } else {
            RetryDecision::Delay { retry_count }
        }
    }

    /// Message TTL in the delay queue, in milliseconds.
    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }
}

impl From<&ConsumerConfigs> for RetryPolicy {
    fn from(cfg: &ConsumerConfigs) -> Self {
        RetryPolicy::new(cfg.max_retry_count, cfg.delay())
    }
}

/// Reads the retry count of a delivery, `0` when the header is absent or not an integer.
pub fn extract_retry_count(headers: &FieldTable) -> i64 {
    match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
        Some(AMQPValue::ShortShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongInt(v)) => i64::from(*v),
        Some(AMQPValue::LongUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongLongInt(v)) => *v,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{LongString, ShortString};
    use std::collections::BTreeMap;

    fn policy(max: i64) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_secs(60))
    }

    fn headers(value: AMQPValue) -> FieldTable {
        let mut map = BTreeMap::new();
        map.insert(ShortString::from(AMQP_HEADERS_RETRY_COUNT), value);
        FieldTable::from(map)
    }

    #[test]
    fn delays_while_within_budget() {
        let policy = policy(2);

        assert_eq!(policy.decide(1), RetryDecision::Delay { retry_count: 1 });
        assert_eq!(policy.decide(2), RetryDecision::Delay { retry_count: 2 });
    }

    #[test]
    fn quarantines_past_budget() {
        assert_eq!(
            policy(2).decide(3),
            RetryDecision::Quarantine { retry_count: 3 }
        );
    }

    #[test]
    fn zero_budget_quarantines_first_failure() {
        assert_eq!(
            policy(0).decide(1),
            RetryDecision::Quarantine { retry_count: 1 }
        );
    }

    #[test]
    fn delay_is_fixed_regardless_of_attempt() {
        let policy = policy(10);
        assert_eq!(policy.delay_ms(), 60_000);
        for retry_count in 1..=10 {
            assert!(matches!(policy.decide(retry_count), RetryDecision::Delay { .. }));
            assert_eq!(policy.delay_ms(), 60_000);
        }
    }

    #[test]
    fn builds_from_consumer_configs() {
        let cfg = ConsumerConfigs {
            prefetch: 4,
            max_retry_count: 5,
            delay_minutes: 2,
        };

        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.max_retry_count, 5);
        assert_eq!(policy.delay_ms(), 120_000);
    }

    #[test]
    fn extracts_retry_count_from_any_integer() {
        assert_eq!(extract_retry_count(&FieldTable::default()), 0);
        assert_eq!(extract_retry_count(&headers(AMQPValue::ShortShortInt(1))), 1);
        assert_eq!(extract_retry_count(&headers(AMQPValue::LongInt(2))), 2);
        assert_eq!(extract_retry_count(&headers(AMQPValue::LongLongInt(3))), 3);
        assert_eq!(extract_retry_count(&headers(AMQPValue::LongUInt(4))), 4);
    }

    #[test]
    fn non_integer_retry_count_counts_as_zero() {
        let table = headers(AMQPValue::LongString(LongString::from("2")));
        assert_eq!(extract_retry_count(&table), 0);
    }
}
