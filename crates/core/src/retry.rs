//! Retry policies with fixed or exponential backoff.
//!
//! Used both for step attempts and for restoring the connection gate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Delay strategy between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Delay grows by `multiplier` after each failure, clamped to `max_delay_ms`.
    Exponential {
        initial_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
}

/// How many times an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// A single attempt; suitable for naturally idempotent steps.
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
        }
    }

    /// `max_attempts` attempts with a constant delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    /// `max_attempts` attempts with doubling delays starting at `initial`.
    pub fn exponential(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_delay_ms: initial.as_millis() as u64,
                multiplier: 2.0,
                max_delay_ms: max_delay.as_millis() as u64,
            },
        }
    }

    /// Default policy for restoring the gate: 3 attempts, 1s then 2s.
    pub fn gate_restore_default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    ///
    /// The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match &self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                // initial * multiplier^(attempt - 2), capped at max_delay_ms.
                let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
                let ms = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                Duration::from_millis(ms.min(*max_delay_ms as f64) as u64)
            }
        }
    }

    /// Check the policy is usable; returns the reason when it is not.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if let Backoff::Exponential {
            initial_delay_ms,
            multiplier,
            max_delay_ms,
        } = &self.backoff
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(format!("multiplier must be >= 1.0, got {multiplier}"));
            }
            if initial_delay_ms > max_delay_ms {
                return Err(format!(
                    "initial_delay_ms ({initial_delay_ms}) exceeds max_delay_ms ({max_delay_ms})"
                ));
            }
        }
        Ok(())
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(100, Duration::from_secs(8), Duration::from_secs(10));
        assert_eq!(policy.delay_before(2), Duration::from_secs(8));
        assert_eq!(policy.delay_before(3), Duration::from_secs(10));
        assert_eq!(policy.delay_before(100), Duration::from_secs(10));

        let uncapped = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial_delay_ms: 1500,
                multiplier: 1.5,
                max_delay_ms: 60_000,
            },
        };
        assert_eq!(uncapped.delay_before(3), Duration::from_millis(2250));
    }

    #[test]
    fn exponential_sequence() {
        let policy = RetryPolicy::exponential(8, Duration::from_secs(1), Duration::from_secs(30));
        let expected = [0, 1, 2, 4, 8, 16, 30, 30];

        for (i, &secs) in expected.iter().enumerate() {
            assert_eq!(policy.delay_before(i as u32 + 1).as_secs(), secs, "attempt {}", i + 1);
        }
    }

    #[test]
    fn fixed_delay_is_constant_after_first_attempt() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(250));
        assert_eq!(policy.delay_before(3), Duration::from_millis(250));
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Backoff::Fixed { delay_ms: 0 },
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn shrinking_multiplier_is_invalid() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial_delay_ms: 100,
                multiplier: 0.5,
                max_delay_ms: 1000,
            },
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn deserializes_tagged_backoff() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 3, "backoff": {"kind": "fixed", "delay_ms": 500}}"#,
        )
        .unwrap();
        assert_eq!(policy, RetryPolicy::fixed(3, Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn wait_returns_false_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait(Duration::from_secs(60), &cancel).await);
    }
}
