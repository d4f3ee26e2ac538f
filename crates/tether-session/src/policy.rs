//! Reconnection policy: exponential backoff with jitter and retry/stop decisions.

use crate::classify::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

/// Per-connection overrides layered on top of the manager's default policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOverrides {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

impl ReconnectOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What the reconnection loop should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// The error kind can never be fixed by retrying.
    Stop,
    /// Out of attempts.
    Exhausted,
    RetryAfter(Duration),
}

impl ReconnectPolicy {
    pub fn with_overrides(&self, overrides: &ReconnectOverrides) -> Self {
        Self {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            initial_delay_ms: overrides.initial_delay_ms.unwrap_or(self.initial_delay_ms),
            backoff_factor: overrides.backoff_factor.unwrap_or(self.backoff_factor),
            max_delay_ms: overrides.max_delay_ms.unwrap_or(self.max_delay_ms),
        }
    }

    /// True for credential and policy errors that no retry can fix.
    pub fn should_stop_retrying(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::AuthenticationFailed
                | ErrorKind::PermissionDenied
                | ErrorKind::KeyRejected
                | ErrorKind::PasswordRejected
                | ErrorKind::ConfigurationError
        )
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            self.initial_delay_ms,
            self.backoff_factor,
            self.max_delay_ms,
        )
    }

    /// Decision after the 1-based `attempt` failed with `kind`.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if Self::should_stop_retrying(kind) {
            RetryDecision::Stop
        } else if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.backoff_delay(attempt.saturating_sub(1)))
        }
    }
}

/// `min(max_delay, initial_delay * factor^attempt + jitter)` where jitter is
/// uniform in `[0, 0.5 * initial_delay * factor^attempt]`.
///
/// Factors below 1.0 (or non-finite) are treated as 1.0.
pub fn backoff_delay(
    attempt: u32,
    initial_delay_ms: u64,
    backoff_factor: f64,
    max_delay_ms: u64,
) -> Duration {
    let factor = if backoff_factor.is_finite() && backoff_factor >= 1.0 {
        backoff_factor
    } else {
        1.0
    };
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let base = initial_delay_ms as f64 * factor.powi(exponent);
    let max = max_delay_ms as f64;

    if !base.is_finite() || base >= max {
        return Duration::from_millis(max_delay_ms);
    }

    let jitter = if base > 0.0 {
        rand::thread_rng().gen_range(0.0..=base * 0.5)
    } else {
        0.0
    };
    Duration::from_secs_f64((base + jitter).min(max) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> f64 {
        d.as_secs_f64() * 1000.0
    }

    #[test]
    fn test_defaults() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.initial_delay_ms, 1000);
        assert_eq!(p.backoff_factor, 2.0);
        assert_eq!(p.max_delay_ms, 60_000);
    }

    #[test]
    fn test_first_delay_within_jitter_band() {
        for _ in 0..100 {
            let d = ms(backoff_delay(0, 1000, 2.0, 60_000));
            assert!((999.999..=1500.001).contains(&d), "{}", d);
        }
    }

    #[test]
    fn test_delay_grows_geometrically() {
        for _ in 0..100 {
            let d = ms(backoff_delay(3, 1000, 2.0, 60_000));
            assert!((7999.999..=12000.001).contains(&d), "{}", d);
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        assert_eq!(backoff_delay(10, 1000, 2.0, 60_000), Duration::from_secs(60));
        assert_eq!(backoff_delay(u32::MAX, 1000, 2.0, 60_000), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_initial_delay() {
        assert_eq!(backoff_delay(4, 0, 2.0, 60_000), Duration::ZERO);
    }

    #[test]
    fn test_bad_factor_is_treated_as_one() {
        for _ in 0..20 {
            let d = ms(backoff_delay(5, 100, f64::NAN, 60_000));
            assert!((99.999..=150.001).contains(&d), "{}", d);
        }
    }

    #[test]
    fn test_should_stop_retrying_exact_set() {
        let stop: Vec<ErrorKind> = ErrorKind::ALL
            .into_iter()
            .filter(|k| ReconnectPolicy::should_stop_retrying(*k))
            .collect();
        assert_eq!(
            stop,
            vec![
                ErrorKind::AuthenticationFailed,
                ErrorKind::PermissionDenied,
                ErrorKind::KeyRejected,
                ErrorKind::PasswordRejected,
                ErrorKind::ConfigurationError,
            ]
        );
    }

    #[test]
    fn test_network_kinds_keep_retrying() {
        for kind in ErrorKind::ALL.into_iter().filter(|k| k.is_network()) {
            assert!(!ReconnectPolicy::should_stop_retrying(kind));
        }
    }

    #[test]
    fn test_overrides_apply_field_by_field() {
        let base = ReconnectPolicy::default();
        let overrides = ReconnectOverrides {
            max_attempts: Some(2),
            backoff_factor: Some(3.0),
            ..Default::default()
        };
        let p = base.with_overrides(&overrides);
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.backoff_factor, 3.0);
        assert_eq!(p.initial_delay_ms, 1000);
        assert_eq!(p.max_delay_ms, 60_000);
        assert!(ReconnectOverrides::default().is_empty());
        assert!(!overrides.is_empty());
    }

    #[test]
    fn test_decide() {
        let p = ReconnectPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            backoff_factor: 2.0,
            max_delay_ms: 1000,
        };
        assert_eq!(p.decide(1, ErrorKind::KeyRejected), RetryDecision::Stop);
        assert_eq!(p.decide(3, ErrorKind::NetworkTimeout), RetryDecision::Exhausted);
        match p.decide(2, ErrorKind::HostUnreachable) {
            RetryDecision::RetryAfter(d) => {
                let d = ms(d);
                assert!((19.999..=30.001).contains(&d), "{}", d);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }
}
