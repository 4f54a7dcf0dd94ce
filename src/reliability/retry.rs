//! Transient-failure classification and bounded exponential backoff (§4.4).

use crate::model::RetryPolicyDef;
use rand::Rng;

/// Why a particular outcome was or was not judged retryable. Mirrors the
/// first-match-wins table in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Timeout,
    NetworkError,
    ServerError,
    ConflictRetryEnabled,
    ClientError,
    Unknown,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Timeout => "timeout",
            Reason::NetworkError => "network_error",
            Reason::ServerError => "server_error",
            Reason::ConflictRetryEnabled => "conflict_retry_enabled",
            Reason::ClientError => "client_error",
            Reason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retryable: bool,
    pub reason: Reason,
}

/// Classify an HTTP execution outcome as transient or permanent.
///
/// First matching condition wins, in the order given by §4.4:
/// timeout > network error > 5xx > 409-with-retry-enabled > other 4xx/5xx
/// present > unknown.
pub fn classify_outcome(
    timed_out: bool,
    network_error: bool,
    status_code: Option<u16>,
    retry_on_409: bool,
) -> RetryDecision {
    if timed_out {
        return RetryDecision {
            retryable: true,
            reason: Reason::Timeout,
        };
    }
    if network_error {
        return RetryDecision {
            retryable: true,
            reason: Reason::NetworkError,
        };
    }
    match status_code {
        Some(code) if code >= 500 => RetryDecision {
            retryable: true,
            reason: Reason::ServerError,
        },
        Some(409) if retry_on_409 => RetryDecision {
            retryable: true,
            reason: Reason::ConflictRetryEnabled,
        },
        Some(_) => RetryDecision {
            retryable: false,
            reason: Reason::ClientError,
        },
        None => RetryDecision {
            retryable: false,
            reason: Reason::Unknown,
        },
    }
}

/// Pure backoff computation: `base = initialDelayMs * multiplier^max(0,
/// attemptNo-1)`, capped at `maxDelayMs`, then widened by the jitter window
/// `[bounded*(1-jitter), bounded*(1+jitter))`. `rand` must be in `[0, 1)`;
/// callers needing production randomness should use
/// [`next_backoff_ms`], which sources it from `rand::thread_rng()`.
pub fn compute_backoff_ms(policy: &RetryPolicyDef, attempt_no: u32, rand: f64) -> u64 {
    let exponent = attempt_no.saturating_sub(1).max(0);
    let base = policy.initial_delay_ms as f64 * policy.multiplier.powi(exponent as i32);
    let bounded = base.min(policy.max_delay_ms as f64);

    if policy.jitter <= 0.0 {
        return bounded.floor().max(0.0) as u64;
    }

    let jittered = bounded * (1.0 - policy.jitter + rand * 2.0 * policy.jitter);
    jittered.floor().max(0.0) as u64
}

/// Convenience wrapper over [`compute_backoff_ms`] that sources randomness
/// from the thread-local RNG, for production call sites that don't need a
/// deterministic draw.
pub fn next_backoff_ms(policy: &RetryPolicyDef, attempt_no: u32) -> u64 {
    let rand = rand::thread_rng().gen_range(0.0..1.0);
    compute_backoff_ms(policy, attempt_no, rand)
}

pub fn should_retry(policy: &RetryPolicyDef, attempt_no: u32, decision: RetryDecision) -> bool {
    decision.retryable && attempt_no < policy.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, initial: u64, max: u64, multiplier: f64, jitter: f64) -> RetryPolicyDef {
        RetryPolicyDef {
            max_attempts,
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier,
            jitter,
            retry_on_409: false,
        }
    }

    #[test]
    fn timeout_wins_over_everything() {
        let d = classify_outcome(true, true, Some(500), true);
        assert_eq!(d.reason, Reason::Timeout);
        assert!(d.retryable);
    }

    #[test]
    fn network_error_before_status_code() {
        let d = classify_outcome(false, true, Some(400), false);
        assert_eq!(d.reason, Reason::NetworkError);
        assert!(d.retryable);
    }

    #[test]
    fn server_error_is_retryable() {
        let d = classify_outcome(false, false, Some(503), false);
        assert_eq!(d.reason, Reason::ServerError);
        assert!(d.retryable);
    }

    #[test]
    fn conflict_retry_only_when_enabled() {
        let enabled = classify_outcome(false, false, Some(409), true);
        assert!(enabled.retryable);
        assert_eq!(enabled.reason, Reason::ConflictRetryEnabled);

        let disabled = classify_outcome(false, false, Some(409), false);
        assert!(!disabled.retryable);
        assert_eq!(disabled.reason, Reason::ClientError);
    }

    #[test]
    fn other_client_errors_are_permanent() {
        let d = classify_outcome(false, false, Some(404), false);
        assert!(!d.retryable);
        assert_eq!(d.reason, Reason::ClientError);
    }

    #[test]
    fn no_status_code_is_unknown_and_permanent() {
        let d = classify_outcome(false, false, None, false);
        assert!(!d.retryable);
        assert_eq!(d.reason, Reason::Unknown);
    }

    #[test]
    fn backoff_no_jitter_is_exact_exponential() {
        let p = policy(5, 1000, 60_000, 2.0, 0.0);
        assert_eq!(compute_backoff_ms(&p, 1, 0.0), 1000);
        assert_eq!(compute_backoff_ms(&p, 2, 0.0), 2000);
        assert_eq!(compute_backoff_ms(&p, 3, 0.0), 4000);
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let p = policy(10, 1000, 5000, 2.0, 0.0);
        assert_eq!(compute_backoff_ms(&p, 10, 0.0), 5000);
    }

    #[test]
    fn backoff_jitter_window_bounds() {
        let p = policy(5, 1000, 60_000, 2.0, 0.2);
        let bounded = 2000.0_f64; // attempt 2 -> base 2000, under cap
        let lo = (bounded * 0.8).floor() as u64;
        let hi_exclusive = (bounded * 1.2).floor() as u64;

        for i in 0..=100 {
            let rand = i as f64 / 100.0;
            let v = compute_backoff_ms(&p, 2, rand);
            assert!(v >= lo, "{v} < {lo}");
            assert!(v <= hi_exclusive, "{v} > {hi_exclusive}");
        }
    }

    #[test]
    fn backoff_never_negative() {
        let p = policy(5, 0, 0, 1.0, 1.0);
        for i in 0..10 {
            let rand = i as f64 / 10.0;
            let v = compute_backoff_ms(&p, 1, rand);
            // u64 is unsigned but document the invariant explicitly anyway
            assert!(v >= 0);
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let p = policy(3, 1000, 60_000, 2.0, 0.0);
        let decision = RetryDecision {
            retryable: true,
            reason: Reason::ServerError,
        };
        assert!(should_retry(&p, 1, decision));
        assert!(should_retry(&p, 2, decision));
        assert!(!should_retry(&p, 3, decision));
    }

    #[test]
    fn should_retry_respects_retryable_flag() {
        let p = policy(5, 1000, 60_000, 2.0, 0.0);
        let decision = RetryDecision {
            retryable: false,
            reason: Reason::ClientError,
        };
        assert!(!should_retry(&p, 1, decision));
    }
}
