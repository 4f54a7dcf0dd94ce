//! Transient-failure classification and bounded exponential backoff (§4.4).

pub mod retry;

pub use retry::{classify_outcome, compute_backoff_ms, next_backoff_ms, should_retry, Reason, RetryDecision};
