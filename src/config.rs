//! `WorkerConfig` — the environment variables of §6, loaded once at process
//! startup (§A.3). Follows the `std::env::var(...).unwrap_or_else(...)` /
//! `.expect(...)` idiom of `everruns-worker/src/main.rs` and
//! `everruns-worker/src/providers/openai.rs`: a missing `DATABASE_URL` is a
//! startup-time panic, everything else falls back to the documented default.

/// Poll interval default (§6): `ENGINE_POLL_INTERVAL_MS`.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Outbox lease TTL default (§6): `ENGINE_LEASE_TTL_MS`.
pub const DEFAULT_LEASE_TTL_MS: i64 = 30_000;

/// Everything the worker binary needs to boot a single [`crate::outbox::OutboxPoller`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub lease_ttl_ms: i64,
    pub database_url: String,
    pub otel_endpoint: Option<String>,
}

impl WorkerConfig {
    /// Read the engine's configuration from the environment (§6).
    ///
    /// # Panics
    ///
    /// Panics if `DATABASE_URL` is unset, the same startup-time failure mode
    /// as the teacher's own worker binary.
    pub fn from_env() -> Self {
        let worker_id = std::env::var("ENGINE_WORKER_ID").unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4()));

        let poll_interval_ms = std::env::var("ENGINE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let lease_ttl_ms = std::env::var("ENGINE_LEASE_TTL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LEASE_TTL_MS);

        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required");
        let otel_endpoint = std::env::var("ENGINE_OTEL_ENDPOINT").ok();

        Self {
            worker_id,
            poll_interval_ms,
            lease_ttl_ms,
            database_url,
            otel_endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_section_6() {
        assert_eq!(DEFAULT_POLL_INTERVAL_MS, 500);
        assert_eq!(DEFAULT_LEASE_TTL_MS, 30_000);
    }
}
