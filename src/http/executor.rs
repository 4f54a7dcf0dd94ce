//! `HttpActionExecutor::execute` — issues one rendered request with a
//! per-request timeout and classifies the outcome (§4.3). Never throws to
//! the caller: every failure mode is folded into [`HttpExecutionResult`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::model::HttpRequestSpec;

/// Per-call knobs that aren't part of the persisted [`HttpRequestSpec`]:
/// the step's configured timeout and any engine-injected headers
/// (idempotency key, correlation id) that must win over spec headers.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timeout_ms: u64,
    pub extra_headers: HashMap<String, String>,
}

/// Outcome of one downstream HTTP call. Exactly one of `{ok, timed_out,
/// network_error, statusCode-with-non-2xx}` describes what happened; the
/// retry policy (§4.4) consumes `timed_out`/`network_error`/`status_code`
/// directly.
#[derive(Debug, Clone)]
pub struct HttpExecutionResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub body: Option<Value>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub network_error: bool,
    pub error_message: Option<String>,
}

/// Thin wrapper over a shared [`reqwest::Client`]. The client itself carries
/// no default timeout — each call supplies its own, since `step.timeoutMs`
/// varies per step.
#[derive(Clone)]
pub struct HttpActionExecutor {
    client: Client,
}

impl Default for HttpActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpActionExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Execute one already-rendered request spec. Merges `spec.headers` with
    /// `options.extra_headers` (extra wins), always sets
    /// `content-type: application/json`, and aborts at `options.timeout_ms`.
    #[instrument(skip(self, spec, options), fields(method = %spec.method, url = %spec.url))]
    pub async fn execute(&self, spec: &HttpRequestSpec, options: &ExecutionOptions) -> HttpExecutionResult {
        let method = match spec.method.to_uppercase().parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(e) => {
                return HttpExecutionResult {
                    ok: false,
                    status_code: None,
                    body: None,
                    duration_ms: 0,
                    timed_out: false,
                    network_error: true,
                    error_message: Some(format!("invalid method {}: {e}", spec.method)),
                };
            }
        };

        let mut request = self
            .client
            .request(method, &spec.url)
            .timeout(Duration::from_millis(options.timeout_ms))
            .header("content-type", "application/json");

        for (key, value) in &spec.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        for (key, value) in &options.extra_headers {
            request = request.header(key.as_str(), value.as_str());
        }

        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let start = Instant::now();
        let response = request.send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let timed_out = e.is_timeout();
                if !timed_out {
                    warn!(error = %e, "downstream request failed");
                }
                return HttpExecutionResult {
                    ok: false,
                    status_code: None,
                    body: None,
                    duration_ms,
                    timed_out,
                    network_error: !timed_out,
                    error_message: Some(e.to_string()),
                };
            }
        };

        let status = response.status();
        let status_code = status.as_u16();
        let ok = status.is_success();

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let is_json = content_type.as_deref().unwrap_or("").contains("application/json");

        let raw = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                return HttpExecutionResult {
                    ok: false,
                    status_code: Some(status_code),
                    body: None,
                    duration_ms,
                    timed_out: false,
                    network_error: true,
                    error_message: Some(format!("failed to read response body: {e}")),
                };
            }
        };

        let body = if raw.is_empty() {
            None
        } else if is_json {
            serde_json::from_str::<Value>(&raw).ok()
        } else {
            Some(Value::String(raw))
        };

        let error_message = if ok {
            None
        } else {
            Some(format!("HTTP {status_code}"))
        };

        HttpExecutionResult {
            ok,
            status_code: Some(status_code),
            body,
            duration_ms,
            timed_out: false,
            network_error: false,
            error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_options_carries_injected_headers() {
        let mut extra = HashMap::new();
        extra.insert("x-idempotency-key".to_string(), "r:s:1".to_string());
        let opts = ExecutionOptions {
            timeout_ms: 5000,
            extra_headers: extra,
        };
        assert_eq!(opts.extra_headers.get("x-idempotency-key").unwrap(), "r:s:1");
    }

    #[tokio::test]
    async fn invalid_method_is_reported_as_network_error_not_panic() {
        let executor = HttpActionExecutor::new();
        let spec = HttpRequestSpec {
            method: "NOT A METHOD".to_string(),
            url: "http://127.0.0.1:0/x".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        let result = executor
            .execute(
                &spec,
                &ExecutionOptions {
                    timeout_ms: 100,
                    extra_headers: HashMap::new(),
                },
            )
            .await;
        assert!(!result.ok);
        assert!(result.network_error);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn connection_refused_is_network_error_not_timeout() {
        let executor = HttpActionExecutor::new();
        let spec = HttpRequestSpec {
            method: "GET".to_string(),
            url: "http://127.0.0.1:1/unreachable".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        let result = executor
            .execute(
                &spec,
                &ExecutionOptions {
                    timeout_ms: 500,
                    extra_headers: HashMap::new(),
                },
            )
            .await;
        assert!(!result.ok);
        assert!(result.network_error || result.timed_out);
    }
}
