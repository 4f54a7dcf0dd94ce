//! `CompensationScheduler::handle` — the `EXECUTE_COMPENSATION` algorithm of
//! §4.7: walk the reverse-order queue head-first, invoking each step's
//! compensation with the same attempt/retry discipline as §4.6.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::http::{ExecutionOptions, HttpActionExecutor};
use crate::model::{self, error_codes, AttemptStatus, AttemptType, CompensationReason};
use crate::persistence::{AttemptRecord, CompensationFailureOutcome, ReserveOutcome, SagaStore, StoreError};
use crate::reliability::retry::{classify_outcome, compute_backoff_ms, should_retry};
use crate::template::render_value;

#[derive(Clone)]
pub struct CompensationScheduler {
    store: Arc<dyn SagaStore>,
    http: HttpActionExecutor,
}

impl CompensationScheduler {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self {
            store,
            http: HttpActionExecutor::new(),
        }
    }

    #[instrument(skip(self, queue), fields(%run_id, ?reason, queue_len = queue.len()))]
    pub async fn handle(
        &self,
        run_id: Uuid,
        queue: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError> {
        // Step 1: an empty queue means every succeeded step has been dealt
        // with; finalize the run (idempotently).
        let Some((current, remaining)) = queue.split_first() else {
            self.store.finalize_compensated(run_id).await?;
            return Ok(());
        };
        let current = current.clone();
        let remaining = remaining.to_vec();

        // Step 2: load run + definition.
        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(StoreError::RunNotFound(_)) => {
                warn!(%run_id, "run not found, skipping compensation message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let definition = match self.store.get_definition(&run.workflow_name, &run.workflow_version).await {
            Ok(d) => d,
            Err(StoreError::DefinitionNotFound { .. }) => {
                return self
                    .store
                    .fail_run(run_id, error_codes::WORKFLOW_NOT_FOUND, "workflow definition not found")
                    .await;
            }
            Err(e) => return Err(e),
        };

        // Step 3: the current step may no longer be part of the definition
        // (a vanishingly unlikely edge case spec calls out anyway) — skip it.
        let Some(step) = definition.step(&current) else {
            return self.continue_with(run_id, remaining, reason).await;
        };

        // Step 4: no compensation spec — mark skipped and move on.
        let Some(compensation_spec) = &step.compensation else {
            return self.store.skip_compensation(run_id, &current, remaining, reason).await;
        };

        // Step 5: reserve the compensation attempt.
        let attempt_no = match self.store.reserve_compensation(run_id, &current).await? {
            ReserveOutcome::Reserved { attempt_no } => attempt_no,
            ReserveOutcome::Skip => {
                info!(%run_id, step_id = %current, "compensation reservation skipped (already terminal/running)");
                return self.continue_with(run_id, remaining, reason).await;
            }
        };

        // Step 6: render and invoke.
        let envelope = json!({
            "input": run.input,
            "context": run.context,
            "run": {"id": run_id.to_string()},
        });
        let headers = render_value(
            &serde_json::to_value(&compensation_spec.headers).unwrap_or(json!({})),
            &envelope,
        );
        let headers: HashMap<String, String> = serde_json::from_value(headers).unwrap_or_default();
        let body = compensation_spec.body.as_ref().map(|b| render_value(b, &envelope));
        let url_value = render_value(&json!(compensation_spec.url), &envelope);
        let url = url_value.as_str().unwrap_or(&compensation_spec.url).to_string();

        let correlation_id = run
            .context
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| run_id.to_string());
        let mut extra_headers = HashMap::new();
        extra_headers.insert(
            "x-idempotency-key".to_string(),
            format!("{run_id}:{current}:compensation:{attempt_no}"),
        );
        extra_headers.insert("x-correlation-id".to_string(), correlation_id);

        let rendered_spec = model::HttpRequestSpec {
            method: compensation_spec.method.clone(),
            url,
            headers,
            body,
        };
        let result = self
            .http
            .execute(
                &rendered_spec,
                &ExecutionOptions {
                    timeout_ms: step.timeout_ms,
                    extra_headers,
                },
            )
            .await;

        info!(%run_id, step_id = %current, attempt_no, duration_ms = result.duration_ms, ok = result.ok, "compensation attempt completed");

        if result.ok {
            let attempt = AttemptRecord {
                attempt_type: AttemptType::Compensation,
                status: AttemptStatus::Success,
                http_status: result.status_code,
                duration_ms: result.duration_ms,
                error_message: None,
            };
            return self
                .store
                .finish_compensation_success(run_id, &current, attempt_no, attempt, remaining, reason)
                .await;
        }

        // Step 8: failure.
        let decision = classify_outcome(
            result.timed_out,
            result.network_error,
            result.status_code,
            step.retry_policy.retry_on_409,
        );
        let error_message = result
            .error_message
            .clone()
            .unwrap_or_else(|| format!("HTTP {}", result.status_code.unwrap_or(0)));
        let attempt = AttemptRecord {
            attempt_type: AttemptType::Compensation,
            status: AttemptStatus::Fail,
            http_status: result.status_code,
            duration_ms: result.duration_ms,
            error_message: Some(error_message),
        };

        let outcome = if should_retry(&step.retry_policy, attempt_no, decision) {
            let delay_ms = compute_backoff_ms(&step.retry_policy, attempt_no, rand::random::<f64>());
            let mut whole_queue = vec![current.clone()];
            whole_queue.extend(remaining);
            CompensationFailureOutcome::Retry {
                queue: whole_queue,
                reason,
                next_attempt_at: Utc::now() + chrono::Duration::milliseconds(delay_ms as i64),
            }
        } else {
            CompensationFailureOutcome::Terminate
        };

        self.store
            .finish_compensation_failure(run_id, &current, attempt_no, attempt, outcome)
            .await
    }

    /// Shared tail for "this step needs no further action, move to the next
    /// one in the queue": finalize if nothing is left, otherwise re-enqueue.
    async fn continue_with(&self, run_id: Uuid, remaining: Vec<String>, reason: CompensationReason) -> Result<(), StoreError> {
        if remaining.is_empty() {
            self.store.finalize_compensated(run_id).await?;
            return Ok(());
        }
        self.store
            .enqueue_execute_compensation(run_id, remaining, reason, Utc::now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::persistence::memory::InMemorySagaStore;
    use serde_json::json;

    fn step_with_compensation(id: &str, action_url: &str, comp_url: &str) -> StepDefinition {
        StepDefinition {
            step_id: id.into(),
            action: HttpRequestSpec {
                method: "POST".into(),
                url: action_url.into(),
                headers: HashMap::new(),
                body: None,
            },
            compensation: Some(HttpRequestSpec {
                method: "POST".into(),
                url: comp_url.into(),
                headers: HashMap::new(),
                body: None,
            }),
            timeout_ms: 300,
            retry_policy: RetryPolicyDef {
                max_attempts: 1,
                initial_delay_ms: 1,
                max_delay_ms: 10,
                multiplier: 1.0,
                jitter: 0.0,
                retry_on_409: false,
            },
            idempotency_scope: IdempotencyScope::Run,
            on_failure: OnFailure::Compensate,
        }
    }

    #[tokio::test]
    async fn empty_queue_finalizes_compensated_run() {
        let store = Arc::new(InMemorySagaStore::new());
        let d = WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            steps: vec![step_with_compensation("a", "http://x", "http://127.0.0.1:1/refund")],
        };
        store.put_definition(&d).await.unwrap();
        let run_id = store.start_run("wf", "1.0.0", json!({}), json!({})).await.unwrap();
        store.cancel_run(run_id, false).await.unwrap();

        let scheduler = CompensationScheduler::new(store.clone());
        scheduler.handle(run_id, vec![], CompensationReason::Cancel).await.unwrap();

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn step_with_no_compensation_spec_is_skipped_and_queue_advances() {
        let store = Arc::new(InMemorySagaStore::new());
        let mut first = step_with_compensation("a", "http://x", "http://127.0.0.1:1/refund-a");
        first.compensation = None;
        let d = WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            steps: vec![first],
        };
        store.put_definition(&d).await.unwrap();
        let run_id = store.start_run("wf", "1.0.0", json!({}), json!({})).await.unwrap();

        let scheduler = CompensationScheduler::new(store.clone());
        scheduler
            .handle(run_id, vec!["a".to_string()], CompensationReason::StepFailure)
            .await
            .unwrap();

        let run_step = store.get_run_step(run_id, "a").await.unwrap();
        assert_eq!(run_step.compensation_status, CompensationStatus::Skipped);
    }
}
