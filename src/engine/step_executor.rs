//! `StepExecutor::handle` — the `EXECUTE_STEP` algorithm of §4.6: reserve an
//! attempt, render and invoke the action, persist the outcome, and drive the
//! run/step state machine forward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::http::{ExecutionOptions, HttpActionExecutor};
use crate::model::{self, error_codes, AttemptStatus, AttemptType, OnFailure, RunStatus, ScheduledBy};
use crate::persistence::{AttemptRecord, ReserveOutcome, SagaStore, StepFailureOutcome, StoreError};
use crate::reliability::retry::{classify_outcome, compute_backoff_ms, should_retry};
use crate::template::render_value;

/// Drives one `EXECUTE_STEP` outbox message through reserve → invoke →
/// persist. Holds no per-run state of its own; every decision is made from
/// what the store currently reports (§9 "no in-memory engine state").
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn SagaStore>,
    http: HttpActionExecutor,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self {
            store,
            http: HttpActionExecutor::new(),
        }
    }

    #[instrument(skip(self), fields(%run_id, %step_id, ?scheduled_by))]
    pub async fn handle(
        &self,
        run_id: Uuid,
        step_id: &str,
        scheduled_by: ScheduledBy,
    ) -> Result<(), StoreError> {
        // Step 1: load the run; absent runs are a benign no-op (the engine
        // never deletes runs, so this means a caller did).
        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(StoreError::RunNotFound(_)) => {
                warn!(%run_id, "run not found, skipping execute-step message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if matches!(
            run.status,
            RunStatus::Completed | RunStatus::Compensated | RunStatus::Cancelled
        ) {
            info!(%run_id, status = ?run.status, "run already terminal, skipping step dispatch");
            return Ok(());
        }

        // Step 2: load the definition and validate the step exists in it.
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

        let Some(step) = definition.step(step_id) else {
            return self
                .store
                .fail_run(run_id, error_codes::STEP_NOT_FOUND, &format!("step not found: {step_id}"))
                .await;
        };

        // Step 3: reserve the attempt.
        let attempt_no = match self.store.reserve_step(run_id, step_id).await? {
            ReserveOutcome::Reserved { attempt_no } => attempt_no,
            ReserveOutcome::Skip => {
                info!(%run_id, %step_id, "step reservation skipped (already running/succeeded/compensated)");
                return Ok(());
            }
        };

        // Step 4: render the action against the envelope.
        let envelope = json!({
            "input": run.input,
            "context": run.context,
            "run": {"id": run_id.to_string()},
        });
        let headers = render_value(
            &serde_json::to_value(&step.action.headers).unwrap_or(json!({})),
            &envelope,
        );
        let headers: HashMap<String, String> = serde_json::from_value(headers).unwrap_or_default();
        let body = step.action.body.as_ref().map(|b| render_value(b, &envelope));
        let url_value = render_value(&json!(step.action.url), &envelope);
        let url = url_value.as_str().unwrap_or(&step.action.url).to_string();

        // Step 5: invoke with engine-injected headers.
        let correlation_id = run
            .context
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| run_id.to_string());
        let mut extra_headers = HashMap::new();
        extra_headers.insert(
            "x-idempotency-key".to_string(),
            format!("{run_id}:{step_id}:{attempt_no}"),
        );
        extra_headers.insert("x-correlation-id".to_string(), correlation_id);

        let rendered_spec = model::HttpRequestSpec {
            method: step.action.method.clone(),
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

        // Step 6: attempt latency.
        info!(%run_id, %step_id, attempt_no, duration_ms = result.duration_ms, ok = result.ok, "step attempt completed");

        if result.ok {
            let attempt = AttemptRecord {
                attempt_type: AttemptType::Action,
                status: AttemptStatus::Success,
                http_status: result.status_code,
                duration_ms: result.duration_ms,
                error_message: None,
            };
            let next_step_id = definition.next_step(step_id).map(|s| s.step_id.clone());
            return self
                .store
                .finish_step_success(run_id, step_id, attempt_no, attempt, result.body, next_step_id)
                .await;
        }

        // Step 8: failure handling.
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
            attempt_type: AttemptType::Action,
            status: AttemptStatus::Fail,
            http_status: result.status_code,
            duration_ms: result.duration_ms,
            error_message: Some(error_message),
        };

        let outcome = if should_retry(&step.retry_policy, attempt_no, decision) {
            let delay_ms = compute_backoff_ms(&step.retry_policy, attempt_no, rand::random::<f64>());
            StepFailureOutcome::Retry {
                next_attempt_at: Utc::now() + chrono::Duration::milliseconds(delay_ms as i64),
            }
        } else if step.on_failure == OnFailure::Compensate {
            let succeeded = self.store.succeeded_step_ids(run_id).await?;
            let queue = model::compensation_queue(&definition, &succeeded);
            if queue.is_empty() {
                StepFailureOutcome::Halt
            } else {
                StepFailureOutcome::Compensate { queue }
            }
        } else {
            StepFailureOutcome::Halt
        };

        self.store.finish_step_failure(run_id, step_id, attempt_no, attempt, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::persistence::memory::InMemorySagaStore;
    use serde_json::json;

    fn def_with(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            steps,
        }
    }

    fn step(id: &str, url: &str, on_failure: OnFailure, max_attempts: u32) -> StepDefinition {
        StepDefinition {
            step_id: id.into(),
            action: HttpRequestSpec {
                method: "POST".into(),
                url: url.into(),
                headers: HashMap::new(),
                body: None,
            },
            compensation: None,
            timeout_ms: 300,
            retry_policy: RetryPolicyDef {
                max_attempts,
                initial_delay_ms: 1,
                max_delay_ms: 10,
                multiplier: 1.0,
                jitter: 0.0,
                retry_on_409: false,
            },
            idempotency_scope: IdempotencyScope::Run,
            on_failure,
        }
    }

    #[tokio::test]
    async fn missing_run_is_a_benign_no_op() {
        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
        let executor = StepExecutor::new(store);
        let result = executor.handle(Uuid::new_v4(), "x", ScheduledBy::Start).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_action_records_fail_attempt_and_halts() {
        let store = Arc::new(InMemorySagaStore::new());
        let d = def_with(vec![step("only", "http://127.0.0.1:1/x", OnFailure::Halt, 1)]);
        store.put_definition(&d).await.unwrap();
        let run_id = store.start_run("wf", "1.0.0", json!({}), json!({})).await.unwrap();

        let executor = StepExecutor::new(store.clone());
        executor.handle(run_id, "only", ScheduledBy::Start).await.unwrap();

        let run_step = store.get_run_step(run_id, "only").await.unwrap();
        assert_eq!(run_step.status, RunStepStatus::Failed);
        assert_eq!(run_step.attempts, 1);

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some(error_codes::STEP_FAILED));
    }

    #[tokio::test]
    async fn step_not_found_fails_the_run() {
        let store = Arc::new(InMemorySagaStore::new());
        let d = def_with(vec![step("a", "http://127.0.0.1:1/x", OnFailure::Halt, 1)]);
        store.put_definition(&d).await.unwrap();
        let run_id = store.start_run("wf", "1.0.0", json!({}), json!({})).await.unwrap();

        let executor = StepExecutor::new(store.clone());
        executor.handle(run_id, "missing", ScheduledBy::Start).await.unwrap();

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some(error_codes::STEP_NOT_FOUND));
    }
}
