//! `Intake` — start/retry/cancel (§4.8), the three entry points a control
//! API collaborator calls into before anything lands in the outbox. Each
//! method is a thin pass-through to a single [`SagaStore`] transaction; the
//! only work done here is mapping [`StoreError`]'s sentinel variants onto
//! [`IntakeError`] so a thin HTTP layer (out of scope, §1) can map them to
//! status codes without inspecting store internals.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::persistence::{CancelOutcome, SagaStore, StoreError};

/// Sentinel outcomes §4.8 calls out for the API collaborator to map to HTTP
/// statuses (`404` for not-found, `409` for a terminal run already settled).
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("workflow definition not found: {name}@{version}")]
    DefinitionNotFound { name: String, version: String },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step not found: {run_id}/{step_id}")]
    StepNotFound { run_id: Uuid, step_id: String },

    #[error("run {0} is already terminal")]
    RunTerminal(Uuid),

    #[error(transparent)]
    Store(#[from] StoreErrorOpaque),
}

/// Wraps the store's infrastructure-failure variants so they convert via
/// `?` without flattening the sentinel variants above into the same arm.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct StoreErrorOpaque(#[from] StoreError);

impl From<StoreError> for IntakeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DefinitionNotFound { name, version } => IntakeError::DefinitionNotFound { name, version },
            StoreError::RunNotFound(id) => IntakeError::RunNotFound(id),
            StoreError::StepNotFound { run_id, step_id } => IntakeError::StepNotFound { run_id, step_id },
            StoreError::RunTerminal(id) => IntakeError::RunTerminal(id),
            other => IntakeError::Store(StoreErrorOpaque(other)),
        }
    }
}

/// Outcome of [`Intake::cancel_run`], re-exported here so callers don't need
/// to depend on `crate::persistence` for it directly.
pub use crate::persistence::CancelOutcome as CancelRunOutcome;

/// The three intake operations of §4.8, backed by a [`SagaStore`].
#[derive(Clone)]
pub struct Intake {
    store: Arc<dyn SagaStore>,
}

impl Intake {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self { store }
    }

    /// Start a new run of `name`@`version`. Rejects with
    /// [`IntakeError::DefinitionNotFound`] if the definition doesn't exist.
    pub async fn start_run(&self, name: &str, version: &str, input: Value, context: Value) -> Result<Uuid, IntakeError> {
        self.store.start_run(name, version, input, context).await.map_err(Into::into)
    }

    /// Reset `step_id` to `PENDING` and re-enqueue it for execution,
    /// regardless of its current status (§4.8 "Manual retry").
    pub async fn retry_step(&self, run_id: Uuid, step_id: &str) -> Result<(), IntakeError> {
        self.store.manual_retry_step(run_id, step_id).await.map_err(Into::into)
    }

    /// Cancel a run. When `compensate` is true and the run has succeeded
    /// steps, this schedules compensation instead of cancelling outright —
    /// see [`CancelOutcome`].
    pub async fn cancel_run(&self, run_id: Uuid, compensate: bool) -> Result<CancelOutcome, IntakeError> {
        self.store.cancel_run(run_id, compensate).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpRequestSpec, IdempotencyScope, OnFailure, RetryPolicyDef, StepDefinition, WorkflowDefinition};
    use crate::persistence::InMemorySagaStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn def() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            steps: vec![StepDefinition {
                step_id: "a".into(),
                action: HttpRequestSpec { method: "POST".into(), url: "http://x".into(), headers: HashMap::new(), body: None },
                compensation: None,
                timeout_ms: 1000,
                retry_policy: RetryPolicyDef {
                    max_attempts: 1,
                    initial_delay_ms: 0,
                    max_delay_ms: 0,
                    multiplier: 1.0,
                    jitter: 0.0,
                    retry_on_409: false,
                },
                idempotency_scope: IdempotencyScope::Run,
                on_failure: OnFailure::Halt,
            }],
        }
    }

    #[tokio::test]
    async fn start_run_on_missing_definition_surfaces_sentinel_error() {
        let store = Arc::new(InMemorySagaStore::new());
        let intake = Intake::new(store);
        let err = intake.start_run("missing", "1.0.0", json!({}), json!({})).await.unwrap_err();
        assert!(matches!(err, IntakeError::DefinitionNotFound { .. }));
    }

    #[tokio::test]
    async fn start_run_then_cancel_without_compensation_cancels_immediately() {
        let store = Arc::new(InMemorySagaStore::new());
        store.put_definition(&def()).await.unwrap();
        let intake = Intake::new(store.clone());
        let run_id = intake.start_run("wf", "1.0.0", json!({}), json!({})).await.unwrap();

        let outcome = intake.cancel_run(run_id, false).await.unwrap();
        assert_eq!(outcome, CancelRunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn retry_step_on_missing_run_surfaces_sentinel_error() {
        let store = Arc::new(InMemorySagaStore::new());
        let intake = Intake::new(store);
        let err = intake.retry_step(Uuid::new_v4(), "a").await.unwrap_err();
        assert!(matches!(err, IntakeError::RunNotFound(_)));
    }
}
