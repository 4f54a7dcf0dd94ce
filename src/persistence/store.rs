//! `SagaStore` trait: the transactional persistence seam of §4.1.
//!
//! One domain method per intake/engine operation, each documented with the
//! spec step it implements. Implementations are responsible for wrapping
//! the operation's statements in a single transaction where the spec calls
//! for it — callers never see partial effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    AttemptStatus, AttemptType, CompensationReason, OutboxMessage, Run, RunStep, ScheduledBy,
    WorkflowDefinition,
};

/// Errors surfaced by the store. The four definition/run/step/terminal
/// variants are the sentinel conditions §9 calls out for the intake layer to
/// map to HTTP statuses; `Database`/`Serialization` are opaque infrastructure
/// failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow definition not found: {name}@{version}")]
    DefinitionNotFound { name: String, version: String },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step not found: {run_id}/{step_id}")]
    StepNotFound { run_id: Uuid, step_id: String },

    #[error("run is already terminal: {0}")]
    RunTerminal(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of a reservation attempt (§4.6 step 3, §4.7 step 5): either the
/// caller now owns the attempt and should proceed, or the row was already
/// claimed/terminal and the caller should skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { attempt_no: u32 },
    Skip,
}

/// What `Intake::cancel_run` (§4.8) actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    Compensating,
    RunTerminal,
}

/// Disposition computed by the step executor after a failed action (§4.6
/// step 8), passed to the store so the transition + attempt insert +
/// outbox enqueue happen atomically.
#[derive(Debug, Clone)]
pub enum StepFailureOutcome {
    Retry { next_attempt_at: DateTime<Utc> },
    Compensate { queue: Vec<String> },
    Halt,
}

/// Disposition computed by the compensation scheduler after a failed
/// compensation (§4.7 step 8).
#[derive(Debug, Clone)]
pub enum CompensationFailureOutcome {
    Retry {
        queue: Vec<String>,
        reason: CompensationReason,
        next_attempt_at: DateTime<Utc>,
    },
    Terminate,
}

/// Best-effort backlog gauge refreshed once per poll tick (§4.5 step 2,
/// §9 "metrics snapshot is best-effort").
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxMetrics {
    pub backlog: i64,
    pub oldest_pending_age_secs: Option<i64>,
}

/// One completed action/compensation attempt, as recorded by the executor
/// before handing it to the store for the idempotent insert.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_type: AttemptType,
    pub status: AttemptStatus,
    pub http_status: Option<u16>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait SagaStore: Send + Sync + 'static {
    // -- Definitions -------------------------------------------------------

    /// Load a workflow definition by identity. Definitions are never
    /// cached in-process (spec Non-goal: no in-memory catalog).
    async fn get_definition(&self, name: &str, version: &str) -> Result<WorkflowDefinition, StoreError>;

    /// Seed/replace a definition. Not an engine operation — exercised by
    /// tests and bootstrap tooling standing in for the schema/seeding
    /// collaborator the spec scopes out (§1).
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    // -- Intake (§4.8) -------------------------------------------------------

    /// Insert the run row (`PENDING`), one `RunStep` per definition step,
    /// and a single `EXECUTE_STEP` outbox row for the first step
    /// (`scheduledBy = START`), all in one transaction.
    async fn start_run(
        &self,
        name: &str,
        version: &str,
        input: Value,
        context: Value,
    ) -> Result<Uuid, StoreError>;

    /// Reset a step to `PENDING`, set its run `RUNNING` (clearing error
    /// fields), and enqueue an `EXECUTE_STEP` row (`scheduledBy =
    /// MANUAL_RETRY`) — all in one transaction.
    async fn manual_retry_step(&self, run_id: Uuid, step_id: &str) -> Result<(), StoreError>;

    /// Cancel a run, optionally scheduling compensation of its succeeded
    /// steps, in one transaction.
    async fn cancel_run(&self, run_id: Uuid, compensate: bool) -> Result<CancelOutcome, StoreError>;

    // -- Reads ---------------------------------------------------------------

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError>;
    async fn get_run_step(&self, run_id: Uuid, step_id: &str) -> Result<RunStep, StoreError>;
    async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>, StoreError>;

    /// Ids of steps whose `RunStep.status == SUCCEEDED`, in no particular
    /// order — callers pass these through [`crate::model::compensation_queue`]
    /// together with the definition to get reverse-definition order.
    async fn succeeded_step_ids(&self, run_id: Uuid) -> Result<Vec<String>, StoreError>;

    // -- Outbox (§4.5) ---------------------------------------------------------

    /// Atomically claim the oldest eligible outbox row: `PENDING` and due,
    /// or `IN_FLIGHT` with an expired lease. Skips rows locked by a
    /// concurrent claimer.
    async fn claim_outbox(
        &self,
        worker_id: &str,
        lease_ttl_ms: i64,
    ) -> Result<Option<OutboxMessage>, StoreError>;

    async fn complete_outbox(&self, id: i64) -> Result<(), StoreError>;
    async fn requeue_outbox(&self, id: i64, delay_ms: i64) -> Result<(), StoreError>;
    async fn outbox_metrics(&self) -> Result<OutboxMetrics, StoreError>;

    async fn enqueue_execute_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        scheduled_by: ScheduledBy,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn enqueue_execute_compensation(
        &self,
        run_id: Uuid,
        queue: Vec<String>,
        reason: CompensationReason,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // -- Step execution (§4.6) ---------------------------------------------

    /// Lock the run and step rows; skip if the run is absorbing-terminal or
    /// the step is already `SUCCEEDED`/`COMPENSATED`/`RUNNING`. Otherwise
    /// transition the run to `RUNNING` (clearing error fields), the step to
    /// `RUNNING`, bump `attempts`, set `startedAt` once, and return the new
    /// `attemptNo`.
    async fn reserve_step(&self, run_id: Uuid, step_id: &str) -> Result<ReserveOutcome, StoreError>;

    /// Fail a run outright for a definition error (`WORKFLOW_NOT_FOUND` /
    /// `STEP_NOT_FOUND`, §7) with no attempt recorded.
    async fn fail_run(&self, run_id: Uuid, error_code: &str, error_message: &str) -> Result<(), StoreError>;

    /// §4.6 step 7: idempotently insert the SUCCESS attempt, set the step
    /// `SUCCEEDED`, and either enqueue the next step or complete the run —
    /// in one transaction.
    async fn finish_step_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        output: Option<Value>,
        next_step_id: Option<String>,
    ) -> Result<(), StoreError>;

    /// §4.6 step 8: idempotently insert the FAIL attempt, set the step
    /// `FAILED`, and apply `outcome` (retry / compensate / halt) — in one
    /// transaction.
    async fn finish_step_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        outcome: StepFailureOutcome,
    ) -> Result<(), StoreError>;

    // -- Compensation (§4.7) -------------------------------------------------

    /// Lock the run-step row; skip if `compensationStatus` is already
    /// `COMPENSATED`/`SKIPPED`/`RUNNING`. Otherwise set it `RUNNING`, bump
    /// `compensationAttempts`, and return the new `attemptNo`.
    async fn reserve_compensation(&self, run_id: Uuid, step_id: &str) -> Result<ReserveOutcome, StoreError>;

    /// §4.7 step 4: the step has no compensation spec — mark it `SKIPPED`
    /// and continue with `remaining` (finalize or re-enqueue, carrying
    /// `reason` forward so the continuation outbox row stays attributable).
    async fn skip_compensation(
        &self,
        run_id: Uuid,
        step_id: &str,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError>;

    /// §4.7 step 7: idempotently insert the SUCCESS compensation attempt,
    /// mark `compensationStatus = COMPENSATED` (and `status = COMPENSATED`
    /// if the step had succeeded), then continue with `remaining`.
    async fn finish_compensation_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError>;

    /// §4.7 step 8: idempotently insert the FAIL compensation attempt, mark
    /// `compensationStatus = FAILED`, and apply `outcome` (retry the same
    /// queue, or terminate the run as `FAILED`/`COMPENSATION_FAILED`).
    async fn finish_compensation_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        outcome: CompensationFailureOutcome,
    ) -> Result<(), StoreError>;

    /// §4.7 step 1: if not already `COMPENSATED`, transition the run there.
    /// Returns `true` iff this call performed the transition (so the caller
    /// bumps the compensated-run metric exactly once).
    async fn finalize_compensated(&self, run_id: Uuid) -> Result<bool, StoreError>;
}
