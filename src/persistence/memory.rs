//! In-memory `SagaStore` for fast tests (§A.4). Mirrors
//! [`super::postgres::PostgresSagaStore`]'s semantics without a database:
//! every method that the Postgres implementation wraps in a transaction is
//! instead guarded by a single `parking_lot::RwLock` write lock here, which
//! gives the same all-or-nothing visibility for a single-process test.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::*;

use super::store::*;

struct Inner {
    definitions: HashMap<(String, String), WorkflowDefinition>,
    runs: HashMap<Uuid, Run>,
    run_steps: HashMap<Uuid, Vec<RunStep>>,
    attempts: Vec<StepAttempt>,
    outbox: HashMap<i64, OutboxMessage>,
}

impl Inner {
    fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            runs: HashMap::new(),
            run_steps: HashMap::new(),
            attempts: Vec::new(),
            outbox: HashMap::new(),
        }
    }

    fn definition_for(&self, run: &Run) -> Result<WorkflowDefinition, StoreError> {
        self.definitions
            .get(&(run.workflow_name.clone(), run.workflow_version.clone()))
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound {
                name: run.workflow_name.clone(),
                version: run.workflow_version.clone(),
            })
    }

    fn step_mut(&mut self, run_id: Uuid, step_id: &str) -> Result<&mut RunStep, StoreError> {
        self.run_steps
            .get_mut(&run_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.step_id == step_id))
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_id: step_id.to_string(),
            })
    }

    fn insert_attempt_if_absent(&mut self, run_id: Uuid, step_id: &str, attempt_no: u32, record: &AttemptRecord) {
        let already = self.attempts.iter().any(|a| {
            a.run_id == run_id && a.step_id == step_id && a.attempt_no == attempt_no && a.attempt_type == record.attempt_type
        });
        if already {
            return;
        }
        self.attempts.push(StepAttempt {
            run_id,
            step_id: step_id.to_string(),
            attempt_no,
            attempt_type: record.attempt_type,
            status: record.status,
            http_status: record.http_status,
            duration_ms: record.duration_ms,
            error_message: record.error_message.clone(),
            created_at: Utc::now(),
        });
    }

    fn next_outbox_id(&self) -> i64 {
        self.outbox.keys().max().copied().unwrap_or(0) + 1
    }

    fn push_outbox(&mut self, payload: OutboxPayload, next_attempt_at: chrono::DateTime<Utc>) {
        let id = self.next_outbox_id();
        self.outbox.insert(
            id,
            OutboxMessage {
                id,
                run_id: payload.run_id(),
                payload,
                status: OutboxStatus::Pending,
                attempts: 0,
                next_attempt_at,
                lock_owner: None,
                lock_acquired_at: None,
                created_at: Utc::now(),
            },
        );
    }

    fn finalize_compensated_if_needed(&mut self, run_id: Uuid) -> bool {
        if let Some(run) = self.runs.get_mut(&run_id) {
            if run.status != RunStatus::Compensated {
                run.status = RunStatus::Compensated;
                run.updated_at = Utc::now();
                return true;
            }
        }
        false
    }

    fn continue_compensation(&mut self, run_id: Uuid, remaining: Vec<String>, reason: CompensationReason) {
        if remaining.is_empty() {
            self.finalize_compensated_if_needed(run_id);
        } else {
            self.push_outbox(
                OutboxPayload::ExecuteCompensation { run_id, queue: remaining, reason },
                Utc::now(),
            );
        }
    }
}

/// In-memory backing store (§A.4), used by unit tests across the crate and
/// by the end-to-end scenario suite in `tests/`.
pub struct InMemorySagaStore {
    inner: RwLock<Inner>,
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Test helper: every recorded attempt for a given step, in insertion
    /// order. Used to assert the attempt-accounting invariant (§8).
    pub fn attempts_for(&self, run_id: Uuid, step_id: &str) -> Vec<StepAttempt> {
        self.inner
            .read()
            .attempts
            .iter()
            .filter(|a| a.run_id == run_id && a.step_id == step_id)
            .cloned()
            .collect()
    }

    /// Test helper: every compensation attempt recorded crate-wide for a
    /// run, in insertion order — used to assert reverse-compensation-order
    /// (§8 "Reverse compensation order").
    pub fn compensation_attempts_for(&self, run_id: Uuid) -> Vec<StepAttempt> {
        self.inner
            .read()
            .attempts
            .iter()
            .filter(|a| a.run_id == run_id && a.attempt_type == AttemptType::Compensation)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn get_definition(&self, name: &str, version: &str) -> Result<WorkflowDefinition, StoreError> {
        self.inner
            .read()
            .definitions
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.inner
            .write()
            .definitions
            .insert((definition.name.clone(), definition.version.clone()), definition.clone());
        Ok(())
    }

    async fn start_run(
        &self,
        name: &str,
        version: &str,
        input: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write();
        let definition = inner
            .definitions
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })?;

        let run_id = Uuid::new_v4();
        let now = Utc::now();
        inner.runs.insert(
            run_id,
            Run {
                id: run_id,
                workflow_name: name.to_string(),
                workflow_version: version.to_string(),
                status: RunStatus::Pending,
                input,
                context,
                error_code: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            },
        );

        let steps = definition.steps.iter().map(|s| RunStep::new(run_id, s.step_id.clone())).collect();
        inner.run_steps.insert(run_id, steps);

        if let Some(first) = definition.first_step() {
            inner.push_outbox(
                OutboxPayload::ExecuteStep {
                    run_id,
                    step_id: first.step_id.clone(),
                    scheduled_by: ScheduledBy::Start,
                },
                now,
            );
        }

        Ok(run_id)
    }

    async fn manual_retry_step(&self, run_id: Uuid, step_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        {
            let run = inner.runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
            run.status = RunStatus::Running;
            run.error_code = None;
            run.error_message = None;
            run.updated_at = Utc::now();
        }
        {
            let step = inner.step_mut(run_id, step_id)?;
            step.status = RunStepStatus::Pending;
            step.last_error = None;
            step.ended_at = None;
        }
        inner.push_outbox(
            OutboxPayload::ExecuteStep {
                run_id,
                step_id: step_id.to_string(),
                scheduled_by: ScheduledBy::ManualRetry,
            },
            Utc::now(),
        );
        Ok(())
    }

    async fn cancel_run(&self, run_id: Uuid, compensate: bool) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.write();
        let run = inner.runs.get(&run_id).cloned().ok_or(StoreError::RunNotFound(run_id))?;
        if run.status.is_absorbing_terminal() {
            return Ok(CancelOutcome::RunTerminal);
        }

        let queue = if compensate {
            let definition = inner.definition_for(&run)?;
            let succeeded: Vec<String> = inner
                .run_steps
                .get(&run_id)
                .into_iter()
                .flatten()
                .filter(|s| s.status == RunStepStatus::Succeeded)
                .map(|s| s.step_id.clone())
                .collect();
            compensation_queue(&definition, &succeeded)
        } else {
            Vec::new()
        };

        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).unwrap();
        if queue.is_empty() {
            run.status = RunStatus::Cancelled;
            run.updated_at = now;
            Ok(CancelOutcome::Cancelled)
        } else {
            run.status = RunStatus::Compensating;
            run.error_code = Some(error_codes::CANCELLED_BY_USER.to_string());
            run.error_message = Some("cancelled by user".to_string());
            run.updated_at = now;
            inner.push_outbox(
                OutboxPayload::ExecuteCompensation { run_id, queue, reason: CompensationReason::Cancel },
                now,
            );
            Ok(CancelOutcome::Compensating)
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        self.inner.read().runs.get(&run_id).cloned().ok_or(StoreError::RunNotFound(run_id))
    }

    async fn get_run_step(&self, run_id: Uuid, step_id: &str) -> Result<RunStep, StoreError> {
        self.inner
            .read()
            .run_steps
            .get(&run_id)
            .and_then(|steps| steps.iter().find(|s| s.step_id == step_id).cloned())
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_id: step_id.to_string(),
            })
    }

    async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>, StoreError> {
        Ok(self.inner.read().run_steps.get(&run_id).cloned().unwrap_or_default())
    }

    async fn succeeded_step_ids(&self, run_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .run_steps
            .get(&run_id)
            .into_iter()
            .flatten()
            .filter(|s| s.status == RunStepStatus::Succeeded)
            .map(|s| s.step_id.clone())
            .collect())
    }

    async fn claim_outbox(&self, worker_id: &str, lease_ttl_ms: i64) -> Result<Option<OutboxMessage>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let lease = chrono::Duration::milliseconds(lease_ttl_ms);

        let candidate_id = inner
            .outbox
            .values()
            .filter(|m| match m.status {
                OutboxStatus::Pending => m.next_attempt_at <= now,
                OutboxStatus::InFlight => m.lock_acquired_at.map(|t| t < now - lease).unwrap_or(false),
                _ => false,
            })
            .min_by_key(|m| m.created_at)
            .map(|m| m.id);

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let message = inner.outbox.get_mut(&id).unwrap();
        message.status = OutboxStatus::InFlight;
        message.lock_owner = Some(worker_id.to_string());
        message.lock_acquired_at = Some(now);
        message.attempts += 1;
        Ok(Some(message.clone()))
    }

    async fn complete_outbox(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(message) = inner.outbox.get_mut(&id) {
            message.status = OutboxStatus::Done;
            message.lock_owner = None;
            message.lock_acquired_at = None;
        }
        Ok(())
    }

    async fn requeue_outbox(&self, id: i64, delay_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(message) = inner.outbox.get_mut(&id) {
            message.status = OutboxStatus::Pending;
            message.next_attempt_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
            message.lock_owner = None;
            message.lock_acquired_at = None;
        }
        Ok(())
    }

    async fn outbox_metrics(&self) -> Result<OutboxMetrics, StoreError> {
        let inner = self.inner.read();
        let pending: Vec<&OutboxMessage> = inner.outbox.values().filter(|m| m.status == OutboxStatus::Pending).collect();
        let backlog = pending.len() as i64;
        let oldest_pending_age_secs = pending.iter().map(|m| m.created_at).min().map(|oldest| (Utc::now() - oldest).num_seconds());
        Ok(OutboxMetrics { backlog, oldest_pending_age_secs })
    }

    async fn enqueue_execute_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        scheduled_by: ScheduledBy,
        next_attempt_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.write().push_outbox(
            OutboxPayload::ExecuteStep { run_id, step_id: step_id.to_string(), scheduled_by },
            next_attempt_at,
        );
        Ok(())
    }

    async fn enqueue_execute_compensation(
        &self,
        run_id: Uuid,
        queue: Vec<String>,
        reason: CompensationReason,
        next_attempt_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .push_outbox(OutboxPayload::ExecuteCompensation { run_id, queue, reason }, next_attempt_at);
        Ok(())
    }

    async fn reserve_step(&self, run_id: Uuid, step_id: &str) -> Result<ReserveOutcome, StoreError> {
        let mut inner = self.inner.write();
        let run_status = inner.runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?.status;
        if run_status.is_absorbing_terminal() {
            return Ok(ReserveOutcome::Skip);
        }

        let now = Utc::now();
        let attempt_no = {
            let step = inner.step_mut(run_id, step_id)?;
            if matches!(step.status, RunStepStatus::Succeeded | RunStepStatus::Compensated | RunStepStatus::Running) {
                return Ok(ReserveOutcome::Skip);
            }
            step.status = RunStepStatus::Running;
            step.attempts += 1;
            if step.started_at.is_none() {
                step.started_at = Some(now);
            }
            step.attempts
        };

        if matches!(run_status, RunStatus::Pending | RunStatus::Failed | RunStatus::Running) {
            let run = inner.runs.get_mut(&run_id).unwrap();
            run.status = RunStatus::Running;
            run.error_code = None;
            run.error_message = None;
            run.updated_at = now;
        }

        Ok(ReserveOutcome::Reserved { attempt_no })
    }

    async fn fail_run(&self, run_id: Uuid, error_code: &str, error_message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if !run.status.is_absorbing_terminal() {
                run.status = RunStatus::Failed;
                run.error_code = Some(error_code.to_string());
                run.error_message = Some(error_message.to_string());
                run.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finish_step_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        output: Option<serde_json::Value>,
        next_step_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.insert_attempt_if_absent(run_id, step_id, attempt_no, &attempt);

        let now = Utc::now();
        {
            let step = inner.step_mut(run_id, step_id)?;
            step.status = RunStepStatus::Succeeded;
            step.ended_at = Some(now);
            step.output = output;
        }

        if let Some(next_step_id) = next_step_id {
            inner.push_outbox(
                OutboxPayload::ExecuteStep { run_id, step_id: next_step_id, scheduled_by: ScheduledBy::NextStep },
                now,
            );
        } else if let Some(run) = inner.runs.get_mut(&run_id) {
            if !run.status.is_absorbing_terminal() {
                run.status = RunStatus::Completed;
                run.updated_at = now;
            }
        }

        Ok(())
    }

    async fn finish_step_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        outcome: StepFailureOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.insert_attempt_if_absent(run_id, step_id, attempt_no, &attempt);

        let now = Utc::now();
        {
            let step = inner.step_mut(run_id, step_id)?;
            step.status = RunStepStatus::Failed;
            step.ended_at = Some(now);
            step.last_error = attempt.error_message.clone();
        }

        match outcome {
            StepFailureOutcome::Retry { next_attempt_at } => {
                inner.push_outbox(
                    OutboxPayload::ExecuteStep { run_id, step_id: step_id.to_string(), scheduled_by: ScheduledBy::Retry },
                    next_attempt_at,
                );
            }
            StepFailureOutcome::Compensate { queue } => {
                {
                    let step = inner.step_mut(run_id, step_id)?;
                    step.compensation_status = CompensationStatus::Skipped;
                }
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    if !run.status.is_absorbing_terminal() {
                        run.status = RunStatus::Compensating;
                        run.error_code = Some(error_codes::STEP_FAILED.to_string());
                        run.updated_at = now;
                    }
                }
                inner.push_outbox(
                    OutboxPayload::ExecuteCompensation { run_id, queue, reason: CompensationReason::StepFailure },
                    now,
                );
            }
            StepFailureOutcome::Halt => {
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    if !run.status.is_absorbing_terminal() {
                        run.status = RunStatus::Failed;
                        run.error_code = Some(error_codes::STEP_FAILED.to_string());
                        run.updated_at = now;
                    }
                }
            }
        }

        Ok(())
    }

    async fn reserve_compensation(&self, run_id: Uuid, step_id: &str) -> Result<ReserveOutcome, StoreError> {
        let mut inner = self.inner.write();
        let step = inner.step_mut(run_id, step_id)?;
        if matches!(
            step.compensation_status,
            CompensationStatus::Compensated | CompensationStatus::Skipped | CompensationStatus::Running
        ) {
            return Ok(ReserveOutcome::Skip);
        }
        step.compensation_status = CompensationStatus::Running;
        step.compensation_attempts += 1;
        Ok(ReserveOutcome::Reserved { attempt_no: step.compensation_attempts })
    }

    async fn skip_compensation(
        &self,
        run_id: Uuid,
        step_id: &str,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        {
            let step = inner.step_mut(run_id, step_id)?;
            step.compensation_status = CompensationStatus::Skipped;
            step.compensation_error = None;
        }
        inner.continue_compensation(run_id, remaining, reason);
        Ok(())
    }

    async fn finish_compensation_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.insert_attempt_if_absent(run_id, step_id, attempt_no, &attempt);
        {
            let step = inner.step_mut(run_id, step_id)?;
            step.compensation_status = CompensationStatus::Compensated;
            step.compensation_error = None;
            if step.status == RunStepStatus::Succeeded {
                step.status = RunStepStatus::Compensated;
            }
        }
        inner.continue_compensation(run_id, remaining, reason);
        Ok(())
    }

    async fn finish_compensation_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        outcome: CompensationFailureOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.insert_attempt_if_absent(run_id, step_id, attempt_no, &attempt);
        {
            let step = inner.step_mut(run_id, step_id)?;
            step.compensation_status = CompensationStatus::Failed;
            step.compensation_error = attempt.error_message.clone();
        }

        match outcome {
            CompensationFailureOutcome::Retry { queue, reason, next_attempt_at } => {
                inner.push_outbox(OutboxPayload::ExecuteCompensation { run_id, queue, reason }, next_attempt_at);
            }
            CompensationFailureOutcome::Terminate => {
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    if !run.status.is_absorbing_terminal() {
                        run.status = RunStatus::Failed;
                        run.error_code = Some(error_codes::COMPENSATION_FAILED.to_string());
                        run.error_message = attempt.error_message.clone();
                        run.updated_at = Utc::now();
                    }
                }
            }
        }

        Ok(())
    }

    async fn finalize_compensated(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.write().finalize_compensated_if_needed(run_id))
    }
}
