//! PostgreSQL implementation of [`SagaStore`] (§4.1, §6).
//!
//! Every multi-statement operation runs in a single transaction, row locks
//! are taken with `FOR UPDATE`, and `claim_outbox` uses the same
//! `FOR UPDATE SKIP LOCKED` CTE shape the worker's task queue has always
//! used for contention-free concurrent claiming. See `migrations/schema.sql`
//! for the table shapes referenced here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{
    compensation_queue, AttemptStatus, AttemptType, CompensationReason, CompensationStatus, OutboxMessage,
    OutboxPayload, OutboxStatus, Run, RunStatus, RunStep, RunStepStatus, ScheduledBy, WorkflowDefinition,
};

use super::store::*;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

/// PostgreSQL-backed [`SagaStore`]. Holds a connection pool; every method
/// opens (and for multi-statement operations, commits) its own transaction.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_run_tx(tx: &mut Transaction<'_, Postgres>, run_id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_name, workflow_version, status, input, context,
                   error_code, error_message, created_at, updated_at
            FROM workflow_runs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(run_id))?;

        row_to_run(&row)
    }

    async fn load_step_tx(tx: &mut Transaction<'_, Postgres>, run_id: Uuid, step_id: &str) -> Result<RunStep, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, status, attempts, last_error, started_at, ended_at,
                   output, compensation_status, compensation_attempts, compensation_error
            FROM run_steps
            WHERE run_id = $1 AND step_id = $2
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::StepNotFound { run_id, step_id: step_id.to_string() })?;

        row_to_run_step(&row)
    }

    async fn insert_attempt_tx(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: &AttemptRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO step_attempts
                (run_id, step_id, attempt_no, attempt_type, status, http_status, duration_ms, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, step_id, attempt_no, attempt_type) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .bind(attempt_no as i32)
        .bind(attempt_type_str(attempt.attempt_type))
        .bind(attempt_status_str(attempt.status))
        .bind(attempt.http_status.map(|s| s as i32))
        .bind(attempt.duration_ms as i64)
        .bind(&attempt.error_message)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn push_outbox_tx(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        payload: &OutboxPayload,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload_json = serde_json::to_value(payload).map_err(ser_err)?;
        sqlx::query(
            r#"
            INSERT INTO outbox (run_id, payload, status, next_attempt_at)
            VALUES ($1, $2, 'PENDING', $3)
            "#,
        )
        .bind(run_id)
        .bind(&payload_json)
        .bind(next_attempt_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn continue_compensation_tx(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError> {
        if remaining.is_empty() {
            Self::finalize_compensated_tx(tx, run_id).await?;
        } else {
            Self::push_outbox_tx(
                tx,
                run_id,
                &OutboxPayload::ExecuteCompensation { run_id, queue: remaining, reason },
                Utc::now(),
            )
            .await?;
        }
        Ok(())
    }

    async fn finalize_compensated_tx(tx: &mut Transaction<'_, Postgres>, run_id: Uuid) -> Result<bool, StoreError> {
        let changed = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'COMPENSATED', updated_at = now()
            WHERE id = $1 AND status NOT IN ('COMPLETED', 'COMPENSATED')
            "#,
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?
        .rows_affected()
            > 0;
        Ok(changed)
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[instrument(skip(self))]
    async fn get_definition(&self, name: &str, version: &str) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE name = $1 AND version = $2")
            .bind(name)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::DefinitionNotFound { name: name.to_string(), version: version.to_string() })?;

        let json: Value = row.get("definition");
        serde_json::from_value(json).map_err(ser_err)
    }

    #[instrument(skip(self, definition))]
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let json = serde_json::to_value(definition).map_err(ser_err)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (name, version, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (name, version) DO UPDATE SET definition = EXCLUDED.definition
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.version)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, input, context))]
    async fn start_run(&self, name: &str, version: &str, input: Value, context: Value) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let def_row = sqlx::query("SELECT definition FROM workflow_definitions WHERE name = $1 AND version = $2")
            .bind(name)
            .bind(version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::DefinitionNotFound { name: name.to_string(), version: version.to_string() })?;
        let definition: WorkflowDefinition = serde_json::from_value(def_row.get("definition")).map_err(ser_err)?;

        let run_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_name, workflow_version, status, input, context)
            VALUES ($1, $2, $3, 'PENDING', $4, $5)
            "#,
        )
        .bind(run_id)
        .bind(name)
        .bind(version)
        .bind(&input)
        .bind(&context)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for step in &definition.steps {
            sqlx::query(
                r#"
                INSERT INTO run_steps (run_id, step_id, status, compensation_status)
                VALUES ($1, $2, 'PENDING', 'PENDING')
                "#,
            )
            .bind(run_id)
            .bind(&step.step_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if let Some(first) = definition.first_step() {
            Self::push_outbox_tx(
                &mut tx,
                run_id,
                &OutboxPayload::ExecuteStep { run_id, step_id: first.step_id.clone(), scheduled_by: ScheduledBy::Start },
                Utc::now(),
            )
            .await?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(%run_id, %name, %version, "started run");
        Ok(run_id)
    }

    #[instrument(skip(self))]
    async fn manual_retry_step(&self, run_id: Uuid, step_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::load_run_tx(&mut tx, run_id).await?;
        Self::load_step_tx(&mut tx, run_id, step_id).await?;

        sqlx::query("UPDATE workflow_runs SET status = 'RUNNING', error_code = NULL, error_message = NULL, updated_at = now() WHERE id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query("UPDATE run_steps SET status = 'PENDING', last_error = NULL, ended_at = NULL WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        Self::push_outbox_tx(
            &mut tx,
            run_id,
            &OutboxPayload::ExecuteStep { run_id, step_id: step_id.to_string(), scheduled_by: ScheduledBy::ManualRetry },
            Utc::now(),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_run(&self, run_id: Uuid, compensate: bool) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run = Self::load_run_tx(&mut tx, run_id).await?;
        if run.status.is_absorbing_terminal() {
            tx.commit().await.map_err(db_err)?;
            return Ok(CancelOutcome::RunTerminal);
        }

        let queue = if compensate {
            let definition = self.get_definition(&run.workflow_name, &run.workflow_version).await?;
            let succeeded_rows = sqlx::query("SELECT step_id FROM run_steps WHERE run_id = $1 AND status = 'SUCCEEDED'")
                .bind(run_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
            let succeeded: Vec<String> = succeeded_rows.iter().map(|r| r.get("step_id")).collect();
            compensation_queue(&definition, &succeeded)
        } else {
            Vec::new()
        };

        let outcome = if queue.is_empty() {
            sqlx::query("UPDATE workflow_runs SET status = 'CANCELLED', updated_at = now() WHERE id = $1")
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            CancelOutcome::Cancelled
        } else {
            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = 'COMPENSATING', error_code = $2, error_message = 'cancelled by user', updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(run_id)
            .bind(crate::model::error_codes::CANCELLED_BY_USER)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            Self::push_outbox_tx(
                &mut tx,
                run_id,
                &OutboxPayload::ExecuteCompensation { run_id, queue, reason: CompensationReason::Cancel },
                Utc::now(),
            )
            .await?;
            CancelOutcome::Compensating
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_name, workflow_version, status, input, context,
                   error_code, error_message, created_at, updated_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(run_id))?;
        row_to_run(&row)
    }

    #[instrument(skip(self))]
    async fn get_run_step(&self, run_id: Uuid, step_id: &str) -> Result<RunStep, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, status, attempts, last_error, started_at, ended_at,
                   output, compensation_status, compensation_attempts, compensation_error
            FROM run_steps
            WHERE run_id = $1 AND step_id = $2
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::StepNotFound { run_id, step_id: step_id.to_string() })?;
        row_to_run_step(&row)
    }

    #[instrument(skip(self))]
    async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, status, attempts, last_error, started_at, ended_at,
                   output, compensation_status, compensation_attempts, compensation_error
            FROM run_steps
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_run_step).collect()
    }

    #[instrument(skip(self))]
    async fn succeeded_step_ids(&self, run_id: Uuid) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT step_id FROM run_steps WHERE run_id = $1 AND status = 'SUCCEEDED'")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get("step_id")).collect())
    }

    #[instrument(skip(self))]
    async fn claim_outbox(&self, worker_id: &str, lease_ttl_ms: i64) -> Result<Option<OutboxMessage>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox
                WHERE (status = 'PENDING' AND next_attempt_at <= now())
                   OR (status = 'IN_FLIGHT' AND lock_acquired_at < now() - ($2 || ' milliseconds')::interval)
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox o
            SET status = 'IN_FLIGHT',
                lock_owner = $1,
                lock_acquired_at = now(),
                attempts = o.attempts + 1
            FROM claimable c
            WHERE o.id = c.id
            RETURNING o.id, o.run_id, o.payload, o.status, o.attempts,
                      o.next_attempt_at, o.lock_owner, o.lock_acquired_at, o.created_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_ttl_ms.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| row_to_outbox_message(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn complete_outbox(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET status = 'DONE', lock_owner = NULL, lock_acquired_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn requeue_outbox(&self, id: i64, delay_ms: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PENDING',
                next_attempt_at = now() + ($2 || ' milliseconds')::interval,
                lock_owner = NULL,
                lock_acquired_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delay_ms.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn outbox_metrics(&self) -> Result<OutboxMetrics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS backlog,
                   EXTRACT(EPOCH FROM (now() - MIN(created_at)))::BIGINT AS oldest_pending_age_secs
            FROM outbox
            WHERE status = 'PENDING'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(OutboxMetrics {
            backlog: row.get("backlog"),
            oldest_pending_age_secs: row.try_get("oldest_pending_age_secs").ok(),
        })
    }

    #[instrument(skip(self))]
    async fn enqueue_execute_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        scheduled_by: ScheduledBy,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = OutboxPayload::ExecuteStep { run_id, step_id: step_id.to_string(), scheduled_by };
        let payload_json = serde_json::to_value(&payload).map_err(ser_err)?;
        sqlx::query("INSERT INTO outbox (run_id, payload, status, next_attempt_at) VALUES ($1, $2, 'PENDING', $3)")
            .bind(run_id)
            .bind(&payload_json)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, queue))]
    async fn enqueue_execute_compensation(
        &self,
        run_id: Uuid,
        queue: Vec<String>,
        reason: CompensationReason,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = OutboxPayload::ExecuteCompensation { run_id, queue, reason };
        let payload_json = serde_json::to_value(&payload).map_err(ser_err)?;
        sqlx::query("INSERT INTO outbox (run_id, payload, status, next_attempt_at) VALUES ($1, $2, 'PENDING', $3)")
            .bind(run_id)
            .bind(&payload_json)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reserve_step(&self, run_id: Uuid, step_id: &str) -> Result<ReserveOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run = Self::load_run_tx(&mut tx, run_id).await?;
        if run.status.is_absorbing_terminal() {
            tx.commit().await.map_err(db_err)?;
            return Ok(ReserveOutcome::Skip);
        }

        let step = Self::load_step_tx(&mut tx, run_id, step_id).await?;
        if matches!(step.status, RunStepStatus::Succeeded | RunStepStatus::Compensated | RunStepStatus::Running) {
            tx.commit().await.map_err(db_err)?;
            return Ok(ReserveOutcome::Skip);
        }

        let row = sqlx::query(
            r#"
            UPDATE run_steps
            SET status = 'RUNNING',
                attempts = attempts + 1,
                started_at = COALESCE(started_at, now())
            WHERE run_id = $1 AND step_id = $2
            RETURNING attempts
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let attempt_no: i32 = row.get("attempts");

        if matches!(run.status, RunStatus::Pending | RunStatus::Failed | RunStatus::Running) {
            sqlx::query(
                "UPDATE workflow_runs SET status = 'RUNNING', error_code = NULL, error_message = NULL, updated_at = now() WHERE id = $1",
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(ReserveOutcome::Reserved { attempt_no: attempt_no as u32 })
    }

    #[instrument(skip(self))]
    async fn fail_run(&self, run_id: Uuid, error_code: &str, error_message: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'FAILED', error_code = $2, error_message = $3, updated_at = now()
            WHERE id = $1 AND status NOT IN ('COMPLETED', 'COMPENSATED')
            "#,
        )
        .bind(run_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, attempt, output))]
    async fn finish_step_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        output: Option<Value>,
        next_step_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::insert_attempt_tx(&mut tx, run_id, step_id, attempt_no, &attempt).await?;

        sqlx::query("UPDATE run_steps SET status = 'SUCCEEDED', ended_at = now(), output = $3 WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .bind(&output)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(next_step_id) = next_step_id {
            Self::push_outbox_tx(
                &mut tx,
                run_id,
                &OutboxPayload::ExecuteStep { run_id, step_id: next_step_id, scheduled_by: ScheduledBy::NextStep },
                Utc::now(),
            )
            .await?;
        } else {
            sqlx::query(
                "UPDATE workflow_runs SET status = 'COMPLETED', updated_at = now() WHERE id = $1 AND status NOT IN ('COMPLETED', 'COMPENSATED')",
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, attempt, outcome))]
    async fn finish_step_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        outcome: StepFailureOutcome,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::insert_attempt_tx(&mut tx, run_id, step_id, attempt_no, &attempt).await?;

        sqlx::query("UPDATE run_steps SET status = 'FAILED', ended_at = now(), last_error = $3 WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .bind(&attempt.error_message)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        match outcome {
            StepFailureOutcome::Retry { next_attempt_at } => {
                Self::push_outbox_tx(
                    &mut tx,
                    run_id,
                    &OutboxPayload::ExecuteStep { run_id, step_id: step_id.to_string(), scheduled_by: ScheduledBy::Retry },
                    next_attempt_at,
                )
                .await?;
            }
            StepFailureOutcome::Compensate { queue } => {
                sqlx::query("UPDATE run_steps SET compensation_status = 'SKIPPED' WHERE run_id = $1 AND step_id = $2")
                    .bind(run_id)
                    .bind(step_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'COMPENSATING', error_code = $2, updated_at = now()
                    WHERE id = $1 AND status NOT IN ('COMPLETED', 'COMPENSATED')
                    "#,
                )
                .bind(run_id)
                .bind(crate::model::error_codes::STEP_FAILED)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                Self::push_outbox_tx(
                    &mut tx,
                    run_id,
                    &OutboxPayload::ExecuteCompensation { run_id, queue, reason: CompensationReason::StepFailure },
                    Utc::now(),
                )
                .await?;
            }
            StepFailureOutcome::Halt => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'FAILED', error_code = $2, updated_at = now()
                    WHERE id = $1 AND status NOT IN ('COMPLETED', 'COMPENSATED')
                    "#,
                )
                .bind(run_id)
                .bind(crate::model::error_codes::STEP_FAILED)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reserve_compensation(&self, run_id: Uuid, step_id: &str) -> Result<ReserveOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let step = Self::load_step_tx(&mut tx, run_id, step_id).await?;
        if matches!(
            step.compensation_status,
            CompensationStatus::Compensated | CompensationStatus::Skipped | CompensationStatus::Running
        ) {
            tx.commit().await.map_err(db_err)?;
            return Ok(ReserveOutcome::Skip);
        }

        let row = sqlx::query(
            r#"
            UPDATE run_steps
            SET compensation_status = 'RUNNING', compensation_attempts = compensation_attempts + 1
            WHERE run_id = $1 AND step_id = $2
            RETURNING compensation_attempts
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let attempt_no: i32 = row.get("compensation_attempts");

        tx.commit().await.map_err(db_err)?;
        Ok(ReserveOutcome::Reserved { attempt_no: attempt_no as u32 })
    }

    #[instrument(skip(self, remaining))]
    async fn skip_compensation(
        &self,
        run_id: Uuid,
        step_id: &str,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE run_steps SET compensation_status = 'SKIPPED', compensation_error = NULL WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Self::continue_compensation_tx(&mut tx, run_id, remaining, reason).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, attempt, remaining))]
    async fn finish_compensation_success(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        remaining: Vec<String>,
        reason: CompensationReason,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::insert_attempt_tx(&mut tx, run_id, step_id, attempt_no, &attempt).await?;

        sqlx::query(
            r#"
            UPDATE run_steps
            SET compensation_status = 'COMPENSATED',
                compensation_error = NULL,
                status = CASE WHEN status = 'SUCCEEDED' THEN 'COMPENSATED' ELSE status END
            WHERE run_id = $1 AND step_id = $2
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::continue_compensation_tx(&mut tx, run_id, remaining, reason).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, attempt, outcome))]
    async fn finish_compensation_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt_no: u32,
        attempt: AttemptRecord,
        outcome: CompensationFailureOutcome,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::insert_attempt_tx(&mut tx, run_id, step_id, attempt_no, &attempt).await?;

        sqlx::query("UPDATE run_steps SET compensation_status = 'FAILED', compensation_error = $3 WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .bind(&attempt.error_message)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        match outcome {
            CompensationFailureOutcome::Retry { queue, reason, next_attempt_at } => {
                Self::push_outbox_tx(
                    &mut tx,
                    run_id,
                    &OutboxPayload::ExecuteCompensation { run_id, queue, reason },
                    next_attempt_at,
                )
                .await?;
            }
            CompensationFailureOutcome::Terminate => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'FAILED', error_code = $2, error_message = $3, updated_at = now()
                    WHERE id = $1 AND status NOT IN ('COMPLETED', 'COMPENSATED')
                    "#,
                )
                .bind(run_id)
                .bind(crate::model::error_codes::COMPENSATION_FAILED)
                .bind(&attempt.error_message)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn finalize_compensated(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let changed = Self::finalize_compensated_tx(&mut tx, run_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(changed)
    }
}

fn attempt_type_str(t: AttemptType) -> &'static str {
    match t {
        AttemptType::Action => "ACTION",
        AttemptType::Compensation => "COMPENSATION",
    }
}

fn attempt_status_str(s: AttemptStatus) -> &'static str {
    match s {
        AttemptStatus::Success => "SUCCESS",
        AttemptStatus::Fail => "FAIL",
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus, StoreError> {
    Ok(match s {
        "PENDING" => RunStatus::Pending,
        "RUNNING" => RunStatus::Running,
        "COMPLETED" => RunStatus::Completed,
        "FAILED" => RunStatus::Failed,
        "COMPENSATING" => RunStatus::Compensating,
        "COMPENSATED" => RunStatus::Compensated,
        "CANCELLED" => RunStatus::Cancelled,
        other => return Err(StoreError::Serialization(format!("unknown run status: {other}"))),
    })
}

fn parse_run_step_status(s: &str) -> Result<RunStepStatus, StoreError> {
    Ok(match s {
        "PENDING" => RunStepStatus::Pending,
        "RUNNING" => RunStepStatus::Running,
        "SUCCEEDED" => RunStepStatus::Succeeded,
        "FAILED" => RunStepStatus::Failed,
        "COMPENSATED" => RunStepStatus::Compensated,
        "SKIPPED" => RunStepStatus::Skipped,
        other => return Err(StoreError::Serialization(format!("unknown run step status: {other}"))),
    })
}

fn parse_compensation_status(s: &str) -> Result<CompensationStatus, StoreError> {
    Ok(match s {
        "PENDING" => CompensationStatus::Pending,
        "RUNNING" => CompensationStatus::Running,
        "COMPENSATED" => CompensationStatus::Compensated,
        "FAILED" => CompensationStatus::Failed,
        "SKIPPED" => CompensationStatus::Skipped,
        other => return Err(StoreError::Serialization(format!("unknown compensation status: {other}"))),
    })
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<Run, StoreError> {
    let status_str: String = row.get("status");
    Ok(Run {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        workflow_version: row.get("workflow_version"),
        status: parse_run_status(&status_str)?,
        input: row.get("input"),
        context: row.get("context"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_run_step(row: &sqlx::postgres::PgRow) -> Result<RunStep, StoreError> {
    let status_str: String = row.get("status");
    let comp_status_str: String = row.get("compensation_status");
    Ok(RunStep {
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        status: parse_run_step_status(&status_str)?,
        attempts: row.get::<i32, _>("attempts") as u32,
        last_error: row.get("last_error"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        output: row.get("output"),
        compensation_status: parse_compensation_status(&comp_status_str)?,
        compensation_attempts: row.get::<i32, _>("compensation_attempts") as u32,
        compensation_error: row.get("compensation_error"),
    })
}

fn row_to_outbox_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, StoreError> {
    let status_str: String = row.get("status");
    let status = match status_str.as_str() {
        "PENDING" => OutboxStatus::Pending,
        "IN_FLIGHT" => OutboxStatus::InFlight,
        "DONE" => OutboxStatus::Done,
        "FAILED" => OutboxStatus::Failed,
        other => return Err(StoreError::Serialization(format!("unknown outbox status: {other}"))),
    };
    let payload_json: Value = row.get("payload");
    let payload: OutboxPayload = serde_json::from_value(payload_json).map_err(ser_err)?;

    Ok(OutboxMessage {
        id: row.get("id"),
        run_id: row.get("run_id"),
        payload,
        status,
        attempts: row.get::<i32, _>("attempts") as u32,
        next_attempt_at: row.get("next_attempt_at"),
        lock_owner: row.get("lock_owner"),
        lock_acquired_at: row.get("lock_acquired_at"),
        created_at: row.get("created_at"),
    })
}
