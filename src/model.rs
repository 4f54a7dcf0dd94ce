//! Declarative workflow definitions and the persisted run/step/attempt/outbox
//! entities of §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An HTTP request template used for both a step's action and its optional
/// compensation. Headers and body are rendered against the run envelope
/// before dispatch (see [`crate::template`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// Whether a step's idempotency key is scoped to the whole run or to this
/// step alone. Currently informational: the engine always derives the key
/// as `{runId}:{stepId}:{attemptNo}`, which is run-scoped by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    Run,
    Step,
}

/// What happens to a run when a step exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Compensate,
    Halt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyDef {
    pub max_attempts: u32,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: u64,
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub retry_on_409: bool,
}

/// One step within a [`WorkflowDefinition`]. `step_id` is unique within the
/// owning definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_id: String,
    pub action: HttpRequestSpec,
    #[serde(default)]
    pub compensation: Option<HttpRequestSpec>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicyDef,
    #[serde(default = "default_idempotency_scope")]
    pub idempotency_scope: IdempotencyScope,
    pub on_failure: OnFailure,
}

fn default_idempotency_scope() -> IdempotencyScope {
    IdempotencyScope::Run
}

/// A declarative, immutable workflow shape identified by `(name, version)`.
/// Loaded per run from the store — never cached in a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    pub fn next_step(&self, step_id: &str) -> Option<&StepDefinition> {
        let idx = self.step_index(step_id)?;
        self.steps.get(idx + 1)
    }

    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Cancelled,
}

impl RunStatus {
    /// `COMPLETED` and `COMPENSATED` are absorbing: the engine must never
    /// overwrite them (invariant 4).
    pub fn is_absorbing_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Compensated)
    }

    /// Includes `CANCELLED`, which is terminal but not one of the two
    /// "absorbing" statuses named by invariant 4 (cancel only ever happens
    /// once per run in practice, but the engine still treats it as a
    /// skip condition in step/compensation dispatch).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Compensated | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    Pending,
    Running,
    Compensated,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: Uuid,
    pub step_id: String,
    pub status: RunStepStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub compensation_status: CompensationStatus,
    pub compensation_attempts: u32,
    pub compensation_error: Option<String>,
}

impl RunStep {
    pub fn new(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            status: RunStepStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            ended_at: None,
            output: None,
            compensation_status: CompensationStatus::Pending,
            compensation_attempts: 0,
            compensation_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptType {
    Action,
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Success,
    Fail,
}

/// Append-only execution history row, identity `(run_id, step_id,
/// attempt_no, attempt_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt_no: u32,
    pub attempt_type: AttemptType,
    pub status: AttemptStatus,
    pub http_status: Option<u16>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledBy {
    Start,
    NextStep,
    Retry,
    ManualRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationReason {
    StepFailure,
    Cancel,
}

/// The two outbox payload shapes of §3/§6, tagged on `type` so the stored
/// JSON column round-trips without a wrapper struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxPayload {
    ExecuteStep {
        run_id: Uuid,
        step_id: String,
        scheduled_by: ScheduledBy,
    },
    ExecuteCompensation {
        run_id: Uuid,
        queue: Vec<String>,
        reason: CompensationReason,
    },
}

impl OutboxPayload {
    pub fn run_id(&self) -> Uuid {
        match self {
            OutboxPayload::ExecuteStep { run_id, .. } => *run_id,
            OutboxPayload::ExecuteCompensation { run_id, .. } => *run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub run_id: Uuid,
    pub payload: OutboxPayload,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Error codes the engine attaches to terminal/compensating runs (§7).
pub mod error_codes {
    pub const WORKFLOW_NOT_FOUND: &str = "WORKFLOW_NOT_FOUND";
    pub const STEP_NOT_FOUND: &str = "STEP_NOT_FOUND";
    pub const STEP_FAILED: &str = "STEP_FAILED";
    pub const COMPENSATION_FAILED: &str = "COMPENSATION_FAILED";
    pub const CANCELLED_BY_USER: &str = "CANCELLED_BY_USER";
}

/// Given a definition's ordered steps and the set of currently-`SUCCEEDED`
/// step ids, build the reverse-order compensation queue (§4.7 "Queue
/// derivation"): definition order, filtered to succeeded ids, then reversed.
pub fn compensation_queue(definition: &WorkflowDefinition, succeeded: &[String]) -> Vec<String> {
    definition
        .steps
        .iter()
        .map(|s| s.step_id.clone())
        .filter(|id| succeeded.contains(id))
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(ids: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            steps: ids
                .iter()
                .map(|id| StepDefinition {
                    step_id: id.to_string(),
                    action: HttpRequestSpec {
                        method: "POST".into(),
                        url: "http://x".into(),
                        headers: HashMap::new(),
                        body: None,
                    },
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
                })
                .collect(),
        }
    }

    #[test]
    fn compensation_queue_is_reverse_of_definition_order() {
        let d = def(&["a", "b", "c"]);
        let succeeded = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(compensation_queue(&d, &succeeded), vec!["c", "b", "a"]);
    }

    #[test]
    fn compensation_queue_skips_unsucceeded_steps() {
        let d = def(&["a", "b", "c"]);
        let succeeded = vec!["a".to_string(), "c".to_string()];
        assert_eq!(compensation_queue(&d, &succeeded), vec!["c", "a"]);
    }

    #[test]
    fn next_step_returns_none_past_the_end() {
        let d = def(&["a", "b"]);
        assert_eq!(d.next_step("a").map(|s| s.step_id.clone()), Some("b".to_string()));
        assert!(d.next_step("b").is_none());
    }

    #[test]
    fn absorbing_terminal_statuses() {
        assert!(RunStatus::Completed.is_absorbing_terminal());
        assert!(RunStatus::Compensated.is_absorbing_terminal());
        assert!(!RunStatus::Failed.is_absorbing_terminal());
        assert!(!RunStatus::Cancelled.is_absorbing_terminal());
    }
}
