//! # sagaflow
//!
//! A durable saga orchestrator for multi-step HTTP workflows: a transactional
//! outbox, a leased poller, a step state machine with retry/backoff, and a
//! reverse-order compensation scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Intake                               │
//! │   (start_run / manual_retry_step / cancel_run)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SagaStore                              │
//! │  (Postgres: workflow_runs, run_steps, step_attempts, outbox) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       OutboxPoller                            │
//! │  (SKIP LOCKED leasing, dispatches to StepExecutor /          │
//! │   CompensationScheduler, requeues on failure)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Steps invoke downstream services over HTTP ([`http::HttpActionExecutor`]),
//! with request/response bodies rendered through `{{path}}` templates
//! ([`template`]) and failures classified into retry/compensate/halt
//! outcomes ([`reliability::retry`]).

pub mod config;
pub mod engine;
pub mod http;
pub mod intake;
pub mod model;
pub mod outbox;
pub mod persistence;
pub mod reliability;
pub mod telemetry;
pub mod template;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::WorkerConfig;
    pub use crate::engine::{CompensationScheduler, StepExecutor};
    pub use crate::http::{ExecutionOptions, HttpActionExecutor, HttpExecutionResult};
    pub use crate::intake::{CancelRunOutcome, Intake, IntakeError};
    pub use crate::model::{
        AttemptStatus, AttemptType, CompensationReason, CompensationStatus, HttpRequestSpec,
        IdempotencyScope, OnFailure, OutboxMessage, OutboxPayload, OutboxStatus, RetryPolicyDef,
        Run, RunStatus, RunStep, RunStepStatus, ScheduledBy, StepAttempt, StepDefinition,
        WorkflowDefinition,
    };
    pub use crate::outbox::{OutboxPoller, PollerMetrics};
    pub use crate::persistence::{
        AttemptRecord, CancelOutcome, CompensationFailureOutcome, InMemorySagaStore,
        OutboxMetrics, PostgresSagaStore, ReserveOutcome, SagaStore, StepFailureOutcome,
        StoreError,
    };
    pub use crate::reliability::{classify_outcome, compute_backoff_ms, next_backoff_ms, should_retry, Reason, RetryDecision};
    pub use crate::template::render_value;
}

// Re-export key types at crate root
pub use config::WorkerConfig;
pub use engine::{CompensationScheduler, StepExecutor};
pub use intake::{CancelRunOutcome, Intake, IntakeError};
pub use outbox::{OutboxPoller, PollerMetrics};
pub use persistence::{InMemorySagaStore, PostgresSagaStore, SagaStore, StoreError};
