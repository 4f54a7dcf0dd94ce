//! `OutboxPoller` — the tick loop of §4.5: claim up to 10 outbox rows per
//! tick, dispatch each to the step executor or compensation scheduler,
//! refresh the backlog gauge, then sleep `poll_ms` before the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use crate::engine::{CompensationScheduler, StepExecutor};
use crate::model::OutboxPayload;
use crate::persistence::{OutboxMetrics, SagaStore, StoreError};

/// Up to this many rows are claimed per tick before the poller moves on to
/// refreshing metrics and sleeping (§4.5 step 1).
const MAX_CLAIMS_PER_TICK: usize = 10;

/// A requeued row is retried after this fixed delay, regardless of the
/// failing step's own retry policy (§4.5 "Processing", §7 "Processing
/// exceptions").
const REQUEUE_DELAY_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct PollerMetrics {
    pub outbox: OutboxMetrics,
}

/// Single cooperative polling loop owned by one worker process (§5). All
/// cross-worker coordination is delegated to the store's claim protocol;
/// nothing here synchronizes with other `OutboxPoller` instances directly.
pub struct OutboxPoller {
    store: Arc<dyn SagaStore>,
    step_executor: StepExecutor,
    compensation_scheduler: CompensationScheduler,
    worker_id: String,
    poll_ms: u64,
    lease_ttl_ms: i64,
    shutdown_rx: watch::Receiver<bool>,
    metrics: PollerMetrics,
}

impl OutboxPoller {
    pub fn new(
        store: Arc<dyn SagaStore>,
        worker_id: impl Into<String>,
        poll_ms: u64,
        lease_ttl_ms: i64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            step_executor: StepExecutor::new(store.clone()),
            compensation_scheduler: CompensationScheduler::new(store.clone()),
            store,
            worker_id: worker_id.into(),
            poll_ms,
            lease_ttl_ms,
            shutdown_rx,
            metrics: PollerMetrics::default(),
        }
    }

    pub fn metrics(&self) -> PollerMetrics {
        self.metrics
    }

    /// Run until the shutdown signal fires. One iteration is one tick:
    /// claim-and-dispatch up to [`MAX_CLAIMS_PER_TICK`] rows, refresh
    /// metrics, sleep `poll_ms`.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                debug!("poller shutdown requested, exiting run loop");
                return;
            }

            self.tick().await;

            let sleep = tokio::time::sleep(Duration::from_millis(self.poll_ms));
            tokio::select! {
                _ = sleep => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("poller shutdown requested during sleep");
                        return;
                    }
                }
            }
        }
    }

    /// One tick: claim-and-process up to 10 rows, then refresh metrics
    /// (§4.5 steps 1-2). Exposed standalone so tests can drive single ticks
    /// without the sleep loop.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) {
        for _ in 0..MAX_CLAIMS_PER_TICK {
            match self.store.claim_outbox(&self.worker_id, self.lease_ttl_ms).await {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim outbox row");
                    break;
                }
            }
        }

        match self.store.outbox_metrics().await {
            Ok(outbox) => self.metrics.outbox = outbox,
            Err(e) => warn!(error = %e, "failed to refresh outbox metrics"),
        }
    }

    async fn process(&self, message: crate::model::OutboxMessage) {
        let id = message.id;
        let result: Result<(), StoreError> = match message.payload {
            OutboxPayload::ExecuteStep { run_id, step_id, scheduled_by } => {
                self.step_executor.handle(run_id, &step_id, scheduled_by).await
            }
            OutboxPayload::ExecuteCompensation { run_id, queue, reason } => {
                self.compensation_scheduler.handle(run_id, queue, reason).await
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.complete_outbox(id).await {
                    error!(outbox_id = id, error = %e, "failed to mark outbox row done");
                }
            }
            Err(e) => {
                warn!(outbox_id = id, error = %e, "outbox processing failed, requeueing");
                if let Err(e) = self.store.requeue_outbox(id, REQUEUE_DELAY_MS).await {
                    error!(outbox_id = id, error = %e, "failed to requeue outbox row");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::persistence::memory::InMemorySagaStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn def() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            steps: vec![StepDefinition {
                step_id: "only".into(),
                action: HttpRequestSpec {
                    method: "POST".into(),
                    url: "http://127.0.0.1:1/unreachable".into(),
                    headers: HashMap::new(),
                    body: None,
                },
                compensation: None,
                timeout_ms: 200,
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
    async fn tick_with_no_pending_rows_does_nothing() {
        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
        let (_tx, rx) = watch::channel(false);
        let mut poller = OutboxPoller::new(store, "w1", 500, 30_000, rx);
        poller.tick().await;
        assert_eq!(poller.metrics().outbox.backlog, 0);
    }

    #[tokio::test]
    async fn tick_claims_and_dispatches_an_execute_step_row() {
        let store = Arc::new(InMemorySagaStore::new());
        store.put_definition(&def()).await.unwrap();
        let run_id = store.start_run("wf", "1.0.0", json!({}), json!({})).await.unwrap();

        let store_dyn: Arc<dyn SagaStore> = store.clone();
        let (_tx, rx) = watch::channel(false);
        let mut poller = OutboxPoller::new(store_dyn, "w1", 500, 30_000, rx);
        poller.tick().await;

        let step = store.get_run_step(run_id, "only").await.unwrap();
        assert_eq!(step.status, RunStepStatus::Failed);
    }
}
