//! End-to-end scenario suite (§8) driven entirely through
//! [`InMemorySagaStore`] and [`OutboxPoller::tick`] against mocked HTTP
//! endpoints, no Postgres required. Each test exercises one literal
//! scenario: happy-path completion, compensation on a later-step failure,
//! user cancellation mid-run, a transient timeout that retries and then
//! succeeds, a permanent 4xx that halts without compensation, and an
//! outbox lease expiring out from under a crashed worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use sagaflow::model::{
    CompensationStatus, HttpRequestSpec, IdempotencyScope, OnFailure, RetryPolicyDef,
    RunStatus, RunStepStatus, StepDefinition, WorkflowDefinition,
};
use sagaflow::outbox::OutboxPoller;
use sagaflow::persistence::{InMemorySagaStore, SagaStore};

fn step(
    id: &str,
    url: String,
    compensation_url: Option<String>,
    on_failure: OnFailure,
    max_attempts: u32,
    timeout_ms: u64,
) -> StepDefinition {
    StepDefinition {
        step_id: id.into(),
        action: HttpRequestSpec {
            method: "POST".into(),
            url,
            headers: HashMap::new(),
            body: None,
        },
        compensation: compensation_url.map(|url| HttpRequestSpec {
            method: "POST".into(),
            url,
            headers: HashMap::new(),
            body: None,
        }),
        timeout_ms,
        retry_policy: RetryPolicyDef {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
            retry_on_409: false,
        },
        idempotency_scope: IdempotencyScope::Run,
        on_failure,
    }
}

/// Ticks `poller` until `run_id` reaches a terminal [`RunStatus`] or
/// `max_ticks` is exhausted (whichever first), yielding to the scheduler
/// between ticks so any mocked response delays actually elapse.
async fn run_until_terminal(poller: &mut OutboxPoller, store: &InMemorySagaStore, run_id: Uuid, max_ticks: usize) {
    for _ in 0..max_ticks {
        let run = store.get_run(run_id).await.unwrap();
        if run.status.is_terminal() {
            return;
        }
        poller.tick().await;
        tokio::task::yield_now().await;
    }
}

fn new_poller(store: Arc<dyn SagaStore>) -> OutboxPoller {
    let (_tx, rx) = watch::channel(false);
    OutboxPoller::new(store, "test-worker", 50, 30_000, rx)
}

#[test_log::test(tokio::test)]
async fn happy_path_two_step_run_completes() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"charged": true})))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reserve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reserved": true})))
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySagaStore::new());
    let definition = WorkflowDefinition {
        name: "order-processing".into(),
        version: "1.0.0".into(),
        steps: vec![
            step("charge-payment", format!("{}/charge", mock_server.uri()), Some(format!("{}/refund", mock_server.uri())), OnFailure::Compensate, 3, 1000),
            step("reserve-inventory", format!("{}/reserve", mock_server.uri()), None, OnFailure::Compensate, 3, 1000),
        ],
    };
    store.put_definition(&definition).await.unwrap();
    let run_id = store.start_run("order-processing", "1.0.0", json!({"order_id": "o1"}), json!({})).await.unwrap();

    let store_dyn: Arc<dyn SagaStore> = store.clone();
    let mut poller = new_poller(store_dyn);
    run_until_terminal(&mut poller, &store, run_id, 10).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let steps = store.list_run_steps(run_id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == RunStepStatus::Succeeded));
}

#[test_log::test(tokio::test)]
async fn reserve_inventory_failure_compensates_charge_payment() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charge"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reserve"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refund"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySagaStore::new());
    let definition = WorkflowDefinition {
        name: "order-processing".into(),
        version: "1.0.0".into(),
        steps: vec![
            step("charge-payment", format!("{}/charge", mock_server.uri()), Some(format!("{}/refund", mock_server.uri())), OnFailure::Compensate, 3, 1000),
            step("reserve-inventory", format!("{}/reserve", mock_server.uri()), None, OnFailure::Compensate, 3, 1000),
        ],
    };
    store.put_definition(&definition).await.unwrap();
    let run_id = store.start_run("order-processing", "1.0.0", json!({}), json!({})).await.unwrap();

    let store_dyn: Arc<dyn SagaStore> = store.clone();
    let mut poller = new_poller(store_dyn);
    run_until_terminal(&mut poller, &store, run_id, 15).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Compensated);

    let charge_step = store.get_run_step(run_id, "charge-payment").await.unwrap();
    assert_eq!(charge_step.compensation_status, CompensationStatus::Compensated);

    let reserve_step = store.get_run_step(run_id, "reserve-inventory").await.unwrap();
    assert_eq!(reserve_step.status, RunStepStatus::Failed);
    assert_eq!(reserve_step.attempts, 3);
}

#[test_log::test(tokio::test)]
async fn user_cancel_after_first_step_succeeded_compensates_it() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charge"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refund"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySagaStore::new());
    let definition = WorkflowDefinition {
        name: "order-processing".into(),
        version: "1.0.0".into(),
        steps: vec![
            step("charge-payment", format!("{}/charge", mock_server.uri()), Some(format!("{}/refund", mock_server.uri())), OnFailure::Compensate, 3, 1000),
            step("reserve-inventory", "http://127.0.0.1:1/reserve".into(), None, OnFailure::Compensate, 3, 1000),
        ],
    };
    store.put_definition(&definition).await.unwrap();
    let run_id = store.start_run("order-processing", "1.0.0", json!({}), json!({})).await.unwrap();

    let store_dyn: Arc<dyn SagaStore> = store.clone();
    let mut poller = new_poller(store_dyn);

    // Drive exactly the first step to completion before cancelling.
    poller.tick().await;
    let charge_step = store.get_run_step(run_id, "charge-payment").await.unwrap();
    assert_eq!(charge_step.status, RunStepStatus::Succeeded);

    let outcome = store.cancel_run(run_id, true).await.unwrap();
    assert_eq!(outcome, sagaflow::persistence::CancelOutcome::Compensating);

    run_until_terminal(&mut poller, &store, run_id, 10).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Compensated);
    let charge_step = store.get_run_step(run_id, "charge-payment").await.unwrap();
    assert_eq!(charge_step.compensation_status, CompensationStatus::Compensated);
}

/// Responds with a long-delayed 200 on the first call (forcing the
/// client-side timeout to fire) and an immediate 200 thereafter.
struct TimeoutThenOk {
    calls: AtomicUsize,
}

impl Respond for TimeoutThenOk {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            ResponseTemplate::new(200).set_delay(Duration::from_millis(400))
        } else {
            ResponseTemplate::new(200)
        }
    }
}

#[test_log::test(tokio::test)]
async fn transient_timeout_retries_then_succeeds() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(TimeoutThenOk { calls: AtomicUsize::new(0) })
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySagaStore::new());
    let definition = WorkflowDefinition {
        name: "flaky-workflow".into(),
        version: "1.0.0".into(),
        steps: vec![step("only", format!("{}/flaky", mock_server.uri()), None, OnFailure::Halt, 3, 100)],
    };
    store.put_definition(&definition).await.unwrap();
    let run_id = store.start_run("flaky-workflow", "1.0.0", json!({}), json!({})).await.unwrap();

    let store_dyn: Arc<dyn SagaStore> = store.clone();
    let mut poller = new_poller(store_dyn);
    run_until_terminal(&mut poller, &store, run_id, 10).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let attempts = store.attempts_for(run_id, "only");
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].error_message.is_some());
    assert!(attempts[1].error_message.is_none());
}

#[test_log::test(tokio::test)]
async fn permanent_client_error_halts_without_compensation() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charge"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid card"})))
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySagaStore::new());
    let definition = WorkflowDefinition {
        name: "order-processing".into(),
        version: "1.0.0".into(),
        steps: vec![step("charge-payment", format!("{}/charge", mock_server.uri()), None, OnFailure::Halt, 3, 1000)],
    };
    store.put_definition(&definition).await.unwrap();
    let run_id = store.start_run("order-processing", "1.0.0", json!({}), json!({})).await.unwrap();

    let store_dyn: Arc<dyn SagaStore> = store.clone();
    let mut poller = new_poller(store_dyn);
    run_until_terminal(&mut poller, &store, run_id, 5).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some(sagaflow::model::error_codes::STEP_FAILED));

    let charge_step = store.get_run_step(run_id, "charge-payment").await.unwrap();
    assert_eq!(charge_step.status, RunStepStatus::Failed);
    assert_eq!(charge_step.attempts, 1);
    assert_eq!(charge_step.compensation_status, CompensationStatus::Pending);
}

#[test_log::test(tokio::test)]
async fn expired_lease_is_reclaimed_and_produces_one_successful_attempt() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charge"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySagaStore::new());
    let definition = WorkflowDefinition {
        name: "order-processing".into(),
        version: "1.0.0".into(),
        steps: vec![step("charge-payment", format!("{}/charge", mock_server.uri()), None, OnFailure::Halt, 3, 1000)],
    };
    store.put_definition(&definition).await.unwrap();
    let run_id = store.start_run("order-processing", "1.0.0", json!({}), json!({})).await.unwrap();

    // Simulate a worker that claims the row and then crashes before
    // processing it: claim directly against the store, never invoke the
    // step executor.
    let ghost_lease_ms = 50;
    let claimed = store.claim_outbox("ghost-worker", ghost_lease_ms).await.unwrap();
    assert!(claimed.is_some());

    tokio::time::sleep(Duration::from_millis(ghost_lease_ms as u64 + 30)).await;

    let store_dyn: Arc<dyn SagaStore> = store.clone();
    let (_tx, rx) = watch::channel(false);
    let mut poller = OutboxPoller::new(store_dyn, "reclaimer", 50, ghost_lease_ms, rx);
    run_until_terminal(&mut poller, &store, run_id, 5).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let attempts = store.attempts_for(run_id, "charge-payment");
    assert_eq!(attempts.len(), 1);
}
