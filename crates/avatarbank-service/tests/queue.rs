//! Queued generation tests: tasks, worker callbacks, retries and recovery.

mod common;

use axum::http::StatusCode;
use common::{eventually, Behavior, TestHarness, Workers};
use serde_json::{json, Value};

use avatarbank_core::{GenerationId, GenerationStatus, TaskStatus, TransactionType};
use avatarbank_service::GenerationMode;
use avatarbank_store::Store;

/// Submit one queued generation, returning (generation id, task id).
async fn submit_queued(harness: &TestHarness) -> (String, String) {
    let response = harness.submit(json!({ "prompt": "queued portrait" })).await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["status"], "pending");
    (
        body["id"].as_str().unwrap().to_string(),
        body["task_id"].as_str().unwrap().to_string(),
    )
}

async fn generation(harness: &TestHarness, id: &str) -> Value {
    harness
        .server
        .get(&format!("/v1/generations/{id}"))
        .add_header("authorization", harness.user_auth_header())
        .await
        .json()
}

async fn refunds(harness: &TestHarness) -> usize {
    harness
        .store
        .ledger_for_user(&harness.test_user_id)
        .await
        .unwrap()
        .iter()
        .filter(|tx| tx.transaction_type == TransactionType::Refund)
        .count()
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn queued_submission_charges_and_creates_one_task() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;

    let (generation_id, task_id) = submit_queued(&harness).await;

    assert_eq!(harness.balance().await, 2);
    let dispatched = harness.dispatched.messages.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].task_id.to_string(), task_id);
    assert_eq!(dispatched[0].generation_id.to_string(), generation_id);

    let tasks: Value = harness
        .server
        .get(&format!("/v1/generations/{generation_id}/tasks"))
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    let tasks = tasks["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["status"], "queued");
    assert_eq!(tasks[0]["retry_count"], 0);
    assert_eq!(tasks[0]["task_type"], "image_generation");
}

// ============================================================================
// Worker callbacks
// ============================================================================

#[tokio::test]
async fn worker_drives_task_to_success() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;
    let (generation_id, task_id) = submit_queued(&harness).await;

    let started = harness
        .worker_call(
            &format!("/v1/worker/tasks/{task_id}/start"),
            json!({ "worker_id": "gpu-7" }),
        )
        .await;
    started.assert_status_ok();
    let started: Value = started.json();
    assert_eq!(started["generation"]["status"], "processing");
    assert_eq!(started["task"]["status"], "running");
    assert_eq!(started["task"]["worker_id"], "gpu-7");

    let completed = harness
        .worker_call(
            &format!("/v1/worker/tasks/{task_id}/complete"),
            json!({ "image_url": "https://cdn.test/out.png", "seed": "42", "nsfw_flag": true }),
        )
        .await;
    completed.assert_status_ok();
    let completed: Value = completed.json();
    assert_eq!(completed["generation"]["status"], "success");
    assert_eq!(completed["task"]["status"], "success");

    let body = generation(&harness, &generation_id).await;
    assert_eq!(body["image_url"], "https://cdn.test/out.png");
    assert_eq!(body["seed"], "42");
    assert_eq!(body["nsfw_flag"], true);
    assert_eq!(harness.balance().await, 2);
}

#[tokio::test]
async fn worker_failure_refunds_once_even_when_repeated() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;
    let (generation_id, task_id) = submit_queued(&harness).await;

    harness
        .worker_call(&format!("/v1/worker/tasks/{task_id}/start"), json!({}))
        .await
        .assert_status_ok();

    for _ in 0..3 {
        let response = harness
            .worker_call(
                &format!("/v1/worker/tasks/{task_id}/fail"),
                json!({ "error": "CUDA out of memory" }),
            )
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["generation"]["status"], "failed");
        assert_eq!(body["retried"], false);
    }

    // A late success report does not resurrect the generation
    let late = harness
        .worker_call(
            &format!("/v1/worker/tasks/{task_id}/complete"),
            json!({ "image_url": "https://cdn.test/late.png" }),
        )
        .await;
    late.assert_status_ok();
    let late: Value = late.json();
    assert_eq!(late["generation"]["status"], "failed");

    assert_eq!(refunds(&harness).await, 1);
    assert_eq!(harness.balance().await, 3);
    let body = generation(&harness, &generation_id).await;
    assert!(body["fail_reason"]
        .as_str()
        .unwrap()
        .contains("CUDA out of memory"));
}

#[tokio::test]
async fn complete_without_start_still_settles() {
    let harness = TestHarness::queued();
    harness.funded_user(1).await;
    let (generation_id, task_id) = submit_queued(&harness).await;

    harness
        .worker_call(
            &format!("/v1/worker/tasks/{task_id}/complete"),
            json!({ "image_url": "https://cdn.test/direct.png" }),
        )
        .await
        .assert_status_ok();

    assert_eq!(generation(&harness, &generation_id).await["status"], "success");
    assert_eq!(harness.balance().await, 0);
}

#[tokio::test]
async fn failed_task_is_retried_without_new_charge() {
    let harness = TestHarness::build(GenerationMode::Async, Workers::External, |config| {
        config.max_task_retries = 1;
    });
    harness.funded_user(3).await;
    let (generation_id, first_task) = submit_queued(&harness).await;

    harness
        .worker_call(&format!("/v1/worker/tasks/{first_task}/start"), json!({}))
        .await
        .assert_status_ok();
    let retry: Value = harness
        .worker_call(
            &format!("/v1/worker/tasks/{first_task}/fail"),
            json!({ "error": "node lost" }),
        )
        .await
        .json();

    assert_eq!(retry["retried"], true);
    assert_eq!(retry["generation"]["status"], "pending");
    assert_eq!(retry["task"]["retry_count"], 1);
    let second_task = retry["task"]["id"].as_str().unwrap().to_string();
    assert_ne!(second_task, first_task);
    assert_eq!(harness.balance().await, 2);
    assert_eq!(refunds(&harness).await, 0);

    // Retries exhausted: the second failure refunds
    harness
        .worker_call(&format!("/v1/worker/tasks/{second_task}/start"), json!({}))
        .await
        .assert_status_ok();
    let settled: Value = harness
        .worker_call(
            &format!("/v1/worker/tasks/{second_task}/fail"),
            json!({ "error": "node lost again" }),
        )
        .await
        .json();
    assert_eq!(settled["retried"], false);
    assert_eq!(settled["generation"]["status"], "failed");
    assert_eq!(harness.balance().await, 3);
    assert_eq!(refunds(&harness).await, 1);

    let tasks = harness
        .store
        .list_tasks_by_generation(&generation_id.parse::<GenerationId>().unwrap())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|task| task.status == TaskStatus::Failed));
}

#[tokio::test]
async fn repeated_failure_report_queues_only_one_retry() {
    let harness = TestHarness::build(GenerationMode::Async, Workers::External, |config| {
        config.max_task_retries = 3;
    });
    harness.funded_user(3).await;
    let (generation_id, first_task) = submit_queued(&harness).await;

    harness
        .worker_call(&format!("/v1/worker/tasks/{first_task}/start"), json!({}))
        .await
        .assert_status_ok();
    for _ in 0..2 {
        harness
            .worker_call(
                &format!("/v1/worker/tasks/{first_task}/fail"),
                json!({ "error": "node lost" }),
            )
            .await
            .assert_status_ok();
    }

    let repeat: Value = harness
        .worker_call(
            &format!("/v1/worker/tasks/{first_task}/fail"),
            json!({ "error": "node lost" }),
        )
        .await
        .json();
    assert_eq!(repeat["retried"], false);
    assert_eq!(repeat["generation"]["status"], "pending");

    let tasks = harness
        .store
        .list_tasks_by_generation(&generation_id.parse::<GenerationId>().unwrap())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(
        tasks.iter().filter(|task| task.status == TaskStatus::Queued).count(),
        1
    );
    assert_eq!(harness.dispatched.messages.lock().unwrap().len(), 2);
    assert_eq!(harness.balance().await, 2);
}

#[tokio::test]
async fn late_failure_report_leaves_running_retry_alone() {
    let harness = TestHarness::build(GenerationMode::Async, Workers::External, |config| {
        config.max_task_retries = 3;
    });
    harness.funded_user(3).await;
    let (generation_id, first_task) = submit_queued(&harness).await;

    harness
        .worker_call(&format!("/v1/worker/tasks/{first_task}/start"), json!({}))
        .await
        .assert_status_ok();
    let retry: Value = harness
        .worker_call(
            &format!("/v1/worker/tasks/{first_task}/fail"),
            json!({ "error": "node lost" }),
        )
        .await
        .json();
    let second_task = retry["task"]["id"].as_str().unwrap().to_string();
    harness
        .worker_call(&format!("/v1/worker/tasks/{second_task}/start"), json!({}))
        .await
        .assert_status_ok();

    let late: Value = harness
        .worker_call(
            &format!("/v1/worker/tasks/{first_task}/fail"),
            json!({ "error": "stale heartbeat" }),
        )
        .await
        .json();
    assert_eq!(late["retried"], false);
    assert_eq!(late["generation"]["status"], "processing");

    // A late success from the dead task cannot settle it either
    harness
        .worker_call(
            &format!("/v1/worker/tasks/{first_task}/complete"),
            json!({ "image_url": "https://cdn.test/stale.png" }),
        )
        .await
        .assert_status(StatusCode::CONFLICT);

    let tasks = harness
        .store
        .list_tasks_by_generation(&generation_id.parse::<GenerationId>().unwrap())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(generation(&harness, &generation_id).await["status"], "processing");

    harness
        .worker_call(
            &format!("/v1/worker/tasks/{second_task}/complete"),
            json!({ "image_url": "https://cdn.test/retry.png" }),
        )
        .await
        .assert_status_ok();
    let body = generation(&harness, &generation_id).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["image_url"], "https://cdn.test/retry.png");
    assert_eq!(refunds(&harness).await, 0);
    assert_eq!(harness.balance().await, 2);
}

#[tokio::test]
async fn unsigned_or_badly_signed_callbacks_are_rejected() {
    let harness = TestHarness::queued();
    harness.funded_user(1).await;
    let (_, task_id) = submit_queued(&harness).await;
    let path = format!("/v1/worker/tasks/{task_id}/start");

    harness
        .server
        .post(&path)
        .json(&json!({ "worker_id": "intruder" }))
        .await
        .assert_status_unauthorized();

    let body = json!({ "worker_id": "intruder" }).to_string();
    let tampered = TestHarness::sign(&json!({ "worker_id": "someone-else" }).to_string());
    harness
        .server
        .post(&path)
        .add_header("x-worker-signature", tampered)
        .bytes(body.into_bytes().into())
        .await
        .assert_status_unauthorized();

    let task = harness
        .store
        .get_task(&task_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
}

#[tokio::test]
async fn sha256_prefixed_signature_is_accepted() {
    let harness = TestHarness::queued();
    harness.funded_user(1).await;
    let (_, task_id) = submit_queued(&harness).await;

    let body = json!({ "worker_id": "prefixed" }).to_string();
    harness
        .server
        .post(&format!("/v1/worker/tasks/{task_id}/start"))
        .add_header("x-worker-signature", format!("sha256={}", TestHarness::sign(&body)))
        .bytes(body.into_bytes().into())
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn callbacks_are_disabled_without_a_secret() {
    let harness = TestHarness::build(GenerationMode::Async, Workers::External, |config| {
        config.worker_hmac_secret = None;
    });
    harness.funded_user(1).await;
    let (_, task_id) = submit_queued(&harness).await;

    harness
        .worker_call(&format!("/v1/worker/tasks/{task_id}/start"), json!({}))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let harness = TestHarness::queued();

    harness
        .worker_call(
            &format!("/v1/worker/tasks/{}/start", avatarbank_core::TaskId::generate()),
            json!({}),
        )
        .await
        .assert_status_not_found();
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn buyer_cancels_pending_generation() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;
    let (generation_id, task_id) = submit_queued(&harness).await;

    let response = harness
        .server
        .post(&format!("/v1/generations/{generation_id}/cancel"))
        .add_header("authorization", harness.user_auth_header())
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "canceled");
    assert_eq!(harness.balance().await, 3);

    // Second cancel conflicts and does not refund again
    harness
        .server
        .post(&format!("/v1/generations/{generation_id}/cancel"))
        .add_header("authorization", harness.user_auth_header())
        .await
        .assert_status(StatusCode::CONFLICT);
    assert_eq!(refunds(&harness).await, 1);

    // The worker finds the task closed
    harness
        .worker_call(&format!("/v1/worker/tasks/{task_id}/start"), json!({}))
        .await
        .assert_status(StatusCode::CONFLICT);
    let task = harness
        .store
        .get_task(&task_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn buyer_cannot_cancel_someone_elses_generation() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;
    let (generation_id, _) = submit_queued(&harness).await;

    harness
        .server
        .post(&format!("/v1/generations/{generation_id}/cancel"))
        .add_header("authorization", TestHarness::other_user_auth_header())
        .await
        .assert_status_not_found();
    assert_eq!(harness.balance().await, 2);
}

#[tokio::test]
async fn buyer_cannot_cancel_processing_but_admin_can() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;
    let (generation_id, task_id) = submit_queued(&harness).await;
    harness
        .worker_call(&format!("/v1/worker/tasks/{task_id}/start"), json!({}))
        .await
        .assert_status_ok();

    harness
        .server
        .post(&format!("/v1/generations/{generation_id}/cancel"))
        .add_header("authorization", harness.user_auth_header())
        .await
        .assert_status(StatusCode::CONFLICT);

    let body: Value = harness
        .server
        .post(&format!("/v1/admin/generations/{generation_id}/cancel"))
        .add_header("authorization", harness.admin_auth_header())
        .await
        .json();
    assert_eq!(body["status"], "canceled");
    assert_eq!(harness.balance().await, 3);

    // The running worker's late result is ignored
    let late: Value = harness
        .worker_call(
            &format!("/v1/worker/tasks/{task_id}/complete"),
            json!({ "image_url": "https://cdn.test/late.png" }),
        )
        .await
        .json();
    assert_eq!(late["generation"]["status"], "canceled");
    assert_eq!(refunds(&harness).await, 1);
}

// ============================================================================
// Stale sweep
// ============================================================================

#[tokio::test]
async fn sweep_refunds_stale_generations_once() {
    let harness = TestHarness::build(GenerationMode::Async, Workers::External, |config| {
        config.stale_after_seconds = 0;
    });
    harness.funded_user(3).await;
    let (generation_id, task_id) = submit_queued(&harness).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let report: Value = harness
        .server
        .post("/v1/admin/sweep")
        .add_header("authorization", harness.admin_auth_header())
        .await
        .json();
    assert_eq!(report["refunded"].as_array().unwrap().len(), 1);
    assert_eq!(report["refunded"][0], generation_id);

    let body = generation(&harness, &generation_id).await;
    assert_eq!(body["status"], "failed");
    assert!(body["fail_reason"].as_str().unwrap().contains("timed out"));
    assert_eq!(harness.balance().await, 3);

    let again: Value = harness
        .server
        .post("/v1/admin/sweep")
        .add_header("authorization", harness.admin_auth_header())
        .await
        .json();
    assert_eq!(again["refunded"].as_array().unwrap().len(), 0);
    assert_eq!(refunds(&harness).await, 1);

    let task = harness
        .store
        .get_task(&task_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn sweep_leaves_fresh_generations_alone() {
    let harness = TestHarness::queued();
    harness.funded_user(3).await;
    submit_queued(&harness).await;

    let report: Value = harness
        .server
        .post("/v1/admin/sweep")
        .add_header("authorization", harness.admin_auth_header())
        .await
        .json();
    assert_eq!(report["examined"], 0);
    assert_eq!(harness.balance().await, 2);
}

// ============================================================================
// In-process workers
// ============================================================================

#[tokio::test]
async fn local_worker_completes_through_provider_queue() {
    let harness = TestHarness::with_local_workers();
    harness.funded_user(3).await;
    let (generation_id, _) = submit_queued(&harness).await;
    let id: GenerationId = generation_id.parse().unwrap();

    let store = harness.store.clone();
    let settled = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get_generation(&id)
                .await
                .unwrap()
                .is_some_and(|g| g.status == GenerationStatus::Success)
        }
    })
    .await;
    assert!(settled, "generation should succeed");

    let stored = harness.store.get_generation(&id).await.unwrap().unwrap();
    assert!(stored.request_id.as_deref().unwrap().starts_with("req-"));
    assert!(stored.image_url.unwrap().contains("/queue/"));
    assert_eq!(harness.balance().await, 2);
}

#[tokio::test]
async fn local_worker_failure_refunds() {
    let harness = TestHarness::with_local_workers();
    harness.funded_user(3).await;
    harness.provider.set(Behavior::Fail("queue rejected".into()));
    let (generation_id, _) = submit_queued(&harness).await;
    let id: GenerationId = generation_id.parse().unwrap();

    let store = harness.store.clone();
    let settled = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get_generation(&id)
                .await
                .unwrap()
                .is_some_and(|g| g.status == GenerationStatus::Failed)
        }
    })
    .await;
    assert!(settled, "generation should fail");
    assert_eq!(harness.balance().await, 3);
    assert_eq!(refunds(&harness).await, 1);
}
