//! Account management integration tests.

mod common;

use axum::http::StatusCode;
use common::TestHarness;
use serde_json::json;

// ============================================================================
// Create Account
// ============================================================================

#[tokio::test]
async fn create_account_success() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "email": "buyer@example.com", "nickname": "buyer" }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["id"], harness.test_user_id.to_string());
    assert_eq!(body["credit_balance"], 0);
    assert_eq!(body["role"], "buyer");
    assert_eq!(body["status"], "active");
    assert_eq!(body["locale"], "en");
}

#[tokio::test]
async fn create_account_takes_email_from_token() {
    let harness = TestHarness::new();
    let header = format!("Bearer test-token:{}:fromtoken@example.com", harness.test_user_id);

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("authorization", header)
        .json(&json!({ "nickname": "tokened", "locale": "ko" }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["email"], "fromtoken@example.com");
    assert_eq!(body["locale"], "ko");
}

#[tokio::test]
async fn create_account_twice_conflicts() {
    let harness = TestHarness::new();
    harness.register().await;

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "email": "again@example.com", "nickname": "again" }))
        .await;

    response.assert_status(StatusCode::CONFLICT);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn create_account_validates_input() {
    let harness = TestHarness::new();

    for body in [
        json!({ "nickname": "no-email" }),
        json!({ "email": "not-an-email", "nickname": "x" }),
        json!({ "email": "a@example.com", "nickname": "   " }),
        json!({ "email": "a@example.com", "nickname": "x".repeat(51) }),
        json!({ "email": "a@example.com", "nickname": "x", "locale": "fr" }),
    ] {
        harness
            .server
            .post("/v1/accounts")
            .add_header("authorization", harness.user_auth_header())
            .json(&body)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn create_account_without_auth_fails() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/accounts")
        .json(&json!({ "email": "a@example.com", "nickname": "a" }))
        .await;

    response.assert_status_unauthorized();
}

// ============================================================================
// Get Account
// ============================================================================

#[tokio::test]
async fn get_account_success() {
    let harness = TestHarness::new();
    harness.register().await;

    let response = harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", harness.user_auth_header())
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["id"], harness.test_user_id.to_string());
    assert_eq!(body["nickname"], "tester");
}

#[tokio::test]
async fn get_nonexistent_account_fails() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", harness.user_auth_header())
        .await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn get_account_without_auth_fails() {
    let harness = TestHarness::new();

    let response = harness.server.get("/v1/accounts/me").await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn malformed_test_token_is_rejected() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", "Bearer test-token:not-a-uuid")
        .await
        .assert_status_unauthorized();

    harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", "Basic abc")
        .await
        .assert_status_unauthorized();
}
