// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{create_context, phone, MOCK_WEBHOOK_SECRET};
use axum::http::StatusCode;
use messenger::domain::models::message::MessageStatus;
use messenger::providers::mock_provider::{MockMode, MockProvider};
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn test_health_lists_providers() {
    let ctx = create_context().await;
    let server = ctx.server();

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    let providers = body["providers"].as_array().unwrap();
    assert!(providers.iter().any(|p| p["name"] == "mocktest"));
}

#[tokio::test]
async fn test_send_then_receive_signed_webhook() {
    let ctx = create_context().await;
    let server = ctx.server();

    let response = server
        .post("/v1/messages")
        .json(&json!({ "to": phone(1), "message": "Your code is 9921" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["message"]["status"], "sent");
    let id: Uuid = body["message"]["id"].as_str().unwrap().parse().unwrap();
    let pmid = body["message"]["providerMessageId"]
        .as_str()
        .unwrap()
        .to_string();

    let raw = json!({ "message_id": pmid, "status": "delivered" }).to_string();
    let signature = MockProvider::sign(MOCK_WEBHOOK_SECRET, &raw);
    let response = server
        .post("/v1/webhooks/mocktest")
        .add_header("x-mock-signature", signature.as_str())
        .text(raw)
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["received"], true);
    assert_eq!(body["processed"], true);

    let response = server.get(&format!("/v1/messages/{}", id)).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], MessageStatus::Delivered.to_string());
    assert!(!body["deliveredAt"].is_null());
}

#[tokio::test]
async fn test_unsigned_webhook_is_acknowledged_but_not_applied() {
    let ctx = create_context().await;
    let server = ctx.server();

    let response = server
        .post("/v1/webhooks/mocktest")
        .json(&json!({ "message_id": "mock_1", "status": "delivered" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["processed"], false);
}

#[tokio::test]
async fn test_error_codes_map_to_statuses() {
    let ctx = create_context().await;
    let server = ctx.server();

    let response = server
        .post("/v1/messages")
        .json(&json!({ "to": "12", "message": "hi" }))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let response = server.get(&format!("/v1/messages/{}", Uuid::new_v4())).await;
    response.assert_status_not_found();
    let body: Value = response.json();
    assert_eq!(body["code"], "NOT_FOUND");

    ctx.mock.set_mode(MockMode::Reject);
    let response = server
        .post("/v1/messages")
        .json(&json!({ "to": phone(2), "message": "hi" }))
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["code"], "SEND_FAILED");
    assert!(body["messageId"].is_string());

    // a rejected message is failed, so cancelling it is a state conflict
    let id = body["messageId"].as_str().unwrap();
    let response = server.post(&format!("/v1/messages/{}/cancel", id)).await;
    response.assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_queue_and_cancel_over_http() {
    let ctx = create_context().await;
    let server = ctx.server();

    let response = server
        .post("/v1/messages/queue")
        .json(&json!({ "to": phone(3), "message": "later", "delaySecs": 600 }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["message"]["status"], "queued");
    let id = body["message"]["id"].as_str().unwrap().to_string();

    let response = server.post(&format!("/v1/messages/{}/cancel", id)).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn test_batch_endpoints() {
    let ctx = create_context().await;
    let server = ctx.server();

    let response = server
        .post("/v1/batches/estimate")
        .json(&json!({ "provider": "twilio", "content": "hello", "recipients": 100 }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["total_segments"], 100);

    let scheduled_at = (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
    let response = server
        .post("/v1/batches")
        .json(&json!({
            "name": "newsletter",
            "content": "Hello {{name}}",
            "recipients": [{ "to": phone(1) }, { "to": phone(2), "variables": { "name": "Ada" } }],
            "scheduledAt": scheduled_at
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["status"], "scheduled");
    let id = body["id"].as_str().unwrap().to_string();

    let response = server.post(&format!("/v1/batches/{}/cancel", id)).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "cancelled");

    let response = server.get(&format!("/v1/batches/{}", id)).await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "cancelled");
}
