// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{
    create_context, create_context_with, drain_events, phone, test_settings, MOCK_WEBHOOK_SECRET,
    PUBLIC_URL, TWILIO_AUTH_TOKEN,
};
use chrono::{Duration as ChronoDuration, Utc};
use messenger::domain::models::events::MessageEvent;
use messenger::domain::models::message::{MessageStatus, SendRequest};
use messenger::domain::repositories::webhook_record_repository::WebhookRecordRepository;
use messenger::providers::mock_provider::MockProvider;
use messenger::providers::traits::InboundWebhook;
use messenger::providers::twilio::compute_signature;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn twilio_webhook(sid: &str, status: &str) -> InboundWebhook {
    let url = format!("{}/v1/webhooks/twilio", PUBLIC_URL);
    let params = BTreeMap::from([
        ("MessageSid".to_string(), sid.to_string()),
        ("MessageStatus".to_string(), status.to_string()),
    ]);
    let signature = compute_signature(TWILIO_AUTH_TOKEN, &url, &params);

    InboundWebhook {
        payload: serde_json::to_value(&params).unwrap(),
        raw_body: None,
        headers: HashMap::from([("x-twilio-signature".to_string(), signature)]),
        url: Some(url),
    }
}

fn mock_webhook(body: serde_json::Value) -> InboundWebhook {
    let raw = body.to_string();
    let signature = MockProvider::sign(MOCK_WEBHOOK_SECRET, &raw);
    InboundWebhook {
        payload: body,
        raw_body: Some(raw),
        headers: HashMap::from([("x-mock-signature".to_string(), signature)]),
        url: None,
    }
}

/// Twilio 发送后收到签名正确的送达回调；重放不会产生新事件
#[tokio::test]
async fn test_twilio_delivery_receipt_is_applied_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sid": "SM0001",
            "status": "queued",
            "price": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = create_context_with(test_settings(&server.uri())).await;
    let outcome = ctx
        .messenger
        .send(SendRequest {
            to: phone(1),
            message: Some("Your order shipped".to_string()),
            provider: Some("twilio".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.message.status, MessageStatus::Sent);
    assert_eq!(outcome.message.provider_message_id.as_deref(), Some("SM0001"));

    let mut events = ctx.subscribe();
    let processed = ctx
        .tracker
        .process_webhook("twilio", twilio_webhook("SM0001", "delivered"))
        .await
        .unwrap();
    assert!(processed);

    let message = ctx.messenger.get_message(outcome.message.id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Delivered);
    assert!(message.delivered_at.is_some());

    let delivered = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, MessageEvent::MessageDelivered { .. }))
        .count();
    assert_eq!(delivered, 1);

    // replay
    let processed = ctx
        .tracker
        .process_webhook("twilio", twilio_webhook("SM0001", "delivered"))
        .await
        .unwrap();
    assert!(processed);
    assert!(drain_events(&mut events).is_empty());
    let replayed = ctx.messenger.get_message(message.id).await.unwrap();
    assert_eq!(replayed.delivered_at, message.delivered_at);
    assert_eq!(replayed.version, message.version);
}

/// 找不到消息的回调被保存并安排重试
#[tokio::test]
async fn test_unknown_provider_message_is_scheduled_for_retry() {
    let ctx = create_context().await;

    let processed = ctx
        .tracker
        .process_webhook(
            "mocktest",
            mock_webhook(json!({ "message_id": "mock_missing", "status": "delivered" })),
        )
        .await
        .unwrap();
    assert!(!processed);

    let later = Utc::now() + ChronoDuration::hours(3);
    let due = ctx.records.find_due(later, 5, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    let record = &due[0];
    assert!(record.is_verified);
    assert!(!record.processed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.provider_message_id.as_deref(), Some("mock_missing"));
    assert_eq!(record.failure_reason.as_deref(), Some("message not found"));

    // not due yet
    assert_eq!(ctx.tracker.retry_pending_webhooks(10).await.unwrap(), 0);
}

/// 签名错误的回调被保存但不应用
#[tokio::test]
async fn test_bad_signature_is_stored_not_applied() {
    let ctx = create_context().await;
    let outcome = ctx
        .messenger
        .send(SendRequest {
            to: phone(1),
            message: Some("hello".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let pmid = outcome.message.provider_message_id.clone().unwrap();

    let mut webhook = mock_webhook(json!({ "message_id": pmid, "status": "delivered" }));
    webhook
        .headers
        .insert("x-mock-signature".to_string(), "00ff".to_string());

    let processed = ctx.tracker.process_webhook("mocktest", webhook).await.unwrap();
    assert!(!processed);

    let message = ctx.messenger.get_message(outcome.message.id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert!(message.delivered_at.is_none());
}

/// 模拟供应商的已读回执和退回
#[tokio::test]
async fn test_mock_read_receipt_and_bounce() {
    let ctx = create_context().await;
    let mut sent = Vec::new();
    for i in 1..=2 {
        let outcome = ctx
            .messenger
            .send(SendRequest {
                to: phone(i),
                message: Some("hello".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        sent.push(outcome.message);
    }
    let (read_target, bounce_target) = (sent[0].clone(), sent[1].clone());
    let mut events = ctx.subscribe();

    let processed = ctx
        .tracker
        .process_webhook(
            "mocktest",
            mock_webhook(json!({
                "message_id": read_target.provider_message_id,
                "status": "read",
                "timestamp": "2025-01-01T10:00:00Z"
            })),
        )
        .await
        .unwrap();
    assert!(processed);
    let read = ctx.messenger.get_message(read_target.id).await.unwrap();
    assert_eq!(read.status, MessageStatus::Delivered);
    assert!(read.read_at.is_some());
    assert!(read.delivered_at.is_some());

    let processed = ctx
        .tracker
        .process_webhook(
            "mocktest",
            mock_webhook(json!({
                "message_id": bounce_target.provider_message_id,
                "status": "bounced",
                "error_code": "30005",
                "error_message": "Unknown destination handset"
            })),
        )
        .await
        .unwrap();
    assert!(processed);
    let bounced = ctx.messenger.get_message(bounce_target.id).await.unwrap();
    assert_eq!(bounced.status, MessageStatus::Bounced);
    assert_eq!(bounced.error_code.as_deref(), Some("30005"));
    assert!(bounced.failed_at.is_some());

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, MessageEvent::MessageDelivered { message_id, .. } if *message_id == read_target.id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, MessageEvent::MessageBounced { message_id, .. } if *message_id == bounce_target.id)));

    // a late "sent" after the bounce never moves the message backwards
    let processed = ctx
        .tracker
        .process_webhook(
            "mocktest",
            mock_webhook(json!({
                "message_id": bounce_target.provider_message_id,
                "status": "sent"
            })),
        )
        .await
        .unwrap();
    assert!(processed);
    let still = ctx.messenger.get_message(bounce_target.id).await.unwrap();
    assert_eq!(still.status, MessageStatus::Bounced);
}
