// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{create_context, drain_events, phone};
use messenger::domain::models::events::MessageEvent;
use messenger::domain::models::message::{MessageStatus, SendRequest};
use messenger::domain::repositories::message_repository::MessageRepository;
use messenger::domain::services::messenger_service::MessengerError;
use messenger::providers::circuit_breaker::Status;
use messenger::providers::mock_provider::MockMode;
use messenger::queue::dispatch_queue::DispatchQueue;
use messenger::workers::dispatch_worker::DispatchWorker;
use std::time::Duration;

fn request(to: String) -> SendRequest {
    SendRequest {
        to,
        message: Some("Your code is 1234".to_string()),
        ..Default::default()
    }
}

/// 三条发送全部成功，熔断器保持可用
#[tokio::test]
async fn test_successful_sends_record_provider_ids() {
    let ctx = create_context().await;
    let mut events = ctx.subscribe();

    for i in 0..3 {
        let outcome = ctx.messenger.send(request(phone(i))).await.unwrap();
        assert_eq!(outcome.message.status, MessageStatus::Sent);
        assert!(outcome
            .message
            .provider_message_id
            .as_deref()
            .unwrap()
            .starts_with("mock_"));
        assert_eq!(outcome.message.cost, Some(0.10));
        assert!(ctx.breaker.is_available("mocktest").await);
    }

    let stored = ctx
        .messages
        .count_by_status(MessageStatus::Sent)
        .await
        .unwrap();
    assert_eq!(stored, 3);

    let sent_events = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, MessageEvent::MessageSent { .. }))
        .count();
    assert_eq!(sent_events, 3);
}

/// 连续五次传输错误后熔断器打开，第六次快速失败且不调用供应商
#[tokio::test]
async fn test_transport_faults_open_circuit_and_fail_fast() {
    let ctx = create_context().await;
    ctx.mock.set_mode(MockMode::TransportFault);

    for i in 0..5 {
        let err = ctx.messenger.send(request(phone(i))).await.unwrap_err();
        assert_eq!(err.code(), "PROVIDER_ERROR");
        let id = err.message_id().unwrap();
        let message = ctx.messenger.get_message(id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.error_code.as_deref(), Some("TRANSPORT_ERROR"));
    }

    assert!(!ctx.breaker.is_available("mocktest").await);
    assert_eq!(ctx.breaker.state("mocktest").await.status, Status::Open);
    let calls = ctx.mock.calls();

    let err = ctx.messenger.send(request(phone(6))).await.unwrap_err();
    assert!(matches!(err, MessengerError::ProviderUnavailable(_)));
    assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");
    assert_eq!(ctx.mock.calls(), calls);
}

/// 供应商拒绝不是异常：消息失败并返回结果
#[tokio::test]
async fn test_vendor_rejection_marks_message_failed() {
    let ctx = create_context().await;
    ctx.mock.set_mode(MockMode::Reject);

    let err = ctx.messenger.send(request(phone(1))).await.unwrap_err();
    let MessengerError::SendFailed { message_id, result } = &err else {
        panic!("expected SendFailed, got {:?}", err);
    };
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("MOCK_REJECTED"));

    let message = ctx.messenger.get_message(*message_id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.error_code.as_deref(), Some("MOCK_REJECTED"));
}

/// 只有被接受的重试才会增加 retry_count
#[tokio::test]
async fn test_retry_count_is_monotonic() {
    let ctx = create_context().await;
    ctx.mock.set_mode(MockMode::Reject);

    let err = ctx.messenger.send(request(phone(1))).await.unwrap_err();
    let id = err.message_id().unwrap();

    // rejected again: still counts as an accepted retry
    let _ = ctx.messenger.retry(id).await;
    assert_eq!(ctx.messenger.get_message(id).await.unwrap().retry_count, 1);

    ctx.mock.set_mode(MockMode::Succeed);
    let outcome = ctx.messenger.retry(id).await.unwrap();
    assert_eq!(outcome.message.status, MessageStatus::Sent);
    assert_eq!(outcome.message.retry_count, 2);

    // retrying a sent message is rejected and does not increment
    let err = ctx.messenger.retry(id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
    assert_eq!(ctx.messenger.get_message(id).await.unwrap().retry_count, 2);
}

/// 只能取消排队或定时的消息
#[tokio::test]
async fn test_cancel_rules() {
    let ctx = create_context().await;

    let queued = ctx
        .messenger
        .queue(request(phone(1)), Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert_eq!(queued.status, MessageStatus::Queued);
    let cancelled = ctx.messenger.cancel(queued.id).await.unwrap();
    assert_eq!(cancelled.status, MessageStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let sent = ctx.messenger.send(request(phone(2))).await.unwrap();
    let err = ctx.messenger.cancel(sent.message.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

/// 定时时间必须在未来
#[tokio::test]
async fn test_schedule_rejects_past_time() {
    let ctx = create_context().await;
    let err = ctx
        .messenger
        .schedule(
            request(phone(1)),
            chrono::Utc::now() - chrono::Duration::minutes(1),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

/// 调度工作者发送排队消息，并跳过已取消的消息
#[tokio::test]
async fn test_dispatch_worker_sends_queued_and_skips_cancelled() {
    let ctx = create_context().await;
    let worker = DispatchWorker::new(0, ctx.queue.clone(), ctx.messenger.clone());

    let keep = ctx.messenger.queue(request(phone(1)), None).await.unwrap();
    let drop = ctx.messenger.queue(request(phone(2)), None).await.unwrap();
    ctx.messenger.cancel(drop.id).await.unwrap();
    assert_eq!(ctx.queue.depth(), 2);

    assert!(worker.process_next().await.unwrap());
    assert!(worker.process_next().await.unwrap());
    assert!(!worker.process_next().await.unwrap());

    let keep = ctx.messenger.get_message(keep.id).await.unwrap();
    assert_eq!(keep.status, MessageStatus::Sent);
    let drop = ctx.messenger.get_message(drop.id).await.unwrap();
    assert_eq!(drop.status, MessageStatus::Cancelled);
    assert_eq!(ctx.mock.calls(), 1);
}

/// 不支持的渠道和未配置的供应商在发送前被拒绝
#[tokio::test]
async fn test_configuration_errors_before_network() {
    let ctx = create_context().await;

    let mut unknown = request(phone(1));
    unknown.provider = Some("nope".to_string());
    let err = ctx.messenger.send(unknown).await.unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION_ERROR");
    assert!(err.message_id().is_none());

    let invalid = request("12".to_string());
    let err = ctx.messenger.send(invalid).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(ctx.mock.calls(), 0);

}
