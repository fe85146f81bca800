// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{create_context, phone, TestContext};
use chrono::{Duration as ChronoDuration, Utc};
use messenger::config::settings::AutomationSettings;
use messenger::domain::models::batch::{NewBatch, Recipient};
use messenger::domain::models::message::{Message, MessageStatus, SendRequest};
use messenger::domain::repositories::message_repository::MessageRepository;
use messenger::providers::circuit_breaker::Status;
use messenger::providers::mock_provider::MockMode;
use messenger::queue::dispatch_queue::DispatchQueue;
use messenger::workers::automation::{AlertKind, AutomationLoop, RebalanceAction};
use messenger::workers::dispatch_worker::DispatchWorker;

fn automation(ctx: &TestContext, settings: AutomationSettings) -> AutomationLoop {
    AutomationLoop::new(
        ctx.messages.clone(),
        ctx.batches.clone(),
        ctx.messenger.clone(),
        ctx.bulk.clone(),
        ctx.tracker.clone(),
        ctx.queue.clone(),
        settings,
    )
}

fn request(i: usize) -> SendRequest {
    SendRequest {
        to: phone(i),
        message: Some("Reminder: appointment tomorrow".to_string()),
        ..Default::default()
    }
}

/// 到期的定时消息被激活并交给队列，随后由调度工作者发送
#[tokio::test]
async fn test_due_scheduled_message_is_promoted_and_sent() {
    let ctx = create_context().await;
    let mut scheduled = request(1);
    scheduled.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(5));
    let message = Message::new("mocktest", &scheduled, MessageStatus::Scheduled);
    let message = ctx.messages.create(&message).await.unwrap();

    let report = automation(&ctx, ctx.settings.automation.clone())
        .run_once()
        .await;
    assert_eq!(report.promoted_messages, 1);
    assert!(report.errors.is_empty());

    let worker = DispatchWorker::new(0, ctx.queue.clone(), ctx.messenger.clone());
    assert!(worker.process_next().await.unwrap());
    let sent = ctx.messenger.get_message(message.id).await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);

    // nothing left to promote
    let report = automation(&ctx, ctx.settings.automation.clone())
        .run_once()
        .await;
    assert_eq!(report.promoted_messages, 0);
}

/// 传输故障可以自动重试，供应商拒绝不会
#[tokio::test]
async fn test_only_retryable_failures_are_requeued() {
    let ctx = create_context().await;

    ctx.mock.set_mode(MockMode::TransportFault);
    let transient = ctx.messenger.send(request(1)).await.unwrap_err();
    ctx.mock.set_mode(MockMode::Reject);
    let rejected = ctx.messenger.send(request(2)).await.unwrap_err();
    ctx.mock.set_mode(MockMode::Succeed);

    let report = automation(&ctx, ctx.settings.automation.clone())
        .run_once()
        .await;
    assert_eq!(report.requeued_messages, 1);

    let transient = ctx
        .messenger
        .get_message(transient.message_id().unwrap())
        .await
        .unwrap();
    assert_eq!(transient.status, MessageStatus::Queued);
    assert_eq!(transient.retry_count, 1);
    assert!(transient.error_code.is_none());
    assert_eq!(ctx.queue.depth(), 1);

    let rejected = ctx
        .messenger
        .get_message(rejected.message_id().unwrap())
        .await
        .unwrap();
    assert_eq!(rejected.status, MessageStatus::Failed);
    assert_eq!(rejected.retry_count, 0);
}

/// 成功率过低的供应商被自动熔断
#[tokio::test]
async fn test_rebalance_opens_circuit_for_low_success_rate() {
    let ctx = create_context().await;

    ctx.messenger.send(request(1)).await.unwrap();
    ctx.mock.set_mode(MockMode::Reject);
    for i in 2..5 {
        ctx.messenger.send(request(i)).await.unwrap_err();
    }
    assert_eq!(ctx.breaker.state("mocktest").await.status, Status::Closed);

    let settings = AutomationSettings {
        min_sample_size: 4,
        ..ctx.settings.automation.clone()
    };
    let report = automation(&ctx, settings).run_once().await;

    let recommendation = report
        .recommendations
        .iter()
        .find(|r| r.provider == "mocktest")
        .unwrap();
    assert_eq!(recommendation.action, RebalanceAction::OpenCircuit);
    assert!(recommendation.applied);
    assert!((recommendation.success_rate - 0.25).abs() < 1e-9);
    assert_eq!(ctx.breaker.state("mocktest").await.status, Status::Open);

    assert!(report
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::ProviderFailureRate));
    assert!(report
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::GlobalSuccessRate));
}

/// 熔断期间未调用供应商就失败的消息不计入供应商统计
#[tokio::test]
async fn test_fast_failed_messages_do_not_count_against_provider() {
    let ctx = create_context().await;
    for i in 0..4 {
        ctx.messenger.send(request(i)).await.unwrap();
    }
    ctx.breaker.force_open("mocktest").await;

    let recipients: Vec<Recipient> = (10..20).map(|i| Recipient::from(phone(i).as_str())).collect();
    let report = ctx
        .bulk
        .send_bulk_message(
            NewBatch {
                name: "while-open".to_string(),
                content: "Store closes early today".to_string(),
                delay_between_batches: Some(0),
                ..Default::default()
            },
            recipients,
        )
        .await
        .unwrap();
    assert_eq!(report.batch.failed_count, 10);
    assert_eq!(ctx.mock.calls(), 4);

    let stats = ctx
        .messages
        .provider_stats(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].provider, "mocktest");
    assert_eq!(stats[0].total, 4);
    assert_eq!(stats[0].succeeded, 4);
    assert_eq!(stats[0].failed, 0);

    let settings = AutomationSettings {
        min_sample_size: 4,
        ..ctx.settings.automation.clone()
    };
    let report = automation(&ctx, settings).run_once().await;
    assert!(report
        .recommendations
        .iter()
        .all(|r| r.action != RebalanceAction::OpenCircuit));
}

/// 样本不足时不做调整
#[tokio::test]
async fn test_rebalance_ignores_small_samples() {
    let ctx = create_context().await;
    ctx.mock.set_mode(MockMode::Reject);
    ctx.messenger.send(request(1)).await.unwrap_err();

    let report = automation(&ctx, ctx.settings.automation.clone())
        .run_once()
        .await;
    assert!(report.recommendations.is_empty());
    assert_eq!(ctx.breaker.state("mocktest").await.status, Status::Closed);
}

/// 队列积压超过阈值时告警
#[tokio::test]
async fn test_backlog_alert() {
    let ctx = create_context().await;
    for i in 0..3 {
        ctx.messenger
            .queue(request(i), Some(std::time::Duration::from_secs(3600)))
            .await
            .unwrap();
    }

    let settings = AutomationSettings {
        backlog_alert_threshold: 2,
        ..ctx.settings.automation.clone()
    };
    let report = automation(&ctx, settings).run_once().await;
    assert!(report
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::QueueBacklog));
}
