// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{create_context, phone};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messenger::domain::models::batch::{Batch, BatchStatus, NewBatch, Recipient};
use messenger::domain::models::message::{Channel, MessageStatus};
use messenger::domain::repositories::batch_repository::BatchRepository;
use messenger::domain::repositories::message_repository::{MessageRepository, RepositoryError};
use messenger::domain::services::bulk_message_service::{
    BulkDefaults, BulkMessageService, RecipientStatus,
};
use messenger::infrastructure::repositories::batch_repo_impl::BatchRepositoryImpl;
use messenger::providers::mock_provider::MockMode;
use sea_orm::DbErr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn recipients(count: usize) -> Vec<Recipient> {
    (0..count).map(|i| Recipient::from(phone(i).as_str())).collect()
}

fn campaign(chunk_size: i32, delay_secs: i32) -> NewBatch {
    NewBatch {
        name: "spring-promo".to_string(),
        content: "Hi {{name}}, 20% off at {{shop}}".to_string(),
        variables: HashMap::from([
            ("name".to_string(), "friend".to_string()),
            ("shop".to_string(), "Main St".to_string()),
        ]),
        chunk_size: Some(chunk_size),
        delay_between_batches: Some(delay_secs),
        ..Default::default()
    }
}

/// 在第 N 次重新计数时模拟外部写入或存储故障的批次仓库
struct InterferingBatches {
    inner: Arc<BatchRepositoryImpl>,
    recounts: AtomicUsize,
    trigger_at: usize,
    interference: Interference,
}

#[derive(Clone, Copy)]
enum Interference {
    /// 重新计数后另一个调用方取消批次，返回取消前的快照
    CancelAfterRecount,
    /// 重新计数失败
    FailRecount,
}

impl InterferingBatches {
    fn new(inner: Arc<BatchRepositoryImpl>, trigger_at: usize, interference: Interference) -> Self {
        Self {
            inner,
            recounts: AtomicUsize::new(0),
            trigger_at,
            interference,
        }
    }
}

#[async_trait]
impl BatchRepository for InterferingBatches {
    async fn create(&self, batch: &Batch) -> Result<Batch, RepositoryError> {
        self.inner.create(batch).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Batch>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, batch: &Batch) -> Result<Batch, RepositoryError> {
        self.inner.update(batch).await
    }

    async fn recompute_counts(&self, id: Uuid) -> Result<Batch, RepositoryError> {
        let call = self.recounts.fetch_add(1, Ordering::SeqCst) + 1;
        if call != self.trigger_at {
            return self.inner.recompute_counts(id).await;
        }

        match self.interference {
            Interference::FailRecount => Err(RepositoryError::Database(DbErr::Custom(
                "disk I/O error".to_string(),
            ))),
            Interference::CancelAfterRecount => {
                let snapshot = self.inner.recompute_counts(id).await?;
                let mut other = self
                    .inner
                    .find_by_id(id)
                    .await?
                    .ok_or(RepositoryError::NotFound)?;
                other.cancel().expect("batch is still cancellable");
                self.inner.update(&other).await?;
                Ok(snapshot)
            }
        }
    }

    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Batch>, RepositoryError> {
        self.inner.find_due_scheduled(now).await
    }

    async fn find_retryable(&self) -> Result<Vec<Batch>, RepositoryError> {
        self.inner.find_retryable().await
    }
}

/// 250 个收件人按 100 分块：100、100、50，结果保持输入顺序
#[tokio::test]
async fn test_bulk_send_chunks_in_order() {
    let ctx = create_context().await;
    let input = recipients(250);

    let report = ctx
        .bulk
        .send_bulk_message(campaign(100, 0), input.clone())
        .await
        .unwrap();

    assert_eq!(report.chunk_sizes, vec![100, 100, 50]);
    assert_eq!(report.results.len(), 250);
    for (result, recipient) in report.results.iter().zip(&input) {
        assert_eq!(result.recipient, recipient.to);
        assert_eq!(result.status, RecipientStatus::Sent);
    }

    let batch = report.batch;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.total_recipients, 250);
    assert_eq!(batch.sent_count, 250);
    assert_eq!(batch.failed_count, 0);
    assert!(batch.counts_consistent());
    assert!(batch.completed_at.is_some());
    assert_eq!(ctx.mock.calls(), 250);
}

/// 批次变量与收件人变量合并，收件人变量优先
#[tokio::test]
async fn test_recipient_variables_override_batch_variables() {
    let ctx = create_context().await;
    let vip = Recipient {
        to: phone(1),
        variables: HashMap::from([("name".to_string(), "Ada".to_string())]),
    };

    let report = ctx
        .bulk
        .send_bulk_message(campaign(10, 0), vec![vip, Recipient::from(phone(2).as_str())])
        .await
        .unwrap();

    let first = ctx
        .messenger
        .get_message(report.results[0].message_id)
        .await
        .unwrap();
    assert_eq!(first.content, "Hi Ada, 20% off at Main St");
    let second = ctx
        .messenger
        .get_message(report.results[1].message_id)
        .await
        .unwrap();
    assert_eq!(second.content, "Hi friend, 20% off at Main St");
}

/// 单条失败不会中断批次
#[tokio::test]
async fn test_rejections_are_counted_not_fatal() {
    let ctx = create_context().await;
    ctx.mock.set_mode(MockMode::Reject);

    let report = ctx
        .bulk
        .send_bulk_message(campaign(2, 0), recipients(3))
        .await
        .unwrap();

    assert_eq!(report.chunk_sizes, vec![2, 1]);
    assert!(report
        .results
        .iter()
        .all(|r| r.status == RecipientStatus::Failed && r.error.is_some()));
    assert_eq!(report.batch.status, BatchStatus::Completed);
    assert_eq!(report.batch.failed_count, 3);
    assert!(report.batch.counts_consistent());

    // failed messages can be retried once the provider recovers
    ctx.mock.set_mode(MockMode::Succeed);
    let retried = ctx
        .bulk
        .retry_failed_messages(report.batch.id)
        .await
        .unwrap();
    assert_eq!(retried.results.len(), 3);
    assert!(retried
        .results
        .iter()
        .all(|r| r.status == RecipientStatus::Sent));
    assert_eq!(retried.batch.current_retry, 1);
    assert_eq!(retried.batch.failed_count, 0);
    assert_eq!(retried.batch.sent_count, 3);
}

/// 在块间等待时取消，剩余收件人全部取消
#[tokio::test]
async fn test_cancel_between_chunks() {
    let ctx = create_context().await;
    let batch = ctx
        .bulk
        .create_batch(campaign(100, 2), recipients(250))
        .await
        .unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);

    let bulk = ctx.bulk.clone();
    let id = batch.id;
    let processing = tokio::spawn(async move { bulk.process_batch(id).await });

    let mut waited = 0;
    loop {
        let current = ctx.bulk.get_batch(id).await.unwrap();
        if current.sent_count >= 100 {
            break;
        }
        waited += 1;
        assert!(waited < 200, "first chunk never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let cancelled = ctx.bulk.cancel_batch(id).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);

    let report = processing.await.unwrap().unwrap();
    assert_eq!(report.chunk_sizes, vec![100]);
    assert_eq!(report.results.len(), 250);
    let skipped = report
        .results
        .iter()
        .filter(|r| r.status == RecipientStatus::Cancelled)
        .count();
    assert_eq!(skipped, 150);
    assert_eq!(report.batch.status, BatchStatus::Cancelled);
    assert_eq!(report.batch.sent_count, 100);
    assert!(report.batch.counts_consistent());

    let cancelled_messages = ctx
        .messages
        .find_by_batch(id, Some(vec![MessageStatus::Cancelled]))
        .await
        .unwrap();
    assert_eq!(cancelled_messages.len(), 150);
    assert_eq!(ctx.mock.calls(), 100);
}

/// 已完成的批次不能取消，未完成的批次不能重试
#[tokio::test]
async fn test_batch_state_rules() {
    let ctx = create_context().await;

    let pending = ctx
        .bulk
        .create_batch(campaign(10, 0), recipients(2))
        .await
        .unwrap();
    let err = ctx.bulk.retry_failed_messages(pending.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    let done = ctx.bulk.process_batch(pending.id).await.unwrap();
    let err = ctx.bulk.cancel_batch(done.batch.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    let err = ctx
        .bulk
        .create_batch(campaign(10, 0), Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

/// 定时批次只创建不发送，消息处于 Scheduled 状态
#[tokio::test]
async fn test_scheduled_batch_waits() {
    let ctx = create_context().await;
    let mut params = campaign(10, 0);
    params.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));

    let report = ctx
        .bulk
        .send_bulk_message(params, recipients(3))
        .await
        .unwrap();
    assert_eq!(report.batch.status, BatchStatus::Scheduled);
    assert!(report.results.is_empty());

    let scheduled = ctx
        .messages
        .find_by_batch(report.batch.id, Some(vec![MessageStatus::Scheduled]))
        .await
        .unwrap();
    assert_eq!(scheduled.len(), 3);
    assert_eq!(ctx.mock.calls(), 0);
}

/// 费用估算按 160 字符分段
#[tokio::test]
async fn test_estimate_bulk_cost() {
    let ctx = create_context().await;
    let content = "x".repeat(161);

    let estimate = ctx
        .bulk
        .estimate_bulk_cost(Some("twilio"), Channel::Sms, &content, 1000);
    assert_eq!(estimate.segments_per_message, 2);
    assert_eq!(estimate.total_segments, 2000);
    assert!((estimate.estimated_cost - 15.8).abs() < 1e-9);

    let default = ctx.bulk.estimate_bulk_cost(None, Channel::Sms, "hi", 10);
    assert_eq!(default.provider, "mocktest");
    assert!((default.estimated_cost - 1.0).abs() < 1e-9);
}

/// 处理结束前被取消的批次保持取消状态
#[tokio::test]
async fn test_cancel_before_completion_is_not_overwritten() {
    let ctx = create_context().await;
    // one chunk: recount after the chunk, then the final recount
    let batches = Arc::new(InterferingBatches::new(
        ctx.batches.clone(),
        2,
        Interference::CancelAfterRecount,
    ));
    let bulk = BulkMessageService::new(
        ctx.messages.clone(),
        batches,
        ctx.messenger.clone(),
        BulkDefaults::default(),
    );

    let report = bulk
        .send_bulk_message(campaign(10, 0), recipients(3))
        .await
        .unwrap();
    assert_eq!(report.batch.status, BatchStatus::Cancelled);

    let stored = ctx
        .batches
        .find_by_id(report.batch.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, BatchStatus::Cancelled);
    assert!(stored.cancelled_at.is_some());
    assert!(stored.completed_at.is_none());
}

/// 基于过期版本的生命周期写入被拒绝
#[tokio::test]
async fn test_stale_batch_update_conflicts() {
    let ctx = create_context().await;
    let batch = ctx
        .bulk
        .create_batch(campaign(10, 0), recipients(2))
        .await
        .unwrap();

    let mut first = ctx.batches.find_by_id(batch.id).await.unwrap().unwrap();
    let mut stale = first.clone();

    first.cancel().unwrap();
    let saved = ctx.batches.update(&first).await.unwrap();
    assert_eq!(saved.version, first.version + 1);

    stale.start().unwrap();
    let err = ctx.batches.update(&stale).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Conflict));

    let stored = ctx.batches.find_by_id(batch.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Cancelled);

    // a retry on the cancelled batch re-reads it and is refused
    let err = ctx.bulk.process_batch(batch.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

/// 处理中途的存储故障使批次失败并把错误返回给调用方
#[tokio::test]
async fn test_storage_failure_mid_batch_fails_batch() {
    let ctx = create_context().await;
    // fails the recount after the first chunk
    let batches = Arc::new(InterferingBatches::new(
        ctx.batches.clone(),
        1,
        Interference::FailRecount,
    ));
    let bulk = BulkMessageService::new(
        ctx.messages.clone(),
        batches,
        ctx.messenger.clone(),
        BulkDefaults::default(),
    );

    let batch = bulk
        .create_batch(campaign(2, 0), recipients(4))
        .await
        .unwrap();
    let err = bulk.process_batch(batch.id).await.unwrap_err();
    assert_eq!(err.code(), "REPOSITORY_ERROR");
    assert_eq!(ctx.mock.calls(), 2);

    let stored = ctx.batches.find_by_id(batch.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert!(stored.completed_at.is_some());
    assert!(stored.cancelled_at.is_none());
    let recorded = stored.metadata["error"].as_str().unwrap();
    assert!(recorded.contains("disk I/O error"));
    assert_eq!(stored.sent_count, 2);
    assert!(stored.counts_consistent());

    // failed batches can still retry their failed messages
    let retried = ctx.bulk.retry_failed_messages(batch.id).await.unwrap();
    assert_eq!(retried.batch.current_retry, 1);
}
