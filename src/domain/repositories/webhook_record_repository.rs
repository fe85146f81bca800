// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::message_repository::RepositoryError;
use crate::domain::models::webhook_record::WebhookRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Webhook记录仓库特质
#[async_trait]
pub trait WebhookRecordRepository: Send + Sync {
    /// 创建记录
    async fn create(&self, record: &WebhookRecord) -> Result<WebhookRecord, RepositoryError>;
    /// 根据ID查找记录
    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookRecord>, RepositoryError>;
    /// 查找到期待重试的记录
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: u64,
    ) -> Result<Vec<WebhookRecord>, RepositoryError>;
    /// 更新记录
    async fn update(&self, record: &WebhookRecord) -> Result<WebhookRecord, RepositoryError>;
}
