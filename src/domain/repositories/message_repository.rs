// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::message::{Message, MessageStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// 仓库错误类型
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    /// 记录未找到
    #[error("Record not found")]
    NotFound,
    /// 乐观锁冲突，记录已被其他写入者修改
    #[error("Concurrent modification detected")]
    Conflict,
}

/// 单个供应商在一段时间内的发送统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderStats {
    pub provider: String,
    /// 已尝试发送的消息数
    pub total: u64,
    /// 成功提交或送达的消息数
    pub succeeded: u64,
    /// 失败或退回的消息数
    pub failed: u64,
}

impl ProviderStats {
    /// 成功率，没有样本时返回 None
    pub fn success_rate(&self) -> Option<f64> {
        let decided = self.succeeded + self.failed;
        if decided == 0 {
            None
        } else {
            Some(self.succeeded as f64 / decided as f64)
        }
    }
}

/// 消息仓库特质
///
/// 定义消息数据访问接口。所有更新都带版本检查，
/// 版本不匹配时返回 `RepositoryError::Conflict`
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 创建消息
    async fn create(&self, message: &Message) -> Result<Message, RepositoryError>;
    /// 批量创建消息
    async fn create_many(&self, messages: &[Message]) -> Result<(), RepositoryError>;
    /// 根据ID查找消息
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, RepositoryError>;
    /// 根据供应商和供应商消息ID查找消息
    async fn find_by_provider_message_id(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError>;
    /// 更新消息（乐观锁），返回版本号递增后的消息
    async fn update(&self, message: &Message) -> Result<Message, RepositoryError>;
    /// 查找批次下的消息，可按状态过滤，按创建顺序返回
    async fn find_by_batch(
        &self,
        batch_id: Uuid,
        statuses: Option<Vec<MessageStatus>>,
    ) -> Result<Vec<Message>, RepositoryError>;
    /// 将批次下尚未发送的消息批量取消
    async fn cancel_unsent_by_batch(&self, batch_id: Uuid) -> Result<u64, RepositoryError>;
    /// 查找已到期的定时消息（不含批次消息）
    async fn find_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Message>, RepositoryError>;
    /// 查找某时间之后失败且重试次数未达上限的消息
    async fn find_failed_since(
        &self,
        since: DateTime<Utc>,
        max_retries: i32,
        limit: u64,
    ) -> Result<Vec<Message>, RepositoryError>;
    /// 按状态计数
    async fn count_by_status(&self, status: MessageStatus) -> Result<u64, RepositoryError>;
    /// 统计各供应商自某时间以来的发送结果
    async fn provider_stats(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderStats>, RepositoryError>;
}
