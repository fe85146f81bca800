// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::message_repository::RepositoryError;
use crate::domain::models::batch::Batch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 批次仓库特质
///
/// 定义批次数据访问接口
#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// 创建批次
    async fn create(&self, batch: &Batch) -> Result<Batch, RepositoryError>;
    /// 根据ID查找批次
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Batch>, RepositoryError>;
    /// 更新批次的生命周期字段（不含聚合计数）
    async fn update(&self, batch: &Batch) -> Result<Batch, RepositoryError>;
    /// 在一个事务中根据批次消息重新计算并保存聚合计数
    async fn recompute_counts(&self, id: Uuid) -> Result<Batch, RepositoryError>;
    /// 查找已到期的定时批次
    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Batch>, RepositoryError>;
    /// 查找需要自动重试失败消息的批次
    async fn find_retryable(&self) -> Result<Vec<Batch>, RepositoryError>;
}
