// Copyright 2025 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::models::batch::{Batch, BatchCounts, BatchStatus};
use crate::domain::models::message::MessageStatus;
use crate::domain::repositories::batch_repository::BatchRepository;
use crate::domain::repositories::message_repository::RepositoryError;
use crate::infrastructure::database::entities::{batch as batch_entity, message as message_entity};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

/// 批次仓库实现
#[derive(Clone)]
pub struct BatchRepositoryImpl {
    db: Arc<DatabaseConnection>,
}

impl BatchRepositoryImpl {
    /// 创建新的批次仓库实例
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl From<batch_entity::Model> for Batch {
    fn from(model: batch_entity::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            provider: model.provider,
            channel: model.channel.parse().unwrap_or_default(),
            content: model.content,
            template_id: model.template_id,
            variables: serde_json::from_value(model.variables).unwrap_or_default(),
            status: model.status.parse().unwrap_or_default(),
            total_recipients: model.total_recipients,
            sent_count: model.sent_count,
            delivered_count: model.delivered_count,
            failed_count: model.failed_count,
            chunk_size: model.chunk_size,
            delay_between_batches: model.delay_between_batches,
            retry_failed: model.retry_failed,
            max_retries: model.max_retries,
            current_retry: model.current_retry,
            scheduled_at: model.scheduled_at.map(Into::into),
            started_at: model.started_at.map(Into::into),
            completed_at: model.completed_at.map(Into::into),
            cancelled_at: model.cancelled_at.map(Into::into),
            metadata: model.metadata,
            version: model.version,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}

impl From<Batch> for batch_entity::ActiveModel {
    fn from(batch: Batch) -> Self {
        Self {
            id: Set(batch.id),
            name: Set(batch.name),
            provider: Set(batch.provider),
            channel: Set(batch.channel.to_string()),
            content: Set(batch.content),
            template_id: Set(batch.template_id),
            variables: Set(
                serde_json::to_value(&batch.variables).unwrap_or_else(|_| serde_json::json!({}))
            ),
            status: Set(batch.status.to_string()),
            total_recipients: Set(batch.total_recipients),
            sent_count: Set(batch.sent_count),
            delivered_count: Set(batch.delivered_count),
            failed_count: Set(batch.failed_count),
            chunk_size: Set(batch.chunk_size),
            delay_between_batches: Set(batch.delay_between_batches),
            retry_failed: Set(batch.retry_failed),
            max_retries: Set(batch.max_retries),
            current_retry: Set(batch.current_retry),
            scheduled_at: Set(batch.scheduled_at.map(Into::into)),
            started_at: Set(batch.started_at.map(Into::into)),
            completed_at: Set(batch.completed_at.map(Into::into)),
            cancelled_at: Set(batch.cancelled_at.map(Into::into)),
            metadata: Set(batch.metadata),
            version: Set(batch.version),
            created_at: Set(batch.created_at.into()),
            updated_at: Set(batch.updated_at.into()),
        }
    }
}

/// 根据各状态的消息数量计算批次聚合计数
///
/// sent_count 统计所有已离开本系统的消息（已提交、已送达、失败、退回），
/// 因此 delivered_count + failed_count 永远不会超过 sent_count
fn counts_from_rows(rows: &[(String, i64)]) -> BatchCounts {
    let mut counts = BatchCounts::default();
    for (status, count) in rows {
        let count = (*count).clamp(0, i32::MAX as i64) as i32;
        match status.parse().unwrap_or(MessageStatus::Unknown) {
            MessageStatus::Sent => counts.sent_count += count,
            MessageStatus::Delivered => {
                counts.sent_count += count;
                counts.delivered_count += count;
            }
            MessageStatus::Failed | MessageStatus::Bounced => {
                counts.sent_count += count;
                counts.failed_count += count;
            }
            _ => {}
        }
    }
    counts
}

#[async_trait]
impl BatchRepository for BatchRepositoryImpl {
    async fn create(&self, batch: &Batch) -> Result<Batch, RepositoryError> {
        let model: batch_entity::ActiveModel = batch.clone().into();

        batch_entity::Entity::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await?;

        Ok(batch.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Batch>, RepositoryError> {
        let model = batch_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;

        Ok(model.map(Into::into))
    }

    async fn update(&self, batch: &Batch) -> Result<Batch, RepositoryError> {
        let now: DateTime<FixedOffset> = Utc::now().into();
        let next_version = batch.version + 1;

        // 只写生命周期字段，聚合计数由 recompute_counts 维护
        let result = batch_entity::Entity::update_many()
            .col_expr(batch_entity::Column::Status, Expr::value(batch.status.to_string()))
            .col_expr(batch_entity::Column::CurrentRetry, Expr::value(batch.current_retry))
            .col_expr(
                batch_entity::Column::StartedAt,
                Expr::value(batch.started_at.map(DateTime::<FixedOffset>::from)),
            )
            .col_expr(
                batch_entity::Column::CompletedAt,
                Expr::value(batch.completed_at.map(DateTime::<FixedOffset>::from)),
            )
            .col_expr(
                batch_entity::Column::CancelledAt,
                Expr::value(batch.cancelled_at.map(DateTime::<FixedOffset>::from)),
            )
            .col_expr(batch_entity::Column::Metadata, Expr::value(batch.metadata.clone()))
            .col_expr(batch_entity::Column::Version, Expr::value(next_version))
            .col_expr(batch_entity::Column::UpdatedAt, Expr::value(now))
            .filter(batch_entity::Column::Id.eq(batch.id))
            .filter(batch_entity::Column::Version.eq(batch.version))
            .exec(self.db.as_ref())
            .await?;

        let model = batch_entity::Entity::find_by_id(batch.id)
            .one(self.db.as_ref())
            .await?
            .ok_or(RepositoryError::NotFound)?;

        if result.rows_affected == 0 {
            return Err(RepositoryError::Conflict);
        }

        Ok(model.into())
    }

    async fn recompute_counts(&self, id: Uuid) -> Result<Batch, RepositoryError> {
        let txn = self.db.begin().await?;

        let rows: Vec<(String, i64)> = message_entity::Entity::find()
            .select_only()
            .column(message_entity::Column::Status)
            .column_as(message_entity::Column::Id.count(), "count")
            .filter(message_entity::Column::BatchId.eq(id))
            .group_by(message_entity::Column::Status)
            .into_tuple()
            .all(&txn)
            .await?;

        let counts = counts_from_rows(&rows);
        let now: DateTime<FixedOffset> = Utc::now().into();

        let result = batch_entity::Entity::update_many()
            .col_expr(batch_entity::Column::SentCount, Expr::value(counts.sent_count))
            .col_expr(
                batch_entity::Column::DeliveredCount,
                Expr::value(counts.delivered_count),
            )
            .col_expr(batch_entity::Column::FailedCount, Expr::value(counts.failed_count))
            .col_expr(batch_entity::Column::UpdatedAt, Expr::value(now))
            .filter(batch_entity::Column::Id.eq(id))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(RepositoryError::NotFound);
        }

        let model = batch_entity::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        txn.commit().await?;

        Ok(model.into())
    }

    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Batch>, RepositoryError> {
        let models = batch_entity::Entity::find()
            .filter(batch_entity::Column::Status.eq(BatchStatus::Scheduled.to_string()))
            .filter(batch_entity::Column::ScheduledAt.lte(DateTime::<FixedOffset>::from(now)))
            .order_by_asc(batch_entity::Column::ScheduledAt)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn find_retryable(&self) -> Result<Vec<Batch>, RepositoryError> {
        let models = batch_entity::Entity::find()
            .filter(batch_entity::Column::Status.eq(BatchStatus::Completed.to_string()))
            .filter(batch_entity::Column::RetryFailed.eq(true))
            .filter(batch_entity::Column::FailedCount.gt(0))
            .filter(
                Expr::col(batch_entity::Column::CurrentRetry)
                    .lt(Expr::col(batch_entity::Column::MaxRetries)),
            )
            .order_by_asc(batch_entity::Column::CompletedAt)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }
}
