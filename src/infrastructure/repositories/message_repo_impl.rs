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

use crate::domain::models::message::{Message, MessageStatus};
use crate::domain::repositories::message_repository::{
    MessageRepository, ProviderStats, RepositoryError,
};
use crate::infrastructure::database::entities::message as message_entity;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    sea_query::Expr, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// 单次批量插入的行数上限
const INSERT_CHUNK: usize = 200;

/// 发送前就失败、从未调用供应商的错误码，不计入供应商统计
const NOT_ATTEMPTED_ERROR_CODES: [&str; 3] =
    ["PROVIDER_UNAVAILABLE", "CONSENT_REQUIRED", "CONFIGURATION_ERROR"];

/// 消息仓库实现
///
/// 基于SeaORM实现的消息数据访问层
#[derive(Clone)]
pub struct MessageRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl MessageRepositoryImpl {
    /// 创建新的消息仓库实例
    ///
    /// # 参数
    ///
    /// * `db` - 数据库连接
    ///
    /// # 返回值
    ///
    /// 返回新的消息仓库实例
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl From<message_entity::Model> for Message {
    fn from(model: message_entity::Model) -> Self {
        Self {
            id: model.id,
            batch_id: model.batch_id,
            provider: model.provider,
            channel: model.channel.parse().unwrap_or_default(),
            recipient: model.recipient,
            content: model.content,
            template_id: model.template_id,
            variables: serde_json::from_value(model.variables).unwrap_or_default(),
            status: model.status.parse().unwrap_or(MessageStatus::Unknown),
            priority: model.priority.parse().unwrap_or_default(),
            provider_message_id: model.provider_message_id,
            scheduled_at: model.scheduled_at.map(Into::into),
            sent_at: model.sent_at.map(Into::into),
            delivered_at: model.delivered_at.map(Into::into),
            read_at: model.read_at.map(Into::into),
            failed_at: model.failed_at.map(Into::into),
            cancelled_at: model.cancelled_at.map(Into::into),
            retry_count: model.retry_count,
            error_code: model.error_code,
            error_message: model.error_message,
            cost: model.cost,
            metadata: model.metadata,
            version: model.version,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}

impl From<Message> for message_entity::ActiveModel {
    fn from(message: Message) -> Self {
        Self {
            id: Set(message.id),
            batch_id: Set(message.batch_id),
            provider: Set(message.provider),
            channel: Set(message.channel.to_string()),
            recipient: Set(message.recipient),
            content: Set(message.content),
            template_id: Set(message.template_id),
            variables: Set(serde_json::to_value(&message.variables)
                .unwrap_or_else(|_| serde_json::json!({}))),
            status: Set(message.status.to_string()),
            priority: Set(message.priority.to_string()),
            provider_message_id: Set(message.provider_message_id),
            scheduled_at: Set(message.scheduled_at.map(Into::into)),
            sent_at: Set(message.sent_at.map(Into::into)),
            delivered_at: Set(message.delivered_at.map(Into::into)),
            read_at: Set(message.read_at.map(Into::into)),
            failed_at: Set(message.failed_at.map(Into::into)),
            cancelled_at: Set(message.cancelled_at.map(Into::into)),
            retry_count: Set(message.retry_count),
            error_code: Set(message.error_code),
            error_message: Set(message.error_message),
            cost: Set(message.cost),
            metadata: Set(message.metadata),
            version: Set(message.version),
            created_at: Set(message.created_at.into()),
            updated_at: Set(message.updated_at.into()),
        }
    }
}

#[async_trait]
impl MessageRepository for MessageRepositoryImpl {
    async fn create(&self, message: &Message) -> Result<Message, RepositoryError> {
        let model: message_entity::ActiveModel = message.clone().into();

        message_entity::Entity::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await?;

        Ok(message.clone())
    }

    async fn create_many(&self, messages: &[Message]) -> Result<(), RepositoryError> {
        if messages.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        for chunk in messages.chunks(INSERT_CHUNK) {
            let models: Vec<message_entity::ActiveModel> =
                chunk.iter().cloned().map(Into::into).collect();
            message_entity::Entity::insert_many(models)
                .exec_without_returning(&txn)
                .await?;
        }
        txn.commit().await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, RepositoryError> {
        let model = message_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;

        Ok(model.map(Into::into))
    }

    async fn find_by_provider_message_id(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let model = message_entity::Entity::find()
            .filter(message_entity::Column::Provider.eq(provider))
            .filter(message_entity::Column::ProviderMessageId.eq(provider_message_id))
            .one(self.db.as_ref())
            .await?;

        Ok(model.map(Into::into))
    }

    async fn update(&self, message: &Message) -> Result<Message, RepositoryError> {
        let mut next = message.clone();
        next.version = message.version + 1;
        let model: message_entity::ActiveModel = next.clone().into();

        let result = message_entity::Entity::update_many()
            .set(model)
            .filter(message_entity::Column::Id.eq(message.id))
            .filter(message_entity::Column::Version.eq(message.version))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            let exists = message_entity::Entity::find_by_id(message.id)
                .one(self.db.as_ref())
                .await?
                .is_some();
            return Err(if exists {
                RepositoryError::Conflict
            } else {
                RepositoryError::NotFound
            });
        }

        Ok(next)
    }

    async fn find_by_batch(
        &self,
        batch_id: Uuid,
        statuses: Option<Vec<MessageStatus>>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let mut query =
            message_entity::Entity::find().filter(message_entity::Column::BatchId.eq(batch_id));

        if let Some(statuses) = statuses {
            query = query.filter(
                message_entity::Column::Status
                    .is_in(statuses.iter().map(ToString::to_string).collect::<Vec<_>>()),
            );
        }

        let models = query
            .order_by_asc(message_entity::Column::CreatedAt)
            .order_by_asc(message_entity::Column::Id)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn cancel_unsent_by_batch(&self, batch_id: Uuid) -> Result<u64, RepositoryError> {
        let now: DateTime<FixedOffset> = Utc::now().into();
        let unsent = [
            MessageStatus::Pending,
            MessageStatus::Scheduled,
            MessageStatus::Queued,
        ]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

        let result = message_entity::Entity::update_many()
            .col_expr(
                message_entity::Column::Status,
                Expr::value(MessageStatus::Cancelled.to_string()),
            )
            .col_expr(message_entity::Column::CancelledAt, Expr::value(now))
            .col_expr(message_entity::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                message_entity::Column::Version,
                Expr::col(message_entity::Column::Version).add(1),
            )
            .filter(message_entity::Column::BatchId.eq(batch_id))
            .filter(message_entity::Column::Status.is_in(unsent))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected)
    }

    async fn find_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Message>, RepositoryError> {
        let models = message_entity::Entity::find()
            .filter(message_entity::Column::Status.eq(MessageStatus::Scheduled.to_string()))
            .filter(
                message_entity::Column::ScheduledAt
                    .lte(DateTime::<FixedOffset>::from(now)),
            )
            .filter(message_entity::Column::BatchId.is_null())
            .order_by_asc(message_entity::Column::ScheduledAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn find_failed_since(
        &self,
        since: DateTime<Utc>,
        max_retries: i32,
        limit: u64,
    ) -> Result<Vec<Message>, RepositoryError> {
        let models = message_entity::Entity::find()
            .filter(message_entity::Column::Status.eq(MessageStatus::Failed.to_string()))
            .filter(
                message_entity::Column::FailedAt
                    .gte(DateTime::<FixedOffset>::from(since)),
            )
            .filter(message_entity::Column::RetryCount.lt(max_retries))
            .order_by_asc(message_entity::Column::FailedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn count_by_status(&self, status: MessageStatus) -> Result<u64, RepositoryError> {
        let count = message_entity::Entity::find()
            .filter(message_entity::Column::Status.eq(status.to_string()))
            .count(self.db.as_ref())
            .await?;

        Ok(count)
    }

    async fn provider_stats(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderStats>, RepositoryError> {
        let rows: Vec<(String, String, i64)> = message_entity::Entity::find()
            .select_only()
            .column(message_entity::Column::Provider)
            .column(message_entity::Column::Status)
            .column_as(message_entity::Column::Id.count(), "count")
            .filter(
                message_entity::Column::UpdatedAt
                    .gte(DateTime::<FixedOffset>::from(since)),
            )
            .filter(
                Condition::any()
                    .add(message_entity::Column::ErrorCode.is_null())
                    .add(message_entity::Column::ErrorCode.is_not_in(NOT_ATTEMPTED_ERROR_CODES)),
            )
            .group_by(message_entity::Column::Provider)
            .group_by(message_entity::Column::Status)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        let mut stats: BTreeMap<String, ProviderStats> = BTreeMap::new();
        for (provider, status, count) in rows {
            let count = count.max(0) as u64;
            let entry = stats
                .entry(provider.clone())
                .or_insert_with(|| ProviderStats {
                    provider,
                    ..Default::default()
                });
            match status.parse().unwrap_or(MessageStatus::Unknown) {
                MessageStatus::Sent | MessageStatus::Delivered => {
                    entry.total += count;
                    entry.succeeded += count;
                }
                MessageStatus::Failed | MessageStatus::Bounced => {
                    entry.total += count;
                    entry.failed += count;
                }
                MessageStatus::Sending => entry.total += count,
                _ => {}
            }
        }

        Ok(stats.into_values().collect())
    }
}
