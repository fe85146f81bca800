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

use crate::domain::models::webhook_record::WebhookRecord;
use crate::domain::repositories::message_repository::RepositoryError;
use crate::domain::repositories::webhook_record_repository::WebhookRecordRepository;
use crate::infrastructure::database::entities::webhook_record;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::*;
use std::sync::Arc;
use uuid::Uuid;

/// Webhook记录仓库实现
#[derive(Clone)]
pub struct WebhookRecordRepoImpl {
    db: Arc<DatabaseConnection>,
}

impl WebhookRecordRepoImpl {
    /// 创建新的Webhook记录仓库实现
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WebhookRecordRepository for WebhookRecordRepoImpl {
    async fn create(&self, record: &WebhookRecord) -> Result<WebhookRecord, RepositoryError> {
        let active_model: webhook_record::ActiveModel = record.clone().into();

        webhook_record::Entity::insert(active_model)
            .exec_without_returning(self.db.as_ref())
            .await?;

        Ok(record.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookRecord>, RepositoryError> {
        let model = webhook_record::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;

        Ok(model.map(Into::into))
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: u64,
    ) -> Result<Vec<WebhookRecord>, RepositoryError> {
        let now: DateTime<FixedOffset> = now.into();

        let models = webhook_record::Entity::find()
            .filter(
                Condition::all()
                    .add(webhook_record::Column::Processed.eq(false))
                    .add(webhook_record::Column::NextRetryAt.is_not_null())
                    .add(webhook_record::Column::NextRetryAt.lte(now))
                    .add(webhook_record::Column::RetryCount.lt(max_retries)),
            )
            .order_by_asc(webhook_record::Column::NextRetryAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn update(&self, record: &WebhookRecord) -> Result<WebhookRecord, RepositoryError> {
        let mut active: webhook_record::ActiveModel = webhook_record::Entity::find_by_id(record.id)
            .one(self.db.as_ref())
            .await?
            .ok_or(RepositoryError::NotFound)?
            .into();

        active.provider_message_id = Set(record.provider_message_id.clone());
        active.processed_payload = Set(record.processed_payload.clone());
        active.is_verified = Set(record.is_verified);
        active.verification_attempts = Set(record.verification_attempts);
        active.processed = Set(record.processed);
        active.processed_at = Set(record.processed_at.map(Into::into));
        active.failure_reason = Set(record.failure_reason.clone());
        active.retry_count = Set(record.retry_count);
        active.next_retry_at = Set(record.next_retry_at.map(Into::into));
        active.updated_at = Set(record.updated_at.into());

        let updated_model = active.update(self.db.as_ref()).await?;

        Ok(updated_model.into())
    }
}

impl From<webhook_record::Model> for WebhookRecord {
    fn from(model: webhook_record::Model) -> Self {
        Self {
            id: model.id,
            provider: model.provider,
            provider_message_id: model.provider_message_id,
            raw_payload: model.raw_payload,
            processed_payload: model.processed_payload,
            signature: model.signature,
            is_verified: model.is_verified,
            verification_attempts: model.verification_attempts,
            processed: model.processed,
            processed_at: model.processed_at.map(Into::into),
            failure_reason: model.failure_reason,
            retry_count: model.retry_count,
            next_retry_at: model.next_retry_at.map(Into::into),
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}

impl From<WebhookRecord> for webhook_record::ActiveModel {
    fn from(record: WebhookRecord) -> Self {
        Self {
            id: Set(record.id),
            provider: Set(record.provider),
            provider_message_id: Set(record.provider_message_id),
            raw_payload: Set(record.raw_payload),
            processed_payload: Set(record.processed_payload),
            signature: Set(record.signature),
            is_verified: Set(record.is_verified),
            verification_attempts: Set(record.verification_attempts),
            processed: Set(record.processed),
            processed_at: Set(record.processed_at.map(Into::into)),
            failure_reason: Set(record.failure_reason),
            retry_count: Set(record.retry_count),
            next_retry_at: Set(record.next_retry_at.map(Into::into)),
            created_at: Set(record.created_at.into()),
            updated_at: Set(record.updated_at.into()),
        }
    }
}
