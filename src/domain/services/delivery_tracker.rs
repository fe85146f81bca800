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

use crate::config::settings::WebhookSettings;
use crate::domain::models::events::MessageEvent;
use crate::domain::models::message::{Message, MessageStatus};
use crate::domain::models::provider::CanonicalWebhookEvent;
use crate::domain::models::webhook_record::WebhookRecord;
use crate::domain::repositories::message_repository::{MessageRepository, RepositoryError};
use crate::domain::repositories::webhook_record_repository::WebhookRecordRepository;
use crate::domain::services::event_publisher::EventPublisher;
use crate::providers::registry::ProviderRegistry;
use crate::providers::traits::{InboundWebhook, ProviderAdapter, ProviderError};
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_UPDATE_ATTEMPTS: usize = 3;

/// 投递跟踪错误类型
#[derive(Error, Debug)]
pub enum TrackerError {
    /// 持久化失败
    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),

    /// 供应商解析或负载映射失败
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// 回调对消息的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// 无需写入
    Unchanged,
    /// 只更新了字段（例如已读时间）
    Fields,
    /// 状态发生了转换
    Transitioned(MessageStatus),
}

/// 把规范化回调应用到消息上
///
/// 只有状态机允许的转换才会写入，重复回调得到 `Change::Unchanged`
fn apply_canonical(message: &mut Message, event: &CanonicalWebhookEvent) -> Change {
    let now = Utc::now();
    let mut change = Change::Unchanged;

    if event.read && message.read_at.is_none() {
        message.read_at = Some(event.delivered_at.unwrap_or(now));
        change = Change::Fields;
    }

    if message.status.can_transition_to(event.status) {
        message.status = event.status;
        match event.status {
            MessageStatus::Delivered => {
                message
                    .delivered_at
                    .get_or_insert(event.delivered_at.unwrap_or(now));
            }
            MessageStatus::Failed | MessageStatus::Bounced => {
                message.error_code = event.error_code.clone().or(message.error_code.take());
                message.error_message = event
                    .error_message
                    .clone()
                    .or(message.error_message.take());
                message.failed_at = Some(now);
            }
            _ => {}
        }
        change = Change::Transitioned(event.status);
    }

    if change != Change::Unchanged {
        message.updated_at = now;
    }
    change
}

/// 根据状态转换生成领域事件，其他转换不产生事件
fn event_for(message: &Message, status: MessageStatus) -> Option<MessageEvent> {
    let at = Utc::now();
    match status {
        MessageStatus::Delivered => Some(MessageEvent::MessageDelivered {
            message_id: message.id,
            provider: message.provider.clone(),
            at: message.delivered_at.unwrap_or(at),
        }),
        MessageStatus::Failed => Some(MessageEvent::MessageFailed {
            message_id: message.id,
            provider: message.provider.clone(),
            error_code: message.error_code.clone(),
            error_message: message.error_message.clone(),
            at: message.failed_at.unwrap_or(at),
        }),
        MessageStatus::Bounced => Some(MessageEvent::MessageBounced {
            message_id: message.id,
            provider: message.provider.clone(),
            error_code: message.error_code.clone(),
            at: message.failed_at.unwrap_or(at),
        }),
        _ => None,
    }
}

/// 投递跟踪服务
///
/// 处理供应商的投递状态回调。原始回调总是先落库，
/// 之后的任何失败都只记录在回调记录自身的重试状态中。
pub struct DeliveryTracker {
    messages: Arc<dyn MessageRepository>,
    records: Arc<dyn WebhookRecordRepository>,
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn EventPublisher>,
    settings: WebhookSettings,
}

impl DeliveryTracker {
    /// 创建新的投递跟踪服务
    ///
    /// # 参数
    ///
    /// * `messages` - 消息仓库
    /// * `records` - 回调记录仓库
    /// * `registry` - 供应商注册表
    /// * `events` - 事件发布器
    /// * `settings` - 回调配置
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        records: Arc<dyn WebhookRecordRepository>,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn EventPublisher>,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            messages,
            records,
            registry,
            events,
            settings,
        }
    }

    /// 处理一次供应商回调
    ///
    /// # 参数
    ///
    /// * `provider` - 供应商名称
    /// * `webhook` - 收到的回调请求
    ///
    /// # 返回值
    ///
    /// * `Ok(true)` - 找到对应消息并已处理（包括重复回调）
    /// * `Ok(false)` - 回调已保存但未应用，等待重试或人工检查
    /// * `Err(TrackerError)` - 原始回调无法保存
    pub async fn process_webhook(
        &self,
        provider: &str,
        webhook: InboundWebhook,
    ) -> Result<bool, TrackerError> {
        counter!("webhooks_received_total", "provider" => provider.to_string()).increment(1);

        let adapter = self.registry.make(provider);
        let signature = adapter
            .as_ref()
            .ok()
            .and_then(|a| webhook.header(a.signature_header()))
            .map(str::to_string);

        let record = WebhookRecord::new(provider, webhook.payload.clone(), signature.clone());
        let mut record = self.records.create(&record).await.map_err(|e| {
            error!(provider = %provider, error = %e, "Failed to store webhook record");
            TrackerError::Storage(e)
        })?;

        let adapter = match adapter {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Webhook for unresolvable provider");
                self.record_failure(record, e.to_string()).await;
                return Ok(false);
            }
        };

        let verified = adapter.verify_webhook(&webhook, signature.as_deref());
        record.record_verification(verified);
        if !verified && self.settings.require_signature {
            warn!(
                provider = %provider,
                record_id = %record.id,
                "Webhook signature verification failed, record stored without applying"
            );
            record.failure_reason = Some("signature verification failed".to_string());
            self.save_record(&record).await;
            return Ok(false);
        }

        Ok(self.apply_record(adapter.as_ref(), record).await)
    }

    /// 重新处理到期的未处理回调记录
    ///
    /// # 参数
    ///
    /// * `limit` - 单次处理的最大记录数
    ///
    /// # 返回值
    ///
    /// 本次成功应用的记录数
    pub async fn retry_pending_webhooks(&self, limit: u64) -> Result<usize, TrackerError> {
        let due = self
            .records
            .find_due(Utc::now(), self.settings.max_retries, limit)
            .await?;

        let mut applied = 0;
        for record in due {
            if self.settings.require_signature && !record.is_verified {
                continue;
            }
            let adapter = match self.registry.make(&record.provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    self.record_failure(record, e.to_string()).await;
                    continue;
                }
            };
            if self.apply_record(adapter.as_ref(), record).await {
                applied += 1;
            }
        }

        if applied > 0 {
            info!(applied, "Reprocessed pending webhooks");
        }
        Ok(applied)
    }

    async fn apply_record(&self, adapter: &dyn ProviderAdapter, mut record: WebhookRecord) -> bool {
        match self.apply(adapter, &mut record).await {
            Ok(true) => {
                record.mark_processed();
                self.save_record(&record).await;
                true
            }
            Ok(false) => {
                self.record_failure(record, "message not found".to_string())
                    .await;
                false
            }
            Err(e) => {
                warn!(
                    provider = %record.provider,
                    record_id = %record.id,
                    error = %e,
                    "Webhook processing failed, scheduled for retry"
                );
                self.record_failure(record, e.to_string()).await;
                false
            }
        }
    }

    async fn apply(
        &self,
        adapter: &dyn ProviderAdapter,
        record: &mut WebhookRecord,
    ) -> Result<bool, TrackerError> {
        let event = adapter.process_webhook(&record.raw_payload)?;
        record.provider_message_id = Some(event.provider_message_id.clone());
        record.processed_payload = serde_json::to_value(&event).ok();

        let Some(message) = self
            .messages
            .find_by_provider_message_id(&record.provider, &event.provider_message_id)
            .await?
        else {
            info!(
                provider = %record.provider,
                provider_message_id = %event.provider_message_id,
                "No message for webhook yet"
            );
            return Ok(false);
        };

        self.apply_event(message, &event).await?;
        Ok(true)
    }

    /// 以乐观锁写入回调状态，冲突时重新读取后再次应用
    async fn apply_event(
        &self,
        message: Message,
        event: &CanonicalWebhookEvent,
    ) -> Result<(), TrackerError> {
        let id = message.id;
        let mut current = message;
        let mut attempt = 1;

        loop {
            let mut next = current.clone();
            let change = apply_canonical(&mut next, event);
            if change == Change::Unchanged {
                debug!(message_id = %id, status = %current.status, "Duplicate webhook ignored");
                return Ok(());
            }

            match self.messages.update(&next).await {
                Ok(saved) => {
                    if let Change::Transitioned(status) = change {
                        info!(
                            message_id = %id,
                            from = %current.status,
                            to = %status,
                            "Delivery status updated"
                        );
                        if let Some(event) = event_for(&saved, status) {
                            self.events.publish(event).await;
                        }
                    }
                    return Ok(());
                }
                Err(RepositoryError::Conflict) if attempt < MAX_UPDATE_ATTEMPTS => {
                    attempt += 1;
                    current = self
                        .messages
                        .find_by_id(id)
                        .await?
                        .ok_or(RepositoryError::NotFound)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn record_failure(&self, mut record: WebhookRecord, reason: String) {
        record.schedule_retry(reason, self.settings.max_backoff_minutes);
        self.save_record(&record).await;
    }

    async fn save_record(&self, record: &WebhookRecord) {
        if let Err(e) = self.records.update(record).await {
            error!(record_id = %record.id, error = %e, "Failed to update webhook record");
        }
    }
}
