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

use crate::config::settings::BulkSettings;
use crate::domain::models::batch::{Batch, BatchStatus, NewBatch, Recipient};
use crate::domain::models::message::{
    Channel, DomainError, Message, MessageStatus, Priority, SendRequest,
};
use crate::domain::repositories::batch_repository::BatchRepository;
use crate::domain::repositories::message_repository::{MessageRepository, RepositoryError};
use crate::domain::services::messenger_service::{MessengerError, MessengerService};
use crate::utils::phone::normalize_e164;
use chrono::Duration as ChronoDuration;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 单条短信的字符数
pub const SMS_SEGMENT_LENGTH: usize = 160;

/// 批次版本冲突时的最大尝试次数
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// 批量发送默认参数
#[derive(Debug, Clone, Copy)]
pub struct BulkDefaults {
    pub chunk_size: i32,
    pub delay_between_batches_secs: i32,
    pub max_retries: i32,
}

impl Default for BulkDefaults {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            delay_between_batches_secs: 1,
            max_retries: 3,
        }
    }
}

impl From<&BulkSettings> for BulkDefaults {
    fn from(settings: &BulkSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            delay_between_batches_secs: settings.delay_between_batches_secs,
            max_retries: settings.max_retries,
        }
    }
}

/// 单个收件人的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Sent,
    Failed,
    Cancelled,
}

/// 单个收件人的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientResult {
    /// 收件人号码
    pub recipient: String,
    /// 处理结果
    pub status: RecipientStatus,
    /// 消息ID
    pub message_id: Uuid,
    /// 失败原因
    pub error: Option<String>,
}

impl RecipientResult {
    fn from_message(message: &Message) -> Self {
        let status = match message.status {
            MessageStatus::Cancelled => RecipientStatus::Cancelled,
            MessageStatus::Failed | MessageStatus::Bounced => RecipientStatus::Failed,
            _ => RecipientStatus::Sent,
        };
        Self {
            recipient: message.recipient.clone(),
            status,
            message_id: message.id,
            error: message.error_message.clone(),
        }
    }

    fn failed(message_id: Uuid, recipient: String, error: String) -> Self {
        Self {
            recipient,
            status: RecipientStatus::Failed,
            message_id,
            error: Some(error),
        }
    }

    fn cancelled(message: &Message) -> Self {
        Self {
            recipient: message.recipient.clone(),
            status: RecipientStatus::Cancelled,
            message_id: message.id,
            error: None,
        }
    }
}

/// 批量处理报告
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    /// 处理后的批次
    pub batch: Batch,
    /// 已处理分块的大小，按处理顺序
    pub chunk_sizes: Vec<usize>,
    /// 每个收件人的结果，按输入顺序
    pub results: Vec<RecipientResult>,
}

/// 费用估算
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub provider: String,
    pub channel: Channel,
    pub recipients: usize,
    /// 每条消息的分段数
    pub segments_per_message: usize,
    pub total_segments: usize,
    /// 每段单价
    pub rate_per_segment: f64,
    pub estimated_cost: f64,
}

/// 供应商加渠道的单价表
#[derive(Debug, Clone)]
pub struct RateTable {
    rates: HashMap<(String, Channel), f64>,
    fallback: f64,
}

impl Default for RateTable {
    fn default() -> Self {
        let rates = [
            ("mocktest", Channel::Sms, 0.10),
            ("mocktest", Channel::Whatsapp, 0.10),
            ("twilio", Channel::Sms, 0.0079),
            ("twilio", Channel::Whatsapp, 0.005),
            ("africastalking", Channel::Sms, 0.8),
        ]
        .into_iter()
        .map(|(provider, channel, rate)| ((provider.to_string(), channel), rate))
        .collect();

        Self {
            rates,
            fallback: 0.05,
        }
    }
}

impl RateTable {
    /// 设置单价
    pub fn with_rate(mut self, provider: &str, channel: Channel, rate: f64) -> Self {
        self.rates.insert((provider.to_string(), channel), rate);
        self
    }

    pub fn rate(&self, provider: &str, channel: Channel) -> f64 {
        self.rates
            .get(&(provider.to_string(), channel))
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// 消息分段数，按 160 字符一段，至少一段
pub fn segment_count(content: &str) -> usize {
    content.chars().count().div_ceil(SMS_SEGMENT_LENGTH).max(1)
}

/// 批量发送服务
///
/// 把批次的收件人分块顺序发送，块之间按批次配置等待，
/// 每块结束后重新计算批次的聚合计数
pub struct BulkMessageService {
    messages: Arc<dyn MessageRepository>,
    batches: Arc<dyn BatchRepository>,
    messenger: Arc<MessengerService>,
    defaults: BulkDefaults,
    rates: RateTable,
}

impl BulkMessageService {
    /// 创建新的批量发送服务
    ///
    /// # 参数
    ///
    /// * `messages` - 消息仓库
    /// * `batches` - 批次仓库
    /// * `messenger` - 单条发送服务
    /// * `defaults` - 批次未指定时使用的默认参数
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        batches: Arc<dyn BatchRepository>,
        messenger: Arc<MessengerService>,
        defaults: BulkDefaults,
    ) -> Self {
        Self {
            messages,
            batches,
            messenger,
            defaults,
            rates: RateTable::default(),
        }
    }

    /// 使用自定义单价表
    pub fn with_rates(mut self, rates: RateTable) -> Self {
        self.rates = rates;
        self
    }

    /// 创建批次并为每个收件人生成一条消息
    ///
    /// 批次变量与收件人变量合并，收件人变量优先。
    /// 定时批次的消息处于 Scheduled 状态，其余处于 Pending 状态
    ///
    /// # 参数
    ///
    /// * `params` - 批次参数
    /// * `recipients` - 收件人列表
    ///
    /// # 返回值
    ///
    /// * `Ok(Batch)` - 创建的批次
    /// * `Err(MessengerError)` - 参数错误或持久化失败
    pub async fn create_batch(
        &self,
        mut params: NewBatch,
        recipients: Vec<Recipient>,
    ) -> Result<Batch, MessengerError> {
        if recipients.is_empty() {
            return Err(MessengerError::Validation(
                "batch must have at least one recipient".to_string(),
            ));
        }
        if params.content.trim().is_empty() {
            return Err(MessengerError::Validation(
                "message content is required".to_string(),
            ));
        }

        let provider = params
            .provider
            .clone()
            .unwrap_or_else(|| self.messenger.default_provider_for(params.channel).to_string());
        self.messenger.resolve_adapter(&provider, params.channel)?;
        params.provider = Some(provider.clone());

        let batch = Batch::new(
            params,
            recipients.len() as i32,
            (
                self.defaults.chunk_size,
                self.defaults.delay_between_batches_secs,
                self.defaults.max_retries,
            ),
        );
        let status = match batch.status {
            BatchStatus::Scheduled => MessageStatus::Scheduled,
            _ => MessageStatus::Pending,
        };
        let country_code = self.messenger.options().default_country_code.clone();

        let mut messages = Vec::with_capacity(recipients.len());
        for (index, recipient) in recipients.iter().enumerate() {
            let to = normalize_e164(&recipient.to, country_code.as_deref()).ok_or_else(|| {
                MessengerError::Validation(format!(
                    "invalid phone number at position {}: {}",
                    index, recipient.to
                ))
            })?;

            let request = SendRequest {
                to,
                message: Some(batch.content.clone()),
                template_id: batch.template_id.clone(),
                variables: batch.merged_variables(recipient),
                provider: Some(provider.clone()),
                channel: batch.channel,
                priority: Priority::Normal,
                scheduled_at: batch.scheduled_at,
                batch_id: Some(batch.id),
            };
            let mut message = Message::new(&provider, &request, status);
            message.created_at = batch.created_at + ChronoDuration::microseconds(index as i64);
            message.metadata = serde_json::json!({ "sequence": index });
            messages.push(message);
        }

        let batch = self.batches.create(&batch).await?;
        self.messages.create_many(&messages).await?;

        info!(
            batch_id = %batch.id,
            name = %batch.name,
            recipients = batch.total_recipients,
            status = %batch.status,
            "Batch created"
        );
        Ok(batch)
    }

    /// 创建批次并立即处理
    ///
    /// 定时批次只创建不处理，由自动化任务在到期后处理
    pub async fn send_bulk_message(
        &self,
        params: NewBatch,
        recipients: Vec<Recipient>,
    ) -> Result<BulkReport, MessengerError> {
        let batch = self.create_batch(params, recipients).await?;
        if batch.status == BatchStatus::Scheduled {
            return Ok(BulkReport {
                batch,
                chunk_sizes: Vec::new(),
                results: Vec::new(),
            });
        }
        self.process_batch(batch.id).await
    }

    /// 处理一个批次
    ///
    /// 分块顺序发送，每块之前（第一块除外）等待批次配置的间隔。
    /// 处理中途出现未处理的错误时批次被标记为失败，错误返回给调用方
    ///
    /// # 参数
    ///
    /// * `id` - 批次ID
    ///
    /// # 返回值
    ///
    /// * `Ok(BulkReport)` - 处理报告
    /// * `Err(MessengerError)` - 状态不允许或处理失败
    pub async fn process_batch(&self, id: Uuid) -> Result<BulkReport, MessengerError> {
        let batch = self
            .update_with_retry(id, |batch| batch.start().map(|_| true))
            .await?;
        info!(batch_id = %id, chunk_size = batch.chunk_size, "Batch processing started");

        let mut chunk_sizes = Vec::new();
        let mut results = Vec::with_capacity(batch.total_recipients.max(0) as usize);

        match self.run_chunks(&batch, &mut chunk_sizes, &mut results).await {
            Ok(()) => {
                self.batches.recompute_counts(id).await?;
                // 处理期间被取消的批次保持取消状态
                let batch = self
                    .update_with_retry(id, |batch| {
                        if batch.status != BatchStatus::Processing {
                            return Ok(false);
                        }
                        batch.complete()?;
                        Ok(true)
                    })
                    .await?;
                info!(
                    batch_id = %id,
                    status = %batch.status,
                    sent = batch.sent_count,
                    failed = batch.failed_count,
                    "Batch processing finished"
                );
                Ok(BulkReport {
                    batch,
                    chunk_sizes,
                    results,
                })
            }
            Err(e) => {
                error!(batch_id = %id, error = %e, "Batch processing failed");
                self.record_batch_failure(id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_chunks(
        &self,
        batch: &Batch,
        chunk_sizes: &mut Vec<usize>,
        results: &mut Vec<RecipientResult>,
    ) -> Result<(), MessengerError> {
        let mut messages = self.messages.find_by_batch(batch.id, None).await?;
        messages.sort_by_key(sequence_of);

        let chunk_size = batch.chunk_size.max(1) as usize;
        let delay = Duration::from_secs(batch.delay_between_batches.max(0) as u64);
        let total_chunks = messages.len().div_ceil(chunk_size);

        for (index, chunk) in messages.chunks(chunk_size).enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.is_cancelled(batch.id).await? {
                info!(batch_id = %batch.id, chunk = index + 1, "Batch cancelled, skipping remaining chunks");
                results.extend(messages[index * chunk_size..].iter().map(RecipientResult::cancelled));
                return Ok(());
            }

            for message in chunk {
                results.push(self.send_one(message.clone()).await?);
            }

            let refreshed = self.batches.recompute_counts(batch.id).await?;
            chunk_sizes.push(chunk.len());
            counter!("bulk_chunks_processed_total").increment(1);
            debug!(
                batch_id = %batch.id,
                chunk = index + 1,
                chunks = total_chunks,
                sent = refreshed.sent_count,
                failed = refreshed.failed_count,
                "Chunk processed"
            );
        }

        Ok(())
    }

    /// 发送批次中的一条消息
    ///
    /// 只有持久化错误会中断整个批次，其余失败记录在收件人结果中
    async fn send_one(&self, message: Message) -> Result<RecipientResult, MessengerError> {
        if !matches!(
            message.status,
            MessageStatus::Pending | MessageStatus::Queued | MessageStatus::Scheduled
        ) {
            return Ok(RecipientResult::from_message(&message));
        }

        let message_id = message.id;
        let recipient = message.recipient.clone();

        match self.messenger.dispatch_stored(message).await {
            Ok(outcome) => Ok(RecipientResult::from_message(&outcome.message)),
            Err(MessengerError::Repository(e)) => Err(MessengerError::Repository(e)),
            Err(MessengerError::InvalidState(_)) => {
                let current = self
                    .messages
                    .find_by_id(message_id)
                    .await?
                    .ok_or_else(|| MessengerError::NotFound(format!("message {}", message_id)))?;
                Ok(RecipientResult::from_message(&current))
            }
            Err(e) => Ok(RecipientResult::failed(message_id, recipient, e.to_string())),
        }
    }

    async fn is_cancelled(&self, id: Uuid) -> Result<bool, MessengerError> {
        Ok(self.load(id).await?.status == BatchStatus::Cancelled)
    }

    async fn record_batch_failure(&self, id: Uuid, error: &MessengerError) {
        let reason = error.to_string();
        let recorded = self
            .update_with_retry(id, |batch| {
                if matches!(
                    batch.status,
                    BatchStatus::Cancelled | BatchStatus::Completed | BatchStatus::Failed
                ) {
                    return Ok(false);
                }
                batch.fail(&reason);
                Ok(true)
            })
            .await;

        match recorded {
            Ok(batch) if batch.status != BatchStatus::Failed => {
                warn!(batch_id = %id, status = %batch.status, "Batch already finished, failure not recorded");
            }
            Ok(_) => {}
            Err(e) => error!(batch_id = %id, error = %e, "Failed to record batch failure"),
        }

        if let Err(e) = self.batches.recompute_counts(id).await {
            error!(batch_id = %id, error = %e, "Failed to recompute batch counts");
        }
    }

    /// 重试批次中所有失败的消息
    ///
    /// 每条消息独立重试，一条失败不影响其他消息
    pub async fn retry_failed_messages(&self, id: Uuid) -> Result<BulkReport, MessengerError> {
        let batch = self
            .update_with_retry(id, |batch| {
                if !matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
                    return Err(DomainError::InvalidStateTransition {
                        from: batch.status.to_string(),
                        action: "retry",
                    });
                }
                batch.current_retry += 1;
                Ok(true)
            })
            .await?;

        let failed = self
            .messages
            .find_by_batch(id, Some(vec![MessageStatus::Failed]))
            .await?;
        info!(
            batch_id = %id,
            failed = failed.len(),
            round = batch.current_retry,
            "Retrying failed batch messages"
        );

        let mut results = Vec::with_capacity(failed.len());
        for message in failed {
            let result = match self.messenger.retry(message.id).await {
                Ok(outcome) => RecipientResult::from_message(&outcome.message),
                Err(e) => {
                    debug!(message_id = %message.id, error = %e, "Batch message retry failed");
                    RecipientResult::failed(message.id, message.recipient.clone(), e.to_string())
                }
            };
            results.push(result);
        }

        let batch = self.batches.recompute_counts(id).await?;
        Ok(BulkReport {
            batch,
            chunk_sizes: Vec::new(),
            results,
        })
    }

    /// 取消批次
    ///
    /// 只允许从 Pending、Processing、Scheduled 取消；尚未发送的消息全部取消
    pub async fn cancel_batch(&self, id: Uuid) -> Result<Batch, MessengerError> {
        self.update_with_retry(id, |batch| batch.cancel().map(|_| true))
            .await?;

        let cancelled = self.messages.cancel_unsent_by_batch(id).await?;
        let batch = self.batches.recompute_counts(id).await?;

        info!(batch_id = %id, cancelled_messages = cancelled, "Batch cancelled");
        Ok(batch)
    }

    /// 获取批次
    pub async fn get_batch(&self, id: Uuid) -> Result<Batch, MessengerError> {
        self.load(id).await
    }

    /// 估算批量发送费用
    ///
    /// 纯计算，没有副作用
    ///
    /// # 参数
    ///
    /// * `provider` - 供应商，为空时使用渠道默认供应商
    /// * `channel` - 渠道
    /// * `content` - 正文
    /// * `recipients` - 收件人数量
    pub fn estimate_bulk_cost(
        &self,
        provider: Option<&str>,
        channel: Channel,
        content: &str,
        recipients: usize,
    ) -> CostEstimate {
        let provider = provider
            .unwrap_or_else(|| self.messenger.default_provider_for(channel))
            .to_string();
        let segments_per_message = segment_count(content);
        let total_segments = segments_per_message * recipients;
        let rate_per_segment = self.rates.rate(&provider, channel);

        CostEstimate {
            estimated_cost: total_segments as f64 * rate_per_segment,
            provider,
            channel,
            recipients,
            segments_per_message,
            total_segments,
            rate_per_segment,
        }
    }

    /// 带乐观锁重试的批次生命周期更新
    ///
    /// 每次尝试都重新读取批次再应用变更，版本冲突时重试；
    /// `change` 返回 `Ok(false)` 表示当前状态无需写入
    async fn update_with_retry<F>(&self, id: Uuid, mut change: F) -> Result<Batch, MessengerError>
    where
        F: FnMut(&mut Batch) -> Result<bool, DomainError> + Send,
    {
        let mut attempt = 1;

        loop {
            let mut batch = self.load(id).await?;
            if !change(&mut batch)? {
                return Ok(batch);
            }

            match self.batches.update(&batch).await {
                Ok(saved) => return Ok(saved),
                Err(RepositoryError::Conflict) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(batch_id = %id, attempt, "Batch version conflict, reloading");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load(&self, id: Uuid) -> Result<Batch, MessengerError> {
        self.batches
            .find_by_id(id)
            .await?
            .ok_or_else(|| MessengerError::NotFound(format!("batch {}", id)))
    }
}

fn sequence_of(message: &Message) -> u64 {
    message
        .metadata
        .get("sequence")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(u64::MAX)
}
