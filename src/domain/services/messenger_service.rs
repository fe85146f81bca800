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

use crate::config::settings::DispatchSettings;
use crate::domain::models::events::MessageEvent;
use crate::domain::models::message::{
    Channel, DomainError, Message, MessageStatus, SendRequest,
};
use crate::domain::models::provider::{Capability, OutboundMessage, SendResult};
use crate::domain::repositories::message_repository::{MessageRepository, RepositoryError};
use crate::domain::services::consent::ConsentChecker;
use crate::domain::services::event_publisher::EventPublisher;
use crate::providers::circuit_breaker::{Admission, CircuitBreaker};
use crate::providers::registry::ProviderRegistry;
use crate::providers::traits::{ProviderAdapter, ProviderError};
use crate::queue::dispatch_queue::{DispatchJob, DispatchQueue};
use crate::utils::phone::normalize_e164;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 乐观锁冲突时的最大尝试次数
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// 发送服务错误
///
/// 每个变体都带有稳定的机器可读错误码，见 [`MessengerError::code`]
#[derive(Error, Debug)]
pub enum MessengerError {
    /// 供应商熔断中
    #[error("Provider {0} is unavailable")]
    ProviderUnavailable(String),

    /// 供应商配置或传输错误
    #[error("Provider error: {source}")]
    Provider {
        /// 已创建的消息ID
        message_id: Option<Uuid>,
        source: ProviderError,
    },

    /// 供应商拒绝发送
    #[error("Send failed: {}", .result.error_message.as_deref().unwrap_or("rejected by provider"))]
    SendFailed {
        /// 消息ID
        message_id: Uuid,
        /// 供应商返回的结果
        result: Box<SendResult>,
    },

    /// 非法状态转换
    #[error(transparent)]
    InvalidState(#[from] DomainError),

    /// 记录不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 收件人未同意
    #[error("Recipient {0} has not consented to receive messages")]
    ConsentRequired(String),

    /// 请求参数错误
    #[error("Validation error: {0}")]
    Validation(String),

    /// 持久化错误
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ProviderError> for MessengerError {
    fn from(source: ProviderError) -> Self {
        MessengerError::Provider {
            message_id: None,
            source,
        }
    }
}

impl MessengerError {
    /// 机器可读的错误码
    pub fn code(&self) -> &'static str {
        match self {
            MessengerError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            MessengerError::Provider { source, .. } if source.is_configuration() => {
                "CONFIGURATION_ERROR"
            }
            MessengerError::Provider { .. } => "PROVIDER_ERROR",
            MessengerError::SendFailed { .. } => "SEND_FAILED",
            MessengerError::InvalidState(DomainError::ValidationError(_)) => "VALIDATION_ERROR",
            MessengerError::InvalidState(_) => "INVALID_STATE",
            MessengerError::NotFound(_) => "NOT_FOUND",
            MessengerError::ConsentRequired(_) => "CONSENT_REQUIRED",
            MessengerError::Validation(_) => "VALIDATION_ERROR",
            MessengerError::Repository(RepositoryError::NotFound) => "NOT_FOUND",
            MessengerError::Repository(_) => "REPOSITORY_ERROR",
        }
    }

    /// 涉及的消息ID（如果已经创建了消息）
    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            MessengerError::Provider { message_id, .. } => *message_id,
            MessengerError::SendFailed { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// 发送结果：持久化后的消息加供应商结果
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub result: SendResult,
}

/// 单条发送选项
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// 默认供应商
    pub default_provider: String,
    /// WhatsApp 默认供应商
    pub default_whatsapp_provider: Option<String>,
    /// 单次供应商调用超时
    pub send_timeout: Duration,
    /// 未指定供应商时是否允许回退
    pub fallback_enabled: bool,
    /// 默认国家码
    pub default_country_code: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            default_provider: "mocktest".to_string(),
            default_whatsapp_provider: None,
            send_timeout: Duration::from_secs(30),
            fallback_enabled: true,
            default_country_code: None,
        }
    }
}

impl From<&DispatchSettings> for DispatchOptions {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            default_provider: settings.default_provider.clone(),
            default_whatsapp_provider: settings.default_whatsapp_provider.clone(),
            send_timeout: settings.send_timeout(),
            fallback_enabled: settings.fallback_enabled,
            default_country_code: settings.default_country_code.clone(),
        }
    }
}

/// 消息发送服务
///
/// 负责单条消息的发送、排队、定时、重试和取消。
/// 每次供应商调用前都经过熔断器检查，调用结果反馈给熔断器
pub struct MessengerService {
    messages: Arc<dyn MessageRepository>,
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<dyn DispatchQueue>,
    events: Arc<dyn EventPublisher>,
    consent: Option<Arc<dyn ConsentChecker>>,
    options: DispatchOptions,
}

impl MessengerService {
    /// 创建新的发送服务
    ///
    /// # 参数
    ///
    /// * `messages` - 消息仓库
    /// * `registry` - 供应商注册表
    /// * `breaker` - 熔断器
    /// * `queue` - 调度队列
    /// * `events` - 事件发布器
    /// * `options` - 发送选项
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<dyn DispatchQueue>,
        events: Arc<dyn EventPublisher>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            messages,
            registry,
            breaker,
            queue,
            events,
            consent: None,
            options,
        }
    }

    /// 设置同意检查器
    pub fn with_consent_checker(mut self, checker: Arc<dyn ConsentChecker>) -> Self {
        self.consent = Some(checker);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// 渠道的默认供应商
    pub fn default_provider_for(&self, channel: Channel) -> &str {
        match channel {
            Channel::Whatsapp => self
                .options
                .default_whatsapp_provider
                .as_deref()
                .unwrap_or(&self.options.default_provider),
            Channel::Sms => &self.options.default_provider,
        }
    }

    /// 立即发送一条消息
    ///
    /// 熔断器打开时快速失败且不创建消息记录。
    /// 供应商拒绝或传输失败时消息被标记为失败，错误返回给调用方
    ///
    /// # 参数
    ///
    /// * `request` - 发送请求
    ///
    /// # 返回值
    ///
    /// * `Ok(SendOutcome)` - 供应商已接受
    /// * `Err(MessengerError)` - 带错误码的失败
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, MessengerError> {
        let request = self.prepare(request)?;
        self.check_consent(&request.to, request.channel).await?;
        let (provider, adapter, admission) = self.select_provider(&request).await?;

        let message = Message::new(&provider, &request, MessageStatus::Pending);
        let message = match self.messages.create(&message).await {
            Ok(message) => message,
            Err(e) => {
                self.breaker.release_trial(&provider, admission).await;
                return Err(e.into());
            }
        };
        debug!(message_id = %message.id, provider = %provider, "Message created");

        self.deliver(message, adapter, admission).await
    }

    /// 排队发送一条消息
    ///
    /// # 参数
    ///
    /// * `request` - 发送请求
    /// * `delay` - 可选的延迟
    ///
    /// # 返回值
    ///
    /// 返回状态为 Queued 的消息
    pub async fn queue(
        &self,
        request: SendRequest,
        delay: Option<Duration>,
    ) -> Result<Message, MessengerError> {
        let request = self.prepare(request)?;
        self.check_consent(&request.to, request.channel).await?;
        let provider = self.resolve_provider_name(&request);
        self.resolve_adapter(&provider, request.channel)?;

        let message = Message::new(&provider, &request, MessageStatus::Queued);
        let message = self.messages.create(&message).await?;
        self.enqueue(&message, delay).await;

        info!(message_id = %message.id, priority = %message.priority, "Message queued");
        Ok(message)
    }

    /// 定时发送一条消息
    ///
    /// # 参数
    ///
    /// * `request` - 发送请求
    /// * `at` - 发送时间，必须晚于当前时间
    pub async fn schedule(
        &self,
        mut request: SendRequest,
        at: DateTime<Utc>,
    ) -> Result<Message, MessengerError> {
        let now = Utc::now();
        if at <= now {
            return Err(MessengerError::Validation(
                "scheduled_at must be in the future".to_string(),
            ));
        }
        request.scheduled_at = Some(at);
        let request = self.prepare(request)?;
        self.check_consent(&request.to, request.channel).await?;
        let provider = self.resolve_provider_name(&request);
        self.resolve_adapter(&provider, request.channel)?;

        let message = Message::new(&provider, &request, MessageStatus::Scheduled);
        let message = self.messages.create(&message).await?;
        let delay = (at - now).to_std().unwrap_or_default();
        self.enqueue(&message, Some(delay)).await;

        info!(message_id = %message.id, scheduled_at = %at, "Message scheduled");
        Ok(message)
    }

    /// 发送一条已经持久化的消息（队列工作者入口）
    ///
    /// 执行前重新检查状态：已取消或已发送的消息被跳过
    ///
    /// # 返回值
    ///
    /// * `Ok(Some(SendOutcome))` - 已发送
    /// * `Ok(None)` - 消息不再处于可发送状态
    pub async fn send_existing(&self, id: Uuid) -> Result<Option<SendOutcome>, MessengerError> {
        let message = self.load(id).await?;
        if !is_dispatchable(message.status) {
            debug!(message_id = %id, status = %message.status, "Skipping message no longer dispatchable");
            return Ok(None);
        }

        match self.dispatch_stored(message).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(MessengerError::InvalidState(e)) => {
                debug!(message_id = %id, error = %e, "Message changed state before dispatch");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 直接发送一条已持久化的消息，不经过队列
    ///
    /// 批量发送使用该入口。供应商不可用、未同意或配置错误时消息被标记为失败
    pub async fn dispatch_stored(&self, message: Message) -> Result<SendOutcome, MessengerError> {
        if !is_dispatchable(message.status) {
            return Err(not_dispatchable(message.status));
        }

        if let Err(e) = self.check_consent(&message.recipient, message.channel).await {
            self.fail_message(message, Some(e.code().to_string()), e.to_string())
                .await;
            return Err(e);
        }

        let adapter = match self.resolve_adapter(&message.provider, message.channel) {
            Ok(adapter) => adapter,
            Err(e) => {
                let e = attach_message_id(e, message.id);
                self.fail_message(message, Some(e.code().to_string()), e.to_string())
                    .await;
                return Err(e);
            }
        };

        let admission = self.breaker.admit(&message.provider).await;
        if !admission.is_allowed() {
            let e = MessengerError::ProviderUnavailable(message.provider.clone());
            counter!("messages_rejected_total", "provider" => message.provider.clone(), "reason" => "circuit_open")
                .increment(1);
            self.fail_message(message, Some(e.code().to_string()), e.to_string())
                .await;
            return Err(e);
        }

        self.deliver(message, adapter, admission).await
    }

    /// 重试一条失败的消息
    ///
    /// 只允许从 Failed 状态重试；被拒绝的重试不会增加重试次数
    pub async fn retry(&self, id: Uuid) -> Result<SendOutcome, MessengerError> {
        let message = self.load(id).await?;
        let message = self
            .update_with_retry(message, |m| m.reset_for_retry(MessageStatus::Pending))
            .await?;
        info!(message_id = %id, retry_count = message.retry_count, "Retrying message");

        self.dispatch_stored(message).await
    }

    /// 将失败的消息重新排队
    ///
    /// # 参数
    ///
    /// * `id` - 消息ID
    /// * `delay` - 退避延迟
    pub async fn requeue_failed(
        &self,
        id: Uuid,
        delay: Option<Duration>,
    ) -> Result<Message, MessengerError> {
        let message = self.load(id).await?;
        let message = self
            .update_with_retry(message, |m| m.reset_for_retry(MessageStatus::Queued))
            .await?;
        self.enqueue(&message, delay).await;

        info!(
            message_id = %id,
            retry_count = message.retry_count,
            delay_secs = delay.map(|d| d.as_secs()).unwrap_or(0),
            "Failed message requeued"
        );
        Ok(message)
    }

    /// 取消一条消息
    ///
    /// 只允许取消定时或排队中的消息
    pub async fn cancel(&self, id: Uuid) -> Result<Message, MessengerError> {
        let message = self.load(id).await?;
        let message = self.update_with_retry(message, |m| m.cancel()).await?;
        info!(message_id = %id, "Message cancelled");
        Ok(message)
    }

    /// 将定时消息激活并交给队列
    pub async fn activate_scheduled(&self, message: Message) -> Result<Message, MessengerError> {
        let message = self.update_with_retry(message, |m| m.activate()).await?;
        self.enqueue(&message, None).await;
        Ok(message)
    }

    /// 获取消息
    pub async fn get_message(&self, id: Uuid) -> Result<Message, MessengerError> {
        self.load(id).await
    }

    async fn load(&self, id: Uuid) -> Result<Message, MessengerError> {
        self.messages
            .find_by_id(id)
            .await?
            .ok_or_else(|| MessengerError::NotFound(format!("message {}", id)))
    }

    async fn enqueue(&self, message: &Message, delay: Option<Duration>) {
        let job = DispatchJob {
            message_id: message.id,
            priority: message.priority,
        };
        if let Err(e) = self.queue.enqueue(job, delay).await {
            // The automation sweep picks up persisted scheduled messages later
            error!(message_id = %message.id, error = %e, "Failed to enqueue message");
        }
    }

    fn prepare(&self, mut request: SendRequest) -> Result<SendRequest, MessengerError> {
        request.to = normalize_e164(&request.to, self.options.default_country_code.as_deref())
            .ok_or_else(|| {
                MessengerError::Validation(format!("invalid phone number: {}", request.to))
            })?;

        match request.message.as_deref() {
            Some(body) if !body.trim().is_empty() => Ok(request),
            _ => Err(MessengerError::Validation(
                "message content is required".to_string(),
            )),
        }
    }

    async fn check_consent(&self, recipient: &str, channel: Channel) -> Result<(), MessengerError> {
        let Some(checker) = &self.consent else {
            return Ok(());
        };

        match checker.has_consent(recipient, channel).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                counter!("messages_rejected_total", "reason" => "consent").increment(1);
                Err(MessengerError::ConsentRequired(recipient.to_string()))
            }
            Err(e) => {
                warn!(recipient = %recipient, error = %e, "Consent check failed");
                Err(MessengerError::ConsentRequired(recipient.to_string()))
            }
        }
    }

    fn resolve_provider_name(&self, request: &SendRequest) -> String {
        request
            .provider
            .clone()
            .unwrap_or_else(|| self.default_provider_for(request.channel).to_string())
    }

    pub fn resolve_adapter(
        &self,
        provider: &str,
        channel: Channel,
    ) -> Result<Arc<dyn ProviderAdapter>, MessengerError> {
        let adapter = self.registry.make(provider)?;
        if !adapter.definition().supports(Capability::from(channel)) {
            return Err(MessengerError::Validation(format!(
                "provider {} does not support {}",
                provider, channel
            )));
        }
        Ok(adapter)
    }

    /// 选择可用的供应商
    ///
    /// 显式指定的供应商从不回退；未指定时默认供应商熔断则尝试其他支持该渠道的供应商
    async fn select_provider(
        &self,
        request: &SendRequest,
    ) -> Result<(String, Arc<dyn ProviderAdapter>, Admission), MessengerError> {
        let primary = self.resolve_provider_name(request);
        let adapter = self.resolve_adapter(&primary, request.channel)?;

        let admission = self.breaker.admit(&primary).await;
        if admission.is_allowed() {
            return Ok((primary, adapter, admission));
        }

        counter!("messages_rejected_total", "provider" => primary.clone(), "reason" => "circuit_open")
            .increment(1);

        if request.provider.is_none() && self.options.fallback_enabled {
            for candidate in self.registry.providers_for(request.channel) {
                if candidate == primary {
                    continue;
                }
                let Ok(adapter) = self.resolve_adapter(candidate, request.channel) else {
                    continue;
                };
                let admission = self.breaker.admit(candidate).await;
                if admission.is_allowed() {
                    info!(from = %primary, to = %candidate, "Falling back to alternate provider");
                    return Ok((candidate.to_string(), adapter, admission));
                }
            }
        }

        warn!(provider = %primary, recipient = %request.to, "Provider unavailable, failing fast");
        Err(MessengerError::ProviderUnavailable(primary))
    }

    async fn deliver(
        &self,
        message: Message,
        adapter: Arc<dyn ProviderAdapter>,
        admission: Admission,
    ) -> Result<SendOutcome, MessengerError> {
        let provider = message.provider.clone();
        let marked = self
            .update_with_retry(message, |m| {
                if m.status.is_cancellable() {
                    m.activate()?;
                }
                m.mark_sending()
            })
            .await;
        let message = match marked {
            Ok(message) => message,
            Err(e) => {
                // the provider was never called
                self.breaker.release_trial(&provider, admission).await;
                return Err(e);
            }
        };

        let outbound = OutboundMessage {
            message_id: Some(message.id),
            to: message.recipient.clone(),
            content: message.content.clone(),
            channel: message.channel,
            template_id: message.template_id.clone(),
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.options.send_timeout, adapter.send(&outbound))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        histogram!("provider_send_duration_seconds", "provider" => provider.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) if result.success => {
                self.breaker.record_success(&provider).await;
                let sent_at = result.sent_at.unwrap_or_else(Utc::now);
                let saved = self
                    .update_with_retry(message, |m| {
                        m.mark_sent(
                            result.status,
                            result.provider_message_id.clone(),
                            result.cost,
                            sent_at,
                        );
                        Ok(())
                    })
                    .await?;

                counter!("messages_sent_total", "provider" => provider.clone(), "channel" => saved.channel.to_string())
                    .increment(1);
                info!(
                    message_id = %saved.id,
                    provider = %provider,
                    provider_message_id = ?saved.provider_message_id,
                    "Message sent"
                );
                self.events
                    .publish(MessageEvent::MessageSent {
                        message_id: saved.id,
                        provider: provider.clone(),
                        provider_message_id: saved.provider_message_id.clone(),
                        at: sent_at,
                    })
                    .await;

                Ok(SendOutcome {
                    message: saved,
                    result,
                })
            }
            Ok(result) => {
                self.breaker.record_failure(&provider).await;
                warn!(
                    message_id = %message.id,
                    provider = %provider,
                    recipient = %message.recipient,
                    error_code = ?result.error_code,
                    error_message = ?result.error_message,
                    "Provider rejected message"
                );
                let message_id = message.id;
                let reason = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "rejected by provider".to_string());
                self.fail_message(message, result.error_code.clone(), reason)
                    .await;

                Err(MessengerError::SendFailed {
                    message_id,
                    result: Box::new(result),
                })
            }
            Err(e) => {
                self.breaker.record_failure(&provider).await;
                error!(
                    message_id = %message.id,
                    provider = %provider,
                    recipient = %message.recipient,
                    error = %e,
                    "Transport fault while sending"
                );
                let message_id = message.id;
                let code = match e {
                    ProviderError::Timeout => "TIMEOUT",
                    _ => "TRANSPORT_ERROR",
                };
                self.fail_message(message, Some(code.to_string()), e.to_string())
                    .await;

                Err(MessengerError::Provider {
                    message_id: Some(message_id),
                    source: e,
                })
            }
        }
    }

    /// 将消息标记为失败并发布事件，持久化失败只记录日志
    async fn fail_message(&self, message: Message, error_code: Option<String>, reason: String) {
        let message_id = message.id;
        let result = self
            .update_with_retry(message, |m| {
                if m.status.is_terminal() {
                    return Err(transition_error(m.status, "fail"));
                }
                m.mark_failed(error_code.clone(), reason.clone());
                Ok(())
            })
            .await;

        match result {
            Ok(saved) => {
                counter!("messages_failed_total", "provider" => saved.provider.clone()).increment(1);
                self.events
                    .publish(MessageEvent::MessageFailed {
                        message_id: saved.id,
                        provider: saved.provider.clone(),
                        error_code: saved.error_code.clone(),
                        error_message: saved.error_message.clone(),
                        at: saved.failed_at.unwrap_or_else(Utc::now),
                    })
                    .await;
            }
            Err(MessengerError::InvalidState(_)) => {
                debug!(message_id = %message_id, "Message already terminal, failure not recorded");
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Failed to persist message failure");
            }
        }
    }

    /// 带乐观锁重试的更新
    ///
    /// 版本冲突时重新读取最新记录并重新应用变更
    async fn update_with_retry<F>(
        &self,
        message: Message,
        mut change: F,
    ) -> Result<Message, MessengerError>
    where
        F: FnMut(&mut Message) -> Result<(), DomainError> + Send,
    {
        let id = message.id;
        let mut current = message;
        let mut attempt = 1;

        loop {
            let mut next = current.clone();
            change(&mut next)?;

            match self.messages.update(&next).await {
                Ok(saved) => return Ok(saved),
                Err(RepositoryError::Conflict) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(message_id = %id, attempt, "Version conflict, reloading message");
                    attempt += 1;
                    current = self.load(id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_dispatchable(status: MessageStatus) -> bool {
    matches!(
        status,
        MessageStatus::Pending | MessageStatus::Queued | MessageStatus::Scheduled
    )
}

fn transition_error(status: MessageStatus, action: &'static str) -> DomainError {
    DomainError::InvalidStateTransition {
        from: status.to_string(),
        action,
    }
}

fn not_dispatchable(status: MessageStatus) -> MessengerError {
    MessengerError::InvalidState(transition_error(status, "send"))
}

fn attach_message_id(error: MessengerError, id: Uuid) -> MessengerError {
    match error {
        MessengerError::Provider { source, .. } => MessengerError::Provider {
            message_id: Some(id),
            source,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::message_repository::ProviderStats;
    use crate::infrastructure::cache::kv_store::InMemoryKeyValueStore;
    use crate::infrastructure::services::event_bus::BroadcastEventBus;
    use crate::providers::circuit_breaker::{CircuitConfig, Status};
    use crate::providers::mock_provider::MockProvider;
    use crate::queue::dispatch_queue::InMemoryDispatchQueue;
    use async_trait::async_trait;
    use mockall::mock;
    use sea_orm::DbErr;
    use std::collections::HashMap;

    mock! {
        pub MessageRepo {}
        #[async_trait]
        impl MessageRepository for MessageRepo {
            async fn create(&self, message: &Message) -> Result<Message, RepositoryError>;
            async fn create_many(&self, messages: &[Message]) -> Result<(), RepositoryError>;
            async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, RepositoryError>;
            async fn find_by_provider_message_id(&self, provider: &str, provider_message_id: &str) -> Result<Option<Message>, RepositoryError>;
            async fn update(&self, message: &Message) -> Result<Message, RepositoryError>;
            async fn find_by_batch(&self, batch_id: Uuid, statuses: Option<Vec<MessageStatus>>) -> Result<Vec<Message>, RepositoryError>;
            async fn cancel_unsent_by_batch(&self, batch_id: Uuid) -> Result<u64, RepositoryError>;
            async fn find_due_scheduled(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Message>, RepositoryError>;
            async fn find_failed_since(&self, since: DateTime<Utc>, max_retries: i32, limit: u64) -> Result<Vec<Message>, RepositoryError>;
            async fn count_by_status(&self, status: MessageStatus) -> Result<u64, RepositoryError>;
            async fn provider_stats(&self, since: DateTime<Utc>) -> Result<Vec<ProviderStats>, RepositoryError>;
        }
    }

    mock! {
        pub Consent {}
        #[async_trait]
        impl ConsentChecker for Consent {
            async fn has_consent(&self, recipient: &str, channel: Channel) -> anyhow::Result<bool>;
        }
    }

    fn service(repo: MockMessageRepo, mock: Arc<MockProvider>) -> MessengerService {
        service_with(repo, mock, CircuitConfig::default())
    }

    fn service_with(
        repo: MockMessageRepo,
        mock: Arc<MockProvider>,
        circuit: CircuitConfig,
    ) -> MessengerService {
        let registry = Arc::new(ProviderRegistry::new(
            HashMap::new(),
            Duration::from_secs(5),
        ));
        registry.register_instance(mock);
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(InMemoryKeyValueStore::new()),
            circuit,
        ));

        MessengerService::new(
            Arc::new(repo),
            registry,
            breaker,
            Arc::new(InMemoryDispatchQueue::new()),
            Arc::new(BroadcastEventBus::default()),
            DispatchOptions::default(),
        )
    }

    fn request() -> SendRequest {
        SendRequest {
            to: "+15550001111".to_string(),
            message: Some("hello".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_consent_denied_creates_no_record() {
        let mut repo = MockMessageRepo::new();
        repo.expect_create().times(0);

        let mut consent = MockConsent::new();
        consent
            .expect_has_consent()
            .times(1)
            .returning(|_, _| Ok(false));

        let mock = Arc::new(MockProvider::default());
        let service = service(repo, mock.clone()).with_consent_checker(Arc::new(consent));

        let err = service.send(request()).await.unwrap_err();
        assert_eq!(err.code(), "CONSENT_REQUIRED");
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_record() {
        let mut repo = MockMessageRepo::new();
        repo.expect_create().times(0);

        let mock = Arc::new(MockProvider::default());
        let service = service(repo, mock.clone());
        service.breaker().force_open("mocktest").await;

        let err = service
            .send(SendRequest {
                provider: Some("mocktest".to_string()),
                ..request()
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");
        assert_eq!(mock.calls(), 0);
    }

    /// 熔断器打开且已过超时时间，下一次调用就是半开试探
    async fn half_open_ready(service: &MessengerService) {
        service.breaker().force_open("mocktest").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn short_open_timeout() -> CircuitConfig {
        CircuitConfig {
            open_timeout: Duration::from_millis(10),
            ..CircuitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_trial_returned_when_message_cancelled_before_send() {
        let stored = Message::new("mocktest", &request(), MessageStatus::Queued);
        let cancelled = Message {
            status: MessageStatus::Cancelled,
            version: 1,
            ..stored.clone()
        };

        let mut repo = MockMessageRepo::new();
        repo.expect_update()
            .times(1)
            .returning(|_| Err(RepositoryError::Conflict));
        repo.expect_find_by_id()
            .returning(move |_| Ok(Some(cancelled.clone())));

        let mock = Arc::new(MockProvider::default());
        let service = service_with(repo, mock.clone(), short_open_timeout());
        half_open_ready(&service).await;

        let err = service.dispatch_stored(stored).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(mock.calls(), 0);

        assert_eq!(service.breaker().state("mocktest").await.status, Status::Open);
        assert!(service.breaker().is_available("mocktest").await);
    }

    #[tokio::test]
    async fn test_trial_returned_when_record_cannot_be_created() {
        let mut repo = MockMessageRepo::new();
        repo.expect_create()
            .times(1)
            .returning(|_| Err(RepositoryError::Database(DbErr::Custom("disk full".into()))));

        let mock = Arc::new(MockProvider::default());
        let service = service_with(repo, mock.clone(), short_open_timeout());
        half_open_ready(&service).await;

        let err = service
            .send(SendRequest {
                provider: Some("mocktest".to_string()),
                ..request()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REPOSITORY_ERROR");
        assert_eq!(mock.calls(), 0);

        assert_eq!(service.breaker().state("mocktest").await.status, Status::Open);
        assert!(service.breaker().is_available("mocktest").await);
    }

    #[tokio::test]
    async fn test_invalid_phone_is_rejected() {
        let mut repo = MockMessageRepo::new();
        repo.expect_create().times(0);
        let service = service(repo, Arc::new(MockProvider::default()));

        let err = service
            .send(SendRequest {
                to: "not-a-number".to_string(),
                ..request()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_update_retries_on_version_conflict() {
        let stored = Message::new("mocktest", &request(), MessageStatus::Queued);
        let reloaded = Message {
            version: 1,
            ..stored.clone()
        };

        let mut repo = MockMessageRepo::new();
        let mut attempts = 0;
        repo.expect_update().times(2).returning(move |m| {
            attempts += 1;
            if attempts == 1 {
                Err(RepositoryError::Conflict)
            } else {
                Ok(Message {
                    version: m.version + 1,
                    ..m.clone()
                })
            }
        });
        let stored_clone = stored.clone();
        repo.expect_find_by_id()
            .returning(move |_| Ok(Some(reloaded.clone())));

        let service = service(repo, Arc::new(MockProvider::default()));
        let cancelled = service
            .update_with_retry(stored_clone, |m| m.cancel())
            .await
            .unwrap();

        assert_eq!(cancelled.status, MessageStatus::Cancelled);
        assert_eq!(cancelled.version, 2);
        assert_eq!(stored.status, MessageStatus::Queued);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MessengerError::from(ProviderError::Configuration("x".into())).code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(
            MessengerError::from(ProviderError::Timeout).code(),
            "PROVIDER_ERROR"
        );
        assert_eq!(
            MessengerError::Repository(RepositoryError::NotFound).code(),
            "NOT_FOUND"
        );
    }
}
