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

use crate::domain::models::message::Channel;
use crate::domain::models::provider::{
    CanonicalWebhookEvent, Capability, OutboundMessage, ProviderDefinition, SendResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// 供应商错误类型
///
/// 只表示“无法与供应商通信”或“无法构造供应商”，
/// 供应商明确拒绝的情况通过 `SendResult.success = false` 表示
#[derive(Error, Debug)]
pub enum ProviderError {
    /// 传输失败
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// 超时
    #[error("Timeout")]
    Timeout,
    /// 供应商未注册
    #[error("Provider not registered: {0}")]
    NotRegistered(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 响应格式错误
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    /// 回调负载无法解析
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

impl ProviderError {
    /// 判断错误是否可重试
    ///
    /// # 返回值
    ///
    /// 如果错误是可重试的则返回true，否则返回false
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            ProviderError::Timeout => true,
            ProviderError::MalformedResponse(_) => true,
            _ => false,
        }
    }

    /// 是否为配置类错误
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProviderError::NotRegistered(_) | ProviderError::Configuration(_)
        )
    }
}

/// 收到的回调请求
#[derive(Debug, Clone, Default)]
pub struct InboundWebhook {
    /// 解析后的负载（表单字段或JSON）
    pub payload: serde_json::Value,
    /// 原始请求体
    pub raw_body: Option<String>,
    /// 请求头（小写键）
    pub headers: HashMap<String, String>,
    /// 供应商回调时使用的完整URL
    pub url: Option<String>,
}

impl InboundWebhook {
    /// 从JSON负载构造
    pub fn from_json(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// 获取请求头（大小写不敏感）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// 用于签名的请求体：优先使用原始请求体
    pub fn signed_body(&self) -> String {
        self.raw_body
            .clone()
            .unwrap_or_else(|| self.payload.to_string())
    }

    /// 读取字符串字段
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// 供应商适配器特质
///
/// 把一个外部短信/WhatsApp供应商的差异（号码格式、签名方案、状态词汇）
/// 隔离在统一接口之后
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// 静态定义
    fn definition(&self) -> &'static ProviderDefinition;

    /// 供应商名称
    fn name(&self) -> &'static str {
        self.definition().name
    }

    /// 发送一条消息
    ///
    /// 供应商明确拒绝时返回 `Ok(SendResult { success: false, .. })`，
    /// 只有传输层故障返回 `Err`
    async fn send(&self, message: &OutboundMessage) -> Result<SendResult, ProviderError>;

    /// 批量发送
    ///
    /// 默认逐条调用 `send`；结果顺序与输入一致，单条传输失败记为拒绝结果
    async fn send_bulk(
        &self,
        messages: &[OutboundMessage],
    ) -> Result<Vec<SendResult>, ProviderError> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            match self.send(message).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(provider = self.name(), recipient = %message.to, "Bulk send item failed: {}", e);
                    results.push(SendResult::rejected(
                        self.name(),
                        "TRANSPORT_ERROR",
                        e.to_string(),
                    ));
                }
            }
        }
        Ok(results)
    }

    /// 查询余额，失败时返回错误
    async fn fetch_balance(&self) -> Result<f64, ProviderError>;

    /// 查询余额
    ///
    /// 仅供参考，任何失败都返回 0.0 而不是错误
    async fn get_balance(&self) -> f64 {
        match self.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(provider = self.name(), "Balance check failed: {}", e);
                0.0
            }
        }
    }

    /// 签名所在的请求头名称
    fn signature_header(&self) -> &'static str;

    /// 验证回调签名
    ///
    /// 缺少签名或验证材料时必须返回 false，不能视为通过
    fn verify_webhook(&self, webhook: &InboundWebhook, signature: Option<&str>) -> bool;

    /// 将回调负载映射为规范化事件
    ///
    /// 纯函数，无副作用，无网络调用；无法识别的状态映射为 Unknown
    fn process_webhook(
        &self,
        payload: &serde_json::Value,
    ) -> Result<CanonicalWebhookEvent, ProviderError>;

    /// 支持的渠道
    fn supported_types(&self) -> Vec<Channel> {
        let definition = self.definition();
        [Channel::Sms, Channel::Whatsapp]
            .into_iter()
            .filter(|channel| definition.supports(Capability::from(*channel)))
            .collect()
    }

    /// 单次请求的最大收件人数
    fn max_recipients(&self) -> usize {
        1
    }

    /// 轻量存活探测
    async fn is_healthy(&self) -> bool {
        self.fetch_balance().await.is_ok()
    }
}
