// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::message::{Channel, MessageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 供应商能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Sms,
    Whatsapp,
    Otp,
    BulkMessaging,
    DeliveryReports,
}

impl From<Channel> for Capability {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Sms => Capability::Sms,
            Channel::Whatsapp => Capability::Whatsapp,
        }
    }
}

/// 供应商静态定义
///
/// 每个适配器一份，注册表据此做能力发现和配置校验，运行时不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDefinition {
    /// 供应商名称
    pub name: &'static str,
    /// 显示名称
    pub display_name: &'static str,
    /// 能力集合
    pub capabilities: &'static [Capability],
    /// 必需配置项
    pub required_config: &'static [&'static str],
    /// 可选配置项
    pub optional_config: &'static [&'static str],
}

impl ProviderDefinition {
    /// 是否具备某项能力
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// 外发消息
///
/// 适配器发送时接收的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// 本地消息ID
    pub message_id: Option<uuid::Uuid>,
    /// 收件人
    pub to: String,
    /// 正文
    pub content: String,
    /// 渠道
    pub channel: Channel,
    /// 模板引用
    pub template_id: Option<String>,
}

/// 发送结果
///
/// 供应商明确拒绝（余额不足、号码无效等）以 `success = false` 表示，而不是错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub status: MessageStatus,
    /// 供应商名称
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub cost: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl SendResult {
    /// 构造成功结果
    pub fn sent(provider: &str, provider_message_id: String, cost: Option<f64>) -> Self {
        Self {
            success: true,
            status: MessageStatus::Sent,
            provider: provider.to_string(),
            provider_message_id: Some(provider_message_id),
            cost,
            error_code: None,
            error_message: None,
            metadata: HashMap::new(),
            sent_at: Some(Utc::now()),
        }
    }

    /// 构造供应商拒绝结果
    pub fn rejected(provider: &str, error_code: &str, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: MessageStatus::Failed,
            provider: provider.to_string(),
            provider_message_id: None,
            cost: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.into()),
            metadata: HashMap::new(),
            sent_at: None,
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }
}

/// 规范化的回调事件
///
/// 由各适配器的纯映射函数产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalWebhookEvent {
    /// 供应商消息ID
    pub provider_message_id: String,
    /// 规范化状态
    pub status: MessageStatus,
    /// 送达时间
    pub delivered_at: Option<DateTime<Utc>>,
    /// 是否为已读回执
    pub read: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}
