// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::traits::{InboundWebhook, ProviderAdapter, ProviderError};
use crate::domain::models::message::MessageStatus;
use crate::domain::models::provider::{
    CanonicalWebhookEvent, Capability, OutboundMessage, ProviderDefinition, SendResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// 签名请求头
pub const MOCK_SIGNATURE_HEADER: &str = "x-mock-signature";

pub static DEFINITION: ProviderDefinition = ProviderDefinition {
    name: "mocktest",
    display_name: "Mock Test Provider",
    capabilities: &[
        Capability::Sms,
        Capability::Whatsapp,
        Capability::Otp,
        Capability::BulkMessaging,
        Capability::DeliveryReports,
    ],
    required_config: &[],
    optional_config: &["cost", "balance", "mode", "webhook_secret"],
};

/// 模拟供应商的行为模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// 总是成功
    #[default]
    Succeed,
    /// 供应商拒绝
    Reject,
    /// 传输故障
    TransportFault,
}

impl std::str::FromStr for MockMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeed" => Ok(MockMode::Succeed),
            "reject" => Ok(MockMode::Reject),
            "transport_fault" => Ok(MockMode::TransportFault),
            _ => Err(()),
        }
    }
}

/// 进程内模拟供应商
///
/// 用于开发和测试；行为模式可以在运行时切换
pub struct MockProvider {
    cost: f64,
    balance: f64,
    webhook_secret: Option<String>,
    mode: RwLock<MockMode>,
    calls: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(0.10)
    }
}

impl MockProvider {
    /// 创建新的模拟供应商
    pub fn new(cost: f64) -> Self {
        Self {
            cost,
            balance: 100.0,
            webhook_secret: None,
            mode: RwLock::new(MockMode::Succeed),
            calls: AtomicUsize::new(0),
        }
    }

    /// 从配置创建
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self, ProviderError> {
        let parse = |key: &str, default: f64| -> Result<f64, ProviderError> {
            match config.get(key) {
                Some(value) => value.parse().map_err(|_| {
                    ProviderError::Configuration(format!("mocktest.{} must be a number", key))
                }),
                None => Ok(default),
            }
        };

        let mut provider = Self::new(parse("cost", 0.10)?);
        provider.balance = parse("balance", 100.0)?;
        provider.webhook_secret = config.get("webhook_secret").cloned();
        if let Some(mode) = config.get("mode") {
            let mode = mode.parse().map_err(|_| {
                ProviderError::Configuration(format!("unknown mocktest.mode '{}'", mode))
            })?;
            *provider.mode.write() = mode;
        }
        Ok(provider)
    }

    pub fn with_webhook_secret(mut self, secret: &str) -> Self {
        self.webhook_secret = Some(secret.to_string());
        self
    }

    /// 切换行为模式
    pub fn set_mode(&self, mode: MockMode) {
        *self.mode.write() = mode;
    }

    /// `send` 被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 计算回调签名（十六进制 HMAC-SHA256）
    pub fn sign(secret: &str, body: &str) -> String {
        match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mut mac) => {
                mac.update(body.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Err(_) => String::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn definition(&self) -> &'static ProviderDefinition {
        &DEFINITION
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match *self.mode.read() {
            MockMode::Succeed => Ok(SendResult::sent(
                DEFINITION.name,
                format!("mock_{}", Uuid::new_v4().simple()),
                Some(self.cost),
            )),
            MockMode::Reject => Ok(SendResult::rejected(
                DEFINITION.name,
                "MOCK_REJECTED",
                format!("mock provider rejected message to {}", message.to),
            )),
            MockMode::TransportFault => Err(ProviderError::MalformedResponse(
                "mock transport fault".to_string(),
            )),
        }
    }

    async fn fetch_balance(&self) -> Result<f64, ProviderError> {
        match *self.mode.read() {
            MockMode::TransportFault => Err(ProviderError::Timeout),
            _ => Ok(self.balance),
        }
    }

    fn signature_header(&self) -> &'static str {
        MOCK_SIGNATURE_HEADER
    }

    fn verify_webhook(&self, webhook: &InboundWebhook, signature: Option<&str>) -> bool {
        let (Some(secret), Some(signature)) = (self.webhook_secret.as_deref(), signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(webhook.signed_body().as_bytes());
        match hex::decode(signature) {
            Ok(expected) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    fn process_webhook(
        &self,
        payload: &serde_json::Value,
    ) -> Result<CanonicalWebhookEvent, ProviderError> {
        let provider_message_id = payload
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::InvalidPayload("missing message_id".to_string()))?;
        let raw_status = payload
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let status = raw_status.parse().unwrap_or(MessageStatus::Unknown);
        let read = raw_status == "read";
        let timestamp = payload
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc));

        Ok(CanonicalWebhookEvent {
            provider_message_id: provider_message_id.to_string(),
            status: if read { MessageStatus::Delivered } else { status },
            delivered_at: match status {
                MessageStatus::Delivered => timestamp,
                _ if read => timestamp,
                _ => None,
            },
            read,
            error_code: payload
                .get("error_code")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            error_message: payload
                .get("error_message")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    fn max_recipients(&self) -> usize {
        1000
    }
}
