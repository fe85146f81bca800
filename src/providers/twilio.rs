// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::traits::{InboundWebhook, ProviderAdapter, ProviderError};
use crate::domain::models::message::{Channel, MessageStatus};
use crate::domain::models::provider::{
    CanonicalWebhookEvent, Capability, OutboundMessage, ProviderDefinition, SendResult,
};
use crate::utils::phone::normalize_e164;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

pub static DEFINITION: ProviderDefinition = ProviderDefinition {
    name: "twilio",
    display_name: "Twilio",
    capabilities: &[
        Capability::Sms,
        Capability::Whatsapp,
        Capability::Otp,
        Capability::DeliveryReports,
    ],
    required_config: &["account_sid", "auth_token", "from"],
    optional_config: &["whatsapp_from", "base_url", "webhook_url", "status_callback"],
};

/// 将 Twilio 状态映射为规范化状态
pub fn map_status(status: &str) -> MessageStatus {
    match status.to_ascii_lowercase().as_str() {
        "queued" | "accepted" | "scheduled" => MessageStatus::Queued,
        "sending" => MessageStatus::Sending,
        "sent" => MessageStatus::Sent,
        "delivered" | "read" => MessageStatus::Delivered,
        "undelivered" => MessageStatus::Bounced,
        "failed" => MessageStatus::Failed,
        "canceled" => MessageStatus::Cancelled,
        _ => MessageStatus::Unknown,
    }
}

/// 计算 Twilio 回调签名
///
/// base64(HMAC-SHA1(auth_token, url + 按键排序后依次拼接的键和值))
pub fn compute_signature(auth_token: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let mut data = String::from(url);
    for (key, value) in params {
        data.push_str(key);
        data.push_str(value);
    }

    match HmacSha1::new_from_slice(auth_token.as_bytes()) {
        Ok(mut mac) => {
            mac.update(data.as_bytes());
            STANDARD.encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// 把负载转换为签名使用的键值表
fn payload_params(payload: &serde_json::Value) -> BTreeMap<String, String> {
    payload
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    status: String,
    price: Option<String>,
    error_code: Option<i64>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResource {
    code: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResource {
    balance: String,
}

/// Twilio 适配器
pub struct TwilioProvider {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from: String,
    whatsapp_from: Option<String>,
    base_url: String,
    webhook_url: Option<String>,
    status_callback: Option<String>,
}

impl TwilioProvider {
    /// 从配置创建
    ///
    /// # 参数
    ///
    /// * `config` - 供应商配置（必需项已由注册表校验）
    /// * `http` - 共享的HTTP客户端
    pub fn from_config(
        config: &HashMap<String, String>,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let required = |key: &str| {
            config
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| ProviderError::Configuration(format!("twilio.{} is required", key)))
        };

        Ok(Self {
            http,
            account_sid: required("account_sid")?,
            auth_token: required("auth_token")?,
            from: required("from")?,
            whatsapp_from: config.get("whatsapp_from").cloned(),
            base_url: config
                .get("base_url")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            webhook_url: config.get("webhook_url").cloned(),
            status_callback: config.get("status_callback").cloned(),
        })
    }

    fn address(&self, number: &str, channel: Channel) -> String {
        let number = normalize_e164(number, None).unwrap_or_else(|| number.to_string());
        match channel {
            Channel::Sms => number,
            Channel::Whatsapp => format!("whatsapp:{}", number),
        }
    }

    fn sender(&self, channel: Channel) -> String {
        match channel {
            Channel::Sms => self.from.clone(),
            Channel::Whatsapp => {
                let from = self.whatsapp_from.as_deref().unwrap_or(&self.from);
                if from.starts_with("whatsapp:") {
                    from.to_string()
                } else {
                    format!("whatsapp:{}", from)
                }
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for TwilioProvider {
    fn definition(&self) -> &'static ProviderDefinition {
        &DEFINITION
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendResult, ProviderError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );
        let mut form = vec![
            ("To", self.address(&message.to, message.channel)),
            ("From", self.sender(message.channel)),
            ("Body", message.content.clone()),
        ];
        if let Some(callback) = &self.status_callback {
            form.push(("StatusCallback", callback.clone()));
        }

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(response.error_for_status().err().map_or_else(
                || ProviderError::MalformedResponse(format!("HTTP {}", status)),
                ProviderError::Transport,
            ));
        }

        if !status.is_success() {
            let error: ErrorResource = response.json().await.unwrap_or(ErrorResource {
                code: None,
                message: None,
            });
            let code = error
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| status.as_u16().to_string());
            warn!(provider = "twilio", recipient = %message.to, code = %code, "Twilio rejected message");
            return Ok(SendResult::rejected(
                DEFINITION.name,
                &code,
                error.message.unwrap_or_else(|| format!("HTTP {}", status)),
            ));
        }

        let resource: MessageResource = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        debug!(provider = "twilio", sid = %resource.sid, status = %resource.status, "Twilio accepted message");

        let canonical = map_status(&resource.status);
        if canonical.is_failure() {
            return Ok(SendResult::rejected(
                DEFINITION.name,
                &resource
                    .error_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| resource.status.clone()),
                resource
                    .error_message
                    .unwrap_or_else(|| format!("message {}", resource.status)),
            ));
        }

        let cost = resource
            .price
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .map(f64::abs);
        let mut result = SendResult::sent(DEFINITION.name, resource.sid, cost);
        result.status = match canonical {
            MessageStatus::Unknown => MessageStatus::Sent,
            other => other,
        };
        result.sent_at = Some(Utc::now());
        Ok(result)
    }

    async fn fetch_balance(&self) -> Result<f64, ProviderError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Balance.json",
            self.base_url, self.account_sid
        );
        let resource: BalanceResource = self
            .http
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        resource
            .balance
            .parse()
            .map_err(|_| ProviderError::MalformedResponse(format!("balance '{}'", resource.balance)))
    }

    fn signature_header(&self) -> &'static str {
        "x-twilio-signature"
    }

    fn verify_webhook(&self, webhook: &InboundWebhook, signature: Option<&str>) -> bool {
        let Some(signature) = signature.filter(|s| !s.is_empty()) else {
            return false;
        };
        let Some(url) = webhook.url.as_deref().or(self.webhook_url.as_deref()) else {
            warn!(provider = "twilio", "Cannot verify webhook without a callback URL");
            return false;
        };
        if self.auth_token.is_empty() {
            return false;
        }

        let Ok(expected) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha1::new_from_slice(self.auth_token.as_bytes()) else {
            return false;
        };
        let mut data = String::from(url);
        for (key, value) in payload_params(&webhook.payload) {
            data.push_str(&key);
            data.push_str(&value);
        }
        mac.update(data.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    fn process_webhook(
        &self,
        payload: &serde_json::Value,
    ) -> Result<CanonicalWebhookEvent, ProviderError> {
        let field = |primary: &str, fallback: &str| {
            payload
                .get(primary)
                .or_else(|| payload.get(fallback))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let sid = field("MessageSid", "SmsSid")
            .ok_or_else(|| ProviderError::InvalidPayload("missing MessageSid".to_string()))?;
        let raw_status = field("MessageStatus", "SmsStatus").unwrap_or_default();
        let status = map_status(&raw_status);
        let read = raw_status.eq_ignore_ascii_case("read");

        Ok(CanonicalWebhookEvent {
            provider_message_id: sid,
            status,
            delivered_at: None,
            read,
            error_code: field("ErrorCode", "ErrorCode"),
            error_message: field("ErrorMessage", "ErrorMessage"),
        })
    }
}
