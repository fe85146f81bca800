// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::traits::{InboundWebhook, ProviderAdapter, ProviderError};
use crate::domain::models::message::MessageStatus;
use crate::domain::models::provider::{
    CanonicalWebhookEvent, Capability, OutboundMessage, ProviderDefinition, SendResult,
};
use crate::utils::phone::normalize_e164;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.africastalking.com";

/// 单次请求的最大收件人数
const MAX_RECIPIENTS: usize = 1000;

pub static DEFINITION: ProviderDefinition = ProviderDefinition {
    name: "africastalking",
    display_name: "Africa's Talking",
    capabilities: &[
        Capability::Sms,
        Capability::Otp,
        Capability::BulkMessaging,
        Capability::DeliveryReports,
    ],
    required_config: &["username", "api_key"],
    optional_config: &["sender_id", "base_url", "webhook_secret", "country_code"],
};

/// 将 Africa's Talking 状态映射为规范化状态
pub fn map_status(status: &str) -> MessageStatus {
    match status {
        "Sent" | "Submitted" => MessageStatus::Sent,
        "Buffered" => MessageStatus::Sending,
        "Success" => MessageStatus::Delivered,
        "Rejected" => MessageStatus::Bounced,
        "Failed" => MessageStatus::Failed,
        _ => MessageStatus::Unknown,
    }
}

/// 解析 "KES 0.8000" 形式的金额
fn parse_amount(value: &str) -> Option<f64> {
    value.split_whitespace().last()?.parse().ok()
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(rename = "SMSMessageData")]
    data: SmsMessageData,
}

#[derive(Debug, Deserialize)]
struct SmsMessageData {
    #[serde(rename = "Recipients", default)]
    recipients: Vec<RecipientResult>,
}

#[derive(Debug, Deserialize)]
struct RecipientResult {
    #[serde(rename = "statusCode")]
    status_code: i64,
    number: String,
    status: String,
    cost: Option<String>,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    #[serde(rename = "UserData")]
    user: UserData,
}

#[derive(Debug, Deserialize)]
struct UserData {
    balance: String,
}

/// Africa's Talking 适配器
///
/// 支持一次请求发送给多个收件人
pub struct AfricasTalkingProvider {
    http: reqwest::Client,
    username: String,
    api_key: String,
    sender_id: Option<String>,
    base_url: String,
    webhook_secret: Option<String>,
    country_code: Option<String>,
}

impl AfricasTalkingProvider {
    /// 从配置创建
    pub fn from_config(
        config: &HashMap<String, String>,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let required = |key: &str| {
            config
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    ProviderError::Configuration(format!("africastalking.{} is required", key))
                })
        };

        Ok(Self {
            http,
            username: required("username")?,
            api_key: required("api_key")?,
            sender_id: config.get("sender_id").cloned(),
            base_url: config
                .get("base_url")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            webhook_secret: config.get("webhook_secret").cloned(),
            country_code: config.get("country_code").cloned(),
        })
    }

    fn normalize(&self, number: &str) -> String {
        normalize_e164(number, self.country_code.as_deref()).unwrap_or_else(|| number.to_string())
    }

    /// 向同一正文的一组收件人发起一次请求
    async fn submit(
        &self,
        content: &str,
        recipients: &[String],
    ) -> Result<Vec<RecipientResult>, ProviderError> {
        let mut form = vec![
            ("username", self.username.clone()),
            ("to", recipients.join(",")),
            ("message", content.to_string()),
        ];
        if let Some(sender) = &self.sender_id {
            form.push(("from", sender.clone()));
        }

        let response: SendResponse = self
            .http
            .post(format!("{}/version1/messaging", self.base_url))
            .header("apiKey", &self.api_key)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        Ok(response.data.recipients)
    }

    fn to_result(&self, recipient: Option<&RecipientResult>, to: &str) -> SendResult {
        match recipient {
            Some(r) if matches!(r.status_code, 100..=102) => {
                let mut result = SendResult::sent(
                    DEFINITION.name,
                    r.message_id.clone().unwrap_or_default(),
                    r.cost.as_deref().and_then(parse_amount),
                );
                result.status = match map_status(&r.status) {
                    MessageStatus::Unknown | MessageStatus::Delivered => MessageStatus::Sent,
                    other => other,
                };
                result
            }
            Some(r) => {
                warn!(provider = "africastalking", recipient = %to, status = %r.status, "Recipient rejected");
                SendResult::rejected(DEFINITION.name, &r.status_code.to_string(), r.status.clone())
            }
            None => SendResult::rejected(
                DEFINITION.name,
                "MISSING_RECIPIENT",
                format!("no result returned for {}", to),
            ),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AfricasTalkingProvider {
    fn definition(&self) -> &'static ProviderDefinition {
        &DEFINITION
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendResult, ProviderError> {
        let mut results = self.send_bulk(std::slice::from_ref(message)).await?;
        results
            .pop()
            .ok_or_else(|| ProviderError::MalformedResponse("empty recipient list".to_string()))
    }

    async fn send_bulk(
        &self,
        messages: &[OutboundMessage],
    ) -> Result<Vec<SendResult>, ProviderError> {
        let mut results = Vec::with_capacity(messages.len());

        // 正文相同的连续消息合并为一次请求，保持输入顺序
        let mut start = 0;
        while start < messages.len() {
            let content = &messages[start].content;
            let mut end = start + 1;
            while end < messages.len()
                && end - start < MAX_RECIPIENTS
                && messages[end].content == *content
            {
                end += 1;
            }

            let numbers: Vec<String> = messages[start..end]
                .iter()
                .map(|m| self.normalize(&m.to))
                .collect();
            let recipients = self.submit(content, &numbers).await?;
            debug!(
                provider = "africastalking",
                requested = numbers.len(),
                returned = recipients.len(),
                "Bulk submission completed"
            );

            let by_number: HashMap<&str, &RecipientResult> =
                recipients.iter().map(|r| (r.number.as_str(), r)).collect();
            for number in &numbers {
                results.push(self.to_result(by_number.get(number.as_str()).copied(), number));
            }
            start = end;
        }

        Ok(results)
    }

    async fn fetch_balance(&self) -> Result<f64, ProviderError> {
        let response: UserResponse = self
            .http
            .get(format!("{}/version1/user", self.base_url))
            .query(&[("username", self.username.as_str())])
            .header("apiKey", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        parse_amount(&response.user.balance).ok_or_else(|| {
            ProviderError::MalformedResponse(format!("balance '{}'", response.user.balance))
        })
    }

    fn signature_header(&self) -> &'static str {
        "x-africastalking-signature"
    }

    fn verify_webhook(&self, webhook: &InboundWebhook, signature: Option<&str>) -> bool {
        let (Some(secret), Some(signature)) = (self.webhook_secret.as_deref(), signature) else {
            return false;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(webhook.signed_body().as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    fn process_webhook(
        &self,
        payload: &serde_json::Value,
    ) -> Result<CanonicalWebhookEvent, ProviderError> {
        let id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::InvalidPayload("missing id".to_string()))?;
        let status = map_status(
            payload
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        let failure_reason = payload
            .get("failureReason")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(CanonicalWebhookEvent {
            provider_message_id: id.to_string(),
            status,
            delivered_at: None,
            read: false,
            error_code: failure_reason.clone(),
            error_message: failure_reason,
        })
    }

    fn max_recipients(&self) -> usize {
        MAX_RECIPIENTS
    }
}
