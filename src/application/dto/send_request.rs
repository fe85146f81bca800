// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::message::{Channel, Message, Priority, SendRequest};
use crate::domain::models::provider::SendResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

/// 发送请求数据传输对象
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequestDto {
    /// 收件人号码
    #[validate(length(min = 5, max = 20))]
    pub to: String,
    /// 正文
    #[validate(length(min = 1, max = 1600))]
    pub message: Option<String>,
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub provider: Option<String>,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// 排队发送时的延迟（秒）
    #[validate(range(max = 86400))]
    pub delay_secs: Option<u64>,
}

impl From<SendMessageRequestDto> for SendRequest {
    fn from(dto: SendMessageRequestDto) -> Self {
        SendRequest {
            to: dto.to,
            message: dto.message,
            template_id: dto.template_id,
            variables: dto.variables,
            provider: dto.provider,
            channel: dto.channel,
            priority: dto.priority,
            scheduled_at: dto.scheduled_at,
            batch_id: None,
        }
    }
}

/// 消息响应数据传输对象
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponseDto {
    pub id: Uuid,
    pub status: String,
    pub provider: String,
    pub channel: Channel,
    pub recipient: String,
    pub provider_message_id: Option<String>,
    pub cost: Option<f64>,
    pub retry_count: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageResponseDto {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            status: message.status.to_string(),
            provider: message.provider.clone(),
            channel: message.channel,
            recipient: message.recipient.clone(),
            provider_message_id: message.provider_message_id.clone(),
            cost: message.cost,
            retry_count: message.retry_count,
            error_code: message.error_code.clone(),
            error_message: message.error_message.clone(),
            scheduled_at: message.scheduled_at,
            sent_at: message.sent_at,
            delivered_at: message.delivered_at,
            created_at: message.created_at,
        }
    }
}

/// 发送结果响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponseDto {
    pub message: MessageResponseDto,
    /// 供应商返回的发送结果，排队或定时发送时为空
    pub result: Option<SendResult>,
}
