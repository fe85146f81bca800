// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 消息领域事件
///
/// 每次有意义的状态变化恰好触发一个事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// 消息已提交给供应商
    MessageSent {
        message_id: Uuid,
        provider: String,
        provider_message_id: Option<String>,
        at: DateTime<Utc>,
    },
    /// 消息已送达
    MessageDelivered {
        message_id: Uuid,
        provider: String,
        at: DateTime<Utc>,
    },
    /// 消息发送失败
    MessageFailed {
        message_id: Uuid,
        provider: String,
        error_code: Option<String>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    },
    /// 消息被退回
    MessageBounced {
        message_id: Uuid,
        provider: String,
        error_code: Option<String>,
        at: DateTime<Utc>,
    },
}

impl MessageEvent {
    pub fn message_id(&self) -> Uuid {
        match self {
            MessageEvent::MessageSent { message_id, .. }
            | MessageEvent::MessageDelivered { message_id, .. }
            | MessageEvent::MessageFailed { message_id, .. }
            | MessageEvent::MessageBounced { message_id, .. } => *message_id,
        }
    }
}

impl fmt::Display for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageEvent::MessageSent { .. } => write!(f, "message.sent"),
            MessageEvent::MessageDelivered { .. } => write!(f, "message.delivered"),
            MessageEvent::MessageFailed { .. } => write!(f, "message.failed"),
            MessageEvent::MessageBounced { .. } => write!(f, "message.bounced"),
        }
    }
}
