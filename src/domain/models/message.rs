// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// 消息渠道枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// 短信
    #[default]
    Sms,
    /// WhatsApp
    Whatsapp,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Channel::Sms => write!(f, "sms"),
            Channel::Whatsapp => write!(f, "whatsapp"),
        }
    }
}

impl FromStr for Channel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Channel::Sms),
            "whatsapp" => Ok(Channel::Whatsapp),
            _ => Err(()),
        }
    }
}

/// 消息优先级
///
/// 决定异步发送时进入哪条队列通道
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// 低
    Low,
    /// 普通
    #[default]
    Normal,
    /// 高
    High,
    /// 紧急
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(()),
        }
    }
}

/// 规范化消息状态枚举
///
/// 所有供应商适配器、领域事件和持久化层共用的状态词汇，
/// 与任何供应商自己的状态字符串无关。
/// 状态转换遵循以下流程：
/// Scheduled → Pending → Queued → Sending → Sent → Delivered
/// Failed/Bounced/Cancelled 为终止失败状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// 待发送
    #[default]
    Pending,
    /// 已入队
    Queued,
    /// 发送中
    Sending,
    /// 已提交给供应商
    Sent,
    /// 已送达
    Delivered,
    /// 发送失败
    Failed,
    /// 被运营商退回
    Bounced,
    /// 已取消
    Cancelled,
    /// 定时发送
    Scheduled,
    /// 无法识别的供应商状态
    Unknown,
}

impl MessageStatus {
    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered
                | MessageStatus::Failed
                | MessageStatus::Bounced
                | MessageStatus::Cancelled
        )
    }

    /// 是否为终止失败状态
    pub fn is_failure(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Bounced)
    }

    /// 是否可以被取消
    pub fn is_cancellable(&self) -> bool {
        matches!(self, MessageStatus::Scheduled | MessageStatus::Queued)
    }

    /// 正向流程中的顺序，终止失败状态与未知状态没有顺序
    fn rank(&self) -> Option<u8> {
        match self {
            MessageStatus::Scheduled => Some(0),
            MessageStatus::Pending => Some(1),
            MessageStatus::Queued => Some(2),
            MessageStatus::Sending => Some(3),
            MessageStatus::Sent => Some(4),
            MessageStatus::Delivered => Some(5),
            _ => None,
        }
    }

    /// 判断是否允许从当前状态转换到目标状态
    ///
    /// 状态只能单调前进：终止状态不再变化，Unknown 永远不会被写入，
    /// 终止失败状态可以从任意非终止状态到达。
    ///
    /// # 参数
    ///
    /// * `next` - 目标状态
    ///
    /// # 返回值
    ///
    /// 如果转换合法则返回true
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        if *self == next || next == MessageStatus::Unknown || self.is_terminal() {
            return false;
        }

        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target > current,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Bounced => "bounced",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MessageStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "queued" => Ok(MessageStatus::Queued),
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            "bounced" => Ok(MessageStatus::Bounced),
            "cancelled" => Ok(MessageStatus::Cancelled),
            "scheduled" => Ok(MessageStatus::Scheduled),
            "unknown" => Ok(MessageStatus::Unknown),
            _ => Err(()),
        }
    }
}

/// 领域错误类型
///
/// 表示在领域层可能发生的各种错误情况
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 无效的状态转换
    #[error("Invalid state transition: cannot {action} from {from}")]
    InvalidStateTransition {
        /// 当前状态
        from: String,
        /// 尝试执行的操作
        action: &'static str,
    },

    /// 验证错误
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl DomainError {
    fn transition(from: impl fmt::Display, action: &'static str) -> Self {
        DomainError::InvalidStateTransition {
            from: from.to_string(),
            action,
        }
    }
}

/// 发送请求
///
/// 调度器接收的统一发送参数，模板已在外部渲染为正文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    /// 收件人号码
    pub to: String,
    /// 正文（可包含 {{变量}} 占位符）
    pub message: Option<String>,
    /// 模板引用
    pub template_id: Option<String>,
    /// 变量映射
    pub variables: HashMap<String, String>,
    /// 指定供应商，为空时使用默认供应商
    pub provider: Option<String>,
    /// 渠道
    pub channel: Channel,
    /// 优先级
    pub priority: Priority,
    /// 定时发送时间
    pub scheduled_at: Option<DateTime<Utc>>,
    /// 所属批次
    pub batch_id: Option<Uuid>,
}

/// 消息实体
///
/// 表示一次外发通信尝试及其结果。由调度器创建，
/// 由调度器（发送时）和投递跟踪器（收到回调时）修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息唯一标识符
    pub id: Uuid,
    /// 所属批次ID
    pub batch_id: Option<Uuid>,
    /// 供应商名称
    pub provider: String,
    /// 渠道
    pub channel: Channel,
    /// 收件人号码
    pub recipient: String,
    /// 渲染后的正文
    pub content: String,
    /// 模板引用
    pub template_id: Option<String>,
    /// 渲染时使用的变量
    pub variables: HashMap<String, String>,
    /// 当前状态
    pub status: MessageStatus,
    /// 优先级
    pub priority: Priority,
    /// 供应商分配的消息ID，发送成功前为空
    pub provider_message_id: Option<String>,
    /// 定时发送时间
    pub scheduled_at: Option<DateTime<Utc>>,
    /// 提交时间
    pub sent_at: Option<DateTime<Utc>>,
    /// 送达时间
    pub delivered_at: Option<DateTime<Utc>>,
    /// 已读时间
    pub read_at: Option<DateTime<Utc>>,
    /// 失败时间
    pub failed_at: Option<DateTime<Utc>>,
    /// 取消时间
    pub cancelled_at: Option<DateTime<Utc>>,
    /// 重试次数，只增不减
    pub retry_count: i32,
    /// 错误码
    pub error_code: Option<String>,
    /// 错误信息
    pub error_message: Option<String>,
    /// 费用，每次成功最多写入一次
    pub cost: Option<f64>,
    /// 附加元数据
    pub metadata: serde_json::Value,
    /// 乐观锁版本号
    pub version: i32,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("placeholder regex is valid")
});

/// 将 `{{name}}` 占位符替换为变量值
///
/// 未提供的变量保持原样，便于排查
pub fn render_content(template: &str, variables: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

impl Message {
    /// 创建一个新的消息
    ///
    /// # 参数
    ///
    /// * `provider` - 已解析的供应商名称
    /// * `request` - 发送请求
    /// * `status` - 初始状态
    ///
    /// # 返回值
    ///
    /// 返回新的消息实例，正文已完成变量替换
    pub fn new(provider: &str, request: &SendRequest, status: MessageStatus) -> Self {
        let now = Utc::now();
        let content = render_content(
            request.message.as_deref().unwrap_or_default(),
            &request.variables,
        );

        Self {
            id: Uuid::new_v4(),
            batch_id: request.batch_id,
            provider: provider.to_string(),
            channel: request.channel,
            recipient: request.to.clone(),
            content,
            template_id: request.template_id.clone(),
            variables: request.variables.clone(),
            status,
            priority: request.priority,
            provider_message_id: None,
            scheduled_at: request.scheduled_at,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            cancelled_at: None,
            retry_count: 0,
            error_code: None,
            error_message: None,
            cost: None,
            metadata: serde_json::json!({}),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 从已存储的消息重建发送请求
    pub fn to_request(&self) -> SendRequest {
        SendRequest {
            to: self.recipient.clone(),
            message: Some(self.content.clone()),
            template_id: self.template_id.clone(),
            variables: self.variables.clone(),
            provider: Some(self.provider.clone()),
            channel: self.channel,
            priority: self.priority,
            scheduled_at: None,
            batch_id: self.batch_id,
        }
    }

    /// 将定时或排队的消息激活为待发送
    pub fn activate(&mut self) -> Result<(), DomainError> {
        match self.status {
            MessageStatus::Scheduled | MessageStatus::Queued => {
                self.status = MessageStatus::Pending;
                self.touch();
                Ok(())
            }
            other => Err(DomainError::transition(other, "activate")),
        }
    }

    /// 标记为发送中
    pub fn mark_sending(&mut self) -> Result<(), DomainError> {
        match self.status {
            MessageStatus::Pending => {
                self.status = MessageStatus::Sending;
                self.touch();
                Ok(())
            }
            other => Err(DomainError::transition(other, "send")),
        }
    }

    /// 根据供应商的成功响应更新消息
    ///
    /// 如果回调已经先一步把消息推进到更靠后的状态，则保留回调的状态，
    /// 只补充供应商ID、费用和提交时间。
    ///
    /// # 参数
    ///
    /// * `status` - 响应中的规范化状态
    /// * `provider_message_id` - 供应商消息ID
    /// * `cost` - 费用
    /// * `sent_at` - 提交时间
    pub fn mark_sent(
        &mut self,
        status: MessageStatus,
        provider_message_id: Option<String>,
        cost: Option<f64>,
        sent_at: DateTime<Utc>,
    ) {
        let target = match status {
            MessageStatus::Unknown
            | MessageStatus::Scheduled
            | MessageStatus::Pending
            | MessageStatus::Queued
            | MessageStatus::Sending => MessageStatus::Sent,
            other => other,
        };

        if self.status.can_transition_to(target) {
            self.status = target;
        }
        if self.provider_message_id.is_none() {
            self.provider_message_id = provider_message_id;
        }
        if self.cost.is_none() {
            self.cost = cost;
        }
        self.sent_at.get_or_insert(sent_at);
        if self.status == MessageStatus::Delivered {
            self.delivered_at.get_or_insert(sent_at);
        }
        self.touch();
    }

    /// 标记发送失败
    ///
    /// 已进入终止状态的消息不会被覆盖
    pub fn mark_failed(&mut self, error_code: Option<String>, error_message: String) {
        if self.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = MessageStatus::Failed;
        self.error_code = error_code;
        self.error_message = Some(error_message);
        self.failed_at = Some(now);
        self.touch();
    }

    /// 取消消息
    ///
    /// 只允许从 Scheduled 或 Queued 状态取消
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        if !self.status.is_cancellable() {
            return Err(DomainError::transition(self.status, "cancel"));
        }
        self.status = MessageStatus::Cancelled;
        self.cancelled_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// 为重试重置消息
    ///
    /// 只允许从 Failed 状态重试，重试次数加一并清空错误字段
    ///
    /// # 参数
    ///
    /// * `target` - 重置后的状态（Pending 立即发送，Queued 交给队列）
    pub fn reset_for_retry(&mut self, target: MessageStatus) -> Result<(), DomainError> {
        if self.status != MessageStatus::Failed {
            return Err(DomainError::transition(self.status, "retry"));
        }
        self.status = target;
        self.retry_count += 1;
        self.error_code = None;
        self.error_message = None;
        self.failed_at = None;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SendRequest {
        SendRequest {
            to: "+15550001111".to_string(),
            message: Some("Hi {{name}}, code {{ code }}".to_string()),
            variables: HashMap::from([
                ("name".to_string(), "Ada".to_string()),
                ("code".to_string(), "1234".to_string()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_content_replaces_known_placeholders() {
        let message = Message::new("mocktest", &request(), MessageStatus::Pending);
        assert_eq!(message.content, "Hi Ada, code 1234");

        let untouched = render_content("Hello {{missing}}", &HashMap::new());
        assert_eq!(untouched, "Hello {{missing}}");
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Failed));
        assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Bounced));
        assert!(!MessageStatus::Delivered.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Delivered.can_transition_to(MessageStatus::Failed));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Queued));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Unknown));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Sent));
    }

    #[test]
    fn test_retry_only_from_failed() {
        let mut message = Message::new("mocktest", &request(), MessageStatus::Pending);
        assert!(message.reset_for_retry(MessageStatus::Pending).is_err());
        assert_eq!(message.retry_count, 0);

        message.mark_failed(Some("TIMEOUT".to_string()), "timeout".to_string());
        message.reset_for_retry(MessageStatus::Pending).unwrap();
        assert_eq!(message.retry_count, 1);
        assert_eq!(message.status, MessageStatus::Pending);
        assert!(message.error_message.is_none());
        assert!(message.failed_at.is_none());
    }

    #[test]
    fn test_cancel_rejected_outside_scheduled_or_queued() {
        let mut message = Message::new("mocktest", &request(), MessageStatus::Sent);
        let err = message.cancel().unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        let mut queued = Message::new("mocktest", &request(), MessageStatus::Queued);
        queued.cancel().unwrap();
        assert_eq!(queued.status, MessageStatus::Cancelled);
        assert!(queued.cancelled_at.is_some());
    }

    #[test]
    fn test_mark_sent_keeps_later_webhook_status_and_first_cost() {
        let mut message = Message::new("mocktest", &request(), MessageStatus::Sending);
        message.status = MessageStatus::Delivered;
        message.cost = Some(0.05);

        message.mark_sent(
            MessageStatus::Sent,
            Some("mock_1".to_string()),
            Some(0.10),
            Utc::now(),
        );

        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.cost, Some(0.05));
        assert_eq!(message.provider_message_id.as_deref(), Some("mock_1"));
    }
}
