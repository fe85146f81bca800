// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::message::{Channel, DomainError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 批次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// 待处理
    #[default]
    Pending,
    /// 定时
    Scheduled,
    /// 处理中
    Processing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl BatchStatus {
    /// 是否可以取消
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            BatchStatus::Pending | BatchStatus::Processing | BatchStatus::Scheduled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Scheduled => write!(f, "scheduled"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for BatchStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "scheduled" => Ok(BatchStatus::Scheduled),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// 批次中的单个收件人
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    /// 收件人号码
    pub to: String,
    /// 收件人专属变量，优先于批次变量
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl From<&str> for Recipient {
    fn from(to: &str) -> Self {
        Self {
            to: to.to_string(),
            variables: HashMap::new(),
        }
    }
}

/// 批次聚合计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    /// 已提交（含后续送达、失败、退回）的消息数
    pub sent_count: i32,
    /// 已送达的消息数
    pub delivered_count: i32,
    /// 失败或退回的消息数
    pub failed_count: i32,
}

/// 批次实体
///
/// 表示一次面向多个收件人的群发活动，
/// 拥有其下所有消息（通过 Message.batch_id 反向引用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// 批次ID
    pub id: Uuid,
    /// 批次名称
    pub name: String,
    /// 供应商名称
    pub provider: Option<String>,
    /// 渠道
    pub channel: Channel,
    /// 批次正文模板
    pub content: String,
    /// 模板引用
    pub template_id: Option<String>,
    /// 批次级变量
    pub variables: HashMap<String, String>,
    /// 状态
    pub status: BatchStatus,
    /// 收件人总数
    pub total_recipients: i32,
    /// 已提交数
    pub sent_count: i32,
    /// 已送达数
    pub delivered_count: i32,
    /// 失败数
    pub failed_count: i32,
    /// 每块收件人数
    pub chunk_size: i32,
    /// 块间延迟（秒）
    pub delay_between_batches: i32,
    /// 是否自动重试失败消息
    pub retry_failed: bool,
    /// 最大重试轮数
    pub max_retries: i32,
    /// 当前重试轮数
    pub current_retry: i32,
    /// 定时开始时间
    pub scheduled_at: Option<DateTime<Utc>>,
    /// 开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 完成时间
    pub completed_at: Option<DateTime<Utc>>,
    /// 取消时间
    pub cancelled_at: Option<DateTime<Utc>>,
    /// 元数据（记录失败原因等）
    pub metadata: serde_json::Value,
    /// 乐观锁版本号，每次生命周期更新加一
    pub version: i32,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

/// 批次创建参数
///
/// 活动参数在创建时被快照，之后不再改变
#[derive(Debug, Clone, Default)]
pub struct NewBatch {
    pub name: String,
    pub provider: Option<String>,
    pub channel: Channel,
    pub content: String,
    pub template_id: Option<String>,
    pub variables: HashMap<String, String>,
    pub chunk_size: Option<i32>,
    pub delay_between_batches: Option<i32>,
    pub retry_failed: bool,
    pub max_retries: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// 创建新批次
    ///
    /// # 参数
    ///
    /// * `params` - 创建参数
    /// * `total_recipients` - 收件人总数
    /// * `defaults` - 未指定时使用的 (chunk_size, delay, max_retries)
    pub fn new(params: NewBatch, total_recipients: i32, defaults: (i32, i32, i32)) -> Self {
        let now = Utc::now();
        let status = match params.scheduled_at {
            Some(at) if at > now => BatchStatus::Scheduled,
            _ => BatchStatus::Pending,
        };

        Self {
            id: Uuid::new_v4(),
            name: params.name,
            provider: params.provider,
            channel: params.channel,
            content: params.content,
            template_id: params.template_id,
            variables: params.variables,
            status,
            total_recipients,
            sent_count: 0,
            delivered_count: 0,
            failed_count: 0,
            chunk_size: params.chunk_size.unwrap_or(defaults.0).max(1),
            delay_between_batches: params.delay_between_batches.unwrap_or(defaults.1).max(0),
            retry_failed: params.retry_failed,
            max_retries: params.max_retries.unwrap_or(defaults.2).max(0),
            current_retry: 0,
            scheduled_at: params.scheduled_at,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            metadata: serde_json::json!({}),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 开始处理批次
    pub fn start(&mut self) -> Result<(), DomainError> {
        match self.status {
            BatchStatus::Pending | BatchStatus::Scheduled => {
                self.status = BatchStatus::Processing;
                self.started_at.get_or_insert_with(Utc::now);
                self.updated_at = Utc::now();
                Ok(())
            }
            other => Err(DomainError::InvalidStateTransition {
                from: other.to_string(),
                action: "start",
            }),
        }
    }

    /// 标记批次完成
    pub fn complete(&mut self) -> Result<(), DomainError> {
        if self.status != BatchStatus::Processing {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                action: "complete",
            });
        }
        self.status = BatchStatus::Completed;
        self.completed_at.get_or_insert_with(Utc::now);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 标记批次失败并记录异常信息
    pub fn fail(&mut self, reason: &str) {
        if matches!(self.status, BatchStatus::Cancelled | BatchStatus::Completed) {
            return;
        }
        self.status = BatchStatus::Failed;
        self.completed_at.get_or_insert_with(Utc::now);
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert("error".to_string(), serde_json::json!(reason));
            map.insert("failed_at".to_string(), serde_json::json!(Utc::now()));
        }
        self.updated_at = Utc::now();
    }

    /// 取消批次
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        if !self.status.is_cancellable() {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                action: "cancel",
            });
        }
        self.status = BatchStatus::Cancelled;
        self.cancelled_at.get_or_insert_with(Utc::now);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 应用重新计算的聚合计数
    pub fn apply_counts(&mut self, counts: BatchCounts) {
        self.sent_count = counts.sent_count;
        self.delivered_count = counts.delivered_count;
        self.failed_count = counts.failed_count;
        self.updated_at = Utc::now();
    }

    /// 合并批次变量与收件人变量，收件人变量优先
    pub fn merged_variables(&self, recipient: &Recipient) -> HashMap<String, String> {
        let mut merged = self.variables.clone();
        merged.extend(recipient.variables.clone());
        merged
    }

    /// 聚合计数是否满足不变式
    pub fn counts_consistent(&self) -> bool {
        self.sent_count <= self.total_recipients
            && self.delivered_count + self.failed_count <= self.sent_count
    }
}
