// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 重试退避的绝对上限（分钟）
const BACKOFF_CEILING_MINUTES: i64 = 60 * 24 * 365;

/// Webhook记录实体
///
/// 表示一次收到的供应商回调。原始负载在任何处理之前持久化，
/// 处理状态构成独立于消息状态的小型重试状态机。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRecord {
    /// 记录唯一标识符
    pub id: Uuid,
    /// 供应商名称
    pub provider: String,
    /// 供应商消息ID，解析成功后填充
    pub provider_message_id: Option<String>,
    /// 原始负载
    pub raw_payload: serde_json::Value,
    /// 规范化后的负载
    pub processed_payload: Option<serde_json::Value>,
    /// 签名
    pub signature: Option<String>,
    /// 签名是否通过验证
    pub is_verified: bool,
    /// 签名验证次数
    pub verification_attempts: i32,
    /// 是否已处理
    pub processed: bool,
    /// 处理时间
    pub processed_at: Option<DateTime<Utc>>,
    /// 失败原因
    pub failure_reason: Option<String>,
    /// 重试次数
    pub retry_count: i32,
    /// 下次重试时间
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl WebhookRecord {
    /// 创建一个新的未处理记录
    ///
    /// # 参数
    ///
    /// * `provider` - 供应商名称
    /// * `raw_payload` - 原始负载
    /// * `signature` - 请求携带的签名
    pub fn new(provider: &str, raw_payload: serde_json::Value, signature: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            provider_message_id: None,
            raw_payload,
            processed_payload: None,
            signature,
            is_verified: false,
            verification_attempts: 0,
            processed: false,
            processed_at: None,
            failure_reason: None,
            retry_count: 0,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 记录一次签名验证结果
    pub fn record_verification(&mut self, verified: bool) {
        self.verification_attempts += 1;
        self.is_verified = verified;
        self.updated_at = Utc::now();
    }

    /// 标记为已处理
    pub fn mark_processed(&mut self) {
        let now = Utc::now();
        self.processed = true;
        self.processed_at = Some(now);
        self.failure_reason = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// 记录处理失败并安排下次重试
    ///
    /// 退避时间为 `2^retry_count` 分钟，最大不超过 `max_backoff_minutes`，
    /// 且不超过一年
    pub fn schedule_retry(&mut self, reason: String, max_backoff_minutes: i64) {
        if self.processed {
            return;
        }
        let backoff = 2i64
            .saturating_pow(self.retry_count.max(0) as u32)
            .min(max_backoff_minutes)
            .clamp(0, BACKOFF_CEILING_MINUTES);
        let now = Utc::now();
        self.failure_reason = Some(reason);
        self.retry_count += 1;
        self.next_retry_at = Some(now + Duration::minutes(backoff));
        self.updated_at = now;
    }

    /// 是否已到达重试时间
    pub fn is_due(&self, now: DateTime<Utc>, max_retries: i32) -> bool {
        !self.processed
            && self.retry_count < max_retries
            && self.next_retry_at.map(|at| at <= now).unwrap_or(false)
    }
}
