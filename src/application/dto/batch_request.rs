// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::batch::{NewBatch, Recipient};
use crate::domain::models::message::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// 批次收件人
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RecipientDto {
    #[validate(length(min = 5, max = 20))]
    pub to: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// 批量发送请求数据传输对象
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequestDto {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub provider: Option<String>,
    #[serde(default)]
    pub channel: Channel,
    #[validate(length(min = 1, max = 1600))]
    pub content: String,
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[validate(length(min = 1, max = 100000), nested)]
    pub recipients: Vec<RecipientDto>,
    #[validate(range(min = 1, max = 1000))]
    pub chunk_size: Option<i32>,
    #[validate(range(min = 0, max = 3600))]
    pub delay_between_batches: Option<i32>,
    #[serde(default)]
    pub retry_failed: bool,
    #[validate(range(min = 0, max = 10))]
    pub max_retries: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl CreateBatchRequestDto {
    /// 拆分为批次参数和收件人列表
    pub fn into_parts(self) -> (NewBatch, Vec<Recipient>) {
        let recipients = self
            .recipients
            .into_iter()
            .map(|r| Recipient {
                to: r.to,
                variables: r.variables,
            })
            .collect();

        let params = NewBatch {
            name: self.name,
            provider: self.provider,
            channel: self.channel,
            content: self.content,
            template_id: self.template_id,
            variables: self.variables,
            chunk_size: self.chunk_size,
            delay_between_batches: self.delay_between_batches,
            retry_failed: self.retry_failed,
            max_retries: self.max_retries,
            scheduled_at: self.scheduled_at,
        };

        (params, recipients)
    }
}

/// 费用估算请求
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EstimateCostRequestDto {
    pub provider: Option<String>,
    #[serde(default)]
    pub channel: Channel,
    #[validate(length(min = 1, max = 1600))]
    pub content: String,
    #[validate(range(min = 1))]
    pub recipients: usize,
}
