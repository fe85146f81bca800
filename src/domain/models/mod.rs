// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域模型模块
///
/// 该模块定义了系统的核心业务实体，包括：
/// - 消息（message）：一次外发通信尝试及其状态机
/// - 批次（batch）：面向多个收件人的群发活动
/// - 回调记录（webhook_record）：收到的供应商回调及其重试状态
/// - 供应商（provider）：适配器契约使用的数据结构
/// - 事件（events）：状态变化时触发的领域事件
pub mod batch;
pub mod events;
pub mod message;
pub mod provider;
pub mod webhook_record;
