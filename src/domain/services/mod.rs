// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 领域服务模块
///
/// 包含的服务：
/// - 单条发送（messenger_service）：供应商选择、熔断检查和消息状态机
/// - 批量发送（bulk_message_service）：分块发送、取消和失败重试
/// - 投递跟踪（delivery_tracker）：供应商回调的落库、映射和应用
/// - 同意检查（consent）与事件发布（event_publisher）两个协作接口
pub mod bulk_message_service;
pub mod consent;
pub mod delivery_tracker;
pub mod event_publisher;
pub mod messenger_service;
