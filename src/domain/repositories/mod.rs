// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 仓库接口模块
///
/// 定义消息、批次和回调记录的数据访问抽象，
/// 具体实现位于 `infrastructure::repositories`
pub mod batch_repository;
pub mod message_repository;
pub mod webhook_record_repository;
