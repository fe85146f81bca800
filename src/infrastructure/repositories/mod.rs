// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 仓库实现模块
///
/// 基于SeaORM的仓库接口实现
pub mod batch_repo_impl;
pub mod message_repo_impl;
pub mod webhook_record_repo_impl;
