// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 缓存模块
///
/// 提供共享键值存储的抽象及其进程内和Redis实现
pub mod kv_store;
pub mod redis_client;
