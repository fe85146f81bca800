// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 队列模块
///
/// 提供按优先级分通道的调度队列，支持延迟任务
pub mod dispatch_queue;
