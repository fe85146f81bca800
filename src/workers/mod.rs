// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 工作器模块
///
/// 提供调度队列的消费者、周期性的自动化循环和工作器生命周期管理
pub mod automation;
pub mod dispatch_worker;
pub mod manager;
pub mod worker;

pub use worker::Worker;
