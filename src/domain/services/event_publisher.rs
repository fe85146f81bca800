// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::events::MessageEvent;
use async_trait::async_trait;

/// 领域事件发布特质
///
/// 发布是尽力而为的：没有订阅者时事件被丢弃，发布本身不会失败
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 发布消息事件
    ///
    /// # 参数
    ///
    /// * `event` - 消息事件
    async fn publish(&self, event: MessageEvent);
}
