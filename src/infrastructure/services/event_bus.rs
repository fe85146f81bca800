// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::events::MessageEvent;
use crate::domain::services::event_publisher::EventPublisher;
use async_trait::async_trait;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::debug;

/// 进程内事件总线
///
/// 基于 tokio broadcast 通道，订阅者落后太多时会丢失最旧的事件
pub struct BroadcastEventBus {
    sender: broadcast::Sender<MessageEvent>,
}

impl BroadcastEventBus {
    /// 创建事件总线
    ///
    /// # 参数
    ///
    /// * `capacity` - 每个订阅者可缓存的事件数
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventBus {
    async fn publish(&self, event: MessageEvent) {
        counter!("message_events_total", "event" => event.to_string()).increment(1);
        debug!(event = %event, message_id = %event.message_id(), "Publishing message event");
        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(MessageEvent::MessageDelivered {
            message_id: id,
            provider: "mocktest".to_string(),
            at: Utc::now(),
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.message_id(), id);
        assert_eq!(event.to_string(), "message.delivered");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::new(4);
        bus.publish(MessageEvent::MessageSent {
            message_id: Uuid::new_v4(),
            provider: "mocktest".to_string(),
            provider_message_id: None,
            at: Utc::now(),
        })
        .await;
    }
}
